use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use quire_doc::{ClientId, MarkKind, Replica, Update};
use quire_sync::{Client, ClientConfig, EditStep, LocalServer, SyncError, Transaction};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_replicas: usize,
    pub operations_per_replica: usize,
    pub total_syncs: usize,
    pub total_time: Duration,
    pub avg_sync_time: Duration,
    pub ops_per_second: f64,
    pub final_length: usize,
    pub converged: bool,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Replicas:        {:>38} ║", self.num_replicas);
        println!("║  Operations per Replica:    {:>38} ║", self.operations_per_replica);
        println!("║  Total Sync Operations:     {:>38} ║", self.total_syncs);
        println!("║  Total Time:                {:>39}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Sync Time:         {:>36}µs ║", format!("{:.2}", self.avg_sync_time.as_micros()));
        println!("║  Operations/Second:         {:>38.0} ║", self.ops_per_second);
        println!("║  Final Document Length:     {:>38} ║", self.final_length);
        println!("║  Converged:                 {:>38} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// A random edit against a document of unknown length.
#[derive(Clone, Copy, Debug)]
enum RandomEdit {
    Insert { at: f64, ch: char },
    Delete { at: f64 },
    Bold { at: f64, span: usize },
}

impl RandomEdit {
    fn generate(rng: &mut StdRng) -> Self {
        let at = rng.gen::<f64>();
        match rng.gen_range(0..10) {
            0..=5 => RandomEdit::Insert {
                at,
                ch: rng.gen_range(b'a'..=b'z') as char,
            },
            6..=8 => RandomEdit::Delete { at },
            _ => RandomEdit::Bold {
                at,
                span: rng.gen_range(1..5),
            },
        }
    }

    /// Translate into a transaction for a document of `len` units.
    fn transaction(self, len: usize) -> Option<Transaction> {
        let index = |at: f64, upper: usize| ((at * upper as f64) as usize).min(upper);
        match self {
            RandomEdit::Insert { at, ch } => {
                Some(Transaction::new().insert_text(index(at, len), ch.to_string()))
            }
            RandomEdit::Delete { at } if len > 0 => {
                let start = index(at, len - 1);
                Some(Transaction::new().delete(start..start + 1))
            }
            RandomEdit::Bold { at, span } if len > 0 => {
                let start = index(at, len - 1);
                Some(Transaction::new().format(start..(start + span).min(len), MarkKind::Bold))
            }
            _ => None,
        }
    }
}

/// Generator that yields replica indices for synchronization patterns
fn replica_sync_generator(num_replicas: usize, num_syncs: usize) -> impl Stream<Item = (usize, usize)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_syncs {
            let replica_a = rng.gen_range(0..num_replicas);
            let replica_b = rng.gen_range(0..num_replicas);
            yield (replica_a, replica_b);
        }
    }
}

/// Generator of (client index, edit) pairs, round-robin over clients
fn edit_generator(num_clients: usize, edits_per_client: usize) -> impl Stream<Item = (usize, RandomEdit)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..edits_per_client {
            for client in 0..num_clients {
                yield (client, RandomEdit::generate(&mut rng));
            }
        }
    }
}

/// Exchange missing operations between two replicas, both ways.
async fn perform_sync(
    replicas: &[Arc<Mutex<Replica>>],
    replica_a_idx: usize,
    replica_b_idx: usize,
    sync_times: &mut Vec<Duration>,
    total_syncs: &mut usize,
) {
    if replica_a_idx == replica_b_idx {
        return; // Skip self-sync
    }

    let sync_start = Instant::now();

    let replica_a = Arc::clone(&replicas[replica_a_idx]);
    let replica_b = Arc::clone(&replicas[replica_b_idx]);
    let (mut a, mut b) = tokio::join!(replica_a.lock(), replica_b.lock());

    let for_a = b.diff_since(&a.state_vector());
    let for_b = a.diff_since(&b.state_vector());
    a.apply_update(for_a);
    b.apply_update(for_b);

    drop(a);
    drop(b);

    sync_times.push(sync_start.elapsed());
    *total_syncs += 1;
}

fn average(times: &[Duration]) -> Duration {
    if times.is_empty() {
        Duration::ZERO
    } else {
        times.iter().sum::<Duration>() / times.len() as u32
    }
}

/// Replicas edit independently, then converge through random pairwise syncs
/// followed by a full mesh round.
pub async fn stress_test_replicas(
    num_replicas: usize,
    ops_per_replica: usize,
    num_syncs: usize,
) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Replica Stress Test (Async)                         ║");
    println!("║  Replicas: {} | Ops/Replica: {} | Syncs: {} ║",
             num_replicas, ops_per_replica, num_syncs);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();

    let replicas: Vec<Arc<Mutex<Replica>>> = (0..num_replicas)
        .map(|idx| Arc::new(Mutex::new(Replica::new(ClientId::new(idx as u64 + 1)))))
        .collect();

    println!("\n[Phase 1/3] Editing replicas independently...");

    let mut handles = vec![];
    for replica in &replicas {
        let replica = Arc::clone(replica);
        let handle = tokio::spawn(async move {
            let mut rng = StdRng::from_entropy();
            for i in 0..ops_per_replica {
                let edit = RandomEdit::generate(&mut rng);
                let mut doc = replica.lock().await;
                if let Some(tx) = edit.transaction(doc.len()) {
                    for step in tx.steps() {
                        if let Err(e) = apply_step(&mut doc, step) {
                            warn!(error = %e, "edit rejected");
                        }
                    }
                }
                drop(doc);

                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
        handles.push(handle);
    }
    for handle in handles {
        let _ = handle.await;
    }

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Random pairwise syncs...");

    let mut sync_times = vec![];
    let mut total_syncs = 0;
    let mut sync_gen = Box::pin(replica_sync_generator(num_replicas, num_syncs));
    while let Some((replica_a_idx, replica_b_idx)) = sync_gen.next().await {
        perform_sync(&replicas, replica_a_idx, replica_b_idx, &mut sync_times, &mut total_syncs).await;
        if total_syncs > 0 && total_syncs % 100 == 0 {
            println!("  Syncs completed: {}/{}", total_syncs, num_syncs);
        }
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Full mesh round...");

    for a in 0..num_replicas {
        for b in 0..num_replicas {
            perform_sync(&replicas, a, b, &mut sync_times, &mut total_syncs).await;
        }
    }

    let mut texts = Vec::with_capacity(num_replicas);
    for replica in &replicas {
        texts.push(replica.lock().await.text());
    }
    let converged = texts.windows(2).all(|pair| pair[0] == pair[1]);
    let final_length = texts.first().map(|t| t.chars().count()).unwrap_or(0);

    let total_time = start.elapsed();
    let total_operations = (num_replicas * ops_per_replica) + total_syncs;

    println!("[Phase 3/3] ✓ Completed");

    StressTestStats {
        num_replicas,
        operations_per_replica: ops_per_replica,
        total_syncs,
        total_time,
        avg_sync_time: average(&sync_times),
        ops_per_second: total_operations as f64 / total_time.as_secs_f64(),
        final_length,
        converged,
    }
}

fn apply_step(replica: &mut Replica, step: &EditStep) -> quire_doc::Result<Update> {
    match step {
        EditStep::InsertText { position, text } => replica.insert_text(*position, text),
        EditStep::Delete { range } => replica.apply_local_delete(range.clone()),
        EditStep::Format { range, mark } => replica.apply_local_format(range.clone(), mark.clone()),
        _ => Ok(Update::new()),
    }
}

/// Full sessions editing one document through the in-process server.
pub async fn stress_test_sessions(
    num_clients: usize,
    edits_per_client: usize,
) -> Result<StressTestStats, SyncError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Session Stress Test (LocalServer)                   ║");
    println!("║  Clients: {} | Edits/Client: {} ║", num_clients, edits_per_client);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let server = LocalServer::new();
    let clients: Vec<Client> = (0..num_clients)
        .map(|idx| {
            let config = ClientConfig {
                user_name: format!("user-{}", idx),
                ..Default::default()
            };
            Client::with_local_server(&server, config)
        })
        .collect();
    let sessions: Vec<_> = clients.iter().map(|c| c.open_session("stress")).collect();

    println!("\n[Phase 1/2] Editing through bindings...");

    let mut edit_times = vec![];
    for session in &sessions {
        session.wait_synced(Duration::from_secs(10)).await?;
    }
    let mut edits = Box::pin(edit_generator(num_clients, edits_per_client));
    let mut applied = 0usize;
    while let Some((client, edit)) = edits.next().await {
        let binding = sessions[client].binding()?;
        let len = binding.text()?.chars().count();
        let Some(tx) = edit.transaction(len) else {
            continue;
        };
        let edit_start = Instant::now();
        binding.apply(tx)?;
        edit_times.push(edit_start.elapsed());
        applied += 1;
        if applied % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }

    println!("[Phase 1/2] ✓ Completed ({} edits)", applied);
    println!("[Phase 2/2] Waiting for convergence...");

    let deadline = Instant::now() + Duration::from_secs(10);
    let (converged, final_length) = loop {
        let server_text = server.document_text("stress").unwrap_or_default();
        let mut all_match = true;
        for session in &sessions {
            if session.text()? != server_text {
                all_match = false;
                break;
            }
        }
        if all_match || Instant::now() >= deadline {
            break (all_match, server_text.chars().count());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let total_time = start.elapsed();
    println!("[Phase 2/2] ✓ Completed");

    Ok(StressTestStats {
        num_replicas: num_clients,
        operations_per_replica: edits_per_client,
        total_syncs: applied,
        total_time,
        avg_sync_time: average(&edit_times),
        ops_per_second: applied as f64 / total_time.as_secs_f64(),
        final_length,
        converged,
    })
}

/// Replica stress runs at increasing replica counts
pub async fn stress_test_scaling(max_replicas: usize, step_size: usize) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Replica Convergence vs Replicas   ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_replicas = step_size;
    while current_replicas <= max_replicas {
        let stats = stress_test_replicas(current_replicas, 50, current_replicas * 100).await;
        stats.print();
        current_replicas += step_size;
    }
}
