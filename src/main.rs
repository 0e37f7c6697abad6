use stress_test::{stress_test_replicas, stress_test_scaling, stress_test_sessions};
use tracing_subscriber::EnvFilter;
pub mod stress_test;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            CONVERGENCE STRESS TESTS                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: Replicas with small scale
    let stats = stress_test_replicas(4, 100, 200).await;
    stats.print();

    // Test 2: Replicas with medium scale
    let stats = stress_test_replicas(10, 500, 1000).await;
    stats.print();

    // Test 3: Sessions through the in-process server
    let stats = stress_test_sessions(3, 100).await?;
    stats.print();

    // Test 4: More sessions
    let stats = stress_test_sessions(8, 200).await?;
    stats.print();

    // Test 5: Scaling analysis
    stress_test_scaling(20, 4).await;

    println!("\n✓ All stress tests completed successfully!");
    Ok(())
}
