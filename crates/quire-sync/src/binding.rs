//! Editor binding - the seam between a host editing surface and a
//! collaborative document.
//!
//! The host describes edits as [`Transaction`]s in visible positions. The
//! binding applies them to the replica as one undo step and answers with a
//! [`RenderPatch`] describing which blocks of the rendered tree changed.
//! Remote changes are announced on [`EditorBinding::changes`]; the host
//! then calls [`EditorBinding::render`] to get the blocks to redraw.
//!
//! A binding holds only weak references to its document and awareness. Once
//! the owning session closes, every call fails with
//! [`SyncError::SessionClosed`] instead of keeping the replica alive.

use crate::awareness::{escape_html, sanitize_color, sanitize_name, Awareness, CursorRange, UserInfo};
use crate::document::CollaborativeDoc;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use quire_doc::{Block, BlockKind, ClientId, DocError, Image, MarkKind, Replica, Update};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info};
use ulid::Ulid;

/// One edit, in visible positions at the time it is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditStep {
    InsertText { position: usize, text: String },
    /// End the block at `position`, giving it `kind`.
    InsertBlock { position: usize, kind: BlockKind },
    InsertImage { position: usize, image: Image },
    Delete { range: Range<usize> },
    Format { range: Range<usize>, mark: MarkKind },
    Unformat { range: Range<usize>, mark: MarkKind },
}

impl EditStep {
    fn apply(self, replica: &mut Replica) -> std::result::Result<Update, DocError> {
        match self {
            EditStep::InsertText { position, text } => replica.insert_text(position, &text),
            EditStep::InsertBlock { position, kind } => replica.insert_block_break(position, kind),
            EditStep::InsertImage { position, image } => replica.insert_image(position, image),
            EditStep::Delete { range } => replica.apply_local_delete(range),
            EditStep::Format { range, mark } => replica.apply_local_format(range, mark),
            EditStep::Unformat { range, mark } => replica.apply_local_unformat(range, &mark),
        }
    }
}

/// A batch of edits applied as one undo step, with an optional new selection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    steps: Vec<EditStep>,
    selection: Option<(usize, usize)>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_text(mut self, position: usize, text: impl Into<String>) -> Self {
        self.steps.push(EditStep::InsertText {
            position,
            text: text.into(),
        });
        self
    }

    pub fn insert_block(mut self, position: usize, kind: BlockKind) -> Self {
        self.steps.push(EditStep::InsertBlock { position, kind });
        self
    }

    pub fn insert_image(mut self, position: usize, image: Image) -> Self {
        self.steps.push(EditStep::InsertImage { position, image });
        self
    }

    pub fn delete(mut self, range: Range<usize>) -> Self {
        self.steps.push(EditStep::Delete { range });
        self
    }

    pub fn format(mut self, range: Range<usize>, mark: MarkKind) -> Self {
        self.steps.push(EditStep::Format { range, mark });
        self
    }

    pub fn unformat(mut self, range: Range<usize>, mark: MarkKind) -> Self {
        self.steps.push(EditStep::Unformat { range, mark });
        self
    }

    /// Selection to publish once the steps are applied.
    pub fn select(mut self, anchor: usize, head: usize) -> Self {
        self.selection = Some((anchor, head));
        self
    }

    pub fn steps(&self) -> &[EditStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.selection.is_none()
    }
}

/// Replace `removed` rendered blocks starting at `start` with `blocks`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderPatch {
    pub start: usize,
    pub removed: usize,
    pub blocks: Vec<Block>,
}

impl RenderPatch {
    /// Smallest single-splice patch turning `old` into `new`.
    pub fn diff(old: &[Block], new: &[Block]) -> Self {
        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let mut suffix = 0;
        while suffix < old.len() - prefix
            && suffix < new.len() - prefix
            && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
        {
            suffix += 1;
        }
        Self {
            start: prefix,
            removed: old.len() - prefix - suffix,
            blocks: new[prefix..new.len() - suffix].to_vec(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed == 0 && self.blocks.is_empty()
    }

    /// Apply the patch to a host-side copy of the tree.
    pub fn apply_to(&self, rendered: &mut Vec<Block>) {
        let end = (self.start + self.removed).min(rendered.len());
        let start = self.start.min(end);
        rendered.splice(start..end, self.blocks.iter().cloned());
    }
}

/// A remote cursor ready for drawing. Name and color are sanitized again
/// here, whatever the awareness layer already did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CursorDecoration {
    pub client: ClientId,
    pub name: String,
    pub color: String,
    pub anchor: usize,
    pub head: usize,
}

impl CursorDecoration {
    /// Selected range, if the cursor is not collapsed.
    pub fn selection(&self) -> Option<Range<usize>> {
        match self.anchor.cmp(&self.head) {
            std::cmp::Ordering::Less => Some(self.anchor..self.head),
            std::cmp::Ordering::Greater => Some(self.head..self.anchor),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Caret label markup. The name is escaped, the color is allow-listed.
    pub fn label_html(&self) -> String {
        format!(
            "<span class=\"collaboration-cursor__label\" style=\"background-color: {}\">{}</span>",
            escape_html(&self.color),
            escape_html(&self.name)
        )
    }
}

/// Host-side cursor drawing.
pub trait CursorRenderer {
    fn draw(&mut self, cursor: &CursorDecoration);
}

/// Collects caret labels as HTML fragments.
#[derive(Debug, Default)]
pub struct HtmlCursorRenderer {
    pub fragments: Vec<String>,
}

impl CursorRenderer for HtmlCursorRenderer {
    fn draw(&mut self, cursor: &CursorDecoration) {
        self.fragments.push(cursor.label_html());
    }
}

/// Stores image bytes and returns the URL to embed.
#[async_trait]
pub trait ImageUploader: Send + Sync + 'static {
    async fn upload(&self, data: Vec<u8>) -> std::result::Result<String, SyncError>;
}

/// Key a binding is cached under: one binding per (document, provider).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub document_id: String,
    pub provider_id: Ulid,
}

/// Binds a host editing surface to a collaborative document.
pub struct EditorBinding {
    key: BindingKey,
    doc: Weak<CollaborativeDoc>,
    awareness: Weak<Awareness>,
    presentation: RwLock<UserInfo>,
    selection: Mutex<Option<CursorRange>>,
    rendered: Mutex<Vec<Block>>,
    uploader: RwLock<Option<Arc<dyn ImageUploader>>>,
}

impl std::fmt::Debug for EditorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorBinding")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl EditorBinding {
    fn new(key: BindingKey, doc: &Arc<CollaborativeDoc>, awareness: &Arc<Awareness>) -> Self {
        Self {
            key,
            doc: Arc::downgrade(doc),
            awareness: Arc::downgrade(awareness),
            presentation: RwLock::new(UserInfo::new("", "")),
            selection: Mutex::new(None),
            rendered: Mutex::new(Vec::new()),
            uploader: RwLock::new(None),
        }
    }

    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    /// Whether the owning session is still open.
    pub fn is_attached(&self) -> bool {
        self.doc.strong_count() > 0
    }

    fn doc(&self) -> Result<Arc<CollaborativeDoc>> {
        self.doc.upgrade().ok_or(SyncError::SessionClosed)
    }

    pub fn text(&self) -> Result<String> {
        Ok(self.doc()?.text())
    }

    /// Apply a transaction as one undo step.
    ///
    /// Steps run in order. If one fails, the earlier ones stay applied and
    /// are still published; the error is returned.
    pub fn apply(&self, tx: Transaction) -> Result<RenderPatch> {
        let doc = self.doc()?;
        let Transaction { steps, selection } = tx;

        if !steps.is_empty() {
            let mut failure = None;
            doc.edit_group(|replica| {
                let mut update = Update::new();
                for step in steps {
                    match step.apply(replica) {
                        Ok(part) => update.merge(part),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                Ok(update)
            })?;
            if let Some(e) = failure {
                debug!(document = %self.key.document_id, error = %e, "transaction step rejected");
                return Err(e.into());
            }
        }

        if let Some((anchor, head)) = selection {
            self.set_selection(anchor, head)?;
        }
        self.render()
    }

    /// Diff the rendered tree against the document.
    pub fn render(&self) -> Result<RenderPatch> {
        let blocks = self.doc()?.read(|replica| replica.blocks());
        let mut rendered = self.rendered.lock();
        let patch = RenderPatch::diff(&rendered, &blocks);
        *rendered = blocks;
        Ok(patch)
    }

    /// Revision signal of the document. It ticks on every local or remote
    /// change and closes when the session does.
    ///
    /// ```ignore
    /// let mut changes = binding.changes()?;
    /// while changes.changed().await.is_ok() {
    ///     let patch = binding.render()?;
    ///     editor.redraw(&patch);
    /// }
    /// ```
    pub fn changes(&self) -> Result<watch::Receiver<u64>> {
        Ok(self.doc()?.subscribe())
    }

    /// The tree as of the last render.
    pub fn rendered_blocks(&self) -> Vec<Block> {
        self.rendered.lock().clone()
    }

    // === Selection and presence ===

    /// Set the local selection and publish it as the awareness cursor.
    pub fn set_selection(&self, anchor: usize, head: usize) -> Result<()> {
        let range = self.doc()?.read(|replica| {
            let length = replica.len();
            for index in [anchor, head] {
                if index > length {
                    return Err(DocError::IndexOutOfBounds { index, length });
                }
            }
            Ok(CursorRange {
                anchor: replica.anchor_at(anchor),
                head: replica.anchor_at(head),
            })
        })?;
        *self.selection.lock() = Some(range);
        if let Some(awareness) = self.awareness.upgrade() {
            awareness.set_local_cursor(Some(range));
        }
        Ok(())
    }

    pub fn clear_selection(&self) {
        *self.selection.lock() = None;
        if let Some(awareness) = self.awareness.upgrade() {
            awareness.set_local_cursor(None);
        }
    }

    /// Current selection in visible positions, following concurrent edits.
    pub fn selection(&self) -> Option<(usize, usize)> {
        let range = (*self.selection.lock())?;
        let doc = self.doc.upgrade()?;
        doc.read(|replica| {
            Some((
                replica.resolve_anchor(&range.anchor)?,
                replica.resolve_anchor(&range.head)?,
            ))
        })
    }

    /// Change the display name and color shown to peers.
    pub fn set_presentation(&self, name: &str, color: &str) {
        let user = UserInfo::new(name, color);
        *self.presentation.write() = user.clone();
        if let Some(awareness) = self.awareness.upgrade() {
            awareness.set_local_user(user);
        }
    }

    pub fn presentation(&self) -> UserInfo {
        self.presentation.read().clone()
    }

    /// Remote cursors whose anchors resolve in this replica.
    pub fn remote_cursors(&self) -> Result<Vec<CursorDecoration>> {
        let doc = self.doc()?;
        let awareness = self.awareness.upgrade().ok_or(SyncError::SessionClosed)?;
        let collaborators = awareness.collaborators();
        Ok(doc.read(|replica| {
            collaborators
                .into_iter()
                .filter_map(|c| {
                    let cursor = c.cursor?;
                    Some(CursorDecoration {
                        client: c.client,
                        name: sanitize_name(&c.name),
                        color: sanitize_color(&c.color),
                        anchor: replica.resolve_anchor(&cursor.anchor)?,
                        head: replica.resolve_anchor(&cursor.head)?,
                    })
                })
                .collect()
        }))
    }

    /// Draw every remote cursor. Returns how many were drawn.
    pub fn render_cursors(&self, renderer: &mut dyn CursorRenderer) -> Result<usize> {
        let cursors = self.remote_cursors()?;
        for cursor in &cursors {
            renderer.draw(cursor);
        }
        Ok(cursors.len())
    }

    // === History ===

    pub fn undo(&self) -> Result<bool> {
        self.doc()?.undo()
    }

    pub fn redo(&self) -> Result<bool> {
        self.doc()?.redo()
    }

    pub fn can_undo(&self) -> bool {
        self.doc.upgrade().map(|doc| doc.can_undo()).unwrap_or(false)
    }

    pub fn can_redo(&self) -> bool {
        self.doc.upgrade().map(|doc| doc.can_redo()).unwrap_or(false)
    }

    // === Images ===

    pub fn set_image_uploader(&self, uploader: Arc<dyn ImageUploader>) {
        *self.uploader.write() = Some(uploader);
    }

    /// Upload `data`, then embed the returned URL at `position`.
    pub async fn insert_image(&self, position: usize, data: Vec<u8>, alt: &str) -> Result<RenderPatch> {
        let uploader = self
            .uploader
            .read()
            .clone()
            .ok_or_else(|| SyncError::ImageUpload("no image uploader configured".into()))?;
        let src = uploader.upload(data).await?;
        self.apply(Transaction::new().insert_image(position, Image::new(src, alt)))
    }
}

/// Hands out one binding per (document, provider) pair.
#[derive(Default)]
pub struct BindingFactory {
    bindings: Mutex<HashMap<BindingKey, Weak<EditorBinding>>>,
    created: AtomicUsize,
}

impl BindingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live binding for `key`, creating it if needed.
    pub fn get_or_create(
        &self,
        key: BindingKey,
        doc: &Arc<CollaborativeDoc>,
        awareness: &Arc<Awareness>,
    ) -> Arc<EditorBinding> {
        let mut bindings = self.bindings.lock();
        bindings.retain(|_, binding| binding.strong_count() > 0);
        if let Some(existing) = bindings.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let binding = Arc::new(EditorBinding::new(key.clone(), doc, awareness));
        info!(document = %key.document_id, provider = %key.provider_id, "created editor binding");
        bindings.insert(key, Arc::downgrade(&binding));
        self.created.fetch_add(1, Ordering::Relaxed);
        binding
    }

    /// Bindings created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Bindings still referenced somewhere.
    pub fn live(&self) -> usize {
        self.bindings
            .lock()
            .values()
            .filter(|binding| binding.strong_count() > 0)
            .count()
    }
}
