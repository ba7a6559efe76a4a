//! Sync coordinator: one instance per open document per client.
//!
//! Bridges three parties that never talk to each other directly:
//! ```text
//! ┌────────────┐  local updates   ┌─────────────────┐   publish    ┌────────────┐
//! │ yrs::Doc   │ ───────────────► │ SyncCoordinator │ ───────────► │ DocChannel │
//! │ (host UI   │ ◄─────────────── │  (event loop)   │ ◄─────────── │ (fan-out)  │
//! │  edits)    │  remote applies  └───────┬─────────┘   envelopes  └────────────┘
//! └────────────┘                          │ debounced flush
//!                                ┌────────▼─────────┐
//!                                │ SnapshotStore    │──► MetadataRegistry
//!                                │ (durable blob)   │    (version, size, time)
//!                                └──────────────────┘
//! ```
//!
//! A local edit is broadcast immediately (latency path) and persisted lazily
//! (durability path): each edit re-arms a debounce deadline, and a flush at
//! deadline encodes the state as of fire time, so a burst of edits costs one
//! storage write. Metadata is updated only after the storage write succeeds —
//! a registry sync version never points at a write that did not happen.
//!
//! All coordinator-side document writes run on a single owning task; local
//! editing never blocks on any network operation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::broadcast::{ChannelStatus, DocChannel};
use crate::metadata::{now_epoch_secs, MetadataError, MetadataRegistry, SyncStateUpdate};
use crate::protocol::{
    validate_identifier, DeltaEnvelope, MAX_DOCUMENT_BYTES, MAX_DOCUMENT_ID_LEN,
};
use crate::store::{SnapshotStore, StoreError};

/// Errors surfaced by the coordinator.
///
/// Only `Validation` is ever returned from construction (programmer error);
/// everything else is reported asynchronously and never thrown into the
/// edit path.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Malformed identifier or envelope.
    Validation(String),
    /// Broadcast/transport failure. Non-fatal; editing unaffected.
    Transport(String),
    /// Snapshot write/read failure. Dirty flag stays set; retried.
    Storage(StoreError),
    /// Registry backend failure. Dirty flag stays set; retried.
    Metadata(MetadataError),
    /// Metadata update matched zero rows: tenant mismatch or deleted
    /// document. The coordinator halts further flushes for this instance.
    MetadataConflict {
        document_id: String,
        tenant_id: String,
    },
    /// Encoded state exceeds the hard ceiling; flush refused.
    DocumentTooLarge { size: usize, max: usize },
    /// CRDT layer failure (update decode/apply).
    Replica(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "Validation error: {e}"),
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Storage(e) => write!(f, "Storage error: {e}"),
            Self::Metadata(e) => write!(f, "Metadata error: {e}"),
            Self::MetadataConflict {
                document_id,
                tenant_id,
            } => write!(
                f,
                "Metadata conflict: document {document_id} not found for tenant {tenant_id} \
                 (deleted or access denied)"
            ),
            Self::DocumentTooLarge { size, max } => {
                write!(f, "Document too large: {size} bytes (max {max})")
            }
            Self::Replica(e) => write!(f, "Replica error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<MetadataError> for SyncError {
    fn from(e: MetadataError) -> Self {
        Self::Metadata(e)
    }
}

/// Outcome of a `load()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A snapshot existed and was applied.
    Applied,
    /// No snapshot yet (or fetch timed out) — empty document, not an error.
    Empty,
    /// A previous load already succeeded; no-op.
    AlreadyLoaded,
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Snapshot written and metadata advanced to this version.
    Flushed { sync_version: u64 },
    /// Nothing dirty; no write performed.
    Clean,
    /// Instance halted after a metadata conflict; no write attempted.
    Halted,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub document_id: String,
    pub tenant_id: String,
    /// Quiet period before a flush (default 2 s).
    pub debounce: Duration,
    /// Ceiling on the full encoded document state.
    pub max_document_bytes: usize,
    /// Bound on the initial snapshot fetch; on timeout the document
    /// proceeds empty rather than blocking availability.
    pub load_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(document_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            tenant_id: tenant_id.into(),
            debounce: Duration::from_millis(2000),
            max_document_bytes: MAX_DOCUMENT_BYTES,
            load_timeout: Duration::from_secs(10),
        }
    }

    /// Config for testing (short debounce, short load timeout).
    pub fn for_testing(document_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            debounce: Duration::from_millis(50),
            load_timeout: Duration::from_secs(1),
            ..Self::new(document_id, tenant_id)
        }
    }
}

/// Called on channel connection-state transitions (`true` = connected).
pub type ConnectionHook = Arc<dyn Fn(bool) + Send + Sync>;
/// Called whenever a background sync operation fails.
pub type SyncErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Optional host callbacks.
#[derive(Clone, Default)]
pub struct CoordinatorHooks {
    pub on_connection_change: Option<ConnectionHook>,
    pub on_sync_error: Option<SyncErrorHook>,
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub deltas_broadcast: u64,
    pub deltas_applied: u64,
    pub envelopes_rejected: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

/// State shared between the handle, the worker task, and the doc observer.
struct SharedState {
    dirty: AtomicBool,
    sync_version: AtomicU64,
    loaded: AtomicBool,
    halted: AtomicBool,
    /// Set while a remote delta is being applied so the update observer
    /// does not echo it back as a local edit.
    applying_remote: AtomicBool,
    deltas_broadcast: AtomicU64,
    deltas_applied: AtomicU64,
    envelopes_rejected: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

impl SharedState {
    fn new() -> Self {
        Self {
            dirty: AtomicBool::new(false),
            sync_version: AtomicU64::new(0),
            loaded: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            applying_remote: AtomicBool::new(false),
            deltas_broadcast: AtomicU64::new(0),
            deltas_applied: AtomicU64::new(0),
            envelopes_rejected: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
        }
    }
}

/// Commands from the public handle to the worker loop.
enum Command {
    Load(oneshot::Sender<Result<LoadOutcome, SyncError>>),
    Flush(oneshot::Sender<Result<FlushOutcome, SyncError>>),
    Shutdown,
}

/// The sync coordinator handle.
///
/// Owns the worker task; dropping the handle (or calling
/// [`destroy`](Self::destroy)) tears the worker down, which cancels any
/// pending debounce and performs one best-effort final flush.
pub struct SyncCoordinator {
    document_id: String,
    tenant_id: String,
    replica_id: String,
    doc: Arc<Doc>,
    shared: Arc<SharedState>,
    cmd_tx: mpsc::Sender<Command>,
    task: Option<tokio::task::JoinHandle<()>>,
    // Held so the doc observer stays registered for the handle's lifetime.
    _update_subscription: yrs::Subscription,
}

impl SyncCoordinator {
    /// Construct a coordinator and start its worker task.
    ///
    /// Fails fast on malformed identifiers — they become storage path
    /// segments and channel names, so this is a security boundary. Must be
    /// called from within a tokio runtime.
    pub fn new(
        config: CoordinatorConfig,
        channel: Arc<DocChannel>,
        store: Arc<dyn SnapshotStore>,
        registry: Arc<dyn MetadataRegistry>,
        hooks: CoordinatorHooks,
    ) -> Result<Self, SyncError> {
        validate_identifier(&config.document_id, MAX_DOCUMENT_ID_LEN)
            .map_err(|_| SyncError::Validation(format!("document id {:?}", config.document_id)))?;
        validate_identifier(&config.tenant_id, MAX_DOCUMENT_ID_LEN)
            .map_err(|_| SyncError::Validation(format!("tenant id {:?}", config.tenant_id)))?;

        let doc = Arc::new(Doc::new());
        let shared = Arc::new(SharedState::new());
        let replica_id = Uuid::new_v4().to_string();

        // Local edits flow observer → channel → worker loop. The observer
        // runs inside the committing transaction, so it must never block.
        let (local_tx, local_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let observer_shared = shared.clone();
        let subscription = doc
            .observe_update_v1(move |_, event| {
                if observer_shared.applying_remote.load(Ordering::SeqCst) {
                    return;
                }
                let _ = local_tx.send(event.update.clone());
            })
            .map_err(|e| SyncError::Replica(format!("update observer: {e}")))?;

        let remote_rx = channel.subscribe();
        let status_rx = channel.status();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let worker = Worker {
            document_id: config.document_id.clone(),
            tenant_id: config.tenant_id.clone(),
            replica_id: replica_id.clone(),
            debounce: config.debounce,
            max_document_bytes: config.max_document_bytes,
            load_timeout: config.load_timeout,
            doc: doc.clone(),
            shared: shared.clone(),
            channel,
            store,
            registry,
            hooks,
        };
        let task = tokio::spawn(worker.run(cmd_rx, local_rx, remote_rx, status_rx));

        Ok(Self {
            document_id: config.document_id,
            tenant_id: config.tenant_id,
            replica_id,
            doc,
            shared,
            cmd_tx,
            task: Some(task),
            _update_subscription: subscription,
        })
    }

    /// The replicated document. The host edits through this handle; the
    /// coordinator picks the edits up via its update observer.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// This coordinator's origin tag on the wire.
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    /// True iff a local edit exists that no successful flush has covered.
    pub fn has_unsaved_changes(&self) -> bool {
        self.shared.dirty.load(Ordering::SeqCst)
    }

    pub fn current_sync_version(&self) -> u64 {
        self.shared.sync_version.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> bool {
        self.shared.loaded.load(Ordering::SeqCst)
    }

    /// True once a metadata conflict has halted flushing for this instance.
    /// The host must rebuild the coordinator to resume persistence.
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            deltas_broadcast: self.shared.deltas_broadcast.load(Ordering::Relaxed),
            deltas_applied: self.shared.deltas_applied.load(Ordering::Relaxed),
            envelopes_rejected: self.shared.envelopes_rejected.load(Ordering::Relaxed),
            flushes: self.shared.flushes.load(Ordering::Relaxed),
            failed_flushes: self.shared.failed_flushes.load(Ordering::Relaxed),
        }
    }

    /// Fetch and apply the latest snapshot. Idempotent: after the first
    /// success further calls are no-ops. A missing snapshot is an empty
    /// document, not an error; a slow store is bounded by `load_timeout`.
    pub async fn load(&self) -> Result<LoadOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Load(tx))
            .await
            .map_err(|_| SyncError::Transport("coordinator stopped".into()))?;
        rx.await
            .map_err(|_| SyncError::Transport("coordinator stopped".into()))?
    }

    /// Flush immediately, bypassing the debounce window.
    pub async fn force_save(&self) -> Result<FlushOutcome, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush(tx))
            .await
            .map_err(|_| SyncError::Transport("coordinator stopped".into()))?;
        rx.await
            .map_err(|_| SyncError::Transport("coordinator stopped".into()))?
    }

    /// Tear down: cancel any pending debounce, unsubscribe from the
    /// channel, detach the document observer, and attempt one best-effort
    /// final flush (failures logged, never surfaced).
    pub async fn destroy(mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!(
                    "coordinator worker for {}/{} panicked during teardown: {e}",
                    self.tenant_id,
                    self.document_id
                );
            }
        }
    }
}

/// The coordinator's owning task. All coordinator-side document writes and
/// all persistence happen here, serialized.
struct Worker {
    document_id: String,
    tenant_id: String,
    replica_id: String,
    debounce: Duration,
    max_document_bytes: usize,
    load_timeout: Duration,
    doc: Arc<Doc>,
    shared: Arc<SharedState>,
    channel: Arc<DocChannel>,
    store: Arc<dyn SnapshotStore>,
    registry: Arc<dyn MetadataRegistry>,
    hooks: CoordinatorHooks,
}

impl Worker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut local_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut remote_rx: broadcast::Receiver<Arc<Vec<u8>>>,
        mut status_rx: tokio::sync::watch::Receiver<ChannelStatus>,
    ) {
        let mut deadline: Option<Instant> = None;

        loop {
            // Copy so branch guards see a stable value while handlers
            // rewrite `deadline`.
            let armed = deadline;
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(Command::Load(reply)) => {
                        let _ = reply.send(self.load().await);
                    }
                    Some(Command::Flush(reply)) => {
                        deadline = None;
                        let result = self.flush().await;
                        if let Err(ref e) = result {
                            self.report(e);
                        }
                        let _ = reply.send(result);
                    }
                    // Handle dropped without destroy(): same teardown path.
                    Some(Command::Shutdown) | None => break,
                },

                Some(update) = local_rx.recv() => {
                    self.handle_local_update(update);
                    deadline = if self.shared.halted.load(Ordering::SeqCst) {
                        None
                    } else {
                        Some(Instant::now() + self.debounce)
                    };
                }

                incoming = remote_rx.recv() => match incoming {
                    Ok(bytes) => self.handle_remote(&bytes),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!(
                            "coordinator {}/{} lagged {n} envelopes behind the channel",
                            self.tenant_id, self.document_id
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Cannot happen while we hold the channel, but a
                        // broken transport must not spin the loop.
                        log::error!(
                            "broadcast channel closed for {}/{}",
                            self.tenant_id, self.document_id
                        );
                        break;
                    }
                },

                changed = status_rx.changed() => {
                    if changed.is_ok() {
                        let connected =
                            *status_rx.borrow_and_update() == ChannelStatus::Connected;
                        log::debug!(
                            "channel for {}/{} now {}",
                            self.tenant_id, self.document_id,
                            if connected { "connected" } else { "disconnected" }
                        );
                        if let Some(hook) = &self.hooks.on_connection_change {
                            hook(connected);
                        }
                    }
                }

                _ = async { tokio::time::sleep_until(armed.unwrap()).await },
                    if armed.is_some() =>
                {
                    deadline = None;
                    if let Err(e) = self.flush().await {
                        self.report(&e);
                    }
                }
            }
        }

        // Teardown-time save: best effort, bounded data loss window of one
        // debounce period. Allowed to fail silently (logged only).
        if self.shared.dirty.load(Ordering::SeqCst) && !self.shared.halted.load(Ordering::SeqCst) {
            if let Err(e) = self.flush().await {
                log::warn!(
                    "teardown flush failed for {}/{}: {e}",
                    self.tenant_id,
                    self.document_id
                );
            }
        }
    }

    fn report(&self, error: &SyncError) {
        log::warn!(
            "sync error for {}/{}: {error}",
            self.tenant_id,
            self.document_id
        );
        if let Some(hook) = &self.hooks.on_sync_error {
            hook(error);
        }
    }

    /// A local edit committed: mark dirty and broadcast right away.
    /// Failures here are logged, never surfaced — broadcast is the latency
    /// path, the debounced flush is the durability path.
    fn handle_local_update(&mut self, update: Vec<u8>) {
        self.shared.dirty.store(true, Ordering::SeqCst);

        let envelope = DeltaEnvelope::new(
            self.document_id.clone(),
            self.replica_id.clone(),
            update,
        );
        match envelope.encode() {
            Ok(bytes) => {
                self.channel.publish(bytes);
                self.shared.deltas_broadcast.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!(
                    "failed to encode delta envelope for {}/{}: {e}",
                    self.tenant_id,
                    self.document_id
                );
            }
        }
    }

    /// An envelope arrived from the channel. Validate before the payload
    /// gets anywhere near the document; drop malformed input with a
    /// warning; ignore other documents' traffic and our own echo.
    fn handle_remote(&mut self, bytes: &[u8]) {
        let envelope = match DeltaEnvelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("dropping undecodable envelope: {e}");
                self.shared.envelopes_rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(e) = envelope.validate() {
            log::warn!("dropping invalid envelope: {e}");
            self.shared.envelopes_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if envelope.document_id != self.document_id {
            log::debug!(
                "ignoring envelope for {} on channel of {}",
                envelope.document_id,
                self.document_id
            );
            return;
        }
        if envelope.origin == self.replica_id {
            // Our own broadcast echoed back.
            return;
        }

        let update = match Update::decode_v1(&envelope.payload) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("dropping envelope with undecodable update: {e}");
                self.shared.envelopes_rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Remote-tagged apply: the observer sees the flag and stays quiet,
        // so this delta is neither re-broadcast nor re-marked dirty.
        self.shared.applying_remote.store(true, Ordering::SeqCst);
        let applied = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        self.shared.applying_remote.store(false, Ordering::SeqCst);

        match applied {
            Ok(()) => {
                self.shared.deltas_applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!(
                    "failed to apply remote delta to {}/{}: {e}",
                    self.tenant_id,
                    self.document_id
                );
                self.shared.envelopes_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn load(&mut self) -> Result<LoadOutcome, SyncError> {
        if self.shared.loaded.load(Ordering::SeqCst) {
            return Ok(LoadOutcome::AlreadyLoaded);
        }

        // Seed the in-memory sync version from the registry so flushes
        // continue the monotone sequence across sessions. Best effort: a
        // registry hiccup here surfaces on the first flush instead.
        match self.registry.fetch(&self.document_id, &self.tenant_id).await {
            Ok(Some(record)) => {
                self.shared
                    .sync_version
                    .store(record.sync_version, Ordering::SeqCst);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!(
                    "could not read registry record for {}/{}: {e}",
                    self.tenant_id,
                    self.document_id
                );
            }
        }

        let fetched = match tokio::time::timeout(
            self.load_timeout,
            self.store.load(&self.tenant_id, &self.document_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                // Availability beats completeness: proceed with an empty
                // local document instead of blocking the editor.
                log::warn!(
                    "snapshot fetch for {}/{} timed out after {:?}; starting empty",
                    self.tenant_id,
                    self.document_id,
                    self.load_timeout
                );
                self.shared.loaded.store(true, Ordering::SeqCst);
                return Ok(LoadOutcome::Empty);
            }
        };

        let Some(bytes) = fetched else {
            self.shared.loaded.store(true, Ordering::SeqCst);
            return Ok(LoadOutcome::Empty);
        };

        let update = Update::decode_v1(&bytes)
            .map_err(|e| SyncError::Replica(format!("snapshot decode: {e}")))?;

        self.shared.applying_remote.store(true, Ordering::SeqCst);
        let applied = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
        };
        self.shared.applying_remote.store(false, Ordering::SeqCst);
        applied.map_err(|e| SyncError::Replica(format!("snapshot apply: {e}")))?;

        self.shared.loaded.store(true, Ordering::SeqCst);
        log::debug!(
            "loaded snapshot for {}/{} ({} bytes)",
            self.tenant_id,
            self.document_id,
            bytes.len()
        );
        Ok(LoadOutcome::Applied)
    }

    /// Persist the current state: store write, then metadata update, then —
    /// and only then — clear dirty and advance the version. On any failure
    /// dirty stays set so the next debounce cycle or force_save retries.
    async fn flush(&mut self) -> Result<FlushOutcome, SyncError> {
        if self.shared.halted.load(Ordering::SeqCst) {
            return Ok(FlushOutcome::Halted);
        }
        if !self.shared.dirty.load(Ordering::SeqCst) {
            return Ok(FlushOutcome::Clean);
        }

        // Encode at fire time: the snapshot reflects every edit up to now,
        // not the state when the debounce was armed.
        let snapshot = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        if snapshot.len() > self.max_document_bytes {
            self.shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::DocumentTooLarge {
                size: snapshot.len(),
                max: self.max_document_bytes,
            });
        }

        let saved = match self
            .store
            .save(&self.tenant_id, &self.document_id, &snapshot)
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                self.shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        let next_version = self.shared.sync_version.load(Ordering::SeqCst) + 1;
        let rows = match self
            .registry
            .update_sync_state(
                &self.document_id,
                &self.tenant_id,
                SyncStateUpdate {
                    storage_path: saved.path,
                    storage_size_bytes: saved.size_bytes,
                    sync_version: next_version,
                    last_sync_at: now_epoch_secs(),
                },
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
        };

        if rows == 0 {
            // Tenant mismatch or a deleted document: a hard stop, not a
            // retry case. The host must reinitialize this document.
            self.shared.halted.store(true, Ordering::SeqCst);
            self.shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
            return Err(SyncError::MetadataConflict {
                document_id: self.document_id.clone(),
                tenant_id: self.tenant_id.clone(),
            });
        }

        self.shared.dirty.store(false, Ordering::SeqCst);
        self.shared.sync_version.store(next_version, Ordering::SeqCst);
        self.shared.flushes.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "flushed {}/{} at sync version {next_version}",
            self.tenant_id,
            self.document_id
        );
        Ok(FlushOutcome::Flushed {
            sync_version: next_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::channel_name;
    use crate::metadata::{DocumentRecord, InMemoryRegistry};
    use crate::store::{storage_path, FsSnapshotStore, StoreConfig};
    use yrs::{GetString, Text, WriteTxn};

    struct Fixture {
        _dir: tempfile::TempDir,
        channel: Arc<DocChannel>,
        store: Arc<FsSnapshotStore>,
        registry: Arc<InMemoryRegistry>,
    }

    async fn fixture(document_id: &str, tenant_id: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsSnapshotStore::new(StoreConfig::for_testing(dir.path())));
        let registry = Arc::new(InMemoryRegistry::new());
        registry
            .insert(DocumentRecord::new(
                document_id,
                tenant_id,
                storage_path(tenant_id, document_id).unwrap(),
            ))
            .await;
        let channel = Arc::new(DocChannel::new(
            channel_name(document_id).unwrap(),
            64,
        ));
        Fixture {
            _dir: dir,
            channel,
            store,
            registry,
        }
    }

    fn coordinator(fx: &Fixture, document_id: &str, tenant_id: &str) -> SyncCoordinator {
        SyncCoordinator::new(
            CoordinatorConfig::for_testing(document_id, tenant_id),
            fx.channel.clone(),
            fx.store.clone(),
            fx.registry.clone(),
            CoordinatorHooks::default(),
        )
        .unwrap()
    }

    fn type_text(coordinator: &SyncCoordinator, text: &str) {
        let doc = coordinator.doc();
        let mut txn = doc.transact_mut();
        let field = txn.get_or_insert_text("body");
        let len = field.get_string(&txn).len() as u32;
        field.insert(&mut txn, len, text);
    }

    fn read_text(coordinator: &SyncCoordinator) -> String {
        let doc = coordinator.doc();
        let txn = doc.transact();
        txn.get_text("body")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_construction_rejects_bad_identifiers() {
        let fx = fixture("doc-1", "acme").await;
        for (doc_id, tenant_id) in [
            ("doc/../escape", "acme"),
            ("doc 1", "acme"),
            ("doc-1", "acme/.."),
            ("", "acme"),
        ] {
            let result = SyncCoordinator::new(
                CoordinatorConfig::for_testing(doc_id, tenant_id),
                fx.channel.clone(),
                fx.store.clone(),
                fx.registry.clone(),
                CoordinatorHooks::default(),
            );
            assert!(
                matches!(result, Err(SyncError::Validation(_))),
                "{doc_id}/{tenant_id} should fail construction"
            );
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");

        assert!(!c.has_unsaved_changes());
        assert!(!c.loaded());
        assert!(!c.is_halted());
        assert_eq!(c.current_sync_version(), 0);
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_load_empty_store_is_not_an_error() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");

        assert_eq!(c.load().await.unwrap(), LoadOutcome::Empty);
        assert!(c.loaded());
        assert_eq!(read_text(&c), "");

        // Idempotent
        assert_eq!(c.load().await.unwrap(), LoadOutcome::AlreadyLoaded);
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_local_edit_marks_dirty_and_broadcasts() {
        let fx = fixture("doc-1", "acme").await;
        let mut rx = fx.channel.subscribe();
        let c = coordinator(&fx, "doc-1", "acme");

        type_text(&c, "hello");
        settle().await;

        assert!(c.has_unsaved_changes());

        let bytes = rx.recv().await.unwrap();
        let envelope = DeltaEnvelope::decode(&bytes).unwrap();
        assert_eq!(envelope.document_id, "doc-1");
        assert_eq!(envelope.origin, c.replica_id());
        assert!(!envelope.payload.is_empty());
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_force_save_roundtrips_through_store() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        type_text(&c, "persisted content");
        settle().await;

        let outcome = c.force_save().await.unwrap();
        assert_eq!(outcome, FlushOutcome::Flushed { sync_version: 1 });
        assert!(!c.has_unsaved_changes());
        assert_eq!(c.current_sync_version(), 1);

        // Fresh coordinator sees the snapshot
        let c2 = coordinator(&fx, "doc-1", "acme");
        assert_eq!(c2.load().await.unwrap(), LoadOutcome::Applied);
        assert_eq!(read_text(&c2), "persisted content");
        assert_eq!(c2.current_sync_version(), 1);

        c.destroy().await;
        c2.destroy().await;
    }

    #[tokio::test]
    async fn test_force_save_clean_is_noop() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        assert_eq!(c.force_save().await.unwrap(), FlushOutcome::Clean);
        assert!(!fx.store.exists("acme", "doc-1").await.unwrap());
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_debounce_coalesces_edits_into_one_flush() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        for i in 0..10 {
            type_text(&c, &format!("edit{i} "));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // All ten edits land within one 50ms debounce window
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!c.has_unsaved_changes());
        assert_eq!(c.current_sync_version(), 1, "one flush for the burst");
        assert_eq!(c.stats().flushes, 1);

        // And that single write reflects the final state
        let record = fx.registry.fetch("doc-1", "acme").await.unwrap().unwrap();
        assert_eq!(record.sync_version, 1);
        let c2 = coordinator(&fx, "doc-1", "acme");
        c2.load().await.unwrap();
        assert!(read_text(&c2).contains("edit9"));

        c.destroy().await;
        c2.destroy().await;
    }

    #[tokio::test]
    async fn test_remote_delta_applies_without_rebroadcast() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        // Forge a remote delta from another replica
        let other = Doc::new();
        let payload = {
            let mut txn = other.transact_mut();
            let text = txn.get_or_insert_text("body");
            text.insert(&mut txn, 0, "from afar");
            txn.encode_update_v1()
        };
        let envelope = DeltaEnvelope::new("doc-1", "some-other-replica", payload);
        fx.channel.publish(envelope.encode().unwrap());
        settle().await;

        assert_eq!(read_text(&c), "from afar");
        assert_eq!(c.stats().deltas_applied, 1);
        // Loop prevention: nothing was re-broadcast or re-marked dirty
        assert_eq!(c.stats().deltas_broadcast, 0);
        assert!(!c.has_unsaved_changes());
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_malformed_envelopes_are_dropped() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        // Garbage bytes
        fx.channel.publish(vec![0xFF, 0x00, 0x01]);
        // Id pattern violation
        let traversal = DeltaEnvelope::new("doc/../escape", "r", b"AAAA".to_vec());
        fx.channel.publish(traversal.encode().unwrap());
        // Oversized payload
        let oversized = DeltaEnvelope::new(
            "doc-1",
            "r",
            vec![0u8; crate::protocol::MAX_PAYLOAD_BYTES + 1],
        );
        fx.channel.publish(oversized.encode().unwrap());
        settle().await;

        assert_eq!(c.stats().envelopes_rejected, 3);
        assert_eq!(c.stats().deltas_applied, 0);
        assert_eq!(read_text(&c), "");
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_foreign_document_envelopes_ignored() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        let other = Doc::new();
        let payload = {
            let mut txn = other.transact_mut();
            let text = txn.get_or_insert_text("body");
            text.insert(&mut txn, 0, "wrong doc");
            txn.encode_update_v1()
        };
        let envelope = DeltaEnvelope::new("doc-2", "r", payload);
        fx.channel.publish(envelope.encode().unwrap());
        settle().await;

        assert_eq!(read_text(&c), "");
        assert_eq!(c.stats().deltas_applied, 0);
        // Not malformed, just not ours
        assert_eq!(c.stats().envelopes_rejected, 0);
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_metadata_conflict_halts_instance() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        // Document deleted out from under the coordinator
        fx.registry.remove("doc-1", "acme").await;

        type_text(&c, "doomed");
        settle().await;

        let result = c.force_save().await;
        assert!(matches!(result, Err(SyncError::MetadataConflict { .. })));
        assert!(c.is_halted());
        assert!(c.has_unsaved_changes(), "dirty stays set");

        // Further saves refuse to touch storage
        assert_eq!(c.force_save().await.unwrap(), FlushOutcome::Halted);
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_dirty_and_retries() {
        let fx = fixture("doc-1", "acme").await;

        // A store rooted at a path that cannot be created
        let bad_store = Arc::new(FsSnapshotStore::new(StoreConfig::for_testing(
            "/proc/no-such-root/trellis",
        )));
        let errors: Arc<std::sync::Mutex<Vec<String>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = errors.clone();
        let hooks = CoordinatorHooks {
            on_connection_change: None,
            on_sync_error: Some(Arc::new(move |e: &SyncError| {
                sink.lock().unwrap().push(e.to_string());
            })),
        };
        let c = SyncCoordinator::new(
            CoordinatorConfig::for_testing("doc-1", "acme"),
            fx.channel.clone(),
            bad_store,
            fx.registry.clone(),
            hooks,
        )
        .unwrap();

        type_text(&c, "unsavable");
        settle().await;

        assert!(c.force_save().await.is_err());
        assert!(c.has_unsaved_changes(), "dirty survives a failed flush");
        assert!(!c.is_halted(), "storage errors do not halt");
        assert_eq!(c.current_sync_version(), 0);
        c.destroy().await;

        // The debounce-fired flush also reported through the hook
        assert!(!errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_document_size_ceiling_enforced() {
        let fx = fixture("doc-1", "acme").await;
        let mut config = CoordinatorConfig::for_testing("doc-1", "acme");
        config.max_document_bytes = 64;
        let c = SyncCoordinator::new(
            config,
            fx.channel.clone(),
            fx.store.clone(),
            fx.registry.clone(),
            CoordinatorHooks::default(),
        )
        .unwrap();

        type_text(&c, &"x".repeat(1024));
        settle().await;

        let result = c.force_save().await;
        assert!(matches!(result, Err(SyncError::DocumentTooLarge { .. })));
        assert!(!fx.store.exists("acme", "doc-1").await.unwrap());
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_performs_teardown_flush() {
        let fx = fixture("doc-1", "acme").await;
        let c = coordinator(&fx, "doc-1", "acme");
        c.load().await.unwrap();

        type_text(&c, "last words");
        settle().await;
        assert!(c.has_unsaved_changes());

        c.destroy().await;

        // Exactly one save happened on the way out
        let record = fx.registry.fetch("doc-1", "acme").await.unwrap().unwrap();
        assert_eq!(record.sync_version, 1);
        let c2 = coordinator(&fx, "doc-1", "acme");
        c2.load().await.unwrap();
        assert_eq!(read_text(&c2), "last words");
        c2.destroy().await;
    }

    #[tokio::test]
    async fn test_connection_hook_fires_on_status_change() {
        let fx = fixture("doc-1", "acme").await;
        let seen: Arc<std::sync::Mutex<Vec<bool>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hooks = CoordinatorHooks {
            on_connection_change: Some(Arc::new(move |connected| {
                sink.lock().unwrap().push(connected);
            })),
            on_sync_error: None,
        };
        let c = SyncCoordinator::new(
            CoordinatorConfig::for_testing("doc-1", "acme"),
            fx.channel.clone(),
            fx.store.clone(),
            fx.registry.clone(),
            hooks,
        )
        .unwrap();

        fx.channel.set_status(ChannelStatus::Disconnected);
        settle().await;
        fx.channel.set_status(ChannelStatus::Connected);
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![false, true]);
        c.destroy().await;
    }

    #[tokio::test]
    async fn test_sync_version_continues_across_sessions() {
        let fx = fixture("doc-1", "acme").await;

        for expected in 1..=3u64 {
            let c = coordinator(&fx, "doc-1", "acme");
            c.load().await.unwrap();
            type_text(&c, "more ");
            settle().await;
            assert_eq!(
                c.force_save().await.unwrap(),
                FlushOutcome::Flushed {
                    sync_version: expected
                }
            );
            c.destroy().await;
        }

        let record = fx.registry.fetch("doc-1", "acme").await.unwrap().unwrap();
        assert_eq!(record.sync_version, 3);
    }
}
