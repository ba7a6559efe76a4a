//! Lifecycle binding: one live coordinator per (document, tenant) identity.
//!
//! The host application declares *what* should be open via
//! [`DocumentSession::bind`]; this module owns *when* coordinators are
//! constructed and torn down. Binding is keyed on identity, never on call
//! count — rebinding the same identity is a no-op, so hosts can call `bind`
//! from reactive state without churning coordinators, transport handles, or
//! in-flight debounce timers.
//!
//! Channel handles come from a shared [`ChannelRegistry`], so two sessions
//! bound to the same document in one process converge over the same channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broadcast::{channel_name, ChannelRegistry};
use crate::coordinator::{
    CoordinatorConfig, CoordinatorHooks, FlushOutcome, SyncCoordinator, SyncError,
};
use crate::metadata::MetadataRegistry;
use crate::store::SnapshotStore;

/// Interval between idle-channel sweeps of the shared registry.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide idempotent-initialization token.
///
/// Passed through the [`SessionContext`] rather than living as hidden
/// module state, so tests get a fresh one per fixture instead of fighting
/// over a global.
pub struct InitGuard {
    done: AtomicBool,
}

impl InitGuard {
    pub fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// True exactly once; every later call returns false.
    pub fn acquire(&self) -> bool {
        !self.done.swap(true, Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Re-arm the guard (test fixtures only, in practice).
    pub fn reset(&self) {
        self.done.store(false, Ordering::SeqCst);
    }
}

impl Default for InitGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared collaborators handed to every session in the process.
#[derive(Clone)]
pub struct SessionContext {
    pub channels: Arc<ChannelRegistry>,
    pub store: Arc<dyn SnapshotStore>,
    pub registry: Arc<dyn MetadataRegistry>,
    pub init: Arc<InitGuard>,
}

impl SessionContext {
    pub fn new(
        channels: Arc<ChannelRegistry>,
        store: Arc<dyn SnapshotStore>,
        registry: Arc<dyn MetadataRegistry>,
    ) -> Self {
        Self {
            channels,
            store,
            registry,
            init: Arc::new(InitGuard::new()),
        }
    }

    /// One-time background maintenance: periodically sweep idle channels
    /// out of the shared registry. Guarded by the context's [`InitGuard`],
    /// so any number of sessions can call this and exactly one sweeper runs.
    pub fn ensure_background_maintenance(&self) {
        if !self.init.acquire() {
            return;
        }
        let channels = self.channels.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let removed = channels.sweep_idle().await;
                if removed > 0 {
                    log::debug!("channel registry: swept {removed} idle channels");
                }
            }
        });
    }
}

/// What a session should currently be bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub document_id: String,
    pub tenant_id: String,
    /// When false the session holds no coordinator at all.
    pub enabled: bool,
}

impl SessionIdentity {
    pub fn new(document_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            tenant_id: tenant_id.into(),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            document_id: String::new(),
            tenant_id: String::new(),
            enabled: false,
        }
    }
}

/// Point-in-time view of a session's sync state.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub is_loading: bool,
    pub is_connected: bool,
    pub has_unsaved_changes: bool,
    /// Most recent background sync error; cleared on rebind.
    pub error: Option<String>,
}

/// Flag block written by coordinator hooks, read by `status()`.
struct StatusInner {
    is_loading: AtomicBool,
    is_connected: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl StatusInner {
    fn new() -> Self {
        Self {
            is_loading: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }
}

struct ActiveBinding {
    identity: SessionIdentity,
    coordinator: SyncCoordinator,
    status: Arc<StatusInner>,
}

/// A host-facing document session.
///
/// Not `Clone` and not shared: each editing surface owns one session and
/// drives it from its own state changes.
pub struct DocumentSession {
    context: SessionContext,
    debounce: Option<Duration>,
    active: Option<ActiveBinding>,
}

impl DocumentSession {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            debounce: None,
            active: None,
        }
    }

    /// Override the default flush debounce for coordinators this session
    /// builds (used by tests and latency-sensitive hosts).
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    /// Reconcile the session against the desired identity.
    ///
    /// Same identity: no-op. Different identity: the old coordinator is
    /// destroyed (with its teardown flush) before the new one is built and
    /// loaded. A disabled identity just closes.
    pub async fn bind(&mut self, identity: SessionIdentity) -> Result<(), SyncError> {
        if let Some(active) = &self.active {
            if active.identity == identity {
                return Ok(());
            }
        }
        self.close().await;

        if !identity.enabled {
            return Ok(());
        }
        self.context.ensure_background_maintenance();

        let name = channel_name(&identity.document_id)
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        let channel = self.context.channels.get_or_create(&name).await;

        let status = Arc::new(StatusInner::new());
        // Seed connectivity from the channel's current state; the hook only
        // reports transitions after that.
        status.is_connected.store(
            *channel.status().borrow() == crate::broadcast::ChannelStatus::Connected,
            Ordering::SeqCst,
        );

        let conn_status = status.clone();
        let err_status = status.clone();
        let hooks = CoordinatorHooks {
            on_connection_change: Some(Arc::new(move |connected| {
                conn_status.is_connected.store(connected, Ordering::SeqCst);
            })),
            on_sync_error: Some(Arc::new(move |e: &SyncError| {
                if let Ok(mut slot) = err_status.last_error.lock() {
                    *slot = Some(e.to_string());
                }
            })),
        };

        let mut config = CoordinatorConfig::new(&identity.document_id, &identity.tenant_id);
        if let Some(debounce) = self.debounce {
            config.debounce = debounce;
        }
        let coordinator = SyncCoordinator::new(
            config,
            channel,
            self.context.store.clone(),
            self.context.registry.clone(),
            hooks,
        )?;

        status.is_loading.store(true, Ordering::SeqCst);
        let loaded = coordinator.load().await;
        status.is_loading.store(false, Ordering::SeqCst);

        self.active = Some(ActiveBinding {
            identity,
            coordinator,
            status,
        });

        // The binding stays active even when the initial load failed: the
        // host can retry via save()/rebind, and the error is visible in
        // status().
        match loaded {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Some(active) = &self.active {
                    if let Ok(mut slot) = active.status.last_error.lock() {
                        *slot = Some(e.to_string());
                    }
                }
                Err(e)
            }
        }
    }

    /// The active coordinator, if any.
    pub fn coordinator(&self) -> Option<&SyncCoordinator> {
        self.active.as_ref().map(|a| &a.coordinator)
    }

    pub fn status(&self) -> SessionStatus {
        match &self.active {
            Some(active) => SessionStatus {
                is_loading: active.status.is_loading.load(Ordering::SeqCst),
                is_connected: active.status.is_connected.load(Ordering::SeqCst),
                has_unsaved_changes: active.coordinator.has_unsaved_changes(),
                error: active
                    .status
                    .last_error
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone()),
            },
            None => SessionStatus::default(),
        }
    }

    /// Imperative save of the bound document, bypassing the debounce.
    /// Saving with no binding is a no-op, not an error.
    pub async fn save(&self) -> Result<Option<FlushOutcome>, SyncError> {
        match &self.active {
            Some(active) => {
                let outcome = active.coordinator.force_save().await;
                if let Err(e) = &outcome {
                    if let Ok(mut slot) = active.status.last_error.lock() {
                        *slot = Some(e.to_string());
                    }
                }
                outcome.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Destroy the active coordinator (teardown flush included).
    pub async fn close(&mut self) {
        if let Some(active) = self.active.take() {
            active.coordinator.destroy().await;
        }
    }
}
