//! Metadata registry contract: versioned per-document sync records.
//!
//! The registry is an external collaborator (relationally backed in
//! production); this module specifies its contract and ships an in-memory
//! reference implementation for tests and local mode.
//!
//! The one hard rule: updates are conditioned on **id AND tenant_id**, never
//! id alone, and report the number of rows actually affected. A zero-row
//! match is how the coordinator detects a tenant mismatch or a deleted
//! document — it must never be silently ignored.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::RwLock;

/// Seconds since the Unix epoch.
pub(crate) fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Relational record of a document's existence and sync state.
///
/// Created once per document by the application layer before any
/// coordinator is constructed; mutated only by post-flush updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub tenant_id: String,
    pub storage_path: String,
    pub storage_size_bytes: u64,
    /// Monotonically non-decreasing; +1 per successful flush.
    pub sync_version: u64,
    /// Seconds since epoch of the last successful flush, `None` before the
    /// first one.
    pub last_sync_at: Option<u64>,
    pub updated_at: u64,
}

impl DocumentRecord {
    /// A fresh record for a document that has never been flushed.
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        storage_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            storage_path: storage_path.into(),
            storage_size_bytes: 0,
            sync_version: 0,
            last_sync_at: None,
            updated_at: now_epoch_secs(),
        }
    }
}

/// Fields written by a post-flush metadata update.
#[derive(Debug, Clone)]
pub struct SyncStateUpdate {
    pub storage_path: String,
    pub storage_size_bytes: u64,
    pub sync_version: u64,
    pub last_sync_at: u64,
}

/// Registry errors (transport/backend failures only — a zero-row update is
/// reported through the affected-rows count, not as an error here).
#[derive(Debug, Clone)]
pub enum MetadataError {
    Backend(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "Registry backend error: {e}"),
        }
    }
}

impl std::error::Error for MetadataError {}

/// Contract for the metadata registry.
#[async_trait]
pub trait MetadataRegistry: Send + Sync {
    /// Apply a post-flush update, filtered by id AND tenant_id.
    ///
    /// Returns the number of rows affected. Zero means the (id, tenant)
    /// pair matched nothing — the caller decides what that implies.
    async fn update_sync_state(
        &self,
        document_id: &str,
        tenant_id: &str,
        change: SyncStateUpdate,
    ) -> Result<u64, MetadataError>;

    /// Fetch a record by (id, tenant). `None` when absent.
    async fn fetch(
        &self,
        document_id: &str,
        tenant_id: &str,
    ) -> Result<Option<DocumentRecord>, MetadataError>;
}

/// In-memory reference implementation.
pub struct InMemoryRegistry {
    records: RwLock<HashMap<(String, String), DocumentRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Register a document record (the application layer's "create").
    pub async fn insert(&self, record: DocumentRecord) {
        let key = (record.tenant_id.clone(), record.id.clone());
        self.records.write().await.insert(key, record);
    }

    /// Remove a record, e.g. when a document is deleted out from under an
    /// open coordinator.
    pub async fn remove(&self, document_id: &str, tenant_id: &str) -> bool {
        self.records
            .write()
            .await
            .remove(&(tenant_id.to_string(), document_id.to_string()))
            .is_some()
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataRegistry for InMemoryRegistry {
    async fn update_sync_state(
        &self,
        document_id: &str,
        tenant_id: &str,
        change: SyncStateUpdate,
    ) -> Result<u64, MetadataError> {
        let key = (tenant_id.to_string(), document_id.to_string());
        let mut records = self.records.write().await;
        match records.get_mut(&key) {
            Some(record) => {
                record.storage_path = change.storage_path;
                record.storage_size_bytes = change.storage_size_bytes;
                record.sync_version = change.sync_version;
                record.last_sync_at = Some(change.last_sync_at);
                record.updated_at = now_epoch_secs();
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn fetch(
        &self,
        document_id: &str,
        tenant_id: &str,
    ) -> Result<Option<DocumentRecord>, MetadataError> {
        let key = (tenant_id.to_string(), document_id.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }
}
