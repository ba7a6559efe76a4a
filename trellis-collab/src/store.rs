//! Durable snapshot store: tenant-scoped binary blobs.
//!
//! One blob per document at `{root}/{tenant_id}/{document_id}.state`,
//! overwritten on each flush — no snapshot history is kept here. Blobs are
//! LZ4-compressed on disk and written via temp file + atomic rename so a
//! crashed flush never leaves a torn snapshot.
//!
//! Not-found is a `None` result, never an error: "no document yet" and
//! "storage failure" are different conditions and callers must not conflate
//! them.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::protocol::{validate_identifier, MAX_DOCUMENT_ID_LEN};

/// Result of a successful snapshot write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedSnapshot {
    /// Tenant-relative storage path (`{tenant}/{doc}.state`).
    pub path: String,
    /// Bytes written to durable storage (compressed).
    pub size_bytes: u64,
}

/// Storage errors. Not-found is not among them by design.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Identifier failed the safe-pattern check (path traversal guard).
    InvalidIdentifier(String),
    /// Underlying I/O failure.
    Io(String),
    /// Snapshot decompression failed (corrupt blob).
    Compression(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidIdentifier(id) => write!(f, "Invalid identifier: {id:?}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Build the tenant-relative storage path, validating both segments.
///
/// Shares the identifier check with the coordinator and channel naming —
/// the same pattern guards every place an id touches the filesystem.
pub fn storage_path(tenant_id: &str, document_id: &str) -> Result<String, StoreError> {
    validate_identifier(tenant_id, MAX_DOCUMENT_ID_LEN)
        .map_err(|_| StoreError::InvalidIdentifier(tenant_id.to_string()))?;
    validate_identifier(document_id, MAX_DOCUMENT_ID_LEN)
        .map_err(|_| StoreError::InvalidIdentifier(document_id.to_string()))?;
    Ok(format!("{tenant_id}/{document_id}.state"))
}

/// Contract for durable snapshot persistence.
///
/// Shared across all coordinators of a tenant; writes are scoped by
/// (tenant, document) and safe to run concurrently for different documents.
/// Concurrent writers to the same document are last-write-wins — CRDT merge
/// on reload, not storage ordering, provides convergence.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Write (upsert) the full snapshot for a document.
    async fn save(
        &self,
        tenant_id: &str,
        document_id: &str,
        bytes: &[u8],
    ) -> Result<SavedSnapshot, StoreError>;

    /// Fetch the latest snapshot. `None` when no snapshot exists yet.
    async fn load(&self, tenant_id: &str, document_id: &str)
        -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a snapshot. Returns whether one existed.
    async fn delete(&self, tenant_id: &str, document_id: &str) -> Result<bool, StoreError>;

    /// Whether a snapshot exists.
    async fn exists(&self, tenant_id: &str, document_id: &str) -> Result<bool, StoreError>;

    /// Stored (compressed) size in bytes, `None` when absent.
    async fn size(&self, tenant_id: &str, document_id: &str) -> Result<Option<u64>, StoreError>;

    /// Document ids with a snapshot under the given tenant.
    async fn list_documents(&self, tenant_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all tenants.
    pub root: PathBuf,
    /// fsync after each write (default: false — rename gives atomicity,
    /// the debounce window already bounds loss).
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("trellis_data"),
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Config for testing (temp directory, no fsync).
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sync_writes: false,
        }
    }
}

/// Filesystem-backed snapshot store.
pub struct FsSnapshotStore {
    config: StoreConfig,
}

impl FsSnapshotStore {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Absolute blob path for a (tenant, document) pair.
    fn blob_path(&self, tenant_id: &str, document_id: &str) -> Result<PathBuf, StoreError> {
        // storage_path validates both segments; join only after it passes.
        let relative = storage_path(tenant_id, document_id)?;
        Ok(self.config.root.join(relative))
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn save(
        &self,
        tenant_id: &str,
        document_id: &str,
        bytes: &[u8],
    ) -> Result<SavedSnapshot, StoreError> {
        let relative = storage_path(tenant_id, document_id)?;
        let path = self.config.root.join(&relative);
        let dir = self.config.root.join(tenant_id);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let compressed = lz4_flex::compress_prepend_size(bytes);
        let size_bytes = compressed.len() as u64;

        // Write to a temp file in the same directory, then rename over the
        // target. Rename is atomic on the same filesystem, so readers see
        // either the old snapshot or the new one, never a torn write.
        let tmp = dir.join(format!(".{document_id}.state.tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &compressed)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;

        if self.config.sync_writes {
            let file = tokio::fs::File::open(&tmp)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            file.sync_all()
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }

        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StoreError::Io(e.to_string()));
        }

        log::debug!(
            "store: wrote {relative} ({} bytes raw, {size_bytes} compressed)",
            bytes.len()
        );

        Ok(SavedSnapshot {
            path: relative,
            size_bytes,
        })
    }

    async fn load(
        &self,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.blob_path(tenant_id, document_id)?;
        match tokio::fs::read(&path).await {
            Ok(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn delete(&self, tenant_id: &str, document_id: &str) -> Result<bool, StoreError> {
        let path = self.blob_path(tenant_id, document_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn exists(&self, tenant_id: &str, document_id: &str) -> Result<bool, StoreError> {
        Ok(self.size(tenant_id, document_id).await?.is_some())
    }

    async fn size(&self, tenant_id: &str, document_id: &str) -> Result<Option<u64>, StoreError> {
        let path = self.blob_path(tenant_id, document_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    async fn list_documents(&self, tenant_id: &str) -> Result<Vec<String>, StoreError> {
        validate_identifier(tenant_id, MAX_DOCUMENT_ID_LEN)
            .map_err(|_| StoreError::InvalidIdentifier(tenant_id.to_string()))?;
        let dir = self.config.root.join(tenant_id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_suffix(".state") {
                // Skip temp files and anything that fails the id pattern
                if validate_identifier(id, MAX_DOCUMENT_ID_LEN).is_ok() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(StoreConfig::for_testing(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_storage_path_shape() {
        assert_eq!(storage_path("acme", "doc-1").unwrap(), "acme/doc-1.state");
    }

    #[test]
    fn test_storage_path_rejects_traversal() {
        assert!(storage_path("..", "doc").is_err());
        assert!(storage_path("acme", "doc/../escape").is_err());
        assert!(storage_path("a/b", "doc").is_err());
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (_dir, store) = store();
        let payload = b"snapshot bytes".to_vec();

        let saved = store.save("acme", "doc-1", &payload).await.unwrap();
        assert_eq!(saved.path, "acme/doc-1.state");
        assert!(saved.size_bytes > 0);

        let loaded = store.load("acme", "doc-1").await.unwrap();
        assert_eq!(loaded, Some(payload));
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let (_dir, store) = store();
        assert_eq!(store.load("acme", "nope").await.unwrap(), None);
        assert!(!store.exists("acme", "nope").await.unwrap());
        assert_eq!(store.size("acme", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let (_dir, store) = store();
        store.save("acme", "doc-1", b"first").await.unwrap();
        store.save("acme", "doc-1", b"second").await.unwrap();

        let loaded = store.load("acme", "doc-1").await.unwrap().unwrap();
        assert_eq!(loaded, b"second");
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let (_dir, store) = store();
        store.save("acme", "doc-1", b"x").await.unwrap();

        assert!(store.delete("acme", "doc-1").await.unwrap());
        assert!(!store.delete("acme", "doc-1").await.unwrap());
        assert_eq!(store.load("acme", "doc-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let (_dir, store) = store();
        store.save("acme", "doc-1", b"acme data").await.unwrap();

        assert_eq!(store.load("globex", "doc-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_documents() {
        let (_dir, store) = store();
        store.save("acme", "doc-b", b"1").await.unwrap();
        store.save("acme", "doc-a", b"2").await.unwrap();
        store.save("globex", "other", b"3").await.unwrap();

        let docs = store.list_documents("acme").await.unwrap();
        assert_eq!(docs, vec!["doc-a".to_string(), "doc-b".to_string()]);
        assert!(store.list_documents("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected_everywhere() {
        let (_dir, store) = store();
        assert!(store.save("..", "doc", b"x").await.is_err());
        assert!(store.load("acme", "doc/../escape").await.is_err());
        assert!(store.delete("a b", "doc").await.is_err());
        assert!(store.list_documents("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_compression_roundtrip_large() {
        let (_dir, store) = store();
        // Compressible payload exercises the LZ4 path
        let payload = vec![7u8; 256 * 1024];

        let saved = store.save("acme", "big", &payload).await.unwrap();
        assert!(saved.size_bytes < payload.len() as u64);

        let loaded = store.load("acme", "big").await.unwrap().unwrap();
        assert_eq!(loaded, payload);
    }
}
