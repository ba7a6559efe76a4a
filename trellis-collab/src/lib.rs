//! # trellis-collab — Real-time document synchronization layer for Trellis
//!
//! Keeps a locally edited CRDT document converged with its peers and durable
//! in tenant-scoped storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   local updates    ┌─────────────────┐
//! │ yrs Doc     │ ◄────────────────► │ SyncCoordinator │  one per open doc
//! │ (host edits)│   remote applies   └───────┬─────────┘
//! └─────────────┘                            │
//!                         broadcast (latency)│ debounced flush (durability)
//!                       ┌────────────────────┼────────────────────┐
//!                       ▼                    ▼                    ▼
//!                ┌─────────────┐      ┌──────────────┐   ┌──────────────────┐
//!                │ DocChannel  │      │ SnapshotStore│   │ MetadataRegistry │
//!                │ (fan-out)   │      │ (blobs)      │   │ (versions)       │
//!                └─────────────┘      └──────────────┘   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire envelope (bincode-encoded DeltaEnvelope)
//! - [`broadcast`] — Per-document channels with fan-out and idle cleanup
//! - [`store`] — Durable tenant-scoped snapshot blobs (LZ4, atomic rename)
//! - [`metadata`] — Versioned per-document sync records
//! - [`coordinator`] — The sync engine: broadcast, apply, debounce, flush
//! - [`session`] — Identity-keyed coordinator lifecycle for hosts
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Convergence | CRDT merge; every delta reaches every subscriber |
//! | No echo loops | `applying_remote` flag + origin tag filtering |
//! | Write coalescing | Debounce: N edits in a window, one storage write |
//! | Tenant isolation | (id, tenant) filters on storage and metadata |
//! | No torn snapshots | Temp file + atomic rename |

pub mod protocol;
pub mod broadcast;
pub mod store;
pub mod metadata;
pub mod coordinator;
pub mod session;

// Re-exports for convenience
pub use protocol::{
    DeltaEnvelope, ProtocolError, MAX_DOCUMENT_BYTES, MAX_DOCUMENT_ID_LEN, MAX_ORIGIN_LEN,
    MAX_PAYLOAD_BYTES,
};
pub use broadcast::{channel_name, ChannelRegistry, ChannelStats, ChannelStatus, DocChannel};
pub use store::{
    storage_path, FsSnapshotStore, SavedSnapshot, SnapshotStore, StoreConfig, StoreError,
};
pub use metadata::{
    DocumentRecord, InMemoryRegistry, MetadataError, MetadataRegistry, SyncStateUpdate,
};
pub use coordinator::{
    CoordinatorConfig, CoordinatorHooks, CoordinatorStats, FlushOutcome, LoadOutcome,
    SyncCoordinator, SyncError,
};
pub use session::{
    DocumentSession, InitGuard, SessionContext, SessionIdentity, SessionStatus,
};
