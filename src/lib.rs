//! GPU-resident columnar chunk store
//!
//! A shared-memory resource-tracking and lifecycle subsystem for GPU
//! execution contexts and an immutable columnar data store with
//! snapshot-isolation semantics. Chunk visibility follows MVCC rules
//! driven by transaction commit/abort events; every native resource
//! (device memory, compiled programs, I/O-mapped memory) is tracked
//! per-context for deterministic, leak-free teardown.

pub mod config;
pub mod context;
pub mod device;
pub mod encode;
pub mod shmem;
pub mod store;
pub mod txn;

// Re-export main types
pub use config::StoreConfig;
pub use context::pool::{ContextPool, ExecutionContext};
pub use device::{DeviceMemHandle, DeviceRuntime, HostDevice};
pub use store::{ChunkStore, TableKey};
pub use txn::{Snapshot, Txn, TxnId, TxnOracle};

/// Chunk store error type
#[derive(Debug, thiserror::Error)]
pub enum GpuStoreError {
    /// A fixed-capacity pool (context slots, chunk descriptors) is drained.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Lookup/untrack/release of something that is not there.
    #[error("not found: {0}")]
    NotFound(String),

    /// Impossible shared-state transition; signals a latent bug, aborts
    /// the current request.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// A device-execution call failed; partial acquisitions have been
    /// rolled back before this was raised.
    #[error("device operation failed: {0}")]
    DeviceOperationFailed(String),

    /// Operation outside the store's supported modes (row-filtered
    /// delete, insert into a non-empty store, export of an unpinned
    /// chunk).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias used across the crate
pub type Result<T> = std::result::Result<T, GpuStoreError>;
