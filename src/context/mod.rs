//! Execution contexts and per-context resource tracking

pub mod pool;
pub mod restrack;

pub use pool::{ContextPool, ExecutionContext, ScopeId, SlotId, Transport, TransportConnector};
pub use restrack::{ResourceTracker, TrackedResource};
