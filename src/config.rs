//! Start-up configuration
//!
//! Both pools are sized once at start-up and never grown: exhaustion is
//! a hard error, not a trigger for reallocation. Capacities should be
//! derived from the expected number of concurrent connections plus
//! background workers.

use serde::{Deserialize, Serialize};

/// Default number of execution context slots
const DEFAULT_MAX_CONTEXTS: usize = 128;

/// Default number of chunk descriptor slots
const DEFAULT_MAX_CHUNKS: usize = 512;

/// Fixed capacity bounds for the shared pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of concurrently live execution contexts
    pub max_contexts: usize,
    /// Maximum number of concurrently live chunk descriptors
    pub max_chunks: usize,
}

impl StoreConfig {
    /// Create a config with explicit capacities
    pub fn new(max_contexts: usize, max_chunks: usize) -> Self {
        Self {
            max_contexts,
            max_chunks,
        }
    }

    /// Set the context pool capacity
    pub fn max_contexts(mut self, n: usize) -> Self {
        self.max_contexts = n;
        self
    }

    /// Set the chunk descriptor pool capacity
    pub fn max_chunks(mut self, n: usize) -> Self {
        self.max_chunks = n;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }
}
