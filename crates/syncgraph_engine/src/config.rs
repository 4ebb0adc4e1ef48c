//! Engine configuration.

use std::time::Duration;

/// Tunables for a sync context, built with a fluent API:
///
/// ```
/// use syncgraph_engine::SyncConfig;
/// use std::time::Duration;
///
/// let config = SyncConfig::new("https://api.example.com/sync")
///     .batch_limit(64)
///     .request_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Endpoint the transport submits batches to.
    pub endpoint: String,
    /// Maximum operations drained into one batch.
    pub batch_limit: usize,
    /// Per-request transport timeout.
    pub request_timeout: Duration,
    /// Whether patches queue without an immediate flush by default.
    pub wait_by_default: bool,
}

impl SyncConfig {
    /// Creates a configuration with defaults for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            batch_limit: 128,
            request_timeout: Duration::from_secs(30),
            wait_by_default: false,
        }
    }

    /// Caps how many queued operations one flush drains.
    pub fn batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit.max(1);
        self
    }

    /// Sets the per-request transport timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Makes patches queue without flushing unless overridden per call.
    pub fn wait_by_default(mut self, wait: bool) -> Self {
        self.wait_by_default = wait;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}
