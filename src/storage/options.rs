use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use super::metrics::{default_metrics, CountsMetrics};

/// Default bound on keys held in the live generation before a merge is forced.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 100_000;

/// Configuration options supplied when opening a [`super::CountsStore`].
///
/// Deserializes from a config table with every field optional, for example
///
/// ```toml
/// read_only = false
/// max_cache_size = 50000
/// sync_on_checkpoint = true
/// ```
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CountsStoreOptions {
    /// Open without write access: checkpoints become no-ops and rebuilds fail.
    pub read_only: bool,
    /// Number of changed keys in the live generation that forces a merge.
    /// A merge is attempted opportunistically above 80% of this value.
    pub max_cache_size: usize,
    /// Whether checkpoints fsync the image and its directory.
    pub sync_on_checkpoint: bool,
    /// Optional metrics collection implementation.
    #[serde(skip)]
    pub metrics: Option<Arc<dyn CountsMetrics>>,
}

impl Default for CountsStoreOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            sync_on_checkpoint: true,
            metrics: None,
        }
    }
}

impl fmt::Debug for CountsStoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountsStoreOptions")
            .field("read_only", &self.read_only)
            .field("max_cache_size", &self.max_cache_size)
            .field("sync_on_checkpoint", &self.sync_on_checkpoint)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl CountsStoreOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables read-only mode.
    pub fn read_only(mut self, enabled: bool) -> Self {
        self.read_only = enabled;
        self
    }

    /// Sets the live generation size that forces a merge.
    pub fn max_cache_size(mut self, keys: usize) -> Self {
        self.max_cache_size = keys;
        self
    }

    /// Enables or disables fsync on checkpoint.
    pub fn sync_on_checkpoint(mut self, enabled: bool) -> Self {
        self.sync_on_checkpoint = enabled;
        self
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn CountsMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Parses options from a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub(crate) fn metrics_or_default(&self) -> Arc<dyn CountsMetrics> {
        self.metrics.clone().unwrap_or_else(default_metrics)
    }

    /// Size of the live generation above which a merge is attempted without blocking.
    pub(crate) fn high_mark(&self) -> usize {
        self.max_cache_size.saturating_mul(8) / 10
    }
}
