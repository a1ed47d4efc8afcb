use crate::error::{BundleError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Bundle submissions larger than this are rejected before parsing.
pub const DEFAULT_MAX_BUNDLE_BYTES: usize = 50 * 1024 * 1024;

/// Runtime settings of the processor.
///
/// Every field has a default, so a config file only needs the values it
/// overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Upper bound on entries dispatched at the same time.
    pub max_concurrency: usize,
    /// Deadline for a single adapter call.
    pub adapter_timeout_ms: u64,
    /// Deadline for the whole Bundle. `None` waits for every entry.
    pub bundle_timeout_ms: Option<u64>,
    /// Pause before the single retry of a transient adapter failure.
    pub retry_backoff_ms: u64,
    pub max_bundle_bytes: usize,
    /// When set, the Bundle identifier must use this system and carry a
    /// `program-project` value.
    pub required_identifier_system: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            adapter_timeout_ms: 30_000,
            bundle_timeout_ms: None,
            retry_backoff_ms: 100,
            max_bundle_bytes: DEFAULT_MAX_BUNDLE_BYTES,
            required_identifier_system: None,
        }
    }
}

impl ProcessorConfig {
    /// Loads a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| BundleError::Config(format!("cannot parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(BundleError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.adapter_timeout_ms == 0 {
            return Err(BundleError::Config(
                "adapter_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn bundle_timeout(&self) -> Option<Duration> {
        self.bundle_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
