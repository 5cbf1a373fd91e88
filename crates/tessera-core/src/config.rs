//! Backend configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Pending dispatches that trigger a submission.
    pub max_dispatches_per_flush: usize,
    /// Smallest pool bucket, in bytes. Must be a power of two.
    pub min_bucket_size: u64,
    /// Released blocks kept per bucket; further blocks are destroyed.
    pub max_pooled_per_bucket: usize,
    /// Record a [`DispatchRecord`](crate::DispatchRecord) per dispatch.
    pub profiling: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_dispatches_per_flush: 16,
            min_bucket_size: 256,
            max_pooled_per_bucket: 8,
            profiling: false,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_dispatches_per_flush == 0 {
            return Err(Error::InvalidConfig(
                "max_dispatches_per_flush must be at least 1".into(),
            ));
        }
        if !self.min_bucket_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "min_bucket_size {} is not a power of two",
                self.min_bucket_size
            )));
        }
        Ok(())
    }

    /// Parse and validate a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
