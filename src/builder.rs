//! Builder for configuring and constructing a [`Backend`].

use crate::Result;
use tessera_core::{Backend, BackendConfig, ComputeDevice};

#[cfg(feature = "wgpu")]
use tessera_wgpu::{PowerPreference, WgpuDevice, WgpuOptions};

/// Collects backend configuration and device options, then builds a
/// [`Backend`] on the wgpu device or on a device supplied by the caller.
///
/// # Example
///
/// ```ignore
/// use tessera::prelude::*;
///
/// let mut backend = BackendBuilder::new()
///     .max_dispatches_per_flush(32)
///     .profiling(true)
///     .build()?;
///
/// // Or fall back when no GPU is present
/// let Some(backend) = BackendBuilder::new().try_build() else {
///     return run_on_cpu();
/// };
/// ```
#[derive(Debug, Clone, Default)]
pub struct BackendBuilder {
    config: BackendConfig,

    #[cfg(feature = "wgpu")]
    options: WgpuOptions,
}

impl BackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: BackendConfig) -> Self {
        self.config = config;
        self
    }

    /// Load the configuration from a TOML document.
    pub fn config_toml(mut self, toml: &str) -> Result<Self> {
        self.config = BackendConfig::from_toml_str(toml)?;
        Ok(self)
    }

    /// Default: 16
    pub fn max_dispatches_per_flush(mut self, count: usize) -> Self {
        self.config.max_dispatches_per_flush = count;
        self
    }

    /// Default: 256
    pub fn min_bucket_size(mut self, bytes: u64) -> Self {
        self.config.min_bucket_size = bytes;
        self
    }

    /// Default: 8
    pub fn max_pooled_per_bucket(mut self, count: usize) -> Self {
        self.config.max_pooled_per_bucket = count;
        self
    }

    pub fn profiling(mut self, enabled: bool) -> Self {
        self.config.profiling = enabled;
        self
    }

    #[cfg(feature = "wgpu")]
    pub fn power_preference(mut self, preference: PowerPreference) -> Self {
        self.options.power_preference = preference;
        self
    }

    #[cfg(feature = "wgpu")]
    pub fn force_fallback_adapter(mut self, force: bool) -> Self {
        self.options.force_fallback_adapter = force;
        self
    }

    #[cfg(feature = "wgpu")]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.options.label = label.into();
        self
    }

    /// Build on a caller-supplied device.
    pub fn build_with<D: ComputeDevice + 'static>(self, device: D) -> Result<Backend<D>> {
        Ok(Backend::new(device, self.config)?)
    }

    /// Acquire a wgpu device and build on it.
    #[cfg(feature = "wgpu")]
    pub fn build(self) -> Result<Backend<WgpuDevice>> {
        Ok(tessera_wgpu::create_backend(&self.options, self.config)?)
    }

    /// Like [`build`](Self::build), but logs the failure and returns `None`
    /// so the host can fall back to another execution path.
    #[cfg(feature = "wgpu")]
    pub fn try_build(self) -> Option<Backend<WgpuDevice>> {
        match self.build() {
            Ok(backend) => Some(backend),
            Err(e) => {
                tracing::warn!("GPU backend unavailable, falling back: {}", e);
                None
            }
        }
    }
}
