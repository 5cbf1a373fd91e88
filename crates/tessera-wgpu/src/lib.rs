//! wgpu device for the Tessera execution core.
//!
//! Implements [`ComputeDevice`](tessera_core::ComputeDevice) on a wgpu device
//! and queue. Programs are WGSL compute shaders compiled with an automatic
//! pipeline layout: every binding of group 0 is a storage buffer, bound in
//! order (inputs, outputs, then uniforms), and each binding must be used by
//! the shader.
//!
//! Uploads go through a staging copy recorded in the current command
//! encoder, so they stay ordered with the dispatches around them. Readback
//! maps a staging buffer and waits on the device.
//!
//! # Example
//!
//! ```ignore
//! use tessera_wgpu::{create_backend, WgpuOptions};
//!
//! let mut backend = create_backend(&WgpuOptions::default(), BackendConfig::default())?;
//! ```

mod device;
mod options;

pub use device::{WgpuDevice, WgpuProgram};
pub use options::{PowerPreference, WgpuOptions};

use tessera_core::{Backend, BackendConfig, Result};

/// Acquire a device, blocking until the adapter and device are ready.
pub fn initialize(options: &WgpuOptions) -> Result<WgpuDevice> {
    pollster::block_on(WgpuDevice::request(options))
}

/// Acquire a device and build a [`Backend`] on it.
pub fn create_backend(options: &WgpuOptions, config: BackendConfig) -> Result<Backend<WgpuDevice>> {
    let device = initialize(options)?;
    Backend::new(device, config)
}
