//! # Tessera - GPU Execution Backend
//!
//! Executes tensor kernels on a GPU through a small set of cooperating parts.
//!
//! ## Architecture
//!
//! Tessera is an umbrella crate that coordinates:
//! - **tessera-core** - Buffer registry, program cache, command batcher,
//!   kernel registry and the [`Backend`] context that ties them together
//! - **tessera-wgpu** - wgpu device (Vulkan, Metal, DX12, GL)
//!
//! ## Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! let mut backend = BackendBuilder::new().build()?;
//!
//! backend.register("add", |ctx| {
//!     let inputs = ctx.inputs().to_vec();
//!     ctx.run(&ADD, &inputs, &[OutputSlot::ByIndex(0)])?;
//!     Ok(())
//! });
//!
//! let add = backend.create_instance("add", attrs! {})?;
//! let outputs = backend.invoke(add, &[a, b], 1)?;
//! let bytes = pollster::block_on(backend.download(outputs[0].buffer))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Core plus the wgpu device
//! - `wgpu` - wgpu device and [`try_wgpu_backend`]
//! - `mock` - In-memory `RecordingDevice` for tests

/// Re-export of tessera-core for direct access
pub use tessera_core as core;

pub use tessera_core::{
    attrs,
    // Attributes
    get_attr,
    get_attr_or,
    // Programs
    normalize_dispatch,
    workgroups_for,
    AttributeValue,
    Attributes,
    // Context
    Backend,
    BackendConfig,
    BatcherStats,
    BufferId,
    CacheStats,
    // Device seam
    ComputeDevice,
    DataType,
    DeviceInfo,
    DeviceLimits,
    DispatchRecord,
    Fingerprint,
    KernelContext,
    KernelId,
    LazyProgram,
    Lifecycle,
    OutputSlot,
    ProgramDescriptor,
    ProgramMetadata,
    ProgramProvider,
    ProgramSource,
    RegistryStats,
    // Tensors
    TensorInfo,
    TensorRef,
};

#[cfg(feature = "mock")]
pub use tessera_core::{RecordedCommand, RecordingDevice};

// wgpu device
#[cfg(feature = "wgpu")]
pub use tessera_wgpu as wgpu;

#[cfg(feature = "wgpu")]
pub use tessera_wgpu::{PowerPreference, WgpuDevice, WgpuOptions};

mod builder;
mod error;

pub use builder::BackendBuilder;
pub use error::{Error, Result};

/// Build a wgpu backend with default options, or `None` if no GPU is usable.
///
/// The failure is logged at `warn` level.
#[cfg(feature = "wgpu")]
pub fn try_wgpu_backend(config: BackendConfig) -> Option<Backend<WgpuDevice>> {
    BackendBuilder::new().config(config).try_build()
}

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::BackendBuilder;
    pub use crate::{Error, Result};

    pub use tessera_core::{
        attrs, Attributes, Backend, BackendConfig, BufferId, DataType, KernelContext, KernelId,
        LazyProgram, Lifecycle, OutputSlot, ProgramDescriptor, ProgramMetadata, ProgramProvider,
        ProgramSource, TensorInfo, TensorRef,
    };

    #[cfg(feature = "wgpu")]
    pub use crate::{try_wgpu_backend, WgpuDevice, WgpuOptions};
}
