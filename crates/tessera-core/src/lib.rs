//! GPU execution backend core: buffers, programs, batching and kernel dispatch.
//!
//! # Primary API
//!
//! - [`Backend`]: Context object owning the device and all backend state
//! - [`KernelContext`]: Handle passed to kernel entry points; launches programs
//! - [`ProgramProvider`] / [`LazyProgram`]: Program metadata and on-demand descriptors
//! - [`ComputeDevice`]: The device seam implemented by `tessera-wgpu`
//!
//! # Components
//!
//! - [`BufferRegistry`]: Size-bucketed buffer pool with lifecycle classes
//! - [`ProgramCache`]: Compiled programs keyed by [`Fingerprint`]
//! - [`CommandBatcher`]: One recording session, flushed on a dispatch threshold
//! - [`KernelRegistry`]: Kernel families, instances and the executing marker
//!
//! # Feature flags
//!
//! - `"mock"`: [`RecordingDevice`], an in-memory device for tests
//!
//! # Example
//!
//! ```ignore
//! use tessera_core::*;
//!
//! let mut backend = Backend::new(device, BackendConfig::default())?;
//! backend.register("relu", |ctx| {
//!     let inputs = ctx.inputs().to_vec();
//!     ctx.run(&RELU, &inputs, &[OutputSlot::ByIndex(0)])?;
//!     Ok(())
//! });
//!
//! let relu = backend.create_instance("relu", attrs! {})?;
//! let outputs = backend.invoke(relu, &[x], 1)?;
//! let bytes = pollster::block_on(backend.download(outputs[0].buffer))?;
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod attributes;
pub use attributes::{get_attr, get_attr_or, AttributeValue, Attributes};

mod backend;
pub use backend::{Backend, DispatchRecord, KernelContext, OutputSlot};

pub mod batcher;
pub use batcher::{BatcherStats, CommandBatcher, RecordingState};

pub mod buffer;
pub use buffer::{bucket_size, BufferRegistry, Lifecycle, RegistryStats};

mod config;
pub use config::BackendConfig;

pub mod device;
pub use device::{
    align_copy_size, BufferUsage, ComputeDevice, DeviceInfo, DeviceLimits, COPY_ALIGNMENT,
};
#[cfg(any(test, feature = "mock"))]
pub use device::{RecordedCommand, RecordingDevice};

pub mod kernel;
pub use kernel::{AttributeState, KernelFamily, KernelId, KernelRegistry, ParsedAttributes};

pub mod program;
pub use program::{
    normalize_dispatch, workgroups_for, CacheStats, CachedProgram, Fingerprint, LazyProgram,
    ProgramCache, ProgramDescriptor, ProgramMetadata, ProgramProvider, ProgramSource,
};

pub mod tensor;
pub use tensor::{BufferId, DataType, TensorInfo, TensorRef};
