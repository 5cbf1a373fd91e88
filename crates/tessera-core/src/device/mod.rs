//! Device abstraction: the seam between the execution core and a GPU API.
//!
//! The core never touches a concrete GPU API. Everything it needs from a
//! device is expressed by [`ComputeDevice`]: buffer creation, program
//! compilation, command recording and submission, and readback. The wgpu
//! implementation lives in `tessera-wgpu`; [`RecordingDevice`] is an in-memory
//! implementation for tests (feature `mock`).
//!
//! # Recording model
//!
//! Commands are recorded into an `Encoder` (one per recording session). Compute
//! dispatches go into a `Pass` nested inside the encoder. Uploads and copies are
//! recorded on the encoder itself, so the caller must end the pass first.
//! Submission consumes the encoder; commands run on the device in recording
//! order, and submissions run in submission order.

#[cfg(any(test, feature = "mock"))]
mod recording;
#[cfg(any(test, feature = "mock"))]
pub use recording::{
    DeviceCounters, MockBuffer, MockEncoder, MockPass, MockProgram, RecordedCommand,
    RecordingDevice,
};

use crate::error::Result;
use crate::program::ProgramSource;
use core::future::Future;

/// Buffer copies must be a multiple of this many bytes.
pub const COPY_ALIGNMENT: u64 = 4;

/// Round `size` up to [`COPY_ALIGNMENT`].
pub fn align_copy_size(size: u64) -> u64 {
    size.div_ceil(COPY_ALIGNMENT) * COPY_ALIGNMENT
}

/// How a device buffer will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// Shader-visible storage that can be copied to and from.
    Storage,
    /// Host-mappable destination for readback copies.
    Readback,
}

/// Capability limits negotiated at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub max_storage_buffers_per_stage: u32,
    pub max_compute_workgroups_per_dimension: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        // WebGPU baseline limits.
        Self {
            max_buffer_size: 256 << 20,
            max_storage_buffer_binding_size: 128 << 20,
            max_storage_buffers_per_stage: 8,
            max_compute_workgroups_per_dimension: 65535,
        }
    }
}

/// Description of the acquired device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// e.g. "NVIDIA GeForce RTX 4090"
    pub name: String,
    /// e.g. "Vulkan", "Metal"
    pub backend: String,
    pub limits: DeviceLimits,
    /// Adapter supports timestamp queries.
    pub supports_timestamps: bool,
}

/// Abstraction over a single GPU device and its queue.
///
/// # Thread Safety
///
/// The backend is driven from one logical thread. No `Send` or `Sync` bound is
/// required of implementations.
pub trait ComputeDevice {
    /// Backing memory of a registry buffer.
    type Buffer;
    /// Compiled, executable compute program.
    type Program;
    /// Open command-recording handle.
    type Encoder;
    /// Open compute pass nested inside an encoder.
    type Pass;

    fn info(&self) -> &DeviceInfo;

    /// Allocate device memory. Out-of-memory surfaces as
    /// [`Error::AllocationFailure`](crate::Error::AllocationFailure).
    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<Self::Buffer>;

    /// Compile a program from source.
    fn compile(&self, label: &str, source: &ProgramSource) -> Result<Self::Program>;

    fn begin_recording(&self) -> Self::Encoder;

    fn begin_pass(&self, encoder: &mut Self::Encoder) -> Self::Pass;

    fn end_pass(&self, encoder: &mut Self::Encoder, pass: Self::Pass);

    /// Record one dispatch. `bindings` are bound in order starting at
    /// binding 0 of group 0.
    fn record_dispatch(
        &self,
        pass: &mut Self::Pass,
        program: &Self::Program,
        bindings: &[&Self::Buffer],
        workgroups: [u32; 3],
    );

    /// Record a host→device write of `data` at offset 0 of `dst`.
    /// `data.len()` is a multiple of [`COPY_ALIGNMENT`].
    fn record_upload(&self, encoder: &mut Self::Encoder, dst: &Self::Buffer, data: &[u8]);

    /// Record a device→device copy of `size` bytes from offset 0.
    fn record_copy(
        &self,
        encoder: &mut Self::Encoder,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: u64,
    );

    /// Submit recorded commands to the queue.
    fn submit(&self, encoder: Self::Encoder);

    /// Wait for all submitted work and read `size` bytes of a
    /// [`BufferUsage::Readback`] buffer.
    fn read_back(
        &self,
        buffer: &Self::Buffer,
        size: u64,
    ) -> impl Future<Output = Result<Vec<u8>>>;
}
