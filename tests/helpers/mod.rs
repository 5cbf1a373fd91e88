//! Test helpers and fixtures for Tessera integration tests
//!
//! The fixture device registers host versions of the test programs:
//! - `add`: `out = a + b`, bindings `[a, b, out]`
//! - `scale`: `out = x * factor`, bindings `[x, out, uniforms]`
//! - `copy`: `out = x`, bindings `[x, out]`
//!
//! ## Tolerance Levels
//!
//! Use the appropriate tolerance from [`tolerances`] module:
//! - `FLOAT_EPSILON` (1e-6): Element-wise arithmetic

#![allow(dead_code)]

pub mod tolerances;

use tessera::prelude::*;
use tessera_core::RecordingDevice;

/// Placeholder shader; the recording device runs host programs instead.
pub const STUB_WGSL: &str = "@compute @workgroup_size(64) fn main() {}";

/// Workgroup size assumed by the test programs.
pub const WORKGROUP_SIZE: u32 = 64;

/// Recording device with the host programs listed above.
pub fn test_device() -> RecordingDevice {
    let device = RecordingDevice::new();
    register_host_programs(&device);
    device
}

pub fn register_host_programs(device: &RecordingDevice) {
    device.register_host_program("add", |views| {
        let a = f32_values(&views[0]);
        let b = f32_values(&views[1]);
        let out: Vec<f32> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        write_f32(&mut views[2], &out);
    });
    device.register_host_program("scale", |views| {
        let factor = f32_values(&views[2])[0];
        let out: Vec<f32> = f32_values(&views[0]).iter().map(|x| x * factor).collect();
        write_f32(&mut views[1], &out);
    });
    device.register_host_program("copy", |views| {
        let out = f32_values(&views[0]);
        write_f32(&mut views[1], &out);
    });
}

/// Backend on [`test_device`] with the default configuration.
pub fn test_backend() -> Backend<RecordingDevice> {
    test_backend_with(BackendConfig::default())
}

pub fn test_backend_with(config: BackendConfig) -> Backend<RecordingDevice> {
    BackendBuilder::new()
        .config(config)
        .build_with(test_device())
        .expect("Failed to create test backend")
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn write_f32(dst: &mut [u8], values: &[f32]) {
    for (chunk, v) in dst.chunks_exact_mut(4).zip(values) {
        chunk.copy_from_slice(&v.to_le_bytes());
    }
}

/// Allocate and fill an f32 tensor.
pub fn upload_f32(backend: &mut Backend<RecordingDevice>, shape: &[usize], values: &[f32]) -> TensorRef {
    backend
        .alloc_tensor(TensorInfo::new(shape, DataType::F32), &f32_bytes(values))
        .expect("Failed to upload tensor")
}

pub fn download_f32(backend: &mut Backend<RecordingDevice>, id: BufferId) -> Vec<f32> {
    let bytes = pollster::block_on(backend.download(id)).expect("Failed to download buffer");
    f32_values(&bytes)
}

/// Element-wise program over inputs of identical shape; the output takes the
/// first input's shape.
pub fn elementwise(name: &str, arity: usize) -> impl ProgramProvider {
    LazyProgram::new(
        ProgramMetadata::new(name, vec![DataType::F32; arity]),
        |inputs, _| {
            Ok(ProgramDescriptor {
                outputs: vec![inputs[0].clone()],
                workgroups: tessera::workgroups_for(inputs[0].elements(), WORKGROUP_SIZE),
                source: ProgramSource::new(STUB_WGSL, "main"),
                uniforms: None,
            })
        },
    )
}

/// `x * factor`, with the factor passed as uniform data.
pub fn scale(factor: f32) -> impl ProgramProvider {
    LazyProgram::new(
        ProgramMetadata::new("scale", [DataType::F32]).with_cache_hint(factor.to_string()),
        move |inputs, _| {
            Ok(ProgramDescriptor {
                outputs: vec![inputs[0].clone()],
                workgroups: tessera::workgroups_for(inputs[0].elements(), WORKGROUP_SIZE),
                source: ProgramSource::new(STUB_WGSL, "main"),
                uniforms: Some(factor.to_le_bytes().to_vec()),
            })
        },
    )
}

/// Register the `add` kernel: one `add` dispatch into output 0.
pub fn register_add(backend: &mut Backend<RecordingDevice>) {
    backend.register("add", |ctx| {
        let inputs = ctx.inputs().to_vec();
        ctx.run(&elementwise("add", 2), &inputs, &[OutputSlot::ByIndex(0)])?;
        Ok(())
    });
}
