//! [`ComputeDevice`] over a wgpu device and queue.

use crate::options::WgpuOptions;
use std::borrow::Cow;
use tessera_core::{
    BufferUsage, ComputeDevice, DeviceInfo, DeviceLimits, Error, ProgramSource, Result,
};
use wgpu::util::DeviceExt;
use wgpu::{Backends, DeviceDescriptor, ErrorFilter, Features};

/// A compiled compute pipeline and its bind group layout.
pub struct WgpuProgram {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// wgpu device, queue and the limits negotiated at acquisition.
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: DeviceInfo,
}

impl WgpuDevice {
    /// Acquire an adapter and device.
    ///
    /// Fails with [`Error::DeviceUnavailable`] when no adapter matches or the
    /// device request is refused.
    pub async fn request(options: &WgpuOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: preferred_backends(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: options.power_preference.into(),
                force_fallback_adapter: options.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("no GPU adapter available: {}", e)))?;

        let adapter_info = adapter.get_info();
        tracing::debug!("Selected GPU adapter: {:?}", adapter_info);

        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some(options.label.as_str()),
                required_features: Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: Default::default(),
            })
            .await
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

        let limits = device.limits();
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            limits: DeviceLimits {
                max_buffer_size: limits.max_buffer_size,
                max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size as u64,
                max_storage_buffers_per_stage: limits.max_storage_buffers_per_shader_stage,
                max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            },
            supports_timestamps: adapter.features().contains(Features::TIMESTAMP_QUERY),
        };

        Ok(Self {
            device,
            queue,
            info,
        })
    }

    pub fn raw_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn raw_queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}

fn preferred_backends() -> Backends {
    #[cfg(target_os = "macos")]
    {
        Backends::METAL
    }
    #[cfg(target_os = "windows")]
    {
        Backends::DX12 | Backends::VULKAN
    }
    #[cfg(target_os = "linux")]
    {
        Backends::VULKAN | Backends::GL
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
    {
        Backends::all()
    }
}

impl ComputeDevice for WgpuDevice {
    type Buffer = wgpu::Buffer;
    type Program = WgpuProgram;
    type Encoder = wgpu::CommandEncoder;
    type Pass = wgpu::ComputePass<'static>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> Result<wgpu::Buffer> {
        if size > self.info.limits.max_buffer_size {
            return Err(Error::AllocationFailure {
                size,
                reason: format!(
                    "exceeds device max buffer size of {} bytes",
                    self.info.limits.max_buffer_size
                ),
            });
        }
        let usage = match usage {
            BufferUsage::Storage => {
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST
            }
            BufferUsage::Readback => wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        };

        self.device.push_error_scope(ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tessera buffer"),
            size,
            usage,
            mapped_at_creation: false,
        });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::AllocationFailure {
                size,
                reason: e.to_string(),
            });
        }
        Ok(buffer)
    }

    fn compile(&self, label: &str, source: &ProgramSource) -> Result<WgpuProgram> {
        self.device.push_error_scope(ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source.wgsl.as_str())),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &module,
                entry_point: Some(source.entry_point.as_str()),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(e) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(Error::Device(format!("failed to compile '{}': {}", label, e)));
        }

        let layout = pipeline.get_bind_group_layout(0);
        Ok(WgpuProgram { pipeline, layout })
    }

    fn begin_recording(&self) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tessera session"),
            })
    }

    fn begin_pass(&self, encoder: &mut wgpu::CommandEncoder) -> wgpu::ComputePass<'static> {
        encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("tessera pass"),
                timestamp_writes: None,
            })
            .forget_lifetime()
    }

    fn end_pass(&self, _encoder: &mut wgpu::CommandEncoder, pass: wgpu::ComputePass<'static>) {
        drop(pass);
    }

    fn record_dispatch(
        &self,
        pass: &mut wgpu::ComputePass<'static>,
        program: &WgpuProgram,
        bindings: &[&wgpu::Buffer],
        workgroups: [u32; 3],
    ) {
        let entries: Vec<wgpu::BindGroupEntry<'_>> = bindings
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &program.layout,
            entries: &entries,
        });

        let [x, y, z] = workgroups;
        pass.set_pipeline(&program.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, z);
    }

    fn record_upload(&self, encoder: &mut wgpu::CommandEncoder, dst: &wgpu::Buffer, data: &[u8]) {
        let staging = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("tessera upload"),
                contents: data,
                usage: wgpu::BufferUsages::COPY_SRC,
            });
        encoder.copy_buffer_to_buffer(&staging, 0, dst, 0, data.len() as u64);
    }

    fn record_copy(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        size: u64,
    ) {
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, size);
    }

    fn submit(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
    }

    async fn read_back(&self, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<u8>> {
        let slice = buffer.slice(..size);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| Error::Device(format!("device poll failed: {}", e)))?;

        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(Error::Device(format!("map_async failed: {}", e))),
            Err(_) => return Err(Error::Device("map_async channel closed".into())),
        }

        let data = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(data)
    }
}
