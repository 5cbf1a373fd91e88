//! The execution core.
//!
//! [`Backend`] owns the device and every piece of mutable backend state: the
//! buffer registry, the program cache, the command batcher and the kernel
//! registry. Hosts create kernel instances, [`invoke`](Backend::invoke) them
//! with input tensors, and read results back with
//! [`download`](Backend::download).
//!
//! A kernel entry point receives a [`KernelContext`] and launches programs
//! through [`KernelContext::run`]:
//!
//! 1. the input count and element types are checked against the program's
//!    declared signature,
//! 2. the program is looked up by fingerprint and compiled on a miss,
//! 3. output slots are resolved and their buffers allocated,
//! 4. the dispatch size is fitted to the device limits,
//! 5. the dispatch is recorded into the current compute pass, which may
//!    trigger a flush.
//!
//! Results are only host-visible after a flush and a download.

use crate::attributes::Attributes;
use crate::batcher::{BatcherStats, CommandBatcher};
use crate::buffer::{BufferRegistry, Lifecycle, RegistryStats};
use crate::config::BackendConfig;
use crate::device::{ComputeDevice, DeviceInfo};
use crate::error::{Error, Result};
use crate::kernel::{KernelId, KernelRegistry};
use crate::program::{normalize_dispatch, CacheStats, Fingerprint, ProgramCache, ProgramProvider};
use crate::tensor::{BufferId, TensorInfo, TensorRef};

/// Where a program output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    /// The n-th output of the current invocation, returned to the caller.
    ByIndex(usize),
    /// Scratch space, released when the invocation ends.
    Temporary,
    /// Owned by the executing kernel instance until it is released.
    Persistent,
}

impl OutputSlot {
    fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::ByIndex(_) => Lifecycle::KernelOutput,
            Self::Temporary => Lifecycle::Temporary,
            Self::Persistent => Lifecycle::Persistent,
        }
    }
}

/// One recorded dispatch, kept when profiling is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub kernel: KernelId,
    /// Program name.
    pub program: String,
    /// Full cache key, e.g. `add:f32[2,3];f32[2,3]`.
    pub fingerprint: String,
    /// Workgroup counts after normalization.
    pub workgroups: [u32; 3],
}

/// Backend context: the device plus all backend state.
///
/// # Example
/// ```ignore
/// let mut backend = Backend::new(device, BackendConfig::default())?;
/// backend.register("add", |ctx| {
///     let inputs = ctx.inputs().to_vec();
///     ctx.run(&ADD, &inputs, &[OutputSlot::ByIndex(0)])?;
///     Ok(())
/// });
/// let add = backend.create_instance("add", Attributes::new())?;
/// let outputs = backend.invoke(add, &[a, b], 1)?;
/// let bytes = backend.download(outputs[0].buffer).await?;
/// ```
pub struct Backend<D: ComputeDevice> {
    device: D,
    config: BackendConfig,
    buffers: BufferRegistry<D>,
    programs: ProgramCache<D>,
    batcher: CommandBatcher<D>,
    kernels: KernelRegistry<D>,
    /// Temporaries of the executing invocation.
    temporaries: Vec<BufferId>,
    profile: Vec<DispatchRecord>,
}

impl<D: ComputeDevice + 'static> Backend<D> {
    pub fn new(device: D, config: BackendConfig) -> Result<Self> {
        config.validate()?;
        let info = device.info();
        tracing::debug!("Backend on {} ({})", info.name, info.backend);

        Ok(Self {
            buffers: BufferRegistry::new(config.min_bucket_size, config.max_pooled_per_bucket),
            programs: ProgramCache::new(),
            batcher: CommandBatcher::new(config.max_dispatches_per_flush),
            kernels: KernelRegistry::new(),
            temporaries: Vec::new(),
            profile: Vec::new(),
            device,
            config,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    // ==================== Kernels ====================

    /// Register a kernel family without attributes.
    pub fn register<F>(&mut self, name: impl Into<String>, entry: F)
    where
        F: Fn(&mut KernelContext<'_, D>) -> Result<()> + 'static,
    {
        self.kernels.register(name, entry);
    }

    /// Register a kernel family with a typed attribute parser.
    pub fn register_with_attributes<A, P, F>(&mut self, name: impl Into<String>, parse: P, entry: F)
    where
        A: 'static,
        P: Fn(&Attributes) -> Result<A> + 'static,
        F: Fn(&mut KernelContext<'_, D>, &A) -> Result<()> + 'static,
    {
        self.kernels.register_with_attributes(name, parse, entry);
    }

    pub fn kernels(&self) -> &KernelRegistry<D> {
        &self.kernels
    }

    pub fn create_instance(&mut self, name: &str, attributes: Attributes) -> Result<KernelId> {
        self.kernels.create(name, attributes)
    }

    /// Run a kernel instance on `inputs`, producing `output_count` outputs.
    ///
    /// Fails with [`Error::ConcurrencyViolation`] if called while another
    /// invocation is executing. Whatever the outcome, the invocation's
    /// temporaries are released and the executing marker is cleared before
    /// this returns. On failure the invocation's outputs are released too;
    /// commands already recorded stay recorded.
    pub fn invoke(
        &mut self,
        id: KernelId,
        inputs: &[TensorRef],
        output_count: usize,
    ) -> Result<Vec<TensorRef>> {
        let (family, attributes) = self.kernels.begin(id)?;
        tracing::trace!("Invoking kernel {} ({})", id, family.name());

        let mut ctx = KernelContext {
            backend: self,
            kernel: id,
            inputs,
            outputs: vec![None; output_count],
        };
        let result = family.call(&mut ctx, &*attributes);
        let outputs = ctx.outputs;

        self.end_invocation();

        let missing = outputs.iter().filter(|o| o.is_none()).count();
        let result = result.and_then(|()| {
            if missing > 0 {
                Err(Error::ShapeMismatch(format!(
                    "kernel '{}' produced {} of {} outputs",
                    family.name(),
                    output_count - missing,
                    output_count
                )))
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => Ok(outputs.into_iter().flatten().collect()),
            Err(e) => {
                for output in outputs.into_iter().flatten() {
                    self.release_quietly(output.buffer);
                }
                Err(e)
            }
        }
    }

    fn end_invocation(&mut self) {
        let temporaries = std::mem::take(&mut self.temporaries);
        for id in temporaries {
            self.release_quietly(id);
        }
        self.kernels.finish();
    }

    /// Release a buffer the host may already have freed.
    fn release_quietly(&mut self, id: BufferId) {
        if self.buffers.release(id).is_err() {
            tracing::trace!("Buffer {} already released", id);
        }
    }

    /// Release the instance's persistent buffers, then the instance itself.
    pub fn release_instance(&mut self, id: KernelId) -> Result<()> {
        let persistent = self.kernels.take_persistent(id)?;
        for buffer in persistent {
            self.release_quietly(buffer);
        }
        self.kernels.remove(id)
    }

    // ==================== Buffers ====================

    /// Allocate a kernel-output buffer.
    pub fn alloc(&mut self, size: u64) -> Result<BufferId> {
        self.alloc_with(size, Lifecycle::KernelOutput)
    }

    /// Allocate a buffer with an explicit lifecycle.
    ///
    /// Inside an invocation, temporaries are released when it ends and
    /// persistent buffers are owned by the executing instance. Outside one,
    /// every buffer belongs to the caller until [`free`](Self::free).
    pub fn alloc_with(&mut self, size: u64, lifecycle: Lifecycle) -> Result<BufferId> {
        let id = self.buffers.alloc(&self.device, size, lifecycle)?;
        if self.kernels.executing().is_none() {
            return Ok(id);
        }
        match lifecycle {
            Lifecycle::Temporary => self.temporaries.push(id),
            Lifecycle::Persistent => {
                if let Err(e) = self.kernels.attach_persistent(id) {
                    self.release_quietly(id);
                    return Err(e);
                }
            }
            Lifecycle::KernelOutput => {}
        }
        Ok(id)
    }

    /// Allocate a buffer sized for `info` and fill it with `data`.
    pub fn alloc_tensor(&mut self, info: TensorInfo, data: &[u8]) -> Result<TensorRef> {
        let id = self.alloc(info.byte_size())?;
        if let Err(e) = self.upload(id, data) {
            self.release_quietly(id);
            return Err(e);
        }
        Ok(TensorRef::new(id, info))
    }

    pub fn free(&mut self, id: BufferId) -> Result<Lifecycle> {
        self.buffers.release(id)
    }

    pub fn upload(&mut self, id: BufferId, data: &[u8]) -> Result<()> {
        self.buffers.upload(&self.device, &mut self.batcher, id, data)
    }

    /// Flush pending work and read a buffer back to the host.
    pub async fn download(&mut self, id: BufferId) -> Result<Vec<u8>> {
        self.buffers
            .download(&self.device, &mut self.batcher, id)
            .await
    }

    pub fn memcpy(&mut self, src: BufferId, dst: BufferId) -> Result<()> {
        self.buffers.memcpy(&self.device, &mut self.batcher, src, dst)
    }

    /// Submit everything recorded so far.
    pub fn flush(&mut self) {
        self.batcher.flush(&self.device);
    }

    pub fn buffers(&self) -> &BufferRegistry<D> {
        &self.buffers
    }

    // ==================== Observability ====================

    pub fn buffer_stats(&self) -> &RegistryStats {
        self.buffers.stats()
    }

    pub fn cache_stats(&self) -> &CacheStats {
        self.programs.stats()
    }

    pub fn batcher_stats(&self) -> &BatcherStats {
        self.batcher.stats()
    }

    pub fn programs(&self) -> &ProgramCache<D> {
        &self.programs
    }

    pub fn batcher(&self) -> &CommandBatcher<D> {
        &self.batcher
    }

    /// Drain the dispatch records collected so far.
    pub fn take_profile(&mut self) -> Vec<DispatchRecord> {
        std::mem::take(&mut self.profile)
    }

    /// Flush outstanding work, drop every buffer and hand the device back.
    pub fn dispose(mut self) -> D {
        self.flush();
        tracing::debug!(
            "Disposing backend: {} live buffers, {} programs",
            self.buffers.live_count(),
            self.programs.len()
        );
        self.buffers.clear();
        self.device
    }

    // ==================== Program launch ====================

    fn run_program(
        &mut self,
        kernel: KernelId,
        provider: &dyn ProgramProvider,
        inputs: &[TensorRef],
        slots: &[OutputSlot],
        produced: &[Option<TensorRef>],
    ) -> Result<Vec<TensorRef>> {
        let metadata = provider.metadata();
        if inputs.len() != metadata.arity() {
            return Err(Error::ShapeMismatch(format!(
                "program '{}' takes {} inputs, got {}",
                metadata.name,
                metadata.arity(),
                inputs.len()
            )));
        }
        for (i, (input, expected)) in inputs.iter().zip(&metadata.input_types).enumerate() {
            if input.dtype() != *expected {
                return Err(Error::ShapeMismatch(format!(
                    "program '{}' input {} must be {}, got {}",
                    metadata.name,
                    i,
                    expected.as_str(),
                    input.dtype().as_str()
                )));
            }
            let size = self.buffers.size(input.buffer)?;
            if size < input.info.byte_size() {
                return Err(Error::ShapeMismatch(format!(
                    "input {} is {} but buffer {} holds {} bytes",
                    i, input.info, input.buffer, size
                )));
            }
        }

        let infos: Vec<TensorInfo> = inputs.iter().map(|t| t.info.clone()).collect();
        let fingerprint = Fingerprint::new(metadata, &infos);
        let program =
            self.programs
                .get_or_compile(&self.device, fingerprint.clone(), provider, &infos)?;
        let descriptor = &program.descriptor;

        if slots.len() != descriptor.outputs.len() {
            return Err(Error::ShapeMismatch(format!(
                "program '{}' declares {} outputs, {} slots given",
                metadata.name,
                descriptor.outputs.len(),
                slots.len()
            )));
        }
        check_slots(slots, produced)?;

        let workgroups = normalize_dispatch(descriptor.workgroups, &self.device.info().limits)?;
        let binding_count = inputs.len() + slots.len() + usize::from(descriptor.uniforms.is_some());
        let max_bindings = self.device.info().limits.max_storage_buffers_per_stage as usize;
        if binding_count > max_bindings {
            return Err(Error::ShapeMismatch(format!(
                "program '{}' binds {} buffers, device allows {}",
                metadata.name, binding_count, max_bindings
            )));
        }

        // Allocate everything before committing any of it to a slot.
        let mut allocated: Vec<BufferId> = Vec::with_capacity(slots.len() + 1);
        for (slot, info) in slots.iter().zip(&descriptor.outputs) {
            match self.buffers.alloc(&self.device, info.byte_size(), slot.lifecycle()) {
                Ok(id) => allocated.push(id),
                Err(e) => {
                    allocated.into_iter().for_each(|id| self.release_quietly(id));
                    return Err(e);
                }
            }
        }
        let uniforms = match &descriptor.uniforms {
            Some(bytes) => {
                match self
                    .buffers
                    .alloc(&self.device, bytes.len() as u64, Lifecycle::Temporary)
                {
                    Ok(id) => allocated.push(id),
                    Err(e) => {
                        allocated.into_iter().for_each(|id| self.release_quietly(id));
                        return Err(e);
                    }
                }
                let id = allocated[allocated.len() - 1];
                if let Err(e) = self.buffers.upload(&self.device, &mut self.batcher, id, bytes) {
                    allocated.into_iter().for_each(|id| self.release_quietly(id));
                    return Err(e);
                }
                allocated.pop()
            }
            None => None,
        };

        let mut outputs = Vec::with_capacity(slots.len());
        for ((slot, info), id) in slots.iter().zip(&descriptor.outputs).zip(&allocated) {
            match slot {
                OutputSlot::Temporary => self.temporaries.push(*id),
                OutputSlot::Persistent => {
                    self.kernels.attach_persistent(*id)?;
                }
                OutputSlot::ByIndex(_) => {}
            }
            outputs.push(TensorRef::new(*id, info.clone()));
        }
        if let Some(id) = uniforms {
            self.temporaries.push(id);
        }

        let binding_ids = inputs
            .iter()
            .map(|t| t.buffer)
            .chain(allocated.iter().copied())
            .chain(uniforms);
        let bindings = binding_ids
            .map(|id| self.buffers.buffer(id))
            .collect::<Result<Vec<_>>>()?;
        let flushed =
            self.batcher
                .record_dispatch(&self.device, &program.compiled, &bindings, workgroups);
        if flushed {
            tracing::debug!("Pending dispatch threshold reached, flushed");
        }

        if self.config.profiling {
            self.profile.push(DispatchRecord {
                kernel,
                program: fingerprint.name().to_string(),
                fingerprint: fingerprint.to_string(),
                workgroups,
            });
        }
        Ok(outputs)
    }
}

/// Every `ByIndex` slot must name a distinct, not yet produced output.
fn check_slots(slots: &[OutputSlot], produced: &[Option<TensorRef>]) -> Result<()> {
    let mut claimed = vec![false; produced.len()];
    for slot in slots {
        if let OutputSlot::ByIndex(n) = *slot {
            if n >= produced.len() {
                return Err(Error::ShapeMismatch(format!(
                    "output index {} out of range for {} outputs",
                    n,
                    produced.len()
                )));
            }
            if produced[n].is_some() || claimed[n] {
                return Err(Error::ShapeMismatch(format!("output {} produced twice", n)));
            }
            claimed[n] = true;
        }
    }
    Ok(())
}

/// Handle passed to kernel entry points for the duration of one invocation.
pub struct KernelContext<'a, D: ComputeDevice> {
    backend: &'a mut Backend<D>,
    kernel: KernelId,
    inputs: &'a [TensorRef],
    outputs: Vec<Option<TensorRef>>,
}

impl<'a, D: ComputeDevice + 'static> KernelContext<'a, D> {
    pub fn kernel_id(&self) -> KernelId {
        self.kernel
    }

    pub fn inputs(&self) -> &[TensorRef] {
        self.inputs
    }

    pub fn input(&self, index: usize) -> Result<&TensorRef> {
        self.inputs.get(index).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "input {} requested, {} given",
                index,
                self.inputs.len()
            ))
        })
    }

    /// Number of outputs the caller asked for.
    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn backend_mut(&mut self) -> &mut Backend<D> {
        self.backend
    }

    /// Launch a program. Returns its outputs in slot order; `ByIndex` outputs
    /// also become the invocation's outputs.
    pub fn run(
        &mut self,
        provider: &dyn ProgramProvider,
        inputs: &[TensorRef],
        slots: &[OutputSlot],
    ) -> Result<Vec<TensorRef>> {
        let outputs = self
            .backend
            .run_program(self.kernel, provider, inputs, slots, &self.outputs)?;
        for (slot, output) in slots.iter().zip(&outputs) {
            if let OutputSlot::ByIndex(n) = *slot {
                self.outputs[n] = Some(output.clone());
            }
        }
        Ok(outputs)
    }
}
