//! Programs, fingerprints and the compiled-program cache.
//!
//! A program is described by a [`ProgramProvider`]: cheap [`ProgramMetadata`]
//! that is always available, and a [`ProgramDescriptor`] (output shapes,
//! dispatch size, shader source) that is only materialized on a cache miss.
//! Compiled programs are keyed by [`Fingerprint`], so two invocations with the
//! same program identity and input shapes/types share one compiled program.

use crate::device::{ComputeDevice, DeviceLimits};
use crate::error::{Error, Result};
use crate::tensor::{DataType, TensorInfo};
use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

/// WGSL source and entry point of a compute program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource {
    pub wgsl: String,
    pub entry_point: String,
}

impl ProgramSource {
    pub fn new(wgsl: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            wgsl: wgsl.into(),
            entry_point: entry_point.into(),
        }
    }
}

/// Program identity and declared input signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramMetadata {
    pub name: String,
    /// Distinguishes variants of the same program. Must cover every
    /// attribute that changes the generated shader or the uniform bytes.
    pub cache_hint: String,
    /// Declared input element types; the length is the declared arity.
    pub input_types: Vec<DataType>,
}

impl ProgramMetadata {
    pub fn new(name: impl Into<String>, input_types: impl Into<Vec<DataType>>) -> Self {
        Self {
            name: name.into(),
            cache_hint: String::new(),
            input_types: input_types.into(),
        }
    }

    pub fn with_cache_hint(mut self, hint: impl Into<String>) -> Self {
        self.cache_hint = hint.into();
        self
    }

    pub fn arity(&self) -> usize {
        self.input_types.len()
    }
}

/// Everything needed to compile and dispatch a program for concrete inputs.
///
/// A descriptor is built once per [`Fingerprint`] and reused on every cache
/// hit, so all of its fields must be a function of the input shapes, the
/// element types and the metadata's cache hint.
#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub outputs: Vec<TensorInfo>,
    /// Workgroup counts before normalization against device limits.
    pub workgroups: [u32; 3],
    pub source: ProgramSource,
    /// Bound read-only after the outputs, if present. Values that vary per
    /// kernel instance belong in the cache hint too, or a hit replays the
    /// bytes of the first compile.
    pub uniforms: Option<Vec<u8>>,
}

/// Source of a program: metadata now, descriptor on demand.
pub trait ProgramProvider {
    fn metadata(&self) -> &ProgramMetadata;

    /// Build the descriptor for these inputs. Only called on a cache miss.
    fn materialize(&self, inputs: &[TensorInfo], limits: &DeviceLimits)
        -> Result<ProgramDescriptor>;
}

/// A [`ProgramProvider`] backed by a closure.
pub struct LazyProgram<F> {
    metadata: ProgramMetadata,
    build: F,
}

impl<F> LazyProgram<F>
where
    F: Fn(&[TensorInfo], &DeviceLimits) -> Result<ProgramDescriptor>,
{
    pub fn new(metadata: ProgramMetadata, build: F) -> Self {
        Self { metadata, build }
    }
}

impl<F> ProgramProvider for LazyProgram<F>
where
    F: Fn(&[TensorInfo], &DeviceLimits) -> Result<ProgramDescriptor>,
{
    fn metadata(&self) -> &ProgramMetadata {
        &self.metadata
    }

    fn materialize(
        &self,
        inputs: &[TensorInfo],
        limits: &DeviceLimits,
    ) -> Result<ProgramDescriptor> {
        (self.build)(inputs, limits)
    }
}

/// Cache key: program name, cache hint, and every input's shape and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    name: String,
    cache_hint: String,
    inputs: Vec<TensorInfo>,
}

impl Fingerprint {
    pub fn new(metadata: &ProgramMetadata, inputs: &[TensorInfo]) -> Self {
        Self {
            name: metadata.name.clone(),
            cache_hint: metadata.cache_hint.clone(),
            inputs: inputs.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.cache_hint.is_empty() {
            write!(f, "[{}]", self.cache_hint)?;
        }
        write!(f, ":")?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            write!(f, "{}", input)?;
        }
        Ok(())
    }
}

/// A compiled program together with the descriptor it was built from.
pub struct CachedProgram<P> {
    pub descriptor: ProgramDescriptor,
    pub compiled: P,
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub compiles: usize,
}

/// Fingerprint → compiled program. Append-only for the backend lifetime.
pub struct ProgramCache<D: ComputeDevice> {
    programs: HashMap<Fingerprint, Arc<CachedProgram<D::Program>>>,
    stats: CacheStats,
}

impl<D: ComputeDevice> ProgramCache<D> {
    pub fn new() -> Self {
        Self {
            programs: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<CachedProgram<D::Program>>> {
        self.programs.get(fingerprint).cloned()
    }

    /// Compile `descriptor` and store it under `fingerprint`.
    ///
    /// Programs are pure functions of their descriptor, so if an entry already
    /// exists it is replaced and either one is a valid result.
    pub fn compile_and_insert(
        &mut self,
        device: &D,
        fingerprint: Fingerprint,
        descriptor: ProgramDescriptor,
    ) -> Result<Arc<CachedProgram<D::Program>>> {
        let compiled = device.compile(fingerprint.name(), &descriptor.source)?;
        tracing::debug!("Compiled program {}", fingerprint);
        self.stats.compiles += 1;

        let program = Arc::new(CachedProgram {
            descriptor,
            compiled,
        });
        self.programs.insert(fingerprint, Arc::clone(&program));
        Ok(program)
    }

    /// Look up `fingerprint`, materializing and compiling on a miss.
    pub fn get_or_compile(
        &mut self,
        device: &D,
        fingerprint: Fingerprint,
        provider: &dyn ProgramProvider,
        inputs: &[TensorInfo],
    ) -> Result<Arc<CachedProgram<D::Program>>> {
        if let Some(program) = self.lookup(&fingerprint) {
            self.stats.hits += 1;
            return Ok(program);
        }
        let descriptor = provider.materialize(inputs, &device.info().limits)?;
        self.compile_and_insert(device, fingerprint, descriptor)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

impl<D: ComputeDevice> Default for ProgramCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Workgroup counts for a one-dimensional launch over `elements`.
pub fn workgroups_for(elements: usize, workgroup_size: u32) -> [u32; 3] {
    let groups = elements.div_ceil(workgroup_size.max(1) as usize).max(1);
    [groups.min(u32::MAX as usize) as u32, 1, 1]
}

/// Fit workgroup counts under the per-dimension limit.
///
/// Counts already within the limit pass through unchanged. Otherwise the
/// total is spread over a square, then a cube; shaders dispatched this way
/// must linearize the workgroup id and bounds-check.
pub fn normalize_dispatch(workgroups: [u32; 3], limits: &DeviceLimits) -> Result<[u32; 3]> {
    let limit = limits.max_compute_workgroups_per_dimension as u64;
    let [x, y, z] = workgroups.map(u64::from);
    if x <= limit && y <= limit && z <= limit {
        return Ok(workgroups);
    }

    let total = x * y * z;
    let side = ceil_root(total, 2);
    if side <= limit {
        return Ok([side as u32, side as u32, 1]);
    }
    let side = ceil_root(total, 3);
    if side <= limit {
        return Ok([side as u32, side as u32, side as u32]);
    }
    Err(Error::ShapeMismatch(format!(
        "dispatch {:?} exceeds device limit of {} workgroups per dimension",
        workgroups, limit
    )))
}

/// Smallest `r` with `r^n >= value`.
fn ceil_root(value: u64, n: u32) -> u64 {
    let mut r = (value as f64).powf(1.0 / n as f64).floor() as u64;
    while r.saturating_pow(n) < value {
        r += 1;
    }
    r
}
