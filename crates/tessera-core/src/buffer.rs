//! Buffer registry with size-bucketed reuse.
//!
//! Every GPU buffer handed out by the backend is owned here and addressed by a
//! [`BufferId`]. Released blocks go back to a free pool keyed by bucket size
//! (a power of two, at least `min_bucket_size`) instead of being destroyed, and
//! later allocations take the smallest pooled bucket that fits.
//!
//! A released id is removed immediately, so any later use of it, including a
//! second release, fails with [`Error::BufferNotFound`]. A pooled block has no
//! id and is therefore never reachable from two live buffers at once.
//!
//! Transfers ([`upload`](BufferRegistry::upload),
//! [`download`](BufferRegistry::download), [`memcpy`](BufferRegistry::memcpy))
//! are recorded into the [`CommandBatcher`]'s current session, so they are
//! ordered with the compute work around them.

use crate::batcher::CommandBatcher;
use crate::device::{align_copy_size, BufferUsage, ComputeDevice};
use crate::error::{Error, Result};
use crate::tensor::BufferId;
use std::collections::{BTreeMap, HashMap};

/// Lifecycle class of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifecycle {
    /// Output of a kernel invocation, owned by the caller.
    #[default]
    KernelOutput,
    /// Survives across invocations; released with its kernel instance.
    Persistent,
    /// Released automatically when the invocation that created it ends.
    Temporary,
}

/// Round `size` up to its pool bucket.
pub fn bucket_size(size: u64, min_bucket_size: u64) -> u64 {
    size.max(min_bucket_size).next_power_of_two()
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Blocks created on the device.
    pub device_allocations: usize,
    /// Allocations served from the free pool.
    pub reuses: usize,
    /// Released blocks dropped because their bucket was full.
    pub dropped: usize,
    pub pooled_bytes: u64,
}

struct BufferEntry<B> {
    buffer: B,
    size: u64,
    capacity: u64,
    lifecycle: Lifecycle,
}

pub struct BufferRegistry<D: ComputeDevice> {
    live: HashMap<BufferId, BufferEntry<D::Buffer>>,
    free: BTreeMap<u64, Vec<D::Buffer>>,
    staging: BTreeMap<u64, Vec<D::Buffer>>,
    next_id: u64,
    min_bucket_size: u64,
    max_pooled_per_bucket: usize,
    stats: RegistryStats,
}

impl<D: ComputeDevice> BufferRegistry<D> {
    pub fn new(min_bucket_size: u64, max_pooled_per_bucket: usize) -> Self {
        Self {
            live: HashMap::new(),
            free: BTreeMap::new(),
            staging: BTreeMap::new(),
            next_id: 1,
            min_bucket_size,
            max_pooled_per_bucket,
            stats: RegistryStats::default(),
        }
    }

    /// Allocate a buffer of at least `size` bytes.
    pub fn alloc(&mut self, device: &D, size: u64, lifecycle: Lifecycle) -> Result<BufferId> {
        let max = device.info().limits.max_buffer_size;
        if size > max {
            return Err(Error::AllocationFailure {
                size,
                reason: format!("exceeds device max buffer size of {} bytes", max),
            });
        }

        let bucket = bucket_size(size, self.min_bucket_size);
        let (buffer, capacity) = match self.take_pooled(bucket) {
            Some(pooled) => pooled,
            None => {
                let buffer = device.create_buffer(bucket, BufferUsage::Storage)?;
                self.stats.device_allocations += 1;
                tracing::trace!("BufferRegistry: created buffer size={}", bucket);
                (buffer, bucket)
            }
        };

        let id = BufferId(self.next_id);
        self.next_id += 1;
        self.live.insert(
            id,
            BufferEntry {
                buffer,
                size,
                capacity,
                lifecycle,
            },
        );
        Ok(id)
    }

    /// Smallest pooled block of at least `bucket` bytes.
    fn take_pooled(&mut self, bucket: u64) -> Option<(D::Buffer, u64)> {
        let (&capacity, blocks) = self
            .free
            .range_mut(bucket..)
            .find(|(_, blocks)| !blocks.is_empty())?;
        let buffer = blocks.pop()?;
        self.stats.reuses += 1;
        self.stats.pooled_bytes -= capacity;
        tracing::trace!("BufferRegistry: reused buffer size={} for {}", capacity, bucket);
        Some((buffer, capacity))
    }

    /// Return a buffer to the free pool. Returns its lifecycle class.
    pub fn release(&mut self, id: BufferId) -> Result<Lifecycle> {
        let entry = self.live.remove(&id).ok_or(Error::BufferNotFound(id))?;

        let blocks = self.free.entry(entry.capacity).or_default();
        if blocks.len() < self.max_pooled_per_bucket {
            blocks.push(entry.buffer);
            self.stats.pooled_bytes += entry.capacity;
        } else {
            tracing::trace!("BufferRegistry: dropping buffer (bucket {} full)", entry.capacity);
            self.stats.dropped += 1;
        }
        Ok(entry.lifecycle)
    }

    fn entry(&self, id: BufferId) -> Result<&BufferEntry<D::Buffer>> {
        self.live.get(&id).ok_or(Error::BufferNotFound(id))
    }

    pub fn buffer(&self, id: BufferId) -> Result<&D::Buffer> {
        self.entry(id).map(|e| &e.buffer)
    }

    /// Requested size in bytes.
    pub fn size(&self, id: BufferId) -> Result<u64> {
        self.entry(id).map(|e| e.size)
    }

    /// Size of the backing block.
    pub fn capacity(&self, id: BufferId) -> Result<u64> {
        self.entry(id).map(|e| e.capacity)
    }

    pub fn lifecycle(&self, id: BufferId) -> Result<Lifecycle> {
        self.entry(id).map(|e| e.lifecycle)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Record a host→device write into the current session.
    ///
    /// Writes start at offset 0. An unaligned write must cover the whole
    /// buffer, since the padding would clobber the bytes after it.
    pub fn upload(
        &self,
        device: &D,
        batcher: &mut CommandBatcher<D>,
        id: BufferId,
        data: &[u8],
    ) -> Result<()> {
        let entry = self.entry(id)?;
        if data.len() as u64 > entry.size {
            return Err(Error::InvalidUpload {
                id,
                len: data.len(),
                size: entry.size,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let padded_len = align_copy_size(data.len() as u64);
        if padded_len != data.len() as u64 && data.len() as u64 != entry.size {
            return Err(Error::ShapeMismatch(format!(
                "upload of {} bytes into {} ({} bytes) would overwrite {} trailing bytes",
                data.len(),
                id,
                entry.size,
                padded_len - data.len() as u64
            )));
        }

        let padded_len = padded_len as usize;
        if padded_len == data.len() {
            batcher.record_upload(device, &entry.buffer, data);
        } else {
            let mut padded = Vec::with_capacity(padded_len);
            padded.extend_from_slice(data);
            padded.resize(padded_len, 0);
            batcher.record_upload(device, &entry.buffer, &padded);
        }
        Ok(())
    }

    /// Record a device→device copy of `src` into `dst`.
    ///
    /// Copies move whole 4-byte words, so an unaligned source is only
    /// accepted when both buffers have the same size.
    pub fn memcpy(
        &self,
        device: &D,
        batcher: &mut CommandBatcher<D>,
        src: BufferId,
        dst: BufferId,
    ) -> Result<()> {
        let from = self.entry(src)?;
        let to = self.entry(dst)?;
        if from.size > to.size {
            return Err(Error::ShapeMismatch(format!(
                "memcpy of {} bytes from {} into {} ({} bytes)",
                from.size, src, dst, to.size
            )));
        }
        let size = align_copy_size(from.size);
        // The padded copy must not reach into the destination's contents.
        if size != from.size && from.size != to.size {
            return Err(Error::ShapeMismatch(format!(
                "unaligned memcpy of {} bytes from {} into {} ({} bytes)",
                from.size, src, dst, to.size
            )));
        }
        if size > 0 {
            batcher.record_copy(device, &from.buffer, &to.buffer, size);
        }
        Ok(())
    }

    /// Copy a buffer back to the host.
    ///
    /// The copy is recorded and the session flushed immediately; the caller
    /// only waits at the readback itself.
    pub async fn download(
        &mut self,
        device: &D,
        batcher: &mut CommandBatcher<D>,
        id: BufferId,
    ) -> Result<Vec<u8>> {
        let size = self.entry(id)?.size;
        if size == 0 {
            return Ok(Vec::new());
        }

        let copy_size = align_copy_size(size);
        let (staging, staging_capacity) = self.take_staging(device, copy_size)?;
        batcher.record_copy(device, &self.entry(id)?.buffer, &staging, copy_size);
        batcher.flush(device);

        let result = device.read_back(&staging, copy_size).await;
        self.return_staging(staging, staging_capacity);

        let mut data = result?;
        data.truncate(size as usize);
        Ok(data)
    }

    fn take_staging(&mut self, device: &D, size: u64) -> Result<(D::Buffer, u64)> {
        let bucket = bucket_size(size, self.min_bucket_size);
        if let Some(buffer) = self.staging.get_mut(&bucket).and_then(Vec::pop) {
            tracing::trace!("BufferRegistry: reused staging buffer size={}", bucket);
            return Ok((buffer, bucket));
        }
        tracing::trace!("BufferRegistry: created staging buffer size={}", bucket);
        Ok((device.create_buffer(bucket, BufferUsage::Readback)?, bucket))
    }

    fn return_staging(&mut self, buffer: D::Buffer, capacity: u64) {
        let blocks = self.staging.entry(capacity).or_default();
        if blocks.len() < self.max_pooled_per_bucket {
            blocks.push(buffer);
        }
    }

    /// Drop every live and pooled block.
    pub fn clear(&mut self) {
        self.live.clear();
        self.free.clear();
        self.staging.clear();
        self.stats.pooled_bytes = 0;
    }
}
