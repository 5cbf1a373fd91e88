//! Buffer registry integration tests
//!
//! Allocation, bucket reuse, release semantics and host/device transfers.

use crate::helpers::*;
use tessera::prelude::*;
use tessera_core::{Error, RecordingDevice};

/// `alloc(1024)`, release, `alloc(1024)` reuses the pooled block.
#[test]
fn test_alloc_release_alloc_reuses_block() {
    let mut backend = test_backend();

    let first = backend.alloc(1024).unwrap();
    assert_eq!(backend.free(first).unwrap(), Lifecycle::KernelOutput);
    let second = backend.alloc(1024).unwrap();

    assert_ne!(first, second);
    assert_eq!(backend.device().counters().buffers_created, 1);
    assert_eq!(backend.buffer_stats().reuses, 1);
    assert_eq!(backend.buffers().capacity(second).unwrap(), 1024);
}

/// A larger pooled bucket serves a smaller request when nothing smaller is free.
#[test]
fn test_smallest_adequate_bucket() {
    let mut backend = test_backend();

    let big = backend.alloc(4096).unwrap();
    let medium = backend.alloc(2048).unwrap();
    backend.free(big).unwrap();
    backend.free(medium).unwrap();

    let small = backend.alloc(1000).unwrap();
    assert_eq!(backend.buffers().capacity(small).unwrap(), 2048);
    assert_eq!(backend.buffers().size(small).unwrap(), 1000);
    assert_eq!(backend.device().counters().buffers_created, 2);
}

#[test]
fn test_release_exactly_once() {
    let mut backend = test_backend();
    let id = backend.alloc(64).unwrap();

    backend.free(id).unwrap();
    assert!(matches!(backend.free(id), Err(Error::BufferNotFound(b)) if b == id));
    assert!(matches!(backend.upload(id, &[0; 4]), Err(Error::BufferNotFound(_))));
    assert!(pollster::block_on(backend.download(id))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_lifecycle_is_reported_on_release() {
    let mut backend = test_backend();
    let persistent = backend.alloc_with(16, Lifecycle::Persistent).unwrap();
    let temporary = backend.alloc_with(16, Lifecycle::Temporary).unwrap();

    assert_eq!(backend.free(persistent).unwrap(), Lifecycle::Persistent);
    assert_eq!(backend.free(temporary).unwrap(), Lifecycle::Temporary);
}

#[test]
fn test_full_bucket_drops_blocks() {
    let config = BackendConfig {
        max_pooled_per_bucket: 1,
        ..BackendConfig::default()
    };
    let mut backend = test_backend_with(config);

    let a = backend.alloc(100).unwrap();
    let b = backend.alloc(100).unwrap();
    backend.free(a).unwrap();
    backend.free(b).unwrap();

    let stats = backend.buffer_stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.pooled_bytes, 256);
}

#[test]
fn test_allocation_failure() {
    let device = RecordingDevice::new().with_memory_limit(1024);
    let mut backend = BackendBuilder::new().build_with(device).unwrap();

    backend.alloc(512).unwrap();
    assert!(matches!(
        backend.alloc(1024),
        Err(Error::AllocationFailure { size: 1024, .. })
    ));

    let too_big = backend.info().limits.max_buffer_size + 1;
    assert!(matches!(
        backend.alloc(too_big),
        Err(Error::AllocationFailure { .. })
    ));
}

#[tokio::test]
async fn test_upload_download_roundtrip() {
    let mut backend = test_backend();
    let values = [1.0f32, -2.5, 3.25, 1e-3];
    let tensor = upload_f32(&mut backend, &[4], &values);

    let bytes = backend.download(tensor.buffer).await.unwrap();
    assert_eq!(f32_values(&bytes), values);
    assert_eq!(backend.device().counters().readbacks, 1);
}

#[tokio::test]
async fn test_unaligned_transfer() {
    let mut backend = test_backend();
    let id = backend.alloc(3).unwrap();
    backend.upload(id, &[1, 2, 3]).unwrap();

    assert_eq!(backend.download(id).await.unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_upload_larger_than_buffer() {
    let mut backend = test_backend();
    let id = backend.alloc(8).unwrap();

    // The block is 256 bytes, but only 8 were requested.
    assert!(matches!(
        backend.upload(id, &[0; 12]),
        Err(Error::InvalidUpload { len: 12, size: 8, .. })
    ));
}

/// Transfers are ordered with each other: a later upload to the source does
/// not leak into an earlier copy.
#[test]
fn test_memcpy_is_ordered() {
    let mut backend = test_backend();
    let src = upload_f32(&mut backend, &[2], &[1.0, 2.0]);
    let dst = backend.alloc(8).unwrap();

    backend.memcpy(src.buffer, dst).unwrap();
    backend.upload(src.buffer, &f32_bytes(&[9.0, 9.0])).unwrap();

    assert_eq!(download_f32(&mut backend, dst), vec![1.0, 2.0]);
    assert_eq!(download_f32(&mut backend, src.buffer), vec![9.0, 9.0]);
}

#[test]
fn test_memcpy_size_mismatch() {
    let mut backend = test_backend();
    let src = backend.alloc(16).unwrap();
    let dst = backend.alloc(8).unwrap();

    assert!(matches!(
        backend.memcpy(src, dst),
        Err(Error::ShapeMismatch(_))
    ));
    backend.memcpy(dst, src).unwrap();
}

/// Staging buffers for readback are pooled too.
#[test]
fn test_staging_buffers_are_reused() {
    let mut backend = test_backend();
    let tensor = upload_f32(&mut backend, &[4], &[0.0; 4]);

    download_f32(&mut backend, tensor.buffer);
    let created = backend.device().counters().buffers_created;
    download_f32(&mut backend, tensor.buffer);
    assert_eq!(backend.device().counters().buffers_created, created);
}

/// A 3-byte copy into an 8-byte buffer would carry the source's padding
/// into byte 3 of the destination.
#[test]
fn test_unaligned_memcpy_keeps_destination_intact() {
    let mut backend = test_backend();
    let src = backend.alloc(3).unwrap();
    let dst = backend.alloc(8).unwrap();
    backend.upload(src, &[1, 2, 3]).unwrap();
    backend.upload(dst, &[9; 8]).unwrap();

    assert!(matches!(
        backend.memcpy(src, dst),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(matches!(
        backend.upload(dst, &[1, 2, 3]),
        Err(Error::ShapeMismatch(_))
    ));
    assert_eq!(pollster::block_on(backend.download(dst)).unwrap(), vec![9; 8]);

    let same = backend.alloc(3).unwrap();
    backend.memcpy(src, same).unwrap();
    assert_eq!(pollster::block_on(backend.download(same)).unwrap(), vec![1, 2, 3]);
}
