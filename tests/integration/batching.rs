//! Recording session integration tests
//!
//! Lazy session opening, pass boundaries, idempotent close/flush, the pending
//! dispatch threshold, and submission order as seen by the device.

use crate::helpers::*;
use tessera::prelude::*;
use tessera_core::{CommandBatcher, RecordedCommand, RecordingDevice};

fn count_submits(device: &RecordingDevice) -> usize {
    device
        .log()
        .iter()
        .filter(|c| matches!(c, RecordedCommand::Submit))
        .count()
}

#[test]
fn test_end_pass_and_flush_are_idempotent() {
    let device = RecordingDevice::new();
    let mut batcher = CommandBatcher::<RecordingDevice>::new(16);

    batcher.flush(&device);
    batcher.end_compute_pass(&device);
    assert_eq!(device.counters().submissions, 0);
    assert!(!batcher.is_open());

    batcher.current_compute_pass(&device);
    batcher.end_compute_pass(&device);
    batcher.end_compute_pass(&device);
    assert!(batcher.is_open());
    assert!(!batcher.has_open_pass());

    batcher.flush(&device);
    batcher.flush(&device);
    assert_eq!(device.counters().submissions, 1);
}

#[test]
fn test_nothing_recorded_until_first_command() {
    let mut backend = test_backend();
    register_add(&mut backend);
    backend.create_instance("add", attrs! {}).unwrap();

    assert!(!backend.batcher().is_open());
    backend.flush();
    assert_eq!(backend.device().counters().submissions, 0);
}

#[test]
fn test_threshold_flush_during_invoke() {
    let config = BackendConfig {
        max_dispatches_per_flush: 2,
        ..BackendConfig::default()
    };
    let mut backend = test_backend_with(config);
    register_add(&mut backend);
    let add = backend.create_instance("add", attrs! {}).unwrap();
    let x = upload_f32(&mut backend, &[4], &[1.0; 4]);

    for _ in 0..5 {
        backend.invoke(add, &[x.clone(), x.clone()], 1).unwrap();
    }
    assert_eq!(backend.device().counters().submissions, 2);
    assert_eq!(backend.batcher().pending_dispatches(), 1);
    assert_eq!(backend.batcher_stats().threshold_flushes, 2);

    backend.flush();
    assert_eq!(backend.device().counters().submissions, 3);
    assert_eq!(backend.batcher().pending_dispatches(), 0);
    assert_eq!(count_submits(backend.device()), 3);
}

/// Dispatches share one pass until an upload needs the encoder.
#[test]
fn test_upload_splits_pass() {
    let mut backend = test_backend();
    register_add(&mut backend);
    let add = backend.create_instance("add", attrs! {}).unwrap();
    let x = upload_f32(&mut backend, &[4], &[1.0; 4]);

    backend.invoke(add, &[x.clone(), x.clone()], 1).unwrap();
    backend.invoke(add, &[x.clone(), x.clone()], 1).unwrap();
    assert!(backend.batcher().has_open_pass());
    assert_eq!(backend.device().counters().passes_opened, 1);

    backend.upload(x.buffer, &f32_bytes(&[2.0; 4])).unwrap();
    assert!(!backend.batcher().has_open_pass());
    let out = backend.invoke(add, &[x.clone(), x], 1).unwrap();
    assert_eq!(backend.device().counters().passes_opened, 2);

    // The upload landed between the second and third dispatch.
    assert_eq!(download_f32(&mut backend, out[0].buffer), vec![4.0; 4]);
}

#[test]
fn test_device_sees_recording_order() {
    let mut backend = test_backend();
    register_add(&mut backend);
    let add = backend.create_instance("add", attrs! {}).unwrap();

    let x = upload_f32(&mut backend, &[2], &[1.0, 2.0]);
    let out = backend.invoke(add, &[x.clone(), x], 1).unwrap();
    download_f32(&mut backend, out[0].buffer);

    let log = backend.device().log();
    assert!(matches!(log[0], RecordedCommand::Upload { len: 8, .. }));
    assert!(matches!(log[1], RecordedCommand::Dispatch { ref program, .. } if program == "add"));
    assert!(matches!(log[2], RecordedCommand::Copy { size: 8, .. }));
    assert_eq!(log[3], RecordedCommand::Submit);
    assert_eq!(log.len(), 4);
}

/// Disposal closes the open pass before the final submission.
#[test]
fn test_dispose_with_pending_work() {
    let mut backend = test_backend();
    register_add(&mut backend);
    let add = backend.create_instance("add", attrs! {}).unwrap();
    let x = upload_f32(&mut backend, &[2], &[1.0, 2.0]);
    backend.invoke(add, &[x.clone(), x], 1).unwrap();

    assert!(backend.batcher().is_open());
    assert!(backend.batcher().has_open_pass());
    assert_eq!(backend.device().counters().submissions, 0);

    let device = backend.dispose();
    assert_eq!(device.counters().submissions, 1);
    assert_eq!(device.counters().passes_opened, 1);
    let log = device.log();
    assert!(matches!(log[log.len() - 2], RecordedCommand::Dispatch { .. }));
    assert_eq!(log[log.len() - 1], RecordedCommand::Submit);
}
