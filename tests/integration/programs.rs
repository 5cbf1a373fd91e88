//! Program cache integration tests
//!
//! Fingerprint determinism, compile-once behavior, cache hints, element type
//! checks and dispatch sizing against device limits.

use crate::helpers::*;
use proptest::prelude::*;
use std::sync::Arc;
use tessera::prelude::*;
use tessera_core::{
    get_attr, normalize_dispatch, DeviceLimits, Error, Fingerprint, ProgramCache, RecordedCommand,
    RecordingDevice,
};

#[test]
fn test_same_fingerprint_same_program() {
    let device = RecordingDevice::new();
    let mut cache = ProgramCache::<RecordingDevice>::new();
    let provider = elementwise("add", 2);
    let inputs = vec![TensorInfo::new([2, 3], DataType::F32); 2];

    let first = cache
        .get_or_compile(
            &device,
            Fingerprint::new(provider.metadata(), &inputs),
            &provider,
            &inputs,
        )
        .unwrap();
    let second = cache
        .get_or_compile(
            &device,
            Fingerprint::new(provider.metadata(), &inputs),
            &provider,
            &inputs,
        )
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(device.counters().programs_compiled, 1);
}

#[test]
fn test_cache_hint_separates_variants() {
    let mut backend = test_backend();
    backend.register_with_attributes(
        "scale",
        |raw| get_attr(raw, "factor", |v| v.as_f32()),
        |ctx, &factor: &f32| {
            let inputs = ctx.inputs().to_vec();
            ctx.run(&scale(factor), &inputs, &[OutputSlot::ByIndex(0)])?;
            Ok(())
        },
    );
    let double = backend
        .create_instance("scale", attrs! { "factor" => 2.0 })
        .unwrap();
    let triple = backend
        .create_instance("scale", attrs! { "factor" => 3.0 })
        .unwrap();
    let x = upload_f32(&mut backend, &[2], &[1.0, 2.0]);

    let doubled = backend.invoke(double, &[x.clone()], 1).unwrap();
    let tripled = backend.invoke(triple, &[x.clone()], 1).unwrap();
    backend.invoke(double, &[x], 1).unwrap();

    assert_eq!(backend.cache_stats().compiles, 2);
    assert_eq!(download_f32(&mut backend, doubled[0].buffer), vec![2.0, 4.0]);
    assert_eq!(download_f32(&mut backend, tripled[0].buffer), vec![3.0, 6.0]);
}

#[test]
fn test_element_type_mismatch() {
    let mut backend = test_backend();
    register_add(&mut backend);
    let add = backend.create_instance("add", attrs! {}).unwrap();

    let a = upload_f32(&mut backend, &[2], &[1.0, 2.0]);
    let b = backend
        .alloc_tensor(TensorInfo::new([2], DataType::I32), &[0; 8])
        .unwrap();

    assert!(matches!(
        backend.invoke(add, &[a, b], 1),
        Err(Error::ShapeMismatch(_))
    ));
    assert!(backend.programs().is_empty());
}

#[test]
fn test_failed_materialize_is_not_cached() {
    let mut backend = test_backend();
    backend.register("broken", |ctx| {
        let provider = LazyProgram::new(ProgramMetadata::new("broken", Vec::<DataType>::new()), |_, _| {
            Err(Error::NotImplemented("broken program".into()))
        });
        ctx.run(&provider, &[], &[])?;
        Ok(())
    });
    let kernel = backend.create_instance("broken", attrs! {}).unwrap();

    for _ in 0..2 {
        assert!(matches!(
            backend.invoke(kernel, &[], 0),
            Err(Error::NotImplemented(_))
        ));
    }
    assert!(backend.programs().is_empty());
}

/// Oversized launches are folded into a square grid that fits the limits.
#[test]
fn test_oversized_dispatch_is_normalized() {
    let limits = DeviceLimits {
        max_compute_workgroups_per_dimension: 16,
        ..DeviceLimits::default()
    };
    let device = RecordingDevice::with_limits(limits);
    register_host_programs(&device);
    let mut backend = BackendBuilder::new().build_with(device).unwrap();
    register_add(&mut backend);
    let add = backend.create_instance("add", attrs! {}).unwrap();

    // 100 workgroups of 64 elements.
    let x = upload_f32(&mut backend, &[6400], &vec![1.0; 6400]);
    backend.invoke(add, &[x.clone(), x], 1).unwrap();
    backend.flush();

    let workgroups = backend
        .device()
        .log()
        .into_iter()
        .find_map(|c| match c {
            RecordedCommand::Dispatch { workgroups, .. } => Some(workgroups),
            _ => None,
        })
        .unwrap();
    assert_eq!(workgroups, [10, 10, 1]);
}

#[test]
fn test_dispatch_beyond_limits_fails() {
    let limits = DeviceLimits {
        max_compute_workgroups_per_dimension: 4,
        ..DeviceLimits::default()
    };
    assert!(matches!(
        normalize_dispatch([65, 1, 1], &limits),
        Err(Error::ShapeMismatch(_))
    ));
    assert_eq!(normalize_dispatch([64, 1, 1], &limits).unwrap(), [4, 4, 4]);
}

proptest! {
    #[test]
    fn prop_normalized_dispatch_covers_request(x in 1u32..200_000, limit in 8u32..1024) {
        let limits = DeviceLimits {
            max_compute_workgroups_per_dimension: limit,
            ..DeviceLimits::default()
        };
        if let Ok([nx, ny, nz]) = normalize_dispatch([x, 1, 1], &limits) {
            prop_assert!(nx <= limit && ny <= limit && nz <= limit);
            prop_assert!(nx as u64 * ny as u64 * nz as u64 >= x as u64);
        } else {
            prop_assert!((x as u64) > (limit as u64).pow(3));
        }
    }

    #[test]
    fn prop_fingerprint_tracks_shape(a in 1usize..64, b in 1usize..64) {
        let provider = elementwise("add", 2);
        let left = vec![TensorInfo::new([a, b], DataType::F32); 2];
        let right = vec![TensorInfo::new([b, a], DataType::F32); 2];
        let fa = Fingerprint::new(provider.metadata(), &left);
        let fb = Fingerprint::new(provider.metadata(), &right);
        prop_assert_eq!(fa == fb, a == b);
    }
}
