//! Integration test modules for Tessera
//!
//! - buffers: Buffer registry through the backend API
//! - kernels: Kernel registry and the invoke/run protocol
//! - batching: Recording sessions and submission order
//! - programs: Program cache and dispatch sizing

pub mod batching;
pub mod buffers;
pub mod programs;
