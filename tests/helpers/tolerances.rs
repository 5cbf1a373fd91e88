//! Tolerance constants for comparing device results.

/// Floating point rounding errors. Use for element-wise arithmetic that
/// should be exact up to rounding.
pub const FLOAT_EPSILON: f32 = 1e-6;
