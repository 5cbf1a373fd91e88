//! Tensor descriptors and buffer identifiers.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Opaque handle to a buffer owned by the [`BufferRegistry`](crate::BufferRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

impl BufferId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    F32,
    F16,
    I32,
    U32,
    /// Stored as one `u32` per element, matching WGSL's lack of `bool` storage.
    Bool,
}

impl DataType {
    pub fn byte_width(&self) -> usize {
        match self {
            Self::F16 => 2,
            Self::F32 | Self::I32 | Self::U32 | Self::Bool => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::Bool => "bool",
        }
    }
}

/// Shape and element type of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorInfo {
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorInfo {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DataType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    /// Number of elements (1 for a scalar).
    pub fn elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> u64 {
        (self.elements() * self.dtype.byte_width()) as u64
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype.as_str())?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// A tensor living in a registry buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorRef {
    pub buffer: BufferId,
    pub info: TensorInfo,
}

impl TensorRef {
    pub fn new(buffer: BufferId, info: TensorInfo) -> Self {
        Self { buffer, info }
    }

    pub fn shape(&self) -> &[usize] {
        &self.info.shape
    }

    pub fn dtype(&self) -> DataType {
        self.info.dtype
    }
}
