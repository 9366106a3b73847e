//! Host tensor buffers
//!
//! Plain CPU-resident storage for parameter values, gradients, moment
//! buffers, and shadow copies. Dtype is carried by the storage enum; shape
//! is a plain dimension vector. No strides and no views: every tensor owns
//! a contiguous buffer.

use crate::dtype::DType;
use crate::error::{Error, Result};
use half::f16;

/// Dtype-tagged element storage
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// 32-bit float elements
    F32(Vec<f32>),
    /// 64-bit float elements
    F64(Vec<f64>),
    /// 16-bit float elements
    F16(Vec<f16>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::F16(v) => v.len(),
        }
    }

    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::F16(_) => DType::F16,
        }
    }
}

/// CPU-resident tensor: shape plus owned element storage
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Zero-filled tensor of the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let n: usize = shape.iter().product();
        let data = match dtype {
            DType::F32 => TensorData::F32(vec![0.0f32; n]),
            DType::F64 => TensorData::F64(vec![0.0f64; n]),
            DType::F16 => TensorData::F16(vec![f16::ZERO; n]),
        };
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Zero-filled tensor with the same shape and dtype as `other`.
    pub fn zeros_like(other: &Tensor) -> Self {
        Self::zeros(other.shape(), other.dtype())
    }

    /// Tensor from f32 elements. `data.len()` must equal the shape's element
    /// count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n,
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        Self {
            shape: shape.to_vec(),
            data: TensorData::F32(data.to_vec()),
        }
    }

    /// Tensor from f64 elements. `data.len()` must equal the shape's element
    /// count.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            n,
            "data length {} does not match shape {:?}",
            data.len(),
            shape
        );
        Self {
            shape: shape.to_vec(),
            data: TensorData::F64(data.to_vec()),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total element count.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Borrow the elements as f32.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(dtype_mismatch(DType::F32, other.dtype())),
        }
    }

    /// Mutably borrow the elements as f32.
    pub fn as_f32_mut(&mut self) -> Result<&mut [f32]> {
        match &mut self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(dtype_mismatch(DType::F32, other.dtype())),
        }
    }

    /// Borrow the elements as f64.
    pub fn as_f64(&self) -> Result<&[f64]> {
        match &self.data {
            TensorData::F64(v) => Ok(v),
            other => Err(dtype_mismatch(DType::F64, other.dtype())),
        }
    }

    /// Mutably borrow the elements as f64.
    pub fn as_f64_mut(&mut self) -> Result<&mut [f64]> {
        match &mut self.data {
            TensorData::F64(v) => Ok(v),
            other => Err(dtype_mismatch(DType::F64, other.dtype())),
        }
    }

    /// Borrow the elements as f16.
    pub fn as_f16(&self) -> Result<&[f16]> {
        match &self.data {
            TensorData::F16(v) => Ok(v),
            other => Err(dtype_mismatch(DType::F16, other.dtype())),
        }
    }

    /// Mutably borrow the elements as f16.
    pub fn as_f16_mut(&mut self) -> Result<&mut [f16]> {
        match &mut self.data {
            TensorData::F16(v) => Ok(v),
            other => Err(dtype_mismatch(DType::F16, other.dtype())),
        }
    }

    /// Elements widened/narrowed to f32, for inspection and tests.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }
}

fn dtype_mismatch(expected: DType, got: DType) -> Error {
    Error::Shape {
        reason: format!("expected {} buffer, got {}", expected, got),
    }
}
