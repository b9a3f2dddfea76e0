//! Batch-dimension aware tensor buffers
//!
//! Dimension 0 of every tensor handed to an execution session is the batch
//! dimension. The batching layer concatenates caller tensors along it, pads
//! the result up to an allowed batch size, and slices outputs back apart.

use crate::error::{Error, Result};

/// Data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point
    F16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 8-bit unsigned integer
    U8,
}

impl DataType {
    /// Get size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::I32 => 4,
            DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }
}

/// Dense, row-major, heap-allocated tensor
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuffer {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: DataType,
}

impl Default for TensorBuffer {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            shape: vec![0],
            dtype: DataType::F32,
        }
    }
}

impl TensorBuffer {
    /// Create from raw bytes, checking the byte length against the shape
    pub fn from_vec(data: Vec<u8>, shape: Vec<usize>, dtype: DataType) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(Error::invalid_argument(format!(
                "Tensor size mismatch: shape {:?} needs {} bytes, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { data, shape, dtype })
    }

    /// Create an f32 tensor from values
    pub fn from_f32(values: &[f32], shape: Vec<usize>) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_vec(data, shape, DataType::F32)
    }

    /// Read back the values of an f32 tensor
    pub fn to_f32(&self) -> Result<Vec<f32>> {
        if self.dtype != DataType::F32 {
            return Err(Error::invalid_argument(format!(
                "Expected F32 tensor, got {:?}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Get shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get data type
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Size of dimension 0, or `None` for scalars
    pub fn batch_size(&self) -> Option<usize> {
        self.shape.first().copied()
    }

    /// Bytes occupied by one entry along dimension 0
    fn row_bytes(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>() * self.dtype.size_bytes()
    }

    /// Concatenate tensors along dimension 0.
    ///
    /// All parts must share a dtype and every non-batch dimension.
    pub fn concat(parts: &[&TensorBuffer]) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| Error::invalid_argument("Cannot concatenate zero tensors"))?;
        if first.shape.is_empty() {
            return Err(Error::invalid_argument(
                "Cannot concatenate scalar tensors along the batch dimension",
            ));
        }
        let inner = &first.shape[1..];
        let mut rows = 0;
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.data.len()).sum());
        for part in parts {
            if part.dtype != first.dtype {
                return Err(Error::invalid_argument(format!(
                    "Cannot concatenate {:?} with {:?}",
                    part.dtype, first.dtype
                )));
            }
            if part.shape.len() != first.shape.len() || &part.shape[1..] != inner {
                return Err(Error::invalid_argument(format!(
                    "Tensors with shapes {:?} and {:?} differ outside the batch dimension",
                    part.shape, first.shape
                )));
            }
            rows += part.shape[0];
            data.extend_from_slice(&part.data);
        }
        let mut shape = first.shape.clone();
        shape[0] = rows;
        Ok(Self {
            data,
            shape,
            dtype: first.dtype,
        })
    }

    /// Take `len` rows starting at `start` along dimension 0
    pub fn slice_rows(&self, start: usize, len: usize) -> Result<Self> {
        let rows = self
            .batch_size()
            .ok_or_else(|| Error::invalid_argument("Cannot slice a scalar tensor"))?;
        if start + len > rows {
            return Err(Error::invalid_argument(format!(
                "Row range {}..{} out of bounds for batch of {}",
                start,
                start + len,
                rows
            )));
        }
        let row_bytes = self.row_bytes();
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Self {
            data: self.data[start * row_bytes..(start + len) * row_bytes].to_vec(),
            shape,
            dtype: self.dtype,
        })
    }

    /// Append `extra` copies of the first row along dimension 0
    pub fn pad_rows(&self, extra: usize) -> Result<Self> {
        if extra == 0 {
            return Ok(self.clone());
        }
        let rows = self.batch_size().unwrap_or(0);
        if rows == 0 {
            return Err(Error::invalid_argument(
                "Cannot pad a tensor without a first row",
            ));
        }
        let row_bytes = self.row_bytes();
        let mut data = Vec::with_capacity(self.data.len() + extra * row_bytes);
        data.extend_from_slice(&self.data);
        for _ in 0..extra {
            data.extend_from_slice(&self.data[..row_bytes]);
        }
        let mut shape = self.shape.clone();
        shape[0] = rows + extra;
        Ok(Self {
            data,
            shape,
            dtype: self.dtype,
        })
    }

    /// Grow the non-batch dimensions to `target_inner`, filling new cells
    /// with this tensor's first element
    pub fn pad_inner_to(&self, target_inner: &[usize]) -> Result<Self> {
        if self.shape.len() != target_inner.len() + 1 {
            return Err(Error::invalid_argument(format!(
                "Cannot pad shape {:?} to inner dimensions {:?}",
                self.shape, target_inner
            )));
        }
        if &self.shape[1..] == target_inner {
            return Ok(self.clone());
        }
        if self.shape[1..]
            .iter()
            .zip(target_inner)
            .any(|(have, want)| have > want)
        {
            return Err(Error::invalid_argument(format!(
                "Padding cannot shrink shape {:?} to inner dimensions {:?}",
                self.shape, target_inner
            )));
        }

        let elem = self.dtype.size_bytes();
        let mut target_shape = Vec::with_capacity(self.shape.len());
        target_shape.push(self.shape[0]);
        target_shape.extend_from_slice(target_inner);

        let fill: Vec<u8> = if self.data.len() >= elem {
            self.data[..elem].to_vec()
        } else {
            vec![0; elem]
        };
        let total = target_shape.iter().product::<usize>();
        let mut data = Vec::with_capacity(total * elem);
        for _ in 0..total {
            data.extend_from_slice(&fill);
        }

        // Copy each contiguous innermost line into its new position.
        let rank = self.shape.len();
        let src_strides = compute_strides(&self.shape);
        let dst_strides = compute_strides(&target_shape);
        let outer = &self.shape[..rank - 1];
        let line_bytes = self.shape[rank - 1] * elem;
        let num_lines = outer.iter().product::<usize>();
        let mut index = vec![0usize; rank - 1];
        for _ in 0..num_lines {
            let src: usize = index.iter().zip(&src_strides).map(|(i, s)| i * s).sum();
            let dst: usize = index.iter().zip(&dst_strides).map(|(i, s)| i * s).sum();
            data[dst * elem..dst * elem + line_bytes]
                .copy_from_slice(&self.data[src * elem..src * elem + line_bytes]);
            for d in (0..rank - 1).rev() {
                index[d] += 1;
                if index[d] < outer[d] {
                    break;
                }
                index[d] = 0;
            }
        }

        Ok(Self {
            data,
            shape: target_shape,
            dtype: self.dtype,
        })
    }
}

/// Compute element strides for a contiguous row-major shape
fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}
