use std::collections::BTreeMap;
use thiserror::Error;

/// Named parameters of a model, in stable (sorted) order.
pub type StateDict = BTreeMap<String, Tensor>;

#[derive(Debug, Error, PartialEq)]
#[error("{len} values don't fill shape {shape:?}")]
pub struct ShapeError {
    pub shape: Vec<usize>,
    pub len: usize,
}

/// A dense, host-resident f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ShapeError> {
        if shape.iter().product::<usize>() != data.len() {
            return Err(ShapeError {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            data: vec![value; numel],
        }
    }

    /// Rebuilds a tensor from little-endian f32 bytes. `bytes` may be unaligned.
    pub fn from_le_bytes(shape: Vec<usize>, bytes: &[u8]) -> Result<Self, ShapeError> {
        if bytes.len() % std::mem::size_of::<f32>() != 0 {
            return Err(ShapeError {
                shape,
                len: bytes.len(),
            });
        }
        Self::new(shape, bytemuck::pod_collect_to_vec(bytes))
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.data).to_vec()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}
