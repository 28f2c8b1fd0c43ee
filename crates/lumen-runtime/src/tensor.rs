//! User-facing tensor type for host/device data interchange.

use crate::error::{Result, RuntimeError};
use lumen_core::{DeviceElement, ElementType};

/// Host-side tensor for input/output data.
///
/// Elements are stored as little-endian bytes in the layout the device
/// expects. Create from a `Vec` and extract back into one.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Vec<u8>,
    shape: Vec<usize>,
    dtype: ElementType,
}

impl Tensor {
    /// Create a tensor from a vector with a given shape.
    ///
    /// # Example
    /// ```no_run
    /// # use lumen_runtime::Tensor;
    /// let tensor = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2])?;
    /// # Ok::<(), lumen_runtime::RuntimeError>(())
    /// ```
    ///
    /// # Errors
    /// Returns an error if the data length doesn't match the shape.
    pub fn from_vec<T: DeviceElement>(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(RuntimeError::TensorError(format!(
                "Data length {} doesn't match shape {shape:?} (expected {expected_len})",
                data.len()
            )));
        }

        Ok(Self {
            data: bytemuck::cast_slice(&data).to_vec(),
            shape: shape.to_vec(),
            dtype: T::ELEMENT_TYPE,
        })
    }

    /// Create a tensor from raw bytes.
    pub(crate) fn from_raw(data: Vec<u8>, shape: &[usize], dtype: ElementType) -> Self {
        Self {
            data,
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Convert tensor to a Vec.
    ///
    /// # Errors
    /// Returns an error if `T` is not the tensor's element type.
    pub fn to_vec<T: DeviceElement>(&self) -> Result<Vec<T>> {
        if T::ELEMENT_TYPE != self.dtype {
            return Err(RuntimeError::TensorError(format!(
                "Cannot read {} tensor as {}",
                self.dtype,
                T::ELEMENT_TYPE
            )));
        }
        Ok(bytemuck::pod_collect_to_vec(&self.data))
    }

    /// Get raw bytes of the tensor data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the element type of the tensor.
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    /// Get the total number of elements in the tensor.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
