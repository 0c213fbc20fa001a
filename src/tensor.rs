use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::error::{OptimErr, Result};

/// Where a tensor's storage lives.
///
/// The host runtime computes everything on the CPU, the tag only records placement so
/// capturable updates can check that params and their step cells share an accelerator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

impl Device {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

/// The element storage of a `Tensor`, always kept in standard (row major) layout.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    Real(ArrayD<f32>),
    Complex(ArrayD<Complex32>),
}

/// A dense multi-dimensional array tagged with its device.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    storage: Storage,
    device: Device,
}

impl Tensor {
    /// Creates a new real `Tensor` from a flat buffer.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The elements in row major order.
    ///
    /// # Returns
    /// The tensor or an error if `data` doesn't hold exactly `shape`'s element count.
    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?.into())
    }

    /// Creates a new complex `Tensor` from a flat buffer.
    ///
    /// # Arguments
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The elements in row major order.
    ///
    /// # Returns
    /// The tensor or an error if `data` doesn't hold exactly `shape`'s element count.
    pub fn from_complex_vec(shape: &[usize], data: Vec<Complex32>) -> Result<Self> {
        Ok(ArrayD::from_shape_vec(IxDyn(shape), data)?.into())
    }

    /// A zero-dimensional real tensor holding `value`.
    pub fn scalar(value: f32) -> Self {
        ArrayD::from_elem(IxDyn(&[]), value).into()
    }

    pub fn zeros(shape: &[usize]) -> Self {
        ArrayD::<f32>::zeros(IxDyn(shape)).into()
    }

    /// A zero filled tensor with the same shape, kind and device as `self`.
    pub fn zeros_like(&self) -> Self {
        let storage = match &self.storage {
            Storage::Real(a) => Storage::Real(ArrayD::zeros(a.raw_dim())),
            Storage::Complex(a) => Storage::Complex(ArrayD::zeros(a.raw_dim())),
        };

        Self {
            storage,
            device: self.device,
        }
    }

    /// Moves the tensor to `device`.
    pub fn to_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn shape(&self) -> &[usize] {
        match &self.storage {
            Storage::Real(a) => a.shape(),
            Storage::Complex(a) => a.shape(),
        }
    }

    /// The shape of the real view, complex tensors get their trailing dimension doubled
    /// through an extra axis of length 2.
    pub fn real_shape(&self) -> Vec<usize> {
        let mut shape = self.shape().to_vec();
        if self.is_complex() {
            shape.push(2);
        }

        shape
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    pub fn is_complex(&self) -> bool {
        matches!(self.storage, Storage::Complex(_))
    }

    /// Whether this tensor is a zero-dimensional real cell, the representation used for step counters.
    pub fn is_scalar_cell(&self) -> bool {
        !self.is_complex() && self.ndim() == 0
    }

    /// Reads a single element real tensor back as a number.
    pub fn item(&self) -> Option<f32> {
        match &self.storage {
            Storage::Real(a) if a.len() == 1 => a.iter().next().copied(),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<&ArrayD<f32>> {
        match &self.storage {
            Storage::Real(a) => Some(a),
            Storage::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&ArrayD<Complex32>> {
        match &self.storage {
            Storage::Complex(a) => Some(a),
            Storage::Real(_) => None,
        }
    }

    /// A real valued view over the tensor's storage.
    ///
    /// Complex elements are seen as `[re, im]` pairs along a new trailing axis, the view
    /// aliases the complex buffer.
    pub fn real_view(&self) -> Result<ArrayViewD<'_, f32>> {
        match &self.storage {
            Storage::Real(a) => Ok(a.view()),
            Storage::Complex(a) => {
                let shape = self.real_shape();
                let flat = a.as_slice().ok_or(OptimErr::NonContiguous)?;
                let flat: &[f32] = bytemuck::cast_slice(flat);
                Ok(ArrayViewD::from_shape(IxDyn(&shape), flat)?)
            }
        }
    }

    /// A mutable real valued view over the tensor's storage.
    ///
    /// Writes through the view of a complex tensor land on the complex elements.
    pub fn real_view_mut(&mut self) -> Result<ArrayViewMutD<'_, f32>> {
        let shape = self.real_shape();
        match &mut self.storage {
            Storage::Real(a) => Ok(a.view_mut()),
            Storage::Complex(a) => {
                let flat = a.as_slice_mut().ok_or(OptimErr::NonContiguous)?;
                let flat: &mut [f32] = bytemuck::cast_slice_mut(flat);
                Ok(ArrayViewMutD::from_shape(IxDyn(&shape), flat)?)
            }
        }
    }
}

impl From<ArrayD<f32>> for Tensor {
    fn from(value: ArrayD<f32>) -> Self {
        let value = if value.is_standard_layout() {
            value
        } else {
            value.as_standard_layout().into_owned()
        };

        Self {
            storage: Storage::Real(value),
            device: Device::Cpu,
        }
    }
}

impl From<ArrayD<Complex32>> for Tensor {
    fn from(value: ArrayD<Complex32>) -> Self {
        let value = if value.is_standard_layout() {
            value
        } else {
            value.as_standard_layout().into_owned()
        };

        Self {
            storage: Storage::Complex(value),
            device: Device::Cpu,
        }
    }
}

/// A gradient in coordinate format, only representable so it can be rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseTensor {
    shape: Vec<usize>,
    indices: Vec<Vec<usize>>,
    values: Vec<f32>,
}

impl SparseTensor {
    /// Creates a new `SparseTensor`.
    ///
    /// # Arguments
    /// * `shape` - The dense shape.
    /// * `indices` - One coordinate per stored value.
    /// * `values` - The stored values.
    pub fn new(shape: Vec<usize>, indices: Vec<Vec<usize>>, values: Vec<f32>) -> Result<Self> {
        if indices.len() != values.len() {
            return Err(OptimErr::Layout(format!(
                "{} sparse indices for {} values",
                indices.len(),
                values.len()
            )));
        }

        let in_bounds = indices.iter().all(|idx| {
            idx.len() == shape.len() && idx.iter().zip(&shape).all(|(i, dim)| i < dim)
        });

        if !in_bounds {
            return Err(OptimErr::Layout(format!(
                "sparse index out of bounds for shape {shape:?}"
            )));
        }

        Ok(Self {
            shape,
            indices,
            values,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of stored values.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }
}

/// The gradient of a parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Grad {
    Dense(Tensor),
    Sparse(SparseTensor),
}

impl Grad {
    pub fn is_sparse(&self) -> bool {
        matches!(self, Grad::Sparse(_))
    }

    pub fn dense(&self) -> Option<&Tensor> {
        match self {
            Grad::Dense(t) => Some(t),
            Grad::Sparse(_) => None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Grad::Dense(t) => t.shape(),
            Grad::Sparse(s) => s.shape(),
        }
    }
}

impl From<Tensor> for Grad {
    fn from(value: Tensor) -> Self {
        Self::Dense(value)
    }
}

impl From<SparseTensor> for Grad {
    fn from(value: SparseTensor) -> Self {
        Self::Sparse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complex_real_view_doubles_trailing_dim() {
        let t = Tensor::from_complex_vec(
            &[2],
            vec![Complex32::new(1., 2.), Complex32::new(3., 4.)],
        )
        .unwrap();

        let view = t.real_view().unwrap();
        assert_eq!(view.shape(), &[2, 2]);
        assert_eq!(view.iter().copied().collect::<Vec<_>>(), [1., 2., 3., 4.]);
    }

    #[test]
    fn test_real_view_mut_aliases_complex_storage() {
        let mut t = Tensor::from_complex_vec(&[1], vec![Complex32::new(1., -1.)]).unwrap();

        {
            let mut view = t.real_view_mut().unwrap();
            view *= 2.;
        }

        assert_eq!(t.as_complex().unwrap()[[0]], Complex32::new(2., -2.));
    }

    #[test]
    fn test_zero_dim_complex_becomes_pair() {
        let t: Tensor = ArrayD::from_elem(IxDyn(&[]), Complex32::new(5., 6.)).into();
        assert_eq!(t.real_shape(), [2]);
        assert!(!t.is_scalar_cell());
    }

    #[test]
    fn test_scalar_cell() {
        let step = Tensor::scalar(3.);
        assert!(step.is_scalar_cell());
        assert_eq!(step.item(), Some(3.));

        let not_a_cell = Tensor::from_vec(&[1], vec![3.]).unwrap();
        assert!(!not_a_cell.is_scalar_cell());
        assert_eq!(not_a_cell.item(), Some(3.));
    }

    #[test]
    fn test_zeros_like_keeps_kind_and_device() {
        let t = Tensor::from_complex_vec(&[3], vec![Complex32::new(1., 1.); 3])
            .unwrap()
            .to_device(Device::Accelerator(1));

        let z = t.zeros_like();
        assert!(z.is_complex());
        assert_eq!(z.shape(), &[3]);
        assert_eq!(z.device(), Device::Accelerator(1));
        assert!(z.as_complex().unwrap().iter().all(|c| *c == Complex32::new(0., 0.)));
    }

    #[test]
    fn test_from_vec_rejects_bad_length() {
        assert!(matches!(
            Tensor::from_vec(&[2, 2], vec![1., 2., 3.]),
            Err(OptimErr::Layout(_))
        ));
    }

    #[test]
    fn test_transposed_input_is_made_contiguous() {
        let a = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1., 2., 3., 4.]).unwrap();
        let t: Tensor = a.reversed_axes().into();
        assert!(t.as_real().unwrap().is_standard_layout());
        assert_eq!(t.as_real().unwrap()[[0, 1]], 3.);
    }

    #[test]
    fn test_sparse_validation() {
        assert!(SparseTensor::new(vec![2], vec![vec![0]], vec![1., 2.]).is_err());
        assert!(SparseTensor::new(vec![2], vec![vec![2]], vec![1.]).is_err());

        let sparse = SparseTensor::new(vec![3], vec![vec![1]], vec![1.]).unwrap();
        assert_eq!(sparse.nnz(), 1);
        assert!(Grad::from(sparse).is_sparse());
    }
}
