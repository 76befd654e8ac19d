//! Host-side f32 tensor backed by copy-on-write storage.
//!
//! Cloning a tensor is cheap: the buffer is shared through the storage
//! layer's lazy clone, and any mutable access materializes first, so writers
//! never alias other tensors.

use std::mem::size_of;

use anyhow::{bail, ensure, Result};
use rand::Rng;

use crate::device::Device;
use crate::scalar::Scalar;
use crate::storage::Storage;

/// Axis extents of a tensor.
///
/// Immutable once built; a zero extent on any axis yields an element count
/// of zero, which the storage layer represents as a bufferless storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Box<[usize]>,
}

impl Shape {
    /// Validates and freezes an axis list. Rank zero is rejected.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Result<Self> {
        let dims = dims.into();
        ensure!(!dims.is_empty(), "a shape needs at least one axis");
        Ok(Shape {
            dims: dims.into_boxed_slice(),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Product of all axis extents.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Host tensor of `f32` values over a [`Storage`] buffer.
#[derive(Debug)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    /// Returns a zero-filled tensor of the requested shape on `device`.
    pub fn zeros(shape: Shape, device: Device) -> Result<Self> {
        let size_bytes = shape.num_elements() * size_of::<f32>();
        let storage = Storage::new(size_bytes, device)?;
        if size_bytes > 0 {
            unsafe { std::ptr::write_bytes(storage.data(), 0, size_bytes) };
        }
        Ok(Tensor { storage, shape })
    }

    /// Moves a vector of values into a fresh tensor of the given shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>, device: Device) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "cannot build a {:?} tensor from {} values",
                shape.dims(),
                data.len()
            );
        }
        let mut tensor = Tensor::zeros(shape, device)?;
        tensor.data_mut()?.copy_from_slice(&data);
        Ok(tensor)
    }

    /// Fills a fresh tensor with draws from `N(0, std^2)`.
    ///
    /// Each pair of uniform samples goes through one Box-Muller rotation, so
    /// the loop produces two normal draws at a time and trims the surplus.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng, device: Device) -> Result<Self> {
        let count = shape.num_elements();
        let mut samples = Vec::with_capacity(count + 1);
        while samples.len() < count {
            // Keep the logarithm away from a zero uniform draw.
            let magnitude: f32 = rng.gen_range(f32::MIN_POSITIVE..1.0);
            let rotation: f32 = rng.gen();
            let radius = std * (-2.0 * magnitude.ln()).sqrt();
            let angle = std::f32::consts::TAU * rotation;
            samples.push(radius * angle.cos());
            samples.push(radius * angle.sin());
        }
        samples.truncate(count);
        Tensor::from_vec(shape, samples, device)
    }

    /// Total element count.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// True when no elements are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// True while this tensor shares its buffer with another.
    pub fn is_shared(&self) -> bool {
        self.storage.is_cow()
    }

    /// Borrows the element slice for reading.
    pub fn data(&self) -> &[f32] {
        let len = self.len();
        if len == 0 {
            return &[];
        }
        let ptr = self.storage.data() as *const f32;
        debug_assert!(!ptr.is_null());
        debug_assert_eq!(ptr as usize % std::mem::align_of::<f32>(), 0);
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Borrows the element slice for writing, materializing a private buffer
    /// first when the storage is shared.
    pub fn data_mut(&mut self) -> Result<&mut [f32]> {
        self.storage.materialize()?;
        let len = self.len();
        if len == 0 {
            return Ok(&mut []);
        }
        let ptr = self.storage.data() as *mut f32;
        debug_assert!(!ptr.is_null());
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Produces a tensor sharing this tensor's buffer lazily.
    pub fn clone_shared(&mut self) -> Result<Tensor> {
        let shape = self.shape.clone();
        if self.is_empty() {
            return Tensor::zeros(shape, self.device());
        }
        Ok(Tensor {
            storage: self.storage.lazy_clone()?,
            shape,
        })
    }

    /// Overwrites every element with `value`.
    pub fn fill(&mut self, value: f32) -> Result<()> {
        self.data_mut()?.fill(value);
        Ok(())
    }

    /// Rewrites each element through `f`, detaching from any siblings first.
    pub fn map_inplace<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(f32) -> f32,
    {
        for v in self.data_mut()? {
            *v = f(*v);
        }
        Ok(())
    }

    /// Element-wise sum producing a fresh tensor.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_op(rhs, |a, b| a + b)
    }

    /// Element-wise product producing a fresh tensor.
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.binary_op(rhs, |a, b| a * b)
    }

    /// Extracts the single element of a one-element tensor as a [`Scalar`].
    pub fn item(&self) -> Result<Scalar> {
        ensure!(
            self.len() == 1,
            "item() requires a one-element tensor, got {} elements",
            self.len()
        );
        Ok(Scalar::from(self.data()[0]))
    }

    fn binary_op<F>(&self, rhs: &Tensor, f: F) -> Result<Tensor>
    where
        F: Fn(f32, f32) -> f32,
    {
        ensure!(
            self.shape == rhs.shape,
            "shape mismatch: {:?} vs {:?}",
            self.shape.dims(),
            rhs.shape.dims()
        );
        let values = self
            .data()
            .iter()
            .zip(rhs.data().iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Tensor::from_vec(self.shape.clone(), values, self.device())
    }
}
