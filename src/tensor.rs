use std::ops::Range;

use rand::Rng;

use crate::datatype::{DataType, Precision};
use crate::device::Device;
use crate::shape::Shape;
use crate::{assert_eq_result, assert_result, Error, Result};

/// Dense, row-major host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T: DataType> {
    data: Vec<T>,
    shape: Shape,
}

impl<T: DataType> Tensor<T> {
    pub fn from_vec(data: Vec<T>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        assert_eq_result!(
            data.len(),
            shape.elem_count(),
            "{} elements do not fill shape {}",
            data.len(),
            shape
        );
        Ok(Tensor { data, shape })
    }

    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Tensor {
            data: vec![T::from_f32(0.0); shape.elem_count()],
            shape,
        }
    }

    pub fn full(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        Tensor {
            data: vec![T::from_f32(value); shape.elem_count()],
            shape,
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R, shape: impl Into<Shape>, range: Range<f32>) -> Self {
        let shape = shape.into();
        let data = (0..shape.elem_count())
            .map(|_| T::from_f32(rng.gen_range(range.clone())))
            .collect();
        Tensor { data, shape }
    }

    /// Evenly spaced values over `range`, filled in row-major order.
    #[cfg(test)]
    pub(crate) fn linear(shape: impl Into<Shape>, range: Range<f32>) -> Self {
        let shape = shape.into();
        let count = shape.elem_count();
        let data = (0..count)
            .map(|i| T::from_f32(range.start + i as f32 / count as f32 * (range.end - range.start)))
            .collect();
        Tensor { data, shape }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Copies the elements out as `f32`.
    pub fn contents(&self) -> Vec<f32> {
        self.data.iter().map(|v| v.to_f32()).collect()
    }

    /// Row `i` of a rank-2 tensor.
    pub fn row(&self, i: usize) -> Result<&[T]> {
        let (rows, cols) = self.shape.dims2()?;
        assert_result!(i < rows, "row {} out of bounds for shape {}", i, self.shape);
        Ok(&self.data[i * cols..(i + 1) * cols])
    }
}

impl Tensor<f32> {
    /// Rounds every element through `precision` in place.
    pub fn round_to(&mut self, precision: Precision) {
        precision.round_slice(&mut self.data);
    }

    pub fn add_assign(&mut self, other: &Tensor<f32>) -> Result<()> {
        assert_eq_result!(
            self.shape,
            other.shape,
            "cannot add {} to {}",
            other.shape,
            self.shape
        );
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
        Ok(())
    }
}

/// A batch of token ids shaped `[batch_size, seq_len]`, created for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    ids: Vec<u32>,
    batch_size: usize,
    seq_len: usize,
    device: Device,
}

impl TokenBatch {
    pub fn new(ids: Vec<u32>, batch_size: usize, seq_len: usize, device: Device) -> Result<Self> {
        assert_eq_result!(
            ids.len(),
            batch_size * seq_len,
            "{} token ids do not fill a [{}, {}] batch",
            ids.len(),
            batch_size,
            seq_len
        );
        Ok(TokenBatch {
            ids,
            batch_size,
            seq_len,
            device,
        })
    }

    /// Uniformly random ids in `range`.
    pub fn random<R: Rng + ?Sized>(
        rng: &mut R,
        batch_size: usize,
        seq_len: usize,
        range: Range<u32>,
        device: Device,
    ) -> Result<Self> {
        if range.is_empty() {
            return Err(Error::Config(format!(
                "token range {}..{} is empty",
                range.start, range.end
            )));
        }
        let ids = (0..batch_size * seq_len)
            .map(|_| rng.gen_range(range.clone()))
            .collect();
        TokenBatch::new(ids, batch_size, seq_len, device)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn sequence(&self, b: usize) -> &[u32] {
        &self.ids[b * self.seq_len..(b + 1) * self.seq_len]
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn device(&self) -> Device {
        self.device
    }

    #[cfg(test)]
    pub(crate) fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}
