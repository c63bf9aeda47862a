//! Tensor Operations for Neural Networks
//!
//! This module provides a minimal tensor library sized for an encoder-decoder
//! transformer. Tensors store multi-dimensional arrays with shape and stride
//! information for row-major indexing.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Example
//!
//! ```rust
//! use orsino::Tensor;
//!
//! // Create a 2x3 matrix
//! let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
//! let tensor = Tensor::new(data, vec![2, 3]);
//!
//! // Matrix multiplication
//! let other = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let result = tensor.matmul(&other);
//! assert_eq!(result.shape, vec![2, 2]);
//! ```
//!
//! ## Invariants vs. Errors
//!
//! Operations here assert their shape preconditions: a violation is a bug in
//! the calling layer, not bad user input. Layers validate user-supplied shapes
//! up front and report them as [`OrsinoError`](crate::OrsinoError) values
//! before any tensor op runs.
//!
//! ## Determinism
//!
//! Parallel operations (via Rayon) only split work across independent output
//! rows or matrices. Every reduction (row sums, softmax normalizers, dot
//! products) runs sequentially inside one task, so results are bit-identical
//! regardless of thread count.

use rayon::prelude::*;

use crate::error::{OrsinoError, Result};

/// Work threshold (m * n * k) above which 2D matmul goes parallel.
const PARALLEL_MATMUL_WORK: usize = 1_000;

/// A multi-dimensional array for neural network computations
///
/// For shape `[2, 3]`, data is stored as
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length.
    /// Use [`Tensor::try_new`] for data that comes from outside the crate.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use orsino::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// assert_eq!(tensor.shape, vec![2, 2]);
    /// ```
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Fallible constructor for externally supplied data
    pub fn try_new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(OrsinoError::ElementCount {
                name: format!("tensor of shape {:?}", shape),
                expected: expected_size,
                actual: data.len(),
            });
        }
        Ok(Self::new(data, shape))
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with a constant
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Compute strides from shape (row-major layout)
    ///
    /// For shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the last dimension (1 for a scalar)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    /// Number of last-axis rows, i.e. the product of all leading dimensions
    pub fn rows(&self) -> usize {
        let last = self.last_dim();
        if last == 0 {
            0
        } else {
            self.data.len() / last
        }
    }

    /// SIMD-friendly inner loop for matrix multiplication
    /// Computes: result[j] += a_val * b[j] for all j
    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: batched `[b, h, m, k] @ [b, h, k, n] -> [b, h, m, n]`,
    ///   the layout multi-head attention works in
    ///
    /// Large 2D products use a parallel cache-blocked kernel; batched
    /// products parallelize over (batch, head) pairs.
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        // === 2D MATRIX MULTIPLICATION ===
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let n = other.shape[1];
            let k = self.shape[1];

            if m * n * k >= PARALLEL_MATMUL_WORK {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                for l in 0..k {
                    let a_val = self.data[i * k + l];
                    Self::matmul_inner_simd(
                        a_val,
                        &other.data[l * n..(l + 1) * n],
                        &mut result[i * n..(i + 1) * n],
                    );
                }
            }

            return Tensor::new(result, vec![m, n]);
        }

        // === 4D BATCHED MATRIX MULTIPLICATION ===
        if self.shape.len() == 4 && other.shape.len() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let m = self.shape[2];
            let k = self.shape[3];
            let n = other.shape[3];

            assert_eq!(
                (other.shape[0], other.shape[1], other.shape[2]),
                (batch, n_heads, k),
                "Batched matmul incompatible: {:?} @ {:?}",
                self.shape,
                other.shape
            );

            let mut result = vec![0.0; batch * n_heads * m * n];
            if m * n == 0 {
                return Tensor::new(result, vec![batch, n_heads, m, n]);
            }

            result
                .par_chunks_mut(m * n)
                .enumerate()
                .for_each(|(bh, chunk)| {
                    let a = &self.data[bh * m * k..(bh + 1) * m * k];
                    let b = &other.data[bh * k * n..(bh + 1) * k * n];
                    for i in 0..m {
                        for l in 0..k {
                            Self::matmul_inner_simd(
                                a[i * k + l],
                                &b[l * n..(l + 1) * n],
                                &mut chunk[i * n..(i + 1) * n],
                            );
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, m, n]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked matrix multiplication
    ///
    /// Processes 8×8 blocks so the working set stays in L1 and distributes
    /// row blocks across cores. Each output element is accumulated in the
    /// same k-order as the sequential path.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];
        if n == 0 {
            return Tensor::new(result, vec![m, n]);
        }

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax over the last axis, for any rank
    ///
    /// ```text
    /// softmax(x)[i] = exp(x[i] - max(x)) / sum(exp(x[j] - max(x)))
    /// ```
    ///
    /// A row whose entries are all `-inf` (every key masked out) has no
    /// distribution to normalize; it yields a row of zeros instead of NaN.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use orsino::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, f32::NEG_INFINITY, f32::NEG_INFINITY], vec![2, 2]);
    /// let s = t.softmax_last();
    /// assert!((s.data[0] + s.data[1] - 1.0).abs() < 1e-6);
    /// assert_eq!(&s.data[2..], &[0.0, 0.0]);
    /// ```
    pub fn softmax_last(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();
        if cols == 0 {
            return Tensor::new(result, self.shape.clone());
        }

        result.par_chunks_mut(cols).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            if max == f32::NEG_INFINITY {
                row.iter_mut().for_each(|x| *x = 0.0);
                return;
            }
            let mut sum = 0.0;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting support
    ///
    /// Supported patterns:
    ///
    /// 1. **Exact match**: Same shape
    /// 2. **Broadcast batch**: `[batch, seq, dim] + [seq, dim]`
    /// 3. **Broadcast last dim**: `[*, n] + [n]` (bias addition)
    ///
    /// # Example
    ///
    /// ```rust
    /// # use orsino::Tensor;
    /// let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
    /// let b = Tensor::new(vec![10.0, 20.0], vec![2]);
    /// assert_eq!(a.add(&b).data, vec![11.0, 22.0, 13.0, 24.0]);
    /// ```
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            return self.zip_with(other, |a, b| a + b);
        }

        if self.shape.len() == 3 && other.shape.len() == 2 {
            assert_eq!(
                &self.shape[1..],
                &other.shape[..],
                "Trailing shape must match for batch broadcast: {:?} + {:?}",
                self.shape,
                other.shape
            );
            let plane = other.data.len();
            let result = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &a)| a + other.data[i % plane])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if other.shape.len() == 1 && other.shape[0] == self.last_dim() {
            return self.broadcast_last(other, |a, b| a + b);
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// Element-wise multiplication: same shape, or `[*, n] * [n]`
    pub fn mul(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            return self.zip_with(other, |a, b| a * b);
        }

        if other.shape.len() == 1 && other.shape[0] == self.last_dim() {
            return self.broadcast_last(other, |a, b| a * b);
        }

        panic!(
            "Unsupported broadcast for mul: {:?} * {:?}",
            self.shape, other.shape
        );
    }

    /// Element-wise subtraction
    pub fn sub(&self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for subtraction"
        );
        self.zip_with(other, |a, b| a - b)
    }

    fn zip_with(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32 + Sync) -> Tensor {
        let result = self
            .data
            .par_iter()
            .zip(&other.data)
            .map(|(&a, &b)| f(a, b))
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    fn broadcast_last(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32 + Sync) -> Tensor {
        let last_dim = other.data.len();
        let result = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, &a)| f(a, other.data[i % last_dim]))
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// In-place accumulation of a same-shaped tensor
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(
            self.shape, other.shape,
            "Shapes must match for accumulation"
        );
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, &b)| *a += b);
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Sum over every leading dimension, leaving a `[last_dim]` vector
    ///
    /// This is the reduction a bias gradient needs.
    pub fn sum_leading(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols.max(1)) {
            for (r, &x) in result.iter_mut().zip(row) {
                *r += x;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Reshape tensor to new shape
    ///
    /// Total number of elements must remain the same.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use orsino::Tensor;
    /// let tensor = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let reshaped = tensor.reshape(&[3, 2]);
    /// assert_eq!(reshaped.shape, vec![3, 2]);
    /// ```
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Transpose two dimensions
    ///
    /// Negative indices count from the end (`-1` is the last axis).
    ///
    /// # Example
    ///
    /// ```rust
    /// # use orsino::Tensor;
    /// let t = Tensor::new((0..6).map(|x| x as f32).collect(), vec![1, 2, 3]);
    /// let tt = t.transpose(1, 2);
    /// assert_eq!(tt.shape, vec![1, 3, 2]);
    /// assert_eq!(tt.data, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
    /// ```
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let d1 = self.axis(dim1);
        let d2 = self.axis(dim2);

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if d1 == d2 {
            return self.clone();
        }

        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, new_shape);
        }

        // Walk the output in row-major order; the source stride for each output
        // axis is the old stride of the axis it came from.
        let new_strides = Self::compute_strides(&new_shape);
        let mut source_strides = self.strides.clone();
        source_strides.swap(d1, d2);

        let result = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (&stride, &src_stride) in new_strides.iter().zip(&source_strides) {
                    src += (remaining / stride) * src_stride;
                    remaining %= stride;
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    fn axis(&self, dim: isize) -> usize {
        let ndim = self.shape.len() as isize;
        let d = if dim < 0 { ndim + dim } else { dim };
        assert!(
            (0..ndim).contains(&d),
            "Axis {} out of range for shape {:?}",
            dim,
            self.shape
        );
        d as usize
    }

    /// Largest absolute element-wise difference between two same-shaped tensors
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        assert_eq!(self.shape, other.shape, "Shapes must match for comparison");
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }

    /// `|a - b| <= atol + rtol * |b|` for every element
    pub fn allclose(&self, other: &Tensor, rtol: f32, atol: f32) -> bool {
        self.shape == other.shape
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| (a - b).abs() <= atol + rtol * b.abs())
    }
}
