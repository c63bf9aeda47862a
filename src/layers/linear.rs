//! Linear Layer (Fully Connected)
//!
//! The linear layer is the fundamental building block of every other layer
//! here. It performs an affine transformation over the last axis.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [..., in_features]
//! Weight: W [out_features, in_features]
//! Bias:   b [out_features]
//! Output: y = x @ W^T + b   [..., out_features]
//! ```
//!
//! The weight is stored `[out, in]` so that exported weights line up with
//! other runtimes element for element, without a transpose.
//!
//! ## Backward Pass
//!
//! Flattening all leading axes into rows, with upstream gradient dy:
//!
//! ```text
//! grad_W = dy^T @ x          [out, in]
//! grad_b = sum(dy, rows)     [out]
//! grad_x = dy @ W            [..., in]
//! ```
//!
//! ## Initialization
//!
//! Weights and biases are drawn uniformly from `±1/√in_features` using a
//! small LCG so that a given seed always produces the same model.

use super::check_grad_shape;
use crate::error::{OrsinoError, Result};
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

/// Uniform values in `[-scale, scale)` from a reproducible LCG stream
pub fn random_init(size: usize, seed: u64, scale: f32) -> Vec<f32> {
    let mut rng = seed;
    (0..size)
        .map(|_| {
            rng = rng.wrapping_mul(1103515245).wrapping_add(12345);
            let val = ((rng / 65536) % 32768) as f32 / 32768.0;
            (val - 0.5) * 2.0 * scale
        })
        .collect()
}

/// Linear layer: y = x @ W^T + b
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Parameter,
    pub bias: Parameter,
}

impl Linear {
    /// Create a new linear layer
    ///
    /// # Arguments
    ///
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `seed` - Random seed for reproducibility
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        let scale = 1.0 / (in_features.max(1) as f32).sqrt();
        Self {
            weight: Parameter::new(Tensor::new(
                random_init(in_features * out_features, seed, scale),
                vec![out_features, in_features],
            )),
            bias: Parameter::new(Tensor::new(
                random_init(out_features, seed ^ 0x9e37_79b9, scale),
                vec![out_features],
            )),
        }
    }

    /// Build a layer from explicit weights `[out, in]` and bias `[out]`
    pub fn from_tensors(weight: Tensor, bias: Tensor) -> Result<Self> {
        if weight.shape.len() != 2 {
            return Err(OrsinoError::shape("Linear weight", "[out, in]", &weight.shape));
        }
        if bias.shape != [weight.shape[0]] {
            return Err(OrsinoError::shape(
                "Linear bias",
                format!("[{}]", weight.shape[0]),
                &bias.shape,
            ));
        }
        Ok(Self {
            weight: Parameter::new(weight),
            bias: Parameter::new(bias),
        })
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.shape[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.shape[0]
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor `[..., in_features]`
    ///
    /// # Returns
    ///
    /// Tuple of (output `[..., out_features]`, cache holding `x`)
    ///
    /// # Errors
    ///
    /// Fails if the trailing dimension of `x` is not `in_features`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, LinearCache)> {
        let in_features = self.in_features();
        if x.shape.is_empty() || x.last_dim() != in_features {
            return Err(OrsinoError::shape(
                "Linear",
                format!("[..., {}]", in_features),
                &x.shape,
            ));
        }

        let rows = x.rows();
        let y = x
            .reshape(&[rows, in_features])
            .matmul(&self.weight.value.transpose(0, 1))
            .add(&self.bias.value);

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }

        Ok((y.reshape(&out_shape), LinearCache { x: x.clone() }))
    }

    /// Backward pass
    ///
    /// Accumulates weight and bias gradients and returns the gradient with
    /// respect to the input.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LinearCache) -> Result<Tensor> {
        let mut expected = cache.x.shape.clone();
        if let Some(last) = expected.last_mut() {
            *last = self.out_features();
        }
        check_grad_shape("Linear", &expected, grad_out)?;

        let rows = cache.x.rows();
        let grad_2d = grad_out.reshape(&[rows, self.out_features()]);
        let x_2d = cache.x.reshape(&[rows, self.in_features()]);

        self.weight
            .accumulate(&grad_2d.transpose(0, 1).matmul(&x_2d));
        self.bias.accumulate(&grad_2d.sum_leading());

        let grad_x = grad_2d.matmul(&self.weight.value);
        Ok(grad_x.reshape(&cache.x.shape))
    }
}

impl Module for Linear {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        f(&join_path(prefix, "weight"), &self.weight);
        f(&join_path(prefix, "bias"), &self.bias);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        f(&join_path(prefix, "weight"), &mut self.weight);
        f(&join_path(prefix, "bias"), &mut self.bias);
    }
}

/// Cache for linear layer backward pass
#[derive(Clone, Debug)]
pub struct LinearCache {
    pub x: Tensor,
}
