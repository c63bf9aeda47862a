//! Layer Normalization
//!
//! Normalizes each position's feature vector to zero mean and unit variance,
//! then applies a learnable per-feature scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = sum(x) / N
//! 2. var = sum((x - mean)²) / N          (biased estimate)
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum(grad_y * x_norm)          over all positions
//! grad_β = sum(grad_y)                   over all positions
//! grad_x_norm = grad_y * γ
//! grad_x = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / √(var + ε)
//! ```
//!
//! The two expectation terms are position-local means over the feature axis.
//! They account for every element's influence on the mean and the variance.

use rayon::prelude::*;

use super::check_grad_shape;
use crate::error::{OrsinoError, Result};
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

/// Default variance stabilizer
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Layer normalization over the last axis
#[derive(Clone, Debug)]
pub struct LayerNorm {
    /// Scale `[features]`, exported as `weight`
    pub gamma: Parameter,
    /// Shift `[features]`, exported as `bias`
    pub beta: Parameter,
    pub eps: f32,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1 and beta = 0
    pub fn new(features: usize, eps: f32) -> Self {
        Self {
            gamma: Parameter::new(Tensor::full(vec![features], 1.0)),
            beta: Parameter::new(Tensor::zeros(vec![features])),
            eps,
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.value.numel()
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor `[..., features]`
    ///
    /// # Returns
    ///
    /// Tuple of (normalized output, cache)
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, LayerNormCache)> {
        let n = self.features();
        if x.shape.is_empty() || x.last_dim() != n {
            return Err(OrsinoError::shape("LayerNorm", format!("[..., {}]", n), &x.shape));
        }

        let eps = self.eps;
        let stats: Vec<(f32, f32)> = x
            .data
            .par_chunks(n)
            .map(|row| {
                let mean = row.iter().sum::<f32>() / n as f32;
                let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                (mean, (var + eps).sqrt())
            })
            .collect();

        let mut x_norm = x.data.clone();
        x_norm
            .par_chunks_mut(n)
            .zip(&stats)
            .for_each(|(row, &(mean, std))| {
                for v in row.iter_mut() {
                    *v = (*v - mean) / std;
                }
            });
        let x_norm = Tensor::new(x_norm, x.shape.clone());
        let y = x_norm.mul(&self.gamma.value).add(&self.beta.value);

        let cache = LayerNormCache {
            x_norm,
            std: stats.into_iter().map(|(_, std)| std).collect(),
        };
        Ok((y, cache))
    }

    /// Backward pass
    ///
    /// Accumulates gamma and beta gradients and returns the input gradient.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &LayerNormCache) -> Result<Tensor> {
        check_grad_shape("LayerNorm", &cache.x_norm.shape, grad_out)?;
        let n = self.features();

        let mut grad_gamma = vec![0.0; n];
        let mut grad_beta = vec![0.0; n];
        for (g_row, xn_row) in grad_out.data.chunks(n).zip(cache.x_norm.data.chunks(n)) {
            for j in 0..n {
                grad_gamma[j] += g_row[j] * xn_row[j];
                grad_beta[j] += g_row[j];
            }
        }

        let grad_x_norm = grad_out.mul(&self.gamma.value);
        let mut grad_x = vec![0.0; grad_out.numel()];
        grad_x
            .par_chunks_mut(n)
            .enumerate()
            .for_each(|(i, out_row)| {
                let gxn = &grad_x_norm.data[i * n..(i + 1) * n];
                let xn = &cache.x_norm.data[i * n..(i + 1) * n];

                let mean_grad = gxn.iter().sum::<f32>() / n as f32;
                let mean_grad_x = gxn.iter().zip(xn).map(|(g, x)| g * x).sum::<f32>() / n as f32;

                for j in 0..n {
                    out_row[j] = (gxn[j] - mean_grad - xn[j] * mean_grad_x) / cache.std[i];
                }
            });

        self.gamma.accumulate(&Tensor::new(grad_gamma, vec![n]));
        self.beta.accumulate(&Tensor::new(grad_beta, vec![n]));
        Ok(Tensor::new(grad_x, grad_out.shape.clone()))
    }
}

impl Module for LayerNorm {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        f(&join_path(prefix, "weight"), &self.gamma);
        f(&join_path(prefix, "bias"), &self.beta);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        f(&join_path(prefix, "weight"), &mut self.gamma);
        f(&join_path(prefix, "bias"), &mut self.beta);
    }
}

/// Cache for layer norm backward pass
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// `√(var + ε)` per position
    pub std: Vec<f32>,
}
