//! Dropout Layer
//!
//! Dropout randomly zeros activations during training and scales the
//! survivors by `1 / (1 - rate)` so the expected value is unchanged. In
//! evaluation mode, or at rate 0, it is the identity and samples nothing.
//!
//! The layer starts in evaluation mode: generation and the numeric fixtures
//! never see a random mask unless a caller opts into training.

use crate::error::{OrsinoError, Result};
use crate::tensor::Tensor;

/// Dropout with an explicit training switch
#[derive(Clone, Debug)]
pub struct Dropout {
    pub rate: f32,
    pub training: bool,
}

impl Dropout {
    /// Create a new dropout layer
    ///
    /// # Arguments
    ///
    /// * `rate` - Dropout probability, in `[0, 1)`
    pub fn new(rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(OrsinoError::InvalidConfig(format!(
                "dropout rate must be in [0, 1), got {}",
                rate
            )));
        }
        Ok(Self {
            rate,
            training: false,
        })
    }

    fn active(&self) -> bool {
        self.training && self.rate > 0.0
    }

    /// Forward pass with caching for backward
    ///
    /// # Returns
    ///
    /// Tuple of (output, cache) where cache stores the keep mask, if any
    pub fn forward(&self, x: &Tensor) -> (Tensor, DropoutCache) {
        if !self.active() {
            return (x.clone(), DropoutCache { mask: None, scale: 1.0 });
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.numel())
            .map(|_| rand::random::<f32>() >= self.rate)
            .collect();
        let output = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        (
            Tensor::new(output, x.shape.clone()),
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Backward pass: route gradient through the kept positions only
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let grad = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(grad, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
#[derive(Clone, Debug)]
pub struct DropoutCache {
    /// Keep mask (true = kept); None if dropout was inactive
    pub mask: Option<Vec<bool>>,
    /// Scaling factor applied to kept values
    pub scale: f32,
}
