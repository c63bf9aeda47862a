//! Activation Functions
//!
//! ## ReLU (Rectified Linear Unit)
//!
//! ```text
//! ReLU(x)  = max(0, x)
//! ReLU'(x) = 1 if x > 0, else 0
//! ```
//!
//! The derivative at exactly zero is taken as 0, matching the usual
//! subgradient convention.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// ReLU activation (forward pass)
pub fn relu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::new(result, x.shape.clone())
}

/// ReLU activation (backward pass)
///
/// # Arguments
///
/// * `grad_out` - Gradient from next layer
/// * `x` - Input to the forward pass (pre-activation)
///
/// # Returns
///
/// `grad_out` where `x > 0`, zero elsewhere
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    assert_eq!(
        grad_out.shape, x.shape,
        "ReLU gradient shape must match its input"
    );
    let result = grad_out
        .data
        .par_iter()
        .zip(&x.data)
        .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
        .collect();
    Tensor::new(result, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu_forward_and_backward() {
        let x = Tensor::new(vec![-1.0, 0.0, 2.5], vec![3]);
        assert_eq!(relu_forward(&x).data, vec![0.0, 0.0, 2.5]);

        let g = Tensor::new(vec![3.0, 3.0, 3.0], vec![3]);
        assert_eq!(relu_backward(&g, &x).data, vec![0.0, 0.0, 3.0]);
    }
}
