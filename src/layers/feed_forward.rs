//! Position-wise Feed-Forward Network
//!
//! Applied independently at every position:
//!
//! ```text
//! h = ReLU(x @ w_1^T + b_1)     [..., hidden]
//! h = dropout(h)
//! y = h @ w_2^T + b_2           [..., embed_size]
//! ```

use super::activation::{relu_backward, relu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use crate::error::Result;
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

/// Two linear layers with a ReLU between them
#[derive(Clone, Debug)]
pub struct PositionwiseFeedForward {
    pub w_1: Linear,
    pub w_2: Linear,
    pub dropout: Dropout,
}

impl PositionwiseFeedForward {
    pub fn new(embed_size: usize, hidden_size: usize, dropout: f32, seed: u64) -> Result<Self> {
        Ok(Self {
            w_1: Linear::new(embed_size, hidden_size, seed),
            w_2: Linear::new(hidden_size, embed_size, seed + 1),
            dropout: Dropout::new(dropout)?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, FeedForwardCache)> {
        let (pre_activation, fc1_cache) = self.w_1.forward(x)?;
        let hidden = relu_forward(&pre_activation);
        let (hidden, dropout_cache) = self.dropout.forward(&hidden);
        let (y, fc2_cache) = self.w_2.forward(&hidden)?;

        Ok((
            y,
            FeedForwardCache {
                fc1_cache,
                pre_activation,
                dropout_cache,
                fc2_cache,
            },
        ))
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &FeedForwardCache) -> Result<Tensor> {
        let grad_hidden = self.w_2.backward(grad_out, &cache.fc2_cache)?;
        let grad_hidden = self.dropout.backward(&grad_hidden, &cache.dropout_cache);
        let grad_pre = relu_backward(&grad_hidden, &cache.pre_activation);
        self.w_1.backward(&grad_pre, &cache.fc1_cache)
    }
}

impl Module for PositionwiseFeedForward {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        self.w_1.visit_parameters(&join_path(prefix, "w_1"), f);
        self.w_2.visit_parameters(&join_path(prefix, "w_2"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.w_1.visit_parameters_mut(&join_path(prefix, "w_1"), f);
        self.w_2.visit_parameters_mut(&join_path(prefix, "w_2"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.training = training;
    }
}

/// Cache for feed-forward backward pass
#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    pub pre_activation: Tensor,
    pub dropout_cache: DropoutCache,
    pub fc2_cache: LinearCache,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{compare, numerical_gradient, weighted_sum};

    fn fixture() -> PositionwiseFeedForward {
        let mut ff = PositionwiseFeedForward::new(4, 3, 0.0, 0).unwrap();
        ff.w_1 = Linear::from_tensors(
            Tensor::new(
                vec![
                    -0.3883, 0.2742, -0.4652, -0.1417, //
                    -0.0996, -0.4170, -0.0302, 0.1254, //
                    -0.2065, 0.0107, 0.3998, 0.3775,
                ],
                vec![3, 4],
            ),
            Tensor::new(vec![0.4282, 0.2099, -0.2209], vec![3]),
        )
        .unwrap();
        ff.w_2 = Linear::from_tensors(
            Tensor::new(
                vec![
                    0.0348, 0.3779, -0.5751, //
                    -0.0708, -0.4522, -0.4000, //
                    0.3196, 0.2163, 0.5397, //
                    -0.1805, 0.0472, -0.4630,
                ],
                vec![4, 3],
            ),
            Tensor::new(vec![-0.4660, -0.4707, 0.4046, -0.4392], vec![4]),
        )
        .unwrap();
        ff
    }

    fn input() -> Tensor {
        Tensor::new(
            vec![0.0878, 0.0416, 0.6166, 0.1477, 0.5300, 0.2800, 0.5306, 0.4950],
            vec![1, 2, 4],
        )
    }

    fn upstream() -> Tensor {
        let mut g = Tensor::full(vec![1, 2, 4], 1.0);
        g.data[0] = 5.0;
        g
    }

    #[test]
    fn test_forward_pinned_values() {
        let ff = fixture();
        let (y, cache) = ff.forward(&input()).unwrap();
        let expected = Tensor::new(
            vec![
                -0.429802, -0.586168, 0.509947, -0.477659, //
                -0.474554, -0.538429, 0.461957, -0.468295,
            ],
            vec![1, 2, 4],
        );
        assert!(y.allclose(&expected, 1e-4, 1e-5), "{:?}", y.data);
        // One hidden unit is negative and must be cut by the ReLU.
        assert!(cache.pre_activation.data[3] < 0.0);
    }

    #[test]
    fn test_backward_pinned_values() {
        let mut ff = fixture();
        let (_, cache) = ff.forward(&input()).unwrap();
        let dx = ff.backward(&upstream(), &cache).unwrap();
        let expected = Tensor::new(
            vec![
                0.397067, -0.677022, -1.442962, -1.028601, //
                0.166675, -0.088509, -0.364894, -0.315420,
            ],
            vec![1, 2, 4],
        );
        assert!(dx.allclose(&expected, 1e-4, 1e-5), "{:?}", dx.data);
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let ff = fixture();
        let x = input();
        let g = upstream();
        let mut layer = ff.clone();
        let (_, cache) = layer.forward(&x).unwrap();
        let dx = layer.backward(&g, &cache).unwrap();

        // Smallest pre-activation magnitude is ~0.018, so stay well under it.
        let numerical = numerical_gradient(&x, 1e-3, |shifted| {
            let (y, _) = ff.forward(shifted).unwrap();
            weighted_sum(&y, &g)
        });
        let report = compare(&dx, &numerical, 1e-2, 2e-3);
        assert!(report.passed, "{:?}", report);
    }

    #[test]
    fn test_parameter_names() {
        assert_eq!(
            fixture().parameter_names(),
            vec!["w_1.weight", "w_1.bias", "w_2.weight", "w_2.bias"]
        );
    }
}
