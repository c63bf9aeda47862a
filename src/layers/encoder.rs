//! Encoder Layer and Stack
//!
//! Each encoder layer is two residual sublayers with post-norm placement:
//!
//! ```text
//! x1 = LayerNorm(x  + Dropout(SelfAttention(x, x, x, src_mask)))
//! x2 = LayerNorm(x1 + Dropout(FeedForward(x1)))
//! ```
//!
//! The residual dropout is separate from the dropout inside attention and
//! the feed-forward network; all of them share one rate. Like every dropout
//! site it is the identity outside training mode.
//!
//! The stack applies N independent layers in order, each consuming the
//! previous layer's output.
//!
//! ## Backward Pass
//!
//! Both residual branches split the gradient in two: one copy flows through
//! the sublayer, the other skips it. Self-attention receives the same tensor
//! as query, key and value, so its three input gradients are summed.

use tracing::trace;

use super::attention::{AttentionCache, MultiHeadAttention};
use super::dropout::{Dropout, DropoutCache};
use super::feed_forward::{FeedForwardCache, PositionwiseFeedForward};
use super::layer_norm::{LayerNorm, LayerNormCache};
use crate::error::Result;
use crate::mask::AttentionMask;
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct EncoderLayer {
    pub self_attn: MultiHeadAttention,
    pub feed_forward: PositionwiseFeedForward,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
    /// Applied to each sublayer output before the residual add
    pub dropout: Dropout,
}

impl EncoderLayer {
    /// Create a new encoder layer
    ///
    /// # Arguments
    ///
    /// * `embed_size` - Model width
    /// * `num_heads` - Attention heads; must divide `embed_size`
    /// * `ff_size` - Feed-forward hidden width
    /// * `dropout` - Dropout probability for every dropout site
    /// * `eps` - Layer norm variance stabilizer
    /// * `seed` - Base seed; sublayers derive their own from it
    pub fn new(
        embed_size: usize,
        num_heads: usize,
        ff_size: usize,
        dropout: f32,
        eps: f32,
        seed: u64,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(embed_size, num_heads, dropout, seed)?,
            feed_forward: PositionwiseFeedForward::new(embed_size, ff_size, dropout, seed + 10)?,
            norm1: LayerNorm::new(embed_size, eps),
            norm2: LayerNorm::new(embed_size, eps),
            dropout: Dropout::new(dropout)?,
        })
    }

    /// Forward pass over `[batch, seq, embed_size]`
    pub fn forward(
        &self,
        x: &Tensor,
        src_mask: Option<&AttentionMask>,
    ) -> Result<(Tensor, EncoderLayerCache)> {
        let (attn, attn_cache) = self.self_attn.forward(x, x, x, src_mask)?;
        let (attn, attn_dropout) = self.dropout.forward(&attn);
        let (x1, norm1_cache) = self.norm1.forward(&x.add(&attn))?;

        let (ff, ff_cache) = self.feed_forward.forward(&x1)?;
        let (ff, ff_dropout) = self.dropout.forward(&ff);
        let (x2, norm2_cache) = self.norm2.forward(&x1.add(&ff))?;

        let cache = EncoderLayerCache {
            attn_cache,
            attn_dropout,
            norm1_cache,
            ff_cache,
            ff_dropout,
            norm2_cache,
        };
        Ok((x2, cache))
    }

    /// Backward pass; returns the gradient with respect to `x`
    pub fn backward(&mut self, grad_out: &Tensor, cache: &EncoderLayerCache) -> Result<Tensor> {
        let grad_sum2 = self.norm2.backward(grad_out, &cache.norm2_cache)?;
        let grad_ff = self.dropout.backward(&grad_sum2, &cache.ff_dropout);
        let grad_x1 = grad_sum2.add(&self.feed_forward.backward(&grad_ff, &cache.ff_cache)?);

        let grad_sum1 = self.norm1.backward(&grad_x1, &cache.norm1_cache)?;
        let grad_attn = self.dropout.backward(&grad_sum1, &cache.attn_dropout);
        let attn = self.self_attn.backward(&grad_attn, &cache.attn_cache)?;

        Ok(grad_sum1.add(&attn.query).add(&attn.key).add(&attn.value))
    }
}

impl Module for EncoderLayer {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        self.self_attn.visit_parameters(&join_path(prefix, "self_attn"), f);
        self.feed_forward
            .visit_parameters(&join_path(prefix, "feed_forward"), f);
        self.norm1.visit_parameters(&join_path(prefix, "norm1"), f);
        self.norm2.visit_parameters(&join_path(prefix, "norm2"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.self_attn
            .visit_parameters_mut(&join_path(prefix, "self_attn"), f);
        self.feed_forward
            .visit_parameters_mut(&join_path(prefix, "feed_forward"), f);
        self.norm1.visit_parameters_mut(&join_path(prefix, "norm1"), f);
        self.norm2.visit_parameters_mut(&join_path(prefix, "norm2"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.dropout.training = training;
    }
}

/// Cache for encoder layer backward pass
#[derive(Clone, Debug)]
pub struct EncoderLayerCache {
    pub attn_cache: AttentionCache,
    pub attn_dropout: DropoutCache,
    pub norm1_cache: LayerNormCache,
    pub ff_cache: FeedForwardCache,
    pub ff_dropout: DropoutCache,
    pub norm2_cache: LayerNormCache,
}

/// Ordered stack of encoder layers
#[derive(Clone, Debug)]
pub struct Encoder {
    pub layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub fn new(
        num_layers: usize,
        embed_size: usize,
        num_heads: usize,
        ff_size: usize,
        dropout: f32,
        eps: f32,
        seed: u64,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| {
                EncoderLayer::new(
                    embed_size,
                    num_heads,
                    ff_size,
                    dropout,
                    eps,
                    seed + 100 * i as u64,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Tensor, src_mask: Option<&AttentionMask>) -> Result<(Tensor, Vec<EncoderLayerCache>)> {
        let mut hidden = x.clone();
        let mut caches = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let (next, cache) = layer.forward(&hidden, src_mask)?;
            trace!(layer = i, shape = ?next.shape, "encoder layer");
            hidden = next;
            caches.push(cache);
        }
        Ok((hidden, caches))
    }

    pub fn backward(&mut self, grad_out: &Tensor, caches: &[EncoderLayerCache]) -> Result<Tensor> {
        let mut grad = grad_out.clone();
        for (layer, cache) in self.layers.iter_mut().zip(caches).rev() {
            grad = layer.backward(&grad, cache)?;
        }
        Ok(grad)
    }
}

impl Module for Encoder {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_parameters(&join_path(prefix, &i.to_string()), f);
        }
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_parameters_mut(&join_path(prefix, &i.to_string()), f);
        }
    }

    fn set_training(&mut self, training: bool) {
        self.layers
            .iter_mut()
            .for_each(|layer| layer.set_training(training));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::Mask;
    use crate::testing;
    use proptest::prelude::*;

    #[test]
    fn test_forward_pinned_values() {
        let layer = testing::encoder_layer();
        let mask: AttentionMask = Mask::allow_all(1, 5, 5).into();
        let (y, _) = layer.forward(&testing::encoder_input(), Some(&mask)).unwrap();

        let expected = testing::seq(&[
            &[-1.722719, 0.419248, 0.592836, 0.710635],
            &[-1.722752, 0.418731, 0.594815, 0.709206],
            &[-1.724107, 0.433173, 0.588233, 0.702700],
            &[-1.724427, 0.440623, 0.578204, 0.705600],
            &[-1.724083, 0.434439, 0.584829, 0.704815],
        ]);
        assert!(y.allclose(&expected, 1e-3, 1e-3), "{:?}", y.data);
    }

    #[test]
    fn test_residual_dropout_only_acts_in_training() {
        let mut layer = testing::encoder_layer();
        let mask: AttentionMask = Mask::allow_all(1, 5, 5).into();
        let x = testing::encoder_input();
        let (eval, _) = layer.forward(&x, Some(&mask)).unwrap();

        layer.dropout = Dropout::new(0.5).unwrap();
        let (still_eval, cache) = layer.forward(&x, Some(&mask)).unwrap();
        assert_eq!(still_eval, eval);
        assert!(cache.attn_dropout.mask.is_none());

        layer.dropout.training = true;
        let (trained, cache) = layer.forward(&x, Some(&mask)).unwrap();
        assert!(cache.attn_dropout.mask.is_some() && cache.ff_dropout.mask.is_some());
        assert_ne!(trained, eval);
    }

    #[test]
    fn test_backward_pinned_values() {
        let mut layer = testing::encoder_layer();
        let mask: AttentionMask = Mask::allow_all(1, 5, 5).into();
        let (_, cache) = layer.forward(&testing::encoder_input(), Some(&mask)).unwrap();

        let mut upstream = Tensor::full(vec![1, 5, 4], 1.0);
        upstream.data[0] = 1250.0;
        let dx = layer.backward(&upstream, &cache).unwrap();

        let expected = testing::seq(&[
            &[-0.200041, -0.863827, 0.126292, 0.910772],
            &[-0.523269, -0.089933, -0.179620, 0.270133],
            &[-0.005278, 0.001777, -0.003982, 0.005137],
            &[-0.004458, 0.002844, -0.000987, 0.003335],
            &[-0.005056, 0.001771, -0.003693, 0.004870],
        ]);
        assert!(dx.allclose(&expected, 1e-2, 2e-3), "{:?}", dx.data);
    }

    #[test]
    fn test_stack_applies_layers_in_order() {
        let first = testing::encoder_layer();
        let mut second = testing::encoder_layer();
        second.norm2.beta.value = Tensor::new(vec![0.1, 0.2, 0.3, 0.4], vec![4]);
        let encoder = Encoder {
            layers: vec![first.clone(), second.clone()],
        };

        let x = testing::encoder_input();
        let (stacked, caches) = encoder.forward(&x, None).unwrap();
        let (h, _) = first.forward(&x, None).unwrap();
        let (manual, _) = second.forward(&h, None).unwrap();
        assert_eq!(stacked, manual);
        assert_eq!(caches.len(), 2);
    }

    #[test]
    fn test_parameter_paths() {
        let encoder = Encoder::new(2, 4, 2, 3, 0.0, 1e-5, 0).unwrap();
        let names = encoder.parameter_names();
        assert_eq!(names.len(), 2 * (8 + 4 + 4));
        assert_eq!(names[0], "0.self_attn.W_q.weight");
        assert_eq!(names[8], "0.feed_forward.w_1.weight");
        assert_eq!(names[12], "0.norm1.weight");
        assert_eq!(names[15], "0.norm2.bias");
        assert_eq!(names[16], "1.self_attn.W_q.weight");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_output_shape_equals_input_shape(
            heads in 1usize..4,
            head_dim in 1usize..3,
            batch in 1usize..3,
            seq_len in 1usize..5,
            seed in 0u64..50,
        ) {
            let embed = heads * head_dim;
            let layer = EncoderLayer::new(embed, heads, 3, 0.0, 1e-5, seed).unwrap();
            let x = Tensor::new(
                (0..batch * seq_len * embed).map(|i| ((i * 37) % 11) as f32 * 0.2 - 1.0).collect(),
                vec![batch, seq_len, embed],
            );
            let (y, _) = layer.forward(&x, None).unwrap();
            prop_assert_eq!(y.shape, x.shape);
        }
    }
}
