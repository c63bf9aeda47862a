//! Decoder Layer and Stack
//!
//! Each decoder layer has three residual sublayers, all post-norm:
//!
//! ```text
//! x1 = LayerNorm(x  + Dropout(SelfAttention(x, x, x, tgt_mask)))
//! x2 = LayerNorm(x1 + Dropout(CrossAttention(x1, memory, memory, src_mask)))
//! x3 = LayerNorm(x2 + Dropout(FeedForward(x2)))
//! ```
//!
//! As in the encoder, the residual dropout is its own site, active only in
//! training mode.
//!
//! `tgt_mask` combines causality with target padding; `src_mask` only hides
//! source padding. Every layer in the stack reads the same encoder `memory`,
//! so the backward pass sums the memory gradient over all layers.

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
pub struct DecoderLayer {
    pub self_attn: MultiHeadAttention,
    pub cross_attn: MultiHeadAttention,
    pub feed_forward: PositionwiseFeedForward,
    pub norm1: LayerNorm,
    pub norm2: LayerNorm,
    pub norm3: LayerNorm,
    /// Applied to each sublayer output before the residual add
    pub dropout: Dropout,
}

/// Gradients of a decoder layer's two inputs
#[derive(Clone, Debug)]
pub struct DecoderGradients {
    pub x: Tensor,
    pub memory: Tensor,
}

impl DecoderLayer {
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
            cross_attn: MultiHeadAttention::new(embed_size, num_heads, dropout, seed + 5)?,
            feed_forward: PositionwiseFeedForward::new(embed_size, ff_size, dropout, seed + 10)?,
            norm1: LayerNorm::new(embed_size, eps),
            norm2: LayerNorm::new(embed_size, eps),
            norm3: LayerNorm::new(embed_size, eps),
            dropout: Dropout::new(dropout)?,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Target-side input `[batch, tgt_len, embed_size]`
    /// * `memory` - Encoder output `[batch, src_len, embed_size]`
    /// * `src_mask` - Source padding mask for cross-attention
    /// * `tgt_mask` - Causal and padding mask for self-attention
    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        src_mask: Option<&AttentionMask>,
        tgt_mask: Option<&AttentionMask>,
    ) -> Result<(Tensor, DecoderLayerCache)> {
        let (attn, self_attn_cache) = self.self_attn.forward(x, x, x, tgt_mask)?;
        let (attn, self_attn_dropout) = self.dropout.forward(&attn);
        let (x1, norm1_cache) = self.norm1.forward(&x.add(&attn))?;

        let (cross, cross_attn_cache) = self.cross_attn.forward(&x1, memory, memory, src_mask)?;
        let (cross, cross_attn_dropout) = self.dropout.forward(&cross);
        let (x2, norm2_cache) = self.norm2.forward(&x1.add(&cross))?;

        let (ff, ff_cache) = self.feed_forward.forward(&x2)?;
        let (ff, ff_dropout) = self.dropout.forward(&ff);
        let (x3, norm3_cache) = self.norm3.forward(&x2.add(&ff))?;

        let cache = DecoderLayerCache {
            self_attn_cache,
            self_attn_dropout,
            norm1_cache,
            cross_attn_cache,
            cross_attn_dropout,
            norm2_cache,
            ff_cache,
            ff_dropout,
            norm3_cache,
        };
        Ok((x3, cache))
    }

    pub fn backward(&mut self, grad_out: &Tensor, cache: &DecoderLayerCache) -> Result<DecoderGradients> {
        let grad_sum3 = self.norm3.backward(grad_out, &cache.norm3_cache)?;
        let grad_ff = self.dropout.backward(&grad_sum3, &cache.ff_dropout);
        let grad_x2 = grad_sum3.add(&self.feed_forward.backward(&grad_ff, &cache.ff_cache)?);

        let grad_sum2 = self.norm2.backward(&grad_x2, &cache.norm2_cache)?;
        let grad_cross = self.dropout.backward(&grad_sum2, &cache.cross_attn_dropout);
        let cross = self
            .cross_attn
            .backward(&grad_cross, &cache.cross_attn_cache)?;
        let grad_x1 = grad_sum2.add(&cross.query);

        let grad_sum1 = self.norm1.backward(&grad_x1, &cache.norm1_cache)?;
        let grad_attn = self.dropout.backward(&grad_sum1, &cache.self_attn_dropout);
        let attn = self.self_attn.backward(&grad_attn, &cache.self_attn_cache)?;

        Ok(DecoderGradients {
            x: grad_sum1.add(&attn.query).add(&attn.key).add(&attn.value),
            memory: cross.key.add(&cross.value),
        })
    }
}

impl Module for DecoderLayer {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        self.self_attn.visit_parameters(&join_path(prefix, "self_attn"), f);
        self.cross_attn
            .visit_parameters(&join_path(prefix, "cross_attn"), f);
        self.feed_forward
            .visit_parameters(&join_path(prefix, "feed_forward"), f);
        self.norm1.visit_parameters(&join_path(prefix, "norm1"), f);
        self.norm2.visit_parameters(&join_path(prefix, "norm2"), f);
        self.norm3.visit_parameters(&join_path(prefix, "norm3"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.self_attn
            .visit_parameters_mut(&join_path(prefix, "self_attn"), f);
        self.cross_attn
            .visit_parameters_mut(&join_path(prefix, "cross_attn"), f);
        self.feed_forward
            .visit_parameters_mut(&join_path(prefix, "feed_forward"), f);
        self.norm1.visit_parameters_mut(&join_path(prefix, "norm1"), f);
        self.norm2.visit_parameters_mut(&join_path(prefix, "norm2"), f);
        self.norm3.visit_parameters_mut(&join_path(prefix, "norm3"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.self_attn.set_training(training);
        self.cross_attn.set_training(training);
        self.feed_forward.set_training(training);
        self.dropout.training = training;
    }
}

/// Cache for decoder layer backward pass
#[derive(Clone, Debug)]
pub struct DecoderLayerCache {
    pub self_attn_cache: AttentionCache,
    pub self_attn_dropout: DropoutCache,
    pub norm1_cache: LayerNormCache,
    pub cross_attn_cache: AttentionCache,
    pub cross_attn_dropout: DropoutCache,
    pub norm2_cache: LayerNormCache,
    pub ff_cache: FeedForwardCache,
    pub ff_dropout: DropoutCache,
    pub norm3_cache: LayerNormCache,
}

/// Ordered stack of decoder layers sharing one encoder memory
#[derive(Clone, Debug)]
pub struct Decoder {
    pub layers: Vec<DecoderLayer>,
}

impl Decoder {
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
                DecoderLayer::new(
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

    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        src_mask: Option<&AttentionMask>,
        tgt_mask: Option<&AttentionMask>,
    ) -> Result<(Tensor, Vec<DecoderLayerCache>)> {
        let mut hidden = x.clone();
        let mut caches = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let (next, cache) = layer.forward(&hidden, memory, src_mask, tgt_mask)?;
            trace!(layer = i, shape = ?next.shape, "decoder layer");
            hidden = next;
            caches.push(cache);
        }
        Ok((hidden, caches))
    }

    /// Backward through every layer; `memory` gradients are summed
    pub fn backward(&mut self, grad_out: &Tensor, caches: &[DecoderLayerCache]) -> Result<DecoderGradients> {
        let mut grad = grad_out.clone();
        let mut grad_memory: Option<Tensor> = None;
        for (layer, cache) in self.layers.iter_mut().zip(caches).rev() {
            let grads = layer.backward(&grad, cache)?;
            grad = grads.x;
            match grad_memory.as_mut() {
                Some(total) => total.add_assign(&grads.memory),
                None => grad_memory = Some(grads.memory),
            }
        }

        // An empty stack never reads the memory.
        let memory_shape = caches
            .first()
            .map(|c| c.cross_attn_cache.k_cache.x.shape.clone())
            .unwrap_or_default();
        Ok(DecoderGradients {
            x: grad,
            memory: grad_memory.unwrap_or_else(|| Tensor::zeros(memory_shape)),
        })
    }
}

impl Module for Decoder {
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
