//! Multi-Head Attention
//!
//! Attention lets every query position gather information from a set of key
//! positions, weighted by learned similarity. Splitting the embedding into
//! several heads lets each subspace attend independently.
//!
//! ## Scaled Dot-Product Attention
//!
//! ```text
//! Q, K, V = query @ W_q^T + b_q, key @ W_k^T + b_k, value @ W_v^T + b_v
//! split each into num_heads heads of size d = embed_size / num_heads
//! scores  = (Q_h @ K_h^T) / √d                 [batch, heads, q_len, k_len]
//! scores  = mask(scores)                        (-inf where not allowed)
//! weights = softmax(scores, over keys)
//! context = weights @ V_h, heads concatenated  [batch, q_len, embed_size]
//! output  = context @ W_o^T + b_o
//! ```
//!
//! Masked positions receive exactly zero weight. A query row with no allowed
//! key at all gets an all-zero weight row, so its context is zero and its
//! output is just `b_o`.
//!
//! ## Backward Pass
//!
//! 1. Backprop through the output projection
//! 2. Backprop through `weights @ V` into both the weights and V
//! 3. Backprop through softmax, row by row:
//!    `grad_scores = weights * (grad_weights - Σ(grad_weights * weights))`
//! 4. Backprop through `Q @ K^T / √d` into Q and K
//! 5. Backprop through the three input projections
//!
//! Because masked weights are zero, step 3 gives masked scores zero gradient
//! without any special casing.

use rayon::prelude::*;

use super::check_grad_shape;
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use crate::error::{OrsinoError, Result};
use crate::mask::AttentionMask;
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

/// `[batch, seq, heads * d] -> [batch, heads, seq, d]`
fn split_heads(x: &Tensor, num_heads: usize) -> Tensor {
    let (batch, seq, embed) = (x.shape[0], x.shape[1], x.shape[2]);
    x.reshape(&[batch, seq, num_heads, embed / num_heads])
        .transpose(1, 2)
}

/// `[batch, heads, seq, d] -> [batch, seq, heads * d]`
fn merge_heads(x: &Tensor) -> Tensor {
    let (batch, heads, seq, d) = (x.shape[0], x.shape[1], x.shape[2], x.shape[3]);
    x.transpose(1, 2).reshape(&[batch, seq, heads * d])
}

/// Scaled, masked, softmaxed scores for head-split Q and K
///
/// `q` is `[batch, heads, q_len, d]` and `k` is `[batch, heads, k_len, d]`;
/// the result is `[batch, heads, q_len, k_len]`. The mask is assumed to have
/// been checked against `[batch, q_len, k_len]`.
fn attention_weights(q: &Tensor, k: &Tensor, mask: Option<&AttentionMask>) -> Tensor {
    let heads = q.shape[1];
    let q_len = q.shape[2];
    let k_len = k.shape[2];
    let scale = 1.0 / (q.shape[3] as f32).sqrt();

    let mut scores = q.matmul(&k.transpose(2, 3)).mul_scalar(scale);
    if let Some(mask) = mask {
        if q_len * k_len > 0 {
            scores
                .data
                .par_chunks_mut(q_len * k_len)
                .enumerate()
                .for_each(|(bh, plane)| {
                    let b = bh / heads;
                    for (idx, score) in plane.iter_mut().enumerate() {
                        *score = mask.apply(*score, b, idx / k_len, idx % k_len);
                    }
                });
        }
    }
    scores.softmax_last()
}

/// Row-wise softmax Jacobian-vector product
fn softmax_backward(weights: &Tensor, grad_weights: &Tensor) -> Tensor {
    let cols = weights.last_dim();
    let mut grad = vec![0.0; weights.numel()];
    if cols > 0 {
        grad.par_chunks_mut(cols)
            .enumerate()
            .for_each(|(row, out)| {
                let a = &weights.data[row * cols..(row + 1) * cols];
                let g = &grad_weights.data[row * cols..(row + 1) * cols];
                let dot: f32 = a.iter().zip(g).map(|(a, g)| a * g).sum();
                for j in 0..cols {
                    out[j] = a[j] * (g[j] - dot);
                }
            });
    }
    Tensor::new(grad, weights.shape.clone())
}

/// Single-head scaled dot-product attention on `[batch, seq, d]` inputs
///
/// Returns `(context [batch, q_len, d_v], weights [batch, q_len, k_len])`.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&AttentionMask>,
) -> Result<(Tensor, Tensor)> {
    for (name, t) in [("query", q), ("key", k), ("value", v)] {
        if t.shape.len() != 3 {
            return Err(OrsinoError::shape(name, "[batch, seq, dim]", &t.shape));
        }
    }
    let (batch, q_len, d) = (q.shape[0], q.shape[1], q.shape[2]);
    let (k_len, d_v) = (k.shape[1], v.shape[2]);
    if k.shape != [batch, k_len, d] {
        return Err(OrsinoError::shape(
            "key",
            format!("[{}, _, {}]", batch, d),
            &k.shape,
        ));
    }
    if v.shape[..2] != [batch, k_len] {
        return Err(OrsinoError::shape(
            "value",
            format!("[{}, {}, _]", batch, k_len),
            &v.shape,
        ));
    }
    if let Some(mask) = mask {
        mask.check(batch, q_len, k_len)?;
    }

    let weights = attention_weights(
        &q.reshape(&[batch, 1, q_len, d]),
        &k.reshape(&[batch, 1, k_len, d]),
        mask,
    );
    let context = weights.matmul(&v.reshape(&[batch, 1, k_len, d_v]));
    Ok((
        context.reshape(&[batch, q_len, d_v]),
        weights.reshape(&[batch, q_len, k_len]),
    ))
}

/// Multi-head attention with separate query, key and value inputs
#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    pub dropout: Dropout,
    pub num_heads: usize,
}

impl MultiHeadAttention {
    /// Create a new attention layer
    ///
    /// # Arguments
    ///
    /// * `embed_size` - Model width; must be divisible by `num_heads`
    /// * `num_heads` - Number of attention heads
    /// * `dropout` - Dropout probability on the attention weights
    /// * `seed` - Random seed for initialization
    pub fn new(embed_size: usize, num_heads: usize, dropout: f32, seed: u64) -> Result<Self> {
        if num_heads == 0 || embed_size % num_heads != 0 {
            return Err(OrsinoError::InvalidConfig(format!(
                "embed_size {} is not divisible by num_heads {}",
                embed_size, num_heads
            )));
        }
        Ok(Self {
            w_q: Linear::new(embed_size, embed_size, seed),
            w_k: Linear::new(embed_size, embed_size, seed + 1),
            w_v: Linear::new(embed_size, embed_size, seed + 2),
            w_o: Linear::new(embed_size, embed_size, seed + 3),
            dropout: Dropout::new(dropout)?,
            num_heads,
        })
    }

    pub fn embed_size(&self) -> usize {
        self.w_q.out_features()
    }

    pub fn head_dim(&self) -> usize {
        self.embed_size() / self.num_heads
    }

    fn check_input(&self, name: &'static str, x: &Tensor) -> Result<()> {
        if x.shape.len() != 3 || x.shape[2] != self.embed_size() {
            return Err(OrsinoError::shape(
                name,
                format!("[batch, seq, {}]", self.embed_size()),
                &x.shape,
            ));
        }
        Ok(())
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `query` - `[batch, q_len, embed_size]`
    /// * `key` - `[batch, k_len, embed_size]`
    /// * `value` - `[batch, k_len, embed_size]`
    /// * `mask` - Optional mask broadcastable to `[batch, q_len, k_len]`;
    ///   `None` allows every position
    ///
    /// # Returns
    ///
    /// Tuple of (output `[batch, q_len, embed_size]`, cache)
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&AttentionMask>,
    ) -> Result<(Tensor, AttentionCache)> {
        self.check_input("attention query", query)?;
        self.check_input("attention key", key)?;
        self.check_input("attention value", value)?;
        if key.shape != value.shape || key.shape[0] != query.shape[0] {
            return Err(OrsinoError::shape(
                "attention value",
                format!("key shape {:?} with batch {}", key.shape, query.shape[0]),
                &value.shape,
            ));
        }
        if let Some(mask) = mask {
            mask.check(query.shape[0], query.shape[1], key.shape[1])?;
        }

        let (q, q_cache) = self.w_q.forward(query)?;
        let (k, k_cache) = self.w_k.forward(key)?;
        let (v, v_cache) = self.w_v.forward(value)?;

        let q = split_heads(&q, self.num_heads);
        let k = split_heads(&k, self.num_heads);
        let v = split_heads(&v, self.num_heads);

        let weights = attention_weights(&q, &k, mask);
        let (weights_dropped, dropout_cache) = self.dropout.forward(&weights);
        let context = merge_heads(&weights_dropped.matmul(&v));

        let (output, out_cache) = self.w_o.forward(&context)?;

        let cache = AttentionCache {
            q,
            k,
            v,
            weights,
            weights_dropped,
            q_cache,
            k_cache,
            v_cache,
            out_cache,
            dropout_cache,
        };
        Ok((output, cache))
    }

    /// Backward pass
    ///
    /// Accumulates gradients for all four projections and returns the
    /// gradients of the three inputs separately. Self-attention callers add
    /// them together.
    pub fn backward(&mut self, grad_out: &Tensor, cache: &AttentionCache) -> Result<AttentionGradients> {
        let batch = cache.q.shape[0];
        let q_len = cache.q.shape[2];
        check_grad_shape(
            "MultiHeadAttention",
            &[batch, q_len, self.embed_size()],
            grad_out,
        )?;
        let scale = 1.0 / (self.head_dim() as f32).sqrt();

        let grad_context = self.w_o.backward(grad_out, &cache.out_cache)?;
        let grad_context = split_heads(&grad_context, self.num_heads);

        let grad_v = cache
            .weights_dropped
            .transpose(2, 3)
            .matmul(&grad_context);
        let grad_weights_dropped = grad_context.matmul(&cache.v.transpose(2, 3));
        let grad_weights = self
            .dropout
            .backward(&grad_weights_dropped, &cache.dropout_cache);

        let grad_scores = softmax_backward(&cache.weights, &grad_weights).mul_scalar(scale);

        let grad_q = grad_scores.matmul(&cache.k);
        let grad_k = grad_scores.transpose(2, 3).matmul(&cache.q);

        Ok(AttentionGradients {
            query: self.w_q.backward(&merge_heads(&grad_q), &cache.q_cache)?,
            key: self.w_k.backward(&merge_heads(&grad_k), &cache.k_cache)?,
            value: self.w_v.backward(&merge_heads(&grad_v), &cache.v_cache)?,
        })
    }
}

impl Module for MultiHeadAttention {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        self.w_q.visit_parameters(&join_path(prefix, "W_q"), f);
        self.w_k.visit_parameters(&join_path(prefix, "W_k"), f);
        self.w_v.visit_parameters(&join_path(prefix, "W_v"), f);
        self.w_o.visit_parameters(&join_path(prefix, "W_o"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.w_q.visit_parameters_mut(&join_path(prefix, "W_q"), f);
        self.w_k.visit_parameters_mut(&join_path(prefix, "W_k"), f);
        self.w_v.visit_parameters_mut(&join_path(prefix, "W_v"), f);
        self.w_o.visit_parameters_mut(&join_path(prefix, "W_o"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.dropout.training = training;
    }
}

/// Cache for attention backward pass
#[derive(Clone, Debug)]
pub struct AttentionCache {
    /// Head-split projections `[batch, heads, seq, head_dim]`
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Attention weights before dropout `[batch, heads, q_len, k_len]`
    pub weights: Tensor,
    pub weights_dropped: Tensor,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub out_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

/// Gradients with respect to the three attention inputs
#[derive(Clone, Debug)]
pub struct AttentionGradients {
    pub query: Tensor,
    pub key: Tensor,
    pub value: Tensor,
}
