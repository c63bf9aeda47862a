//! Sinusoidal Positional Encoding
//!
//! Attention by itself is order-blind, so a fixed position signal is added to
//! the token embeddings once, before the first layer:
//!
//! ```text
//! angle(pos, j) = pos / 10000^((j - j mod 2) / embed_size)
//! pe[pos, j]    = sin(angle)   for even j
//!                 cos(angle)   for odd j
//! ```
//!
//! Each sin/cos pair shares one frequency. The table is precomputed for
//! `max_seq_length` positions and has no learnable parameters, so it is not
//! part of the parameter set and its backward pass is the identity.

use crate::error::{OrsinoError, Result};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct PositionalEncoding {
    /// `[max_seq_length, embed_size]`
    pub table: Tensor,
}

impl PositionalEncoding {
    /// Precompute `max_seq_length` rows of the table
    ///
    /// Construction never fails. Sequences longer than the table are rejected
    /// by [`PositionalEncoding::forward`], so the limit is checked once per
    /// call against the actual input length.
    pub fn new(embed_size: usize, max_seq_length: usize) -> Self {
        let neg_log_base = -(10000.0f64).ln() / embed_size as f64;
        let mut data = Vec::with_capacity(max_seq_length * embed_size);
        for pos in 0..max_seq_length {
            for j in 0..embed_size {
                let angle = pos as f64 * (((j - j % 2) as f64) * neg_log_base).exp();
                let value = if j % 2 == 0 { angle.sin() } else { angle.cos() };
                data.push(value as f32);
            }
        }
        Self {
            table: Tensor::new(data, vec![max_seq_length, embed_size]),
        }
    }

    pub fn max_seq_length(&self) -> usize {
        self.table.shape[0]
    }

    /// Add `pe[:seq_len]` to `x` of shape `[batch, seq_len, embed_size]`
    ///
    /// # Errors
    ///
    /// Returns [`OrsinoError::SequenceTooLong`] when `seq_len` is greater than
    /// `max_seq_length`, and a shape error when `x` is not rank 3 or its
    /// embedding width does not match the table.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let embed_size = self.table.shape[1];
        if x.shape.len() != 3 || x.shape[2] != embed_size {
            return Err(OrsinoError::shape(
                "PositionalEncoding",
                format!("[batch, seq, {}]", embed_size),
                &x.shape,
            ));
        }
        let seq_len = x.shape[1];
        if seq_len > self.max_seq_length() {
            return Err(OrsinoError::SequenceTooLong {
                len: seq_len,
                max: self.max_seq_length(),
            });
        }

        let rows = Tensor::new(
            self.table.data[..seq_len * embed_size].to_vec(),
            vec![seq_len, embed_size],
        );
        Ok(x.add(&rows))
    }
}
