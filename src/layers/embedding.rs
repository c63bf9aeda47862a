//! Token Embedding
//!
//! A lookup table `[vocab_size, embed_size]`: token id `t` maps to row `t`.
//! The backward pass scatter-adds each upstream row into the row of the token
//! that produced it, so repeated tokens accumulate.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use super::check_grad_shape;
use crate::error::{OrsinoError, Result};
use crate::mask::batch_dims;
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct Embedding {
    /// Embedding table `[vocab_size, embed_size]`
    pub weight: Parameter,
}

impl Embedding {
    /// Create an embedding with weights drawn from N(0, 1)
    pub fn new(vocab_size: usize, embed_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..vocab_size * embed_size)
            .map(|_| -> f32 { StandardNormal.sample(&mut rng) })
            .collect();
        Self {
            weight: Parameter::new(Tensor::new(data, vec![vocab_size, embed_size])),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.value.shape[0]
    }

    pub fn embed_size(&self) -> usize {
        self.weight.value.shape[1]
    }

    /// Look up embeddings for `[batch, seq_len]` token ids
    ///
    /// # Returns
    ///
    /// Embedding vectors of shape `[batch, seq_len, embed_size]`
    pub fn forward(&self, token_ids: &[Vec<usize>]) -> Result<Tensor> {
        let (batch, seq_len) = batch_dims(token_ids)?;
        let embed_size = self.embed_size();
        let mut output = Vec::with_capacity(batch * seq_len * embed_size);

        for &token in token_ids.iter().flatten() {
            if token >= self.vocab_size() {
                return Err(OrsinoError::TokenOutOfRange {
                    token,
                    vocab_size: self.vocab_size(),
                });
            }
            let start = token * embed_size;
            output.extend_from_slice(&self.weight.value.data[start..start + embed_size]);
        }

        Ok(Tensor::new(output, vec![batch, seq_len, embed_size]))
    }

    /// Scatter-add the upstream gradient into the table gradient
    pub fn backward(&mut self, grad_out: &Tensor, token_ids: &[Vec<usize>]) -> Result<()> {
        let (batch, seq_len) = batch_dims(token_ids)?;
        let embed_size = self.embed_size();
        check_grad_shape("Embedding", &[batch, seq_len, embed_size], grad_out)?;

        for (row, &token) in grad_out.data.chunks(embed_size).zip(token_ids.iter().flatten()) {
            let start = token * embed_size;
            for (g, &v) in self.weight.grad.data[start..start + embed_size]
                .iter_mut()
                .zip(row)
            {
                *g += v;
            }
        }
        Ok(())
    }
}

impl Module for Embedding {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        f(&join_path(prefix, "weight"), &self.weight);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        f(&join_path(prefix, "weight"), &mut self.weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_scatter_add() {
        let mut emb = Embedding::new(5, 2, 7);
        emb.weight.value = Tensor::new((0..10).map(|i| i as f32).collect(), vec![5, 2]);

        let ids = vec![vec![3, 1, 3]];
        let out = emb.forward(&ids).unwrap();
        assert_eq!(out.shape, vec![1, 3, 2]);
        assert_eq!(out.data, vec![6.0, 7.0, 2.0, 3.0, 6.0, 7.0]);

        let grad = Tensor::new(vec![1.0, 1.0, 0.5, 0.5, 2.0, 2.0], vec![1, 3, 2]);
        emb.backward(&grad, &ids).unwrap();
        assert_eq!(&emb.weight.grad.data[6..8], &[3.0, 3.0]);
        assert_eq!(&emb.weight.grad.data[2..4], &[0.5, 0.5]);
        assert_eq!(emb.weight.grad.data[0], 0.0);
    }

    #[test]
    fn test_out_of_range_token_is_an_error() {
        let emb = Embedding::new(5, 2, 0);
        assert!(matches!(
            emb.forward(&[vec![1, 5]]),
            Err(OrsinoError::TokenOutOfRange { token: 5, vocab_size: 5 })
        ));
    }

    #[test]
    fn test_same_seed_same_table() {
        let a = Embedding::new(4, 3, 11);
        let b = Embedding::new(4, 3, 11);
        assert_eq!(a.weight.value, b.weight.value);
    }
}
