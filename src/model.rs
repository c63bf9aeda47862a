//! Encoder-Decoder Transformer
//!
//! The top-level model: two embedding tables, one shared sinusoidal
//! positional encoding, an encoder stack, a decoder stack and an output
//! projection onto the target vocabulary.
//!
//! ## Architecture Overview
//!
//! ```text
//! Source ids [batch, src_len]          Target ids [batch, tgt_len]
//!     ↓                                    ↓
//! Source Embedding + PE                Target Embedding + PE
//!     ↓                                    ↓
//! Encoder Layer × N  ── memory ──────→ Decoder Layer × N
//!   (src_mask)                           (src_mask, tgt_mask)
//!                                          ↓
//!                                      Linear → [batch, tgt_len, tgt_vocab_size]
//! ```
//!
//! Masks are derived from the ids on every call: padding positions are
//! hidden from every attention, and the decoder's self-attention is also
//! causal.
//!
//! ## Generation
//!
//! [`Transformer::generate`] encodes the source once, then greedily extends
//! a target that starts with the start token, re-running the decoder over
//! everything produced so far. The loop is bounded by `max_seq_length`.
//!
//! ## Example
//!
//! ```rust
//! use orsino::{SequenceMask, SpecialTokens, Transformer, TransformerConfig};
//!
//! let config = TransformerConfig::tiny(10, 10);
//! let model = Transformer::new(config).unwrap();
//!
//! let (logits, _) = model
//!     .forward(&[vec![1, 2, 3, 0, 0]], &[vec![8, 1, 2, 0, 0]], SequenceMask::new(0, 0))
//!     .unwrap();
//! assert_eq!(logits.shape, vec![1, 5, 10]);
//!
//! let tokens = SpecialTokens { start: 8, end: 9, src_pad: 0, tgt_pad: 0 };
//! let generation = model.generate(&[1, 2, 3, 0, 0], tokens).unwrap();
//! assert_eq!(generation.tokens.len(), 5);
//! ```

use std::fs;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OrsinoError, Result};
use crate::layers::{
    Decoder, DecoderLayerCache, Dropout, DropoutCache, Embedding, Encoder, EncoderLayerCache, Linear,
    LinearCache, PositionalEncoding, LAYER_NORM_EPS,
};
use crate::mask::{batch_dims, AttentionMask, SequenceMask};
use crate::params::{join_path, Module, Parameter};
use crate::tensor::Tensor;

/// Model configuration
///
/// # Fields
///
/// - `src_vocab_size` / `tgt_vocab_size`: Vocabulary sizes of each side
/// - `embed_size`: Width of every hidden representation
/// - `num_heads`: Attention heads per attention block; must divide `embed_size`
/// - `num_layers`: Layers in each of the encoder and decoder stacks
/// - `ff_size`: Hidden width of the position-wise feed-forward network
/// - `max_seq_length`: Longest sequence the positional table covers
/// - `dropout`: Dropout probability, applied only in training mode
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub src_vocab_size: usize,
    pub tgt_vocab_size: usize,
    pub embed_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub ff_size: usize,
    pub max_seq_length: usize,
    pub dropout: f32,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    /// Initialization seed; the same seed gives the same weights
    #[serde(default)]
    pub seed: u64,
}

fn default_layer_norm_eps() -> f32 {
    LAYER_NORM_EPS
}

impl TransformerConfig {
    /// Smallest useful geometry: width 4, two heads, one layer per stack
    pub fn tiny(src_vocab_size: usize, tgt_vocab_size: usize) -> Self {
        Self {
            src_vocab_size,
            tgt_vocab_size,
            embed_size: 4,
            num_heads: 2,
            num_layers: 1,
            ff_size: 3,
            max_seq_length: 5,
            dropout: 0.0,
            layer_norm_eps: LAYER_NORM_EPS,
            seed: 0,
        }
    }

    /// The "base" model from Attention Is All You Need
    pub fn base(src_vocab_size: usize, tgt_vocab_size: usize) -> Self {
        Self {
            src_vocab_size,
            tgt_vocab_size,
            embed_size: 512,
            num_heads: 8,
            num_layers: 6,
            ff_size: 2048,
            max_seq_length: 100,
            dropout: 0.1,
            layer_norm_eps: LAYER_NORM_EPS,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("src_vocab_size", self.src_vocab_size),
            ("tgt_vocab_size", self.tgt_vocab_size),
            ("embed_size", self.embed_size),
            ("num_heads", self.num_heads),
            ("num_layers", self.num_layers),
            ("ff_size", self.ff_size),
            ("max_seq_length", self.max_seq_length),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(OrsinoError::InvalidConfig(format!("{} must be positive", name)));
        }
        if self.embed_size % self.num_heads != 0 {
            return Err(OrsinoError::InvalidConfig(format!(
                "embed_size {} is not divisible by num_heads {}",
                self.embed_size, self.num_heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(OrsinoError::InvalidConfig(format!(
                "dropout {} is outside [0, 1)",
                self.dropout
            )));
        }
        if self.layer_norm_eps.is_nan() || self.layer_norm_eps <= 0.0 {
            return Err(OrsinoError::InvalidConfig(format!(
                "layer_norm_eps {} must be positive",
                self.layer_norm_eps
            )));
        }
        Ok(())
    }

    /// Read and validate a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Token ids with a fixed role during generation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// Target id that opens every decoded sequence
    pub start: usize,
    /// Target id that ends generation
    pub end: usize,
    /// Source padding id
    pub src_pad: usize,
    /// Target padding id, also used to fill the output
    pub tgt_pad: usize,
}

impl SpecialTokens {
    /// Mask builder for these padding ids
    pub fn masks(&self) -> SequenceMask {
        SequenceMask::new(self.src_pad, self.tgt_pad)
    }
}

/// Why greedy decoding stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// The end token was produced
    EndToken,
    /// `max_seq_length` tokens were produced without an end token
    MaxLength,
}

/// Result of [`Transformer::generate`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    /// Exactly `max_seq_length` ids: the produced tokens (start token
    /// excluded, end token included) followed by padding
    pub tokens: Vec<usize>,
    pub finish: FinishReason,
    /// Number of decoding steps taken
    pub steps: usize,
}

impl Generation {
    /// Produced tokens without the trailing padding
    pub fn produced(&self) -> &[usize] {
        &self.tokens[..self.steps]
    }

    pub fn is_truncated(&self) -> bool {
        self.finish == FinishReason::MaxLength
    }
}

#[derive(Clone, Debug)]
pub struct Transformer {
    pub config: TransformerConfig,
    pub encoder_embedding: Embedding,
    pub decoder_embedding: Embedding,
    pub positional_encoding: PositionalEncoding,
    pub encoder: Encoder,
    pub decoder: Decoder,
    /// Output projection to target-vocabulary logits
    pub fc: Linear,
    /// Applied to both embedded sequences
    pub dropout: Dropout,
}

impl Transformer {
    /// Create a new model with seeded random initialization
    ///
    /// Embeddings are drawn from N(0, 1), linear layers uniformly from
    /// `±1/sqrt(in_features)`, layer norms start at scale 1 and shift 0.
    ///
    /// # Errors
    ///
    /// Fails with [`OrsinoError::InvalidConfig`] if the config does not
    /// validate.
    pub fn new(config: TransformerConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.seed;
        let encoder = Encoder::new(
            config.num_layers,
            config.embed_size,
            config.num_heads,
            config.ff_size,
            config.dropout,
            config.layer_norm_eps,
            seed + 1_000,
        )?;
        let decoder = Decoder::new(
            config.num_layers,
            config.embed_size,
            config.num_heads,
            config.ff_size,
            config.dropout,
            config.layer_norm_eps,
            seed + 2_000,
        )?;

        let model = Self {
            encoder_embedding: Embedding::new(config.src_vocab_size, config.embed_size, seed),
            decoder_embedding: Embedding::new(config.tgt_vocab_size, config.embed_size, seed + 1),
            positional_encoding: PositionalEncoding::new(config.embed_size, config.max_seq_length),
            encoder,
            decoder,
            fc: Linear::new(config.embed_size, config.tgt_vocab_size, seed + 3_000),
            dropout: Dropout::new(config.dropout)?,
            config,
        };
        info!(
            parameters = model.parameter_count(),
            layers = model.config.num_layers,
            embed_size = model.config.embed_size,
            "initialized transformer"
        );
        Ok(model)
    }

    fn embed(&self, embedding: &Embedding, ids: &[Vec<usize>]) -> Result<(Tensor, DropoutCache)> {
        let x = self.positional_encoding.forward(&embedding.forward(ids)?)?;
        Ok(self.dropout.forward(&x))
    }

    /// Run the encoder over source ids; the output is the decoder's memory
    pub fn encode(
        &self,
        src_ids: &[Vec<usize>],
        src_mask: &AttentionMask,
    ) -> Result<(Tensor, EncodeCache)> {
        let (x, dropout) = self.embed(&self.encoder_embedding, src_ids)?;
        let (memory, layers) = self.encoder.forward(&x, Some(src_mask))?;
        Ok((memory, EncodeCache { dropout, layers }))
    }

    /// Run the decoder over target ids against an encoded memory
    ///
    /// Returns the final hidden states `[batch, tgt_len, embed_size]`,
    /// before the output projection.
    pub fn decode(
        &self,
        tgt_ids: &[Vec<usize>],
        memory: &Tensor,
        src_mask: &AttentionMask,
        tgt_mask: &AttentionMask,
    ) -> Result<(Tensor, DecodeCache)> {
        let (y, dropout) = self.embed(&self.decoder_embedding, tgt_ids)?;
        let (hidden, layers) = self
            .decoder
            .forward(&y, memory, Some(src_mask), Some(tgt_mask))?;
        Ok((hidden, DecodeCache { dropout, layers }))
    }

    /// Forward pass: source and target ids → logits
    ///
    /// # Arguments
    ///
    /// * `src_ids` - Source ids `[batch][src_len]`, right-padded with `masks.src_pad`
    /// * `tgt_ids` - Target ids `[batch][tgt_len]`, right-padded with `masks.tgt_pad`
    /// * `masks` - Padding ids hidden from attention on each side
    ///
    /// # Returns
    ///
    /// Logits `[batch, tgt_len, tgt_vocab_size]` and the cache needed by
    /// [`Transformer::backward`].
    pub fn forward(
        &self,
        src_ids: &[Vec<usize>],
        tgt_ids: &[Vec<usize>],
        masks: SequenceMask,
    ) -> Result<(Tensor, TransformerCache)> {
        let (src_batch, _) = batch_dims(src_ids)?;
        let (tgt_batch, _) = batch_dims(tgt_ids)?;
        if src_batch != tgt_batch {
            return Err(OrsinoError::shape(
                "Transformer",
                format!("target batch of {}", src_batch),
                &[tgt_batch],
            ));
        }

        let src_mask: AttentionMask = masks.make_src_mask(src_ids)?.into();
        let tgt_mask: AttentionMask = masks.make_tgt_mask(tgt_ids)?.into();

        let (memory, encode_cache) = self.encode(src_ids, &src_mask)?;
        let (hidden, decode_cache) = self.decode(tgt_ids, &memory, &src_mask, &tgt_mask)?;
        let (logits, fc_cache) = self.fc.forward(&hidden)?;

        let cache = TransformerCache {
            src_ids: src_ids.to_vec(),
            tgt_ids: tgt_ids.to_vec(),
            encode: encode_cache,
            decode: decode_cache,
            fc_cache,
        };
        Ok((logits, cache))
    }

    /// Backward pass from the gradient of the logits
    ///
    /// Clears every parameter gradient first, then fills them in: output
    /// projection, decoder stack, encoder stack (through the summed memory
    /// gradient) and both embedding tables. The positional encoding is
    /// constant and passes gradients through unchanged.
    pub fn backward(&mut self, grad_logits: &Tensor, cache: &TransformerCache) -> Result<()> {
        self.zero_grad();

        let grad_hidden = self.fc.backward(grad_logits, &cache.fc_cache)?;
        let grads = self.decoder.backward(&grad_hidden, &cache.decode.layers)?;
        let grad_tgt = self.dropout.backward(&grads.x, &cache.decode.dropout);
        self.decoder_embedding.backward(&grad_tgt, &cache.tgt_ids)?;

        let grad_src = self.encoder.backward(&grads.memory, &cache.encode.layers)?;
        let grad_src = self.dropout.backward(&grad_src, &cache.encode.dropout);
        self.encoder_embedding.backward(&grad_src, &cache.src_ids)?;
        Ok(())
    }

    /// Greedy decoding of a single source sequence
    ///
    /// Encodes `src_ids` once, then repeatedly decodes `[start] + produced`
    /// and appends the highest-scoring token at the last position, stopping
    /// after the end token or after `max_seq_length` tokens. Ties go to the
    /// lowest id. Dropout should be disabled (the default) for
    /// reproducible output.
    ///
    /// # Errors
    ///
    /// Fails if `src_ids` is empty or longer than `max_seq_length`, or if a
    /// token id is outside its vocabulary. The start, end and target pad ids
    /// are checked against the target vocabulary before anything runs.
    pub fn generate(&self, src_ids: &[usize], tokens: SpecialTokens) -> Result<Generation> {
        let vocab_size = self.config.tgt_vocab_size;
        for token in [tokens.start, tokens.end, tokens.tgt_pad] {
            if token >= vocab_size {
                return Err(OrsinoError::TokenOutOfRange { token, vocab_size });
            }
        }

        let max_len = self.config.max_seq_length;
        let masks = tokens.masks();
        let src = vec![src_ids.to_vec()];
        let src_mask: AttentionMask = masks.make_src_mask(&src)?.into();
        let (memory, _) = self.encode(&src, &src_mask)?;

        let mut produced = Vec::with_capacity(max_len);
        let mut finish = FinishReason::MaxLength;
        for step in 0..max_len {
            let mut tgt = Vec::with_capacity(produced.len() + 1);
            tgt.push(tokens.start);
            tgt.extend_from_slice(&produced);
            let tgt = vec![tgt];

            let tgt_mask: AttentionMask = masks.make_tgt_mask(&tgt)?.into();
            let (hidden, _) = self.decode(&tgt, &memory, &src_mask, &tgt_mask)?;

            // Only the last position's logits are needed.
            let embed_size = self.config.embed_size;
            let last = Tensor::new(
                hidden.data[hidden.data.len() - embed_size..].to_vec(),
                vec![1, embed_size],
            );
            let (logits, _) = self.fc.forward(&last)?;
            let next = argmax(&logits.data);
            debug!(step, token = next, "greedy step");

            produced.push(next);
            if next == tokens.end {
                finish = FinishReason::EndToken;
                break;
            }
        }

        if finish == FinishReason::MaxLength {
            warn!(max_seq_length = max_len, "generation stopped without an end token");
        }
        let steps = produced.len();
        produced.resize(max_len, tokens.tgt_pad);
        Ok(Generation {
            tokens: produced,
            finish,
            steps,
        })
    }

    /// [`Transformer::generate`] for every row, in parallel
    pub fn generate_batch(&self, src_ids: &[Vec<usize>], tokens: SpecialTokens) -> Result<Vec<Generation>> {
        src_ids
            .par_iter()
            .map(|src| self.generate(src, tokens))
            .collect()
    }
}

/// Index of the first maximum
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

impl Module for Transformer {
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
        self.encoder_embedding
            .visit_parameters(&join_path(prefix, "encoder_embedding"), f);
        self.decoder_embedding
            .visit_parameters(&join_path(prefix, "decoder_embedding"), f);
        self.encoder
            .visit_parameters(&join_path(prefix, "encoder_layers"), f);
        self.decoder
            .visit_parameters(&join_path(prefix, "decoder_layers"), f);
        self.fc.visit_parameters(&join_path(prefix, "fc"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
        self.encoder_embedding
            .visit_parameters_mut(&join_path(prefix, "encoder_embedding"), f);
        self.decoder_embedding
            .visit_parameters_mut(&join_path(prefix, "decoder_embedding"), f);
        self.encoder
            .visit_parameters_mut(&join_path(prefix, "encoder_layers"), f);
        self.decoder
            .visit_parameters_mut(&join_path(prefix, "decoder_layers"), f);
        self.fc.visit_parameters_mut(&join_path(prefix, "fc"), f);
    }

    fn set_training(&mut self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
        self.dropout.training = training;
    }
}

/// Encoder-side activations saved for the backward pass
#[derive(Clone, Debug)]
pub struct EncodeCache {
    pub dropout: DropoutCache,
    pub layers: Vec<EncoderLayerCache>,
}

/// Decoder-side activations saved for the backward pass
#[derive(Clone, Debug)]
pub struct DecodeCache {
    pub dropout: DropoutCache,
    pub layers: Vec<DecoderLayerCache>,
}

#[derive(Clone, Debug)]
pub struct TransformerCache {
    pub src_ids: Vec<Vec<usize>>,
    pub tgt_ids: Vec<Vec<usize>>,
    pub encode: EncodeCache,
    pub decode: DecodeCache,
    pub fc_cache: LinearCache,
}
