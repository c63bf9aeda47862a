//! Orsino: An Encoder-Decoder Transformer from Scratch
//!
//! A sequence-to-sequence transformer built from primitive layers, with an
//! explicit backward pass for every layer and a declared bridge for porting
//! weights to and from an independently written graph runtime. Named after
//! the duke of *Twelfth Night*, who spends the play translating between what
//! is said and what is meant.
//!
//! # Modules
//!
//! - [`tensor`] - Dense `f32` tensors with parallel matrix multiply
//! - [`layers`] - Linear, LayerNorm, attention, feed-forward, encoder and
//!   decoder layers, each with forward and backward passes
//! - [`mask`] - Boolean and additive attention masks, padding and causal masks
//! - [`model`] - The full [`Transformer`], its configuration and greedy decoding
//! - [`params`] - Named parameters and the [`Module`] visitor
//! - [`archive`] - Named-array weight archives
//! - [`bridge`] - Name mapping between the two weight dialects
//! - [`gradcheck`] - Finite-difference gradient checking
//!
//! # Example
//!
//! ```rust,no_run
//! use orsino::{NamedArrays, SpecialTokens, Transformer, TransformerConfig, WeightBridge};
//!
//! let config = TransformerConfig::tiny(10, 10);
//! let mut model = Transformer::new(config.clone())?;
//!
//! // Load weights exported by the graph runtime
//! let bridge = WeightBridge::for_config(&config)?;
//! let archive = NamedArrays::load_json("weights.json")?;
//! bridge.import_into(&archive, &mut model)?;
//!
//! let tokens = SpecialTokens { start: 8, end: 9, src_pad: 0, tgt_pad: 0 };
//! let generation = model.generate(&[1, 2, 3, 0, 0], tokens)?;
//! println!("{:?} ({:?})", generation.tokens, generation.finish);
//! # Ok::<(), orsino::OrsinoError>(())
//! ```

pub mod archive;
pub mod bridge;
pub mod error;
pub mod gradcheck;
pub mod layers;
pub mod mask;
pub mod model;
pub mod params;
pub mod tensor;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use archive::{NamedArrays, StoredArray};
pub use bridge::{Direction, WeightBridge};
pub use error::{OrsinoError, Result};
pub use mask::{AttentionMask, Mask, SequenceMask};
pub use model::{FinishReason, Generation, SpecialTokens, Transformer, TransformerCache, TransformerConfig};
pub use params::{Module, Parameter};
pub use tensor::Tensor;
