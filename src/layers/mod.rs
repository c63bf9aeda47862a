//! Neural Network Layers
//!
//! Every layer of the encoder-decoder model, each with an explicit forward
//! and backward pass.
//!
//! ## Layers
//!
//! - **linear**: Fully connected layer
//! - **layer_norm**: Layer normalization
//! - **activation**: ReLU (forward and backward)
//! - **dropout**: Inverted dropout, active only in training mode
//! - **embedding**: Token lookup table
//! - **positional**: Fixed sinusoidal position signal
//! - **attention**: Multi-head scaled dot-product attention
//! - **feed_forward**: Position-wise two-layer network
//! - **encoder** / **decoder**: Residual layers and their stacks
//!
//! ## Design Pattern
//!
//! Each trainable layer follows a consistent pattern:
//!
//! ```rust,ignore
//! pub struct Layer {
//!     pub weight: Parameter, // value and accumulated gradient
//! }
//!
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor) -> Result<(Tensor, LayerCache)> { }
//!     pub fn backward(&mut self, grad: &Tensor, cache: &LayerCache) -> Result<Tensor> { }
//! }
//!
//! impl Module for Layer { /* list parameters and children by name */ }
//! ```
//!
//! `forward` never mutates the layer. `backward` adds parameter gradients
//! into the layer's own [`Parameter`](crate::params::Parameter)s and returns
//! the gradient with respect to the input.

pub mod activation;
pub mod attention;
pub mod decoder;
pub mod dropout;
pub mod embedding;
pub mod encoder;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod positional;

pub use activation::{relu_backward, relu_forward};
pub use attention::{scaled_dot_product_attention, AttentionCache, AttentionGradients, MultiHeadAttention};
pub use decoder::{Decoder, DecoderGradients, DecoderLayer, DecoderLayerCache};
pub use dropout::{Dropout, DropoutCache};
pub use embedding::Embedding;
pub use encoder::{Encoder, EncoderLayer, EncoderLayerCache};
pub use feed_forward::{FeedForwardCache, PositionwiseFeedForward};
pub use layer_norm::{LayerNorm, LayerNormCache, LAYER_NORM_EPS};
pub use linear::{random_init, Linear, LinearCache};
pub use positional::PositionalEncoding;

use crate::error::{OrsinoError, Result};
use crate::tensor::Tensor;

/// Reject an upstream gradient whose shape differs from the forward output
pub(crate) fn check_grad_shape(op: &'static str, expected: &[usize], grad: &Tensor) -> Result<()> {
    if grad.shape == expected {
        Ok(())
    } else {
        Err(OrsinoError::shape(op, format!("{:?}", expected), &grad.shape))
    }
}
