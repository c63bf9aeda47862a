//! Error types for Orsino.

use thiserror::Error;

/// Result type alias for Orsino operations.
pub type Result<T> = std::result::Result<T, OrsinoError>;

/// Errors that can occur while building, running, or porting a model.
#[derive(Error, Debug)]
pub enum OrsinoError {
    /// An operation received a tensor whose shape it cannot accept.
    #[error("shape mismatch in {op}: expected {expected}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    /// Model hyperparameters violate a construction-time invariant.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A sequence is longer than the positional table.
    #[error("sequence length {len} exceeds max_seq_length {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// A token id does not index into the vocabulary.
    #[error("token id {token} out of range for vocab_size {vocab_size}")]
    TokenOutOfRange { token: usize, vocab_size: usize },

    /// A mask cannot be broadcast against the attention scores.
    #[error("mask shape: {0}")]
    MaskShape(String),

    /// No parameter exists at the given path.
    #[error("unknown parameter: {0}")]
    UnknownParameter(String),

    /// A parameter path is syntactically malformed.
    #[error("invalid parameter path: {0:?}")]
    InvalidParameterPath(String),

    /// Names on either side of a weight transfer are not covered by the mapping.
    #[error(
        "weight name mismatch: unmapped local {unmapped_local:?}, unmapped remote {unmapped_remote:?}, \
         missing local {missing_local:?}, missing remote {missing_remote:?}"
    )]
    BridgeMismatch {
        unmapped_local: Vec<String>,
        unmapped_remote: Vec<String>,
        missing_local: Vec<String>,
        missing_remote: Vec<String>,
    },

    /// A name appears more than once in a mapping.
    #[error("duplicate mapping for {0}")]
    DuplicateMapping(String),

    /// Source and destination arrays hold a different number of elements.
    #[error("element count mismatch for {name}: expected {expected}, got {actual}")]
    ElementCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl OrsinoError {
    pub(crate) fn shape(op: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        OrsinoError::ShapeMismatch {
            op,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }
}
