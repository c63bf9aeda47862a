//! Attention Masks
//!
//! A [`Mask`] is a boolean `[batch, query_len, key_len]` grid where `true`
//! means "may attend". Either leading axis may be 1, in which case it
//! broadcasts; a padding mask is typically `[batch, 1, key_len]`.
//!
//! [`SequenceMask`] derives the two masks a seq2seq model needs from
//! right-padded token ids:
//!
//! ```text
//! ids = [1, 2, 3, 0, 0], pad = 0
//!
//! src mask [1, 5]      tgt mask [5, 5]  (padding AND causal)
//! 1 1 1 0 0            1 0 0 0 0
//!                      1 1 0 0 0
//!                      1 1 1 0 0
//!                      1 1 1 0 0
//!                      1 1 1 0 0
//! ```
//!
//! Attention also accepts a float bias instead of a boolean mask. The two are
//! kept as separate variants of [`AttentionMask`] and handled on separate
//! code paths; a float tensor is never read as a boolean mask.

use crate::error::{OrsinoError, Result};
use crate::tensor::Tensor;

/// Boolean attention mask, `true` = attend
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    data: Vec<bool>,
    shape: [usize; 3],
}

impl Mask {
    pub fn new(data: Vec<bool>, batch: usize, query_len: usize, key_len: usize) -> Result<Self> {
        if data.len() != batch * query_len * key_len {
            return Err(OrsinoError::MaskShape(format!(
                "{} values cannot fill [{}, {}, {}]",
                data.len(),
                batch,
                query_len,
                key_len
            )));
        }
        Ok(Self {
            data,
            shape: [batch, query_len, key_len],
        })
    }

    pub fn from_fn(
        batch: usize,
        query_len: usize,
        key_len: usize,
        f: impl Fn(usize, usize, usize) -> bool,
    ) -> Self {
        let mut data = Vec::with_capacity(batch * query_len * key_len);
        for b in 0..batch {
            for i in 0..query_len {
                for j in 0..key_len {
                    data.push(f(b, i, j));
                }
            }
        }
        Self {
            data,
            shape: [batch, query_len, key_len],
        }
    }

    /// Mask that allows every position
    pub fn allow_all(batch: usize, query_len: usize, key_len: usize) -> Self {
        Self::from_fn(batch, query_len, key_len, |_, _, _| true)
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Look up `[b, i, j]`, broadcasting size-1 leading axes
    pub fn get(&self, b: usize, i: usize, j: usize) -> bool {
        let [mb, mq, k] = self.shape;
        let b = if mb == 1 { 0 } else { b };
        let i = if mq == 1 { 0 } else { i };
        self.data[(b * mq + i) * k + j]
    }

    /// Expand to a full `[batch, query_len, key_len]` grid of 0/1 values
    pub fn to_tensor(&self, batch: usize, query_len: usize) -> Tensor {
        let k = self.shape[2];
        let mut data = Vec::with_capacity(batch * query_len * k);
        for b in 0..batch {
            for i in 0..query_len {
                for j in 0..k {
                    data.push(if self.get(b, i, j) { 1.0 } else { 0.0 });
                }
            }
        }
        Tensor::new(data, vec![batch, query_len, k])
    }

    fn check(&self, batch: usize, query_len: usize, key_len: usize) -> Result<()> {
        check_broadcast(self.shape, batch, query_len, key_len)
    }
}

fn check_broadcast(shape: [usize; 3], batch: usize, query_len: usize, key_len: usize) -> Result<()> {
    let [mb, mq, k] = shape;
    let ok = (mb == batch || mb == 1) && (mq == query_len || mq == 1) && k == key_len;
    if ok {
        Ok(())
    } else {
        Err(OrsinoError::MaskShape(format!(
            "mask {:?} does not broadcast to scores [{}, {}, {}]",
            shape, batch, query_len, key_len
        )))
    }
}

/// What attention may be given to restrict or bias its scores
#[derive(Clone, Debug)]
pub enum AttentionMask {
    /// Disallowed positions get a score of `-inf`
    Boolean(Mask),
    /// Float `[batch|1, query|1, key]` added to the scaled scores
    Additive(Tensor),
}

impl AttentionMask {
    /// Verify the mask broadcasts against `[batch, query_len, key_len]`
    pub fn check(&self, batch: usize, query_len: usize, key_len: usize) -> Result<()> {
        match self {
            AttentionMask::Boolean(mask) => mask.check(batch, query_len, key_len),
            AttentionMask::Additive(bias) => {
                if bias.shape.len() != 3 {
                    return Err(OrsinoError::MaskShape(format!(
                        "additive mask must be rank 3, got {:?}",
                        bias.shape
                    )));
                }
                check_broadcast(
                    [bias.shape[0], bias.shape[1], bias.shape[2]],
                    batch,
                    query_len,
                    key_len,
                )
            }
        }
    }

    /// Apply to one score, given its `[b, i, j]` coordinates
    pub(crate) fn apply(&self, score: f32, b: usize, i: usize, j: usize) -> f32 {
        match self {
            AttentionMask::Boolean(mask) => {
                if mask.get(b, i, j) {
                    score
                } else {
                    f32::NEG_INFINITY
                }
            }
            AttentionMask::Additive(bias) => {
                let b = if bias.shape[0] == 1 { 0 } else { b };
                let i = if bias.shape[1] == 1 { 0 } else { i };
                score + bias.data[(b * bias.shape[1] + i) * bias.shape[2] + j]
            }
        }
    }
}

impl From<Mask> for AttentionMask {
    fn from(mask: Mask) -> Self {
        AttentionMask::Boolean(mask)
    }
}

/// Shape of a batch of equal-length id rows
pub fn batch_dims(ids: &[Vec<usize>]) -> Result<(usize, usize)> {
    let seq_len = ids.first().map(Vec::len).unwrap_or(0);
    if ids.is_empty() || seq_len == 0 || ids.iter().any(|row| row.len() != seq_len) {
        let lens: Vec<usize> = ids.iter().map(Vec::len).collect();
        return Err(OrsinoError::shape(
            "token ids",
            "a non-empty batch of equal-length, non-empty rows",
            &lens,
        ));
    }
    Ok((ids.len(), seq_len))
}

/// Builds padding and causal masks from token ids
///
/// Source and target vocabularies may reserve different padding ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SequenceMask {
    pub src_pad: usize,
    pub tgt_pad: usize,
}

impl SequenceMask {
    pub fn new(src_pad: usize, tgt_pad: usize) -> Self {
        Self { src_pad, tgt_pad }
    }

    /// `[batch, 1, seq]`: true where the source id is not `src_pad`
    pub fn make_src_mask(&self, ids: &[Vec<usize>]) -> Result<Mask> {
        let (batch, seq_len) = batch_dims(ids)?;
        Ok(Mask::from_fn(batch, 1, seq_len, |b, _, j| ids[b][j] != self.src_pad))
    }

    /// `[batch, seq, seq]`: key `j` is visible from query `i` when it is not
    /// `tgt_pad` and `j <= i`
    pub fn make_tgt_mask(&self, ids: &[Vec<usize>]) -> Result<Mask> {
        let (batch, seq_len) = batch_dims(ids)?;
        Ok(Mask::from_fn(batch, seq_len, seq_len, |b, i, j| {
            ids[b][j] != self.tgt_pad && j <= i
        }))
    }
}
