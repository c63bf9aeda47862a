//! Named-Array Archive
//!
//! A flat, order-independent mapping from dotted path strings to numeric
//! arrays. This is the interchange format for weights: it knows nothing about
//! which runtime produced it, so the same store holds either naming dialect.
//!
//! Names are kept in a `BTreeMap`, so iteration and the JSON encoding are
//! sorted and deterministic.
//!
//! ## On-Disk Format
//!
//! ```text
//! {
//!   "arrays": {
//!     "fc.bias":   { "shape": [10],    "data": [0.13, -0.16, ...] },
//!     "fc.weight": { "shape": [10, 4], "data": [...] }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OrsinoError, Result};
use crate::tensor::Tensor;

/// One array in the archive
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StoredArray {
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Rebuild a tensor, checking that the stored shape covers the data
    pub fn to_tensor(&self) -> Result<Tensor> {
        Tensor::try_new(self.data.clone(), self.shape.clone())
    }
}

impl From<&Tensor> for StoredArray {
    fn from(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape.clone(),
            data: tensor.data.clone(),
        }
    }
}

/// Flat mapping from parameter path to array
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedArrays {
    arrays: BTreeMap<String, StoredArray>,
}

impl NamedArrays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, array: StoredArray) -> Option<StoredArray> {
        self.arrays.insert(name.into(), array)
    }

    pub fn insert_tensor(&mut self, name: impl Into<String>, tensor: &Tensor) {
        self.arrays.insert(name.into(), StoredArray::from(tensor));
    }

    pub fn get(&self, name: &str) -> Option<&StoredArray> {
        self.arrays.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut StoredArray> {
        self.arrays.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    /// Names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StoredArray)> {
        self.arrays.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Total number of stored scalars
    pub fn total_elements(&self) -> usize {
        self.arrays.values().map(StoredArray::numel).sum()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let archive: NamedArrays = serde_json::from_str(json)?;
        for (name, array) in &archive.arrays {
            let expected: usize = array.shape.iter().product();
            if expected != array.numel() {
                return Err(OrsinoError::ElementCount {
                    name: name.clone(),
                    expected,
                    actual: array.numel(),
                });
            }
        }
        Ok(archive)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?)?;
        info!(
            path = %path.display(),
            arrays = self.len(),
            elements = self.total_elements(),
            "saved archive"
        );
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let archive = Self::from_json_str(&fs::read_to_string(path)?)?;
        info!(path = %path.display(), arrays = archive.len(), "loaded archive");
        Ok(archive)
    }
}
