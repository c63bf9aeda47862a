//! Weight Bridge
//!
//! Converts between this crate's dotted parameter paths (the *local*
//! dialect) and the names used by an independently written graph runtime
//! (the *remote* dialect).
//!
//! The remote runtime names parameters by scope and kind, with a counter per
//! kind inside each scope. The first instance has no suffix, later ones get
//! `.1`, `.2`, and so on:
//!
//! ```text
//! encoder_embedding.weight                 Embedding.E
//! decoder_embedding.weight                 Embedding.E.1
//! encoder_layers.1.self_attn.W_q.weight    encoder:MHA.Wq.1
//! encoder_layers.1.feed_forward.w_2.bias   encoder:Linear.b.3
//! decoder_layers.0.cross_attn.W_o.weight   decoder:MHA.Wo.1
//! decoder_layers.1.norm3.bias              decoder:Norm.B.5
//! fc.weight                                Linear.W
//! ```
//!
//! The mapping is declared in full. Every name on either side must be mapped
//! exactly once or explicitly marked absent, and any violation fails with a
//! list of every offending name. Transfers are checked completely, names and
//! element counts, before the first value is copied, so a failed transfer
//! leaves the destination untouched. Values are copied element by element;
//! nothing is reshaped or transposed.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::archive::NamedArrays;
use crate::error::{OrsinoError, Result};
use crate::model::TransformerConfig;
use crate::params::Module;

/// Direction of a transfer between the two dialects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

#[derive(Clone, Debug)]
pub struct WeightBridge {
    to_remote: BTreeMap<String, String>,
    to_local: BTreeMap<String, String>,
    /// Local names with no remote counterpart
    local_absent: BTreeSet<String>,
    /// Remote names with no local counterpart
    remote_absent: BTreeSet<String>,
}

/// Per-kind counter suffix
fn suffix(n: usize) -> String {
    if n == 0 {
        String::new()
    } else {
        format!(".{}", n)
    }
}

fn absent_set(names: &[&str], mapped: &BTreeMap<String, String>) -> Result<BTreeSet<String>> {
    let mut set = BTreeSet::new();
    for &name in names {
        if mapped.contains_key(name) || !set.insert(name.to_string()) {
            return Err(OrsinoError::DuplicateMapping(name.to_string()));
        }
    }
    Ok(set)
}

fn attention_pairs(local: &str, scope: &str, counter: usize) -> Vec<(String, String)> {
    ["q", "k", "v", "o"]
        .iter()
        .flat_map(|p| {
            [
                (
                    format!("{}.W_{}.weight", local, p),
                    format!("{}:MHA.W{}{}", scope, p, suffix(counter)),
                ),
                (
                    format!("{}.W_{}.bias", local, p),
                    format!("{}:MHA.b{}{}", scope, p, suffix(counter)),
                ),
            ]
        })
        .collect()
}

fn affine_pairs(local: &str, remote: &str, weight: &str, bias: &str, counter: usize) -> [(String, String); 2] {
    [
        (
            format!("{}.weight", local),
            format!("{}.{}{}", remote, weight, suffix(counter)),
        ),
        (
            format!("{}.bias", local),
            format!("{}.{}{}", remote, bias, suffix(counter)),
        ),
    ]
}

impl WeightBridge {
    /// Build a bridge from explicit `(local, remote)` pairs
    ///
    /// # Errors
    ///
    /// [`OrsinoError::DuplicateMapping`] if a name occurs twice on either
    /// side, or is both mapped and marked absent.
    pub fn new(pairs: Vec<(String, String)>, local_absent: &[&str], remote_absent: &[&str]) -> Result<Self> {
        let mut to_remote = BTreeMap::new();
        let mut to_local = BTreeMap::new();
        for (local, remote) in pairs {
            if to_local.insert(remote.clone(), local.clone()).is_some() {
                return Err(OrsinoError::DuplicateMapping(remote));
            }
            if to_remote.insert(local.clone(), remote).is_some() {
                return Err(OrsinoError::DuplicateMapping(local));
            }
        }

        Ok(Self {
            local_absent: absent_set(local_absent, &to_remote)?,
            remote_absent: absent_set(remote_absent, &to_local)?,
            to_remote,
            to_local,
        })
    }

    /// The declared mapping for a model of the given geometry
    pub fn for_config(config: &TransformerConfig) -> Result<Self> {
        let mut pairs = vec![
            ("encoder_embedding.weight".to_string(), "Embedding.E".to_string()),
            ("decoder_embedding.weight".to_string(), "Embedding.E.1".to_string()),
        ];

        for i in 0..config.num_layers {
            let layer = format!("encoder_layers.{}", i);
            pairs.extend(attention_pairs(&format!("{}.self_attn", layer), "encoder", i));
            for (j, w) in ["w_1", "w_2"].iter().enumerate() {
                let local = format!("{}.feed_forward.{}", layer, w);
                pairs.extend(affine_pairs(&local, "encoder:Linear", "W", "b", 2 * i + j));
            }
            for (j, norm) in ["norm1", "norm2"].iter().enumerate() {
                let local = format!("{}.{}", layer, norm);
                pairs.extend(affine_pairs(&local, "encoder:Norm", "A", "B", 2 * i + j));
            }
        }

        for i in 0..config.num_layers {
            let layer = format!("decoder_layers.{}", i);
            pairs.extend(attention_pairs(&format!("{}.self_attn", layer), "decoder", 2 * i));
            pairs.extend(attention_pairs(&format!("{}.cross_attn", layer), "decoder", 2 * i + 1));
            for (j, w) in ["w_1", "w_2"].iter().enumerate() {
                let local = format!("{}.feed_forward.{}", layer, w);
                pairs.extend(affine_pairs(&local, "decoder:Linear", "W", "b", 2 * i + j));
            }
            for (j, norm) in ["norm1", "norm2", "norm3"].iter().enumerate() {
                let local = format!("{}.{}", layer, norm);
                pairs.extend(affine_pairs(&local, "decoder:Norm", "A", "B", 3 * i + j));
            }
        }

        pairs.extend(affine_pairs("fc", "Linear", "W", "b", 0));

        // The sinusoidal table is rebuilt on load, never stored.
        Self::new(pairs, &["positional_encoding.pe"], &[])
    }

    pub fn to_remote(&self, local: &str) -> Option<&str> {
        self.to_remote.get(local).map(String::as_str)
    }

    pub fn to_local(&self, remote: &str) -> Option<&str> {
        self.to_local.get(remote).map(String::as_str)
    }

    /// Number of mapped pairs
    pub fn len(&self) -> usize {
        self.to_remote.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_remote.is_empty()
    }

    /// Check both name sets against the mapping
    ///
    /// # Errors
    ///
    /// [`OrsinoError::BridgeMismatch`] listing names present on a side but
    /// neither mapped nor marked absent (`unmapped_*`), and mapped names the
    /// side does not provide (`missing_*`).
    pub fn validate<'a, L, R>(&self, local_names: L, remote_names: R) -> Result<()>
    where
        L: IntoIterator<Item = &'a str>,
        R: IntoIterator<Item = &'a str>,
    {
        let local: BTreeSet<&str> = local_names.into_iter().collect();
        let remote: BTreeSet<&str> = remote_names.into_iter().collect();

        let unmapped = |names: &BTreeSet<&str>, mapped: &BTreeMap<String, String>, absent: &BTreeSet<String>| {
            names
                .iter()
                .filter(|n| !mapped.contains_key(**n) && !absent.contains(**n))
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
        };
        let missing = |names: &BTreeSet<&str>, mapped: &BTreeMap<String, String>| {
            mapped
                .keys()
                .filter(|n| !names.contains(n.as_str()))
                .cloned()
                .collect::<Vec<_>>()
        };

        let unmapped_local = unmapped(&local, &self.to_remote, &self.local_absent);
        let unmapped_remote = unmapped(&remote, &self.to_local, &self.remote_absent);
        let missing_local = missing(&local, &self.to_remote);
        let missing_remote = missing(&remote, &self.to_local);

        if unmapped_local.is_empty()
            && unmapped_remote.is_empty()
            && missing_local.is_empty()
            && missing_remote.is_empty()
        {
            Ok(())
        } else {
            Err(OrsinoError::BridgeMismatch {
                unmapped_local,
                unmapped_remote,
                missing_local,
                missing_remote,
            })
        }
    }

    fn mapping(&self, direction: Direction) -> &BTreeMap<String, String> {
        match direction {
            Direction::LocalToRemote => &self.to_remote,
            Direction::RemoteToLocal => &self.to_local,
        }
    }

    fn validate_directed(&self, source: &NamedArrays, dest_names: &[&str], direction: Direction) -> Result<()> {
        match direction {
            Direction::LocalToRemote => self.validate(source.names(), dest_names.iter().copied()),
            Direction::RemoteToLocal => self.validate(dest_names.iter().copied(), source.names()),
        }
    }

    /// Copy every mapped array from `source` into the existing arrays of
    /// `dest`, returning the number of arrays written
    ///
    /// Destination shapes are kept; only element counts must agree. Applying
    /// the same transfer twice leaves `dest` as after the first.
    pub fn transfer(&self, source: &NamedArrays, direction: Direction, dest: &mut NamedArrays) -> Result<usize> {
        let dest_names: Vec<&str> = dest.names().collect();
        self.validate_directed(source, &dest_names, direction)?;

        let mapping = self.mapping(direction);
        for (from, to) in mapping {
            let (Some(src), Some(dst)) = (source.get(from), dest.get(to)) else {
                continue;
            };
            if src.numel() != dst.numel() {
                return Err(OrsinoError::ElementCount {
                    name: to.clone(),
                    expected: dst.numel(),
                    actual: src.numel(),
                });
            }
        }

        let mut copied = 0;
        for (from, to) in mapping {
            if let (Some(src), Some(dst)) = (source.get(from), dest.get_mut(to)) {
                dst.data.copy_from_slice(&src.data);
                debug!(from = %from, to = %to, elements = src.numel(), "copied array");
                copied += 1;
            }
        }
        info!(?direction, arrays = copied, "weight transfer complete");
        Ok(copied)
    }

    /// Rename every array of `source` into the other dialect
    ///
    /// Shapes are carried over unchanged. Names marked absent on the source
    /// side are dropped.
    pub fn convert(&self, source: &NamedArrays, direction: Direction) -> Result<NamedArrays> {
        let mapping = self.mapping(direction);
        let targets: Vec<&str> = mapping.values().map(String::as_str).collect();
        self.validate_directed(source, &targets, direction)?;

        let mut out = NamedArrays::new();
        for (from, to) in mapping {
            if let Some(array) = source.get(from) {
                out.insert(to.clone(), array.clone());
            }
        }
        info!(?direction, arrays = out.len(), "converted archive");
        Ok(out)
    }

    /// Load a remote-dialect archive into a module, all or nothing
    pub fn import_into<M: Module>(&self, remote: &NamedArrays, module: &mut M) -> Result<usize> {
        let mut local = module.state_dict();
        let copied = self.transfer(remote, Direction::RemoteToLocal, &mut local)?;
        module.load_state_dict(&local)?;
        Ok(copied)
    }

    /// Export a module's parameters in the remote dialect
    pub fn export_from<M: Module>(&self, module: &M) -> Result<NamedArrays> {
        self.convert(&module.state_dict(), Direction::LocalToRemote)
    }

    /// `(local, remote)` pairs ordered by local name
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.to_remote
            .iter()
            .map(|(l, r)| (l.as_str(), r.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transformer;
    use crate::tensor::Tensor;
    use crate::testing::{self, FC_BIAS_ALTERNATING};
    use proptest::prelude::*;

    fn two_layer() -> TransformerConfig {
        TransformerConfig {
            num_layers: 2,
            ..testing::config()
        }
    }

    #[test]
    fn test_declared_names() {
        let bridge = WeightBridge::for_config(&two_layer()).unwrap();
        let expected = [
            ("encoder_embedding.weight", "Embedding.E"),
            ("decoder_embedding.weight", "Embedding.E.1"),
            ("encoder_layers.0.self_attn.W_q.weight", "encoder:MHA.Wq"),
            ("encoder_layers.1.self_attn.W_o.bias", "encoder:MHA.bo.1"),
            ("encoder_layers.1.feed_forward.w_1.weight", "encoder:Linear.W.2"),
            ("encoder_layers.1.feed_forward.w_2.bias", "encoder:Linear.b.3"),
            ("encoder_layers.0.norm2.weight", "encoder:Norm.A.1"),
            ("encoder_layers.1.norm1.bias", "encoder:Norm.B.2"),
            ("decoder_layers.0.self_attn.W_k.weight", "decoder:MHA.Wk"),
            ("decoder_layers.0.cross_attn.W_q.weight", "decoder:MHA.Wq.1"),
            ("decoder_layers.1.self_attn.W_v.bias", "decoder:MHA.bv.2"),
            ("decoder_layers.1.cross_attn.W_o.weight", "decoder:MHA.Wo.3"),
            ("decoder_layers.1.feed_forward.w_2.weight", "decoder:Linear.W.3"),
            ("decoder_layers.0.norm3.weight", "decoder:Norm.A.2"),
            ("decoder_layers.1.norm3.bias", "decoder:Norm.B.5"),
            ("fc.weight", "Linear.W"),
            ("fc.bias", "Linear.b"),
        ];
        for (local, remote) in expected {
            assert_eq!(bridge.to_remote(local), Some(remote), "{}", local);
            assert_eq!(bridge.to_local(remote), Some(local), "{}", remote);
        }
        assert_eq!(bridge.to_remote("positional_encoding.pe"), None);
    }

    #[test]
    fn test_mapping_covers_every_parameter() {
        let config = two_layer();
        let model = Transformer::new(config.clone()).unwrap();
        let bridge = WeightBridge::for_config(&config).unwrap();
        assert_eq!(bridge.len(), model.named_parameters().len());

        let names = model.parameter_names();
        let remote: Vec<&str> = bridge.pairs().map(|(_, r)| r).collect();
        bridge
            .validate(names.iter().map(String::as_str), remote)
            .unwrap();
    }

    #[test]
    fn test_duplicates_are_rejected() {
        let pairs = vec![
            ("a".to_string(), "X".to_string()),
            ("b".to_string(), "X".to_string()),
        ];
        assert!(matches!(
            WeightBridge::new(pairs, &[], &[]),
            Err(OrsinoError::DuplicateMapping(name)) if name == "X"
        ));

        let pairs = vec![("a".to_string(), "X".to_string())];
        assert!(matches!(
            WeightBridge::new(pairs, &["a"], &[]),
            Err(OrsinoError::DuplicateMapping(name)) if name == "a"
        ));
    }

    #[test]
    fn test_mismatch_enumerates_every_name() {
        let pairs = vec![
            ("a".to_string(), "A".to_string()),
            ("b".to_string(), "B".to_string()),
        ];
        let bridge = WeightBridge::new(pairs, &["pe"], &[]).unwrap();
        bridge.validate(["a", "b", "pe"], ["A", "B"]).unwrap();

        match bridge.validate(["a", "stray", "pe"], ["A", "B", "C", "D"]) {
            Err(OrsinoError::BridgeMismatch {
                unmapped_local,
                unmapped_remote,
                missing_local,
                missing_remote,
            }) => {
                assert_eq!(unmapped_local, vec!["stray"]);
                assert_eq!(unmapped_remote, vec!["C", "D"]);
                assert_eq!(missing_local, vec!["b"]);
                assert!(missing_remote.is_empty());
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_transfer_copies_nothing() {
        let pairs = vec![
            ("a".to_string(), "A".to_string()),
            ("b".to_string(), "B".to_string()),
        ];
        let bridge = WeightBridge::new(pairs, &[], &[]).unwrap();

        let mut source = NamedArrays::new();
        source.insert_tensor("a", &Tensor::new(vec![1.0, 2.0], vec![2]));
        source.insert_tensor("b", &Tensor::new(vec![3.0, 4.0, 5.0], vec![3]));

        let mut dest = NamedArrays::new();
        dest.insert_tensor("A", &Tensor::zeros(vec![2]));
        dest.insert_tensor("B", &Tensor::zeros(vec![2]));
        let before = dest.clone();

        assert!(matches!(
            bridge.transfer(&source, Direction::LocalToRemote, &mut dest),
            Err(OrsinoError::ElementCount { expected: 2, actual: 3, .. })
        ));
        assert_eq!(dest, before);
    }

    #[test]
    fn test_transfer_keeps_destination_shape() {
        let bridge = WeightBridge::new(vec![("w".to_string(), "W".to_string())], &[], &[]).unwrap();
        let mut source = NamedArrays::new();
        source.insert_tensor("W", &Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![4]));
        let mut dest = NamedArrays::new();
        dest.insert_tensor("w", &Tensor::zeros(vec![2, 2]));

        assert_eq!(bridge.transfer(&source, Direction::RemoteToLocal, &mut dest).unwrap(), 1);
        let w = dest.get("w").unwrap();
        assert_eq!(w.shape, vec![2, 2]);
        assert_eq!(w.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_round_trip_through_remote_dialect() {
        let source = testing::transformer(&FC_BIAS_ALTERNATING);
        let bridge = WeightBridge::for_config(&source.config).unwrap();
        let remote = bridge.export_from(&source).unwrap();
        assert_eq!(remote.get("Linear.b").unwrap().data, FC_BIAS_ALTERNATING.to_vec());

        let mut target = Transformer::new(TransformerConfig {
            seed: 99,
            ..testing::config()
        })
        .unwrap();
        bridge.import_into(&remote, &mut target).unwrap();
        assert_eq!(target.state_dict(), source.state_dict());

        let tokens = crate::model::SpecialTokens { start: 8, end: 3, src_pad: 0, tgt_pad: 0 };
        let generation = target.generate(&[1, 2, 3, 0, 0], tokens).unwrap();
        assert_eq!(generation.tokens, vec![5, 3, 0, 0, 0]);
    }

    #[test]
    fn test_import_rejects_incomplete_archive() {
        let source = testing::transformer(&FC_BIAS_ALTERNATING);
        let bridge = WeightBridge::for_config(&source.config).unwrap();
        let mut remote = bridge.export_from(&source).unwrap();
        remote.insert_tensor("decoder:Norm.A.9", &Tensor::zeros(vec![4]));

        let mut target = Transformer::new(testing::config()).unwrap();
        let before = target.state_dict();
        match bridge.import_into(&remote, &mut target) {
            Err(OrsinoError::BridgeMismatch { unmapped_remote, .. }) => {
                assert_eq!(unmapped_remote, vec!["decoder:Norm.A.9"]);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert_eq!(target.state_dict(), before);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_transfer_is_idempotent(seed in 0u64..1000) {
            let config = TransformerConfig { seed, ..testing::config() };
            let bridge = WeightBridge::for_config(&config).unwrap();
            let source = Transformer::new(config).unwrap().state_dict();

            let mut dest = bridge.convert(&source, Direction::LocalToRemote).unwrap();
            let names: Vec<String> = dest.names().map(String::from).collect();
            for name in &names {
                if let Some(array) = dest.get_mut(name) {
                    array.data.fill(0.0);
                }
            }
            bridge.transfer(&source, Direction::LocalToRemote, &mut dest).unwrap();
            let once = dest.clone();
            bridge.transfer(&source, Direction::LocalToRemote, &mut dest).unwrap();
            prop_assert_eq!(dest, once);
        }
    }
}
