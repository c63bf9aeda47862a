//! Parameters and the Module Visitor
//!
//! Every layer owns its [`Parameter`]s directly and exposes them through the
//! [`Module`] trait. A module reports its parameters by calling a visitor
//! once per parameter, in declaration order, then recursing into children
//! with an extended prefix:
//!
//! ```text
//! Transformer
//! ├── encoder_embedding.weight
//! ├── encoder_layers.0
//! │   ├── self_attn.W_q.weight
//! │   ├── self_attn.W_q.bias
//! │   └── ...
//! └── fc.bias
//! ```
//!
//! The resulting dotted paths are the stable contract for weight interchange
//! (see [`crate::bridge`]). Everything else here (enumeration, counting,
//! zeroing gradients, overrides, state dicts) is built on the two visitor
//! methods, so a layer only has to list its own parameters and children.

use std::collections::BTreeSet;

use crate::archive::NamedArrays;
use crate::error::{OrsinoError, Result};
use crate::tensor::Tensor;

/// A learnable tensor and its accumulated gradient
///
/// `grad` always has the same shape as `value`. Backward passes add into it;
/// callers clear it with [`Module::zero_grad`] before a new pass.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub value: Tensor,
    pub grad: Tensor,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self { value, grad }
    }

    pub fn shape(&self) -> &[usize] {
        &self.value.shape
    }

    pub fn numel(&self) -> usize {
        self.value.numel()
    }

    pub fn accumulate(&mut self, grad: &Tensor) {
        self.grad.add_assign(grad);
    }

    pub fn zero_grad(&mut self) {
        self.grad.data.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Join a module prefix and a child name with a dot
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Check that a path is a non-empty sequence of `[A-Za-z0-9_]+` segments
/// separated by single dots.
pub fn validate_path(path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(OrsinoError::InvalidParameterPath(path.to_string()))
    }
}

/// A composite of named parameters
pub trait Module {
    /// Call `f` with the full path and value of every parameter, in
    /// declaration order.
    fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter));

    /// Mutable counterpart of [`Module::visit_parameters`]; must visit the
    /// same paths in the same order.
    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter));

    /// Toggle training-only behavior such as dropout.
    fn set_training(&mut self, _training: bool) {}

    /// Ordered `(path, parameter)` pairs
    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        let mut out = Vec::new();
        self.visit_parameters("", &mut |name, p| out.push((name.to_string(), p)));
        out
    }

    fn parameter_names(&self) -> Vec<String> {
        self.named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }

    fn parameter(&self, path: &str) -> Option<&Parameter> {
        self.named_parameters()
            .into_iter()
            .find(|(name, _)| name == path)
            .map(|(_, p)| p)
    }

    /// Total number of learnable scalars
    fn parameter_count(&self) -> usize {
        let mut total = 0;
        self.visit_parameters("", &mut |_, p| total += p.numel());
        total
    }

    fn zero_grad(&mut self) {
        self.visit_parameters_mut("", &mut |_, p| p.zero_grad());
    }

    /// Replace one parameter's value
    ///
    /// The path is validated and the new value must have exactly the
    /// parameter's shape. The gradient is left untouched.
    fn set_parameter(&mut self, path: &str, value: Tensor) -> Result<()> {
        validate_path(path)?;
        let mut pending = Some(value);
        let mut outcome = Err(OrsinoError::UnknownParameter(path.to_string()));
        self.visit_parameters_mut("", &mut |name, p| {
            if name != path {
                return;
            }
            if let Some(value) = pending.take() {
                outcome = if value.shape == p.value.shape {
                    p.value = value;
                    Ok(())
                } else {
                    Err(OrsinoError::shape(
                        "set_parameter",
                        format!("{:?} for {}", p.value.shape, path),
                        &value.shape,
                    ))
                };
            }
        });
        outcome
    }

    /// Snapshot every parameter value into an archive
    fn state_dict(&self) -> NamedArrays {
        let mut archive = NamedArrays::new();
        self.visit_parameters("", &mut |name, p| archive.insert_tensor(name, &p.value));
        archive
    }

    /// Load values from an archive whose names match this module exactly
    ///
    /// All names and element counts are checked before anything is written.
    /// Values are copied element-wise and each parameter keeps its own shape.
    fn load_state_dict(&mut self, archive: &NamedArrays) -> Result<()> {
        let local: BTreeSet<String> = self.parameter_names().into_iter().collect();
        let stored: BTreeSet<String> = archive.names().map(str::to_string).collect();
        if local != stored {
            return Err(OrsinoError::BridgeMismatch {
                unmapped_local: Vec::new(),
                unmapped_remote: stored.difference(&local).cloned().collect(),
                missing_local: Vec::new(),
                missing_remote: local.difference(&stored).cloned().collect(),
            });
        }

        for (name, p) in self.named_parameters() {
            if let Some(array) = archive.get(&name) {
                if array.numel() != p.numel() {
                    return Err(OrsinoError::ElementCount {
                        name,
                        expected: p.numel(),
                        actual: array.numel(),
                    });
                }
            }
        }

        self.visit_parameters_mut("", &mut |name, p| {
            if let Some(array) = archive.get(name) {
                p.value.data.copy_from_slice(&array.data);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        first: Parameter,
        second: Parameter,
    }

    impl Module for Pair {
        fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
            f(&join_path(prefix, "first"), &self.first);
            f(&join_path(prefix, "second"), &self.second);
        }

        fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
            f(&join_path(prefix, "first"), &mut self.first);
            f(&join_path(prefix, "second"), &mut self.second);
        }
    }

    struct Outer {
        inner: Vec<Pair>,
    }

    impl Module for Outer {
        fn visit_parameters<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
            for (i, pair) in self.inner.iter().enumerate() {
                pair.visit_parameters(&join_path(&join_path(prefix, "inner"), &i.to_string()), f);
            }
        }

        fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut Parameter)) {
            for (i, pair) in self.inner.iter_mut().enumerate() {
                pair.visit_parameters_mut(&join_path(&join_path(prefix, "inner"), &i.to_string()), f);
            }
        }
    }

    fn outer() -> Outer {
        let pair = || Pair {
            first: Parameter::new(Tensor::zeros(vec![2, 3])),
            second: Parameter::new(Tensor::zeros(vec![3])),
        };
        Outer {
            inner: vec![pair(), pair()],
        }
    }

    #[test]
    fn test_named_parameters_in_declaration_order() {
        let names = outer().parameter_names();
        assert_eq!(
            names,
            vec!["inner.0.first", "inner.0.second", "inner.1.first", "inner.1.second"]
        );
        assert_eq!(outer().parameter_count(), 18);
    }

    #[test]
    fn test_set_parameter_checks_path_and_shape() {
        let mut m = outer();
        m.set_parameter("inner.1.second", Tensor::new(vec![1.0, 2.0, 3.0], vec![3]))
            .unwrap();
        assert_eq!(m.inner[1].second.value.data, vec![1.0, 2.0, 3.0]);

        assert!(matches!(
            m.set_parameter("inner.1.second", Tensor::zeros(vec![1, 3])),
            Err(OrsinoError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            m.set_parameter("inner.2.first", Tensor::zeros(vec![2, 3])),
            Err(OrsinoError::UnknownParameter(_))
        ));
        assert!(matches!(
            m.set_parameter("inner..first", Tensor::zeros(vec![2, 3])),
            Err(OrsinoError::InvalidParameterPath(_))
        ));
    }

    #[test]
    fn test_state_dict_load_is_all_or_nothing() {
        let mut source = outer();
        source.inner[0].first.value = Tensor::full(vec![2, 3], 7.0);
        let mut archive = source.state_dict();

        let mut dest = outer();
        dest.load_state_dict(&archive).unwrap();
        assert_eq!(dest.inner[0].first.value.data, vec![7.0; 6]);

        // A bad count on a later entry must not leave earlier entries written.
        archive.insert_tensor("inner.0.first", &Tensor::full(vec![2, 3], 9.0));
        archive.insert_tensor("inner.1.second", &Tensor::zeros(vec![4]));
        assert!(matches!(
            dest.load_state_dict(&archive),
            Err(OrsinoError::ElementCount { .. })
        ));
        assert_eq!(dest.inner[0].first.value.data, vec![7.0; 6]);
    }

    #[test]
    fn test_zero_grad_clears_every_gradient() {
        let mut m = outer();
        m.inner[1].first.accumulate(&Tensor::full(vec![2, 3], 1.5));
        m.zero_grad();
        assert!(m.named_parameters().iter().all(|(_, p)| p.grad.data.iter().all(|&g| g == 0.0)));
    }
}
