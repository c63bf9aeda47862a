//! Finite-Difference Gradient Checking
//!
//! Every backward pass in this crate is hand-written, so each one is checked
//! against a numerical derivative of the matching forward pass:
//!
//! ```text
//! dL/dx[i] ≈ (L(x + ε·e_i) - L(x - ε·e_i)) / 2ε
//! ```
//!
//! The scalar loss used throughout is `L = Σ y ⊙ g` for a fixed upstream
//! gradient `g`, so the analytic input gradient is exactly what `backward(g)`
//! returns. Losses are accumulated in `f64` to keep the subtraction above
//! `f32` rounding noise.

use crate::tensor::Tensor;

/// Outcome of comparing an analytic gradient against a numerical one
#[derive(Clone, Debug)]
pub struct GradCheckReport {
    pub max_abs_error: f32,
    pub max_rel_error: f32,
    /// Flat index of the element with the largest tolerance violation
    pub worst_index: usize,
    pub passed: bool,
}

/// `Σ y ⊙ g` in double precision
pub fn weighted_sum(y: &Tensor, upstream: &Tensor) -> f64 {
    assert_eq!(y.shape, upstream.shape, "Shapes must match for weighted sum");
    y.data
        .iter()
        .zip(&upstream.data)
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum()
}

/// Central-difference gradient of `f` at `x`
///
/// The step actually taken is measured after `f32` rounding, so the quotient
/// uses the true perturbation rather than `2ε`.
pub fn numerical_gradient(x: &Tensor, eps: f32, mut f: impl FnMut(&Tensor) -> f64) -> Tensor {
    let mut shifted = x.clone();
    let mut grad = vec![0.0; x.numel()];

    for (i, g) in grad.iter_mut().enumerate() {
        let original = x.data[i];
        let plus = original + eps;
        let minus = original - eps;

        shifted.data[i] = plus;
        let f_plus = f(&shifted);
        shifted.data[i] = minus;
        let f_minus = f(&shifted);
        shifted.data[i] = original;

        *g = ((f_plus - f_minus) / (plus as f64 - minus as f64)) as f32;
    }

    Tensor::new(grad, x.shape.clone())
}

/// Element-wise comparison: passes when `|a - n| <= atol + rtol * |n|` everywhere
pub fn compare(analytic: &Tensor, numerical: &Tensor, rtol: f32, atol: f32) -> GradCheckReport {
    assert_eq!(
        analytic.shape, numerical.shape,
        "Gradient shapes differ: {:?} vs {:?}",
        analytic.shape, numerical.shape
    );

    let mut report = GradCheckReport {
        max_abs_error: 0.0,
        max_rel_error: 0.0,
        worst_index: 0,
        passed: true,
    };
    let mut worst_excess = f32::NEG_INFINITY;

    for (i, (&a, &n)) in analytic.data.iter().zip(&numerical.data).enumerate() {
        let abs = (a - n).abs();
        let rel = abs / n.abs().max(f32::EPSILON);
        report.max_abs_error = report.max_abs_error.max(abs);
        report.max_rel_error = report.max_rel_error.max(rel);

        let excess = abs - (atol + rtol * n.abs());
        if excess > worst_excess {
            worst_excess = excess;
            report.worst_index = i;
        }
        if excess > 0.0 || a.is_nan() {
            report.passed = false;
        }
    }

    report
}
