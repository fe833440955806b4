use std::fmt;

use crate::datatype::DataType;
use crate::tensor::Tensor;

/// Closeness bound `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub atol: f64,
    pub rtol: f64,
}

impl Tolerance {
    pub const fn new(atol: f64, rtol: f64) -> Self {
        Tolerance { atol, rtol }
    }

    /// Purely relative bound, as used when comparing reduced-precision outputs.
    pub const fn relative(rtol: f64) -> Self {
        Tolerance { atol: 0.0, rtol }
    }

    #[inline]
    pub fn is_close(&self, a: f64, b: f64) -> bool {
        if a == b {
            // Covers equal infinities.
            return true;
        }
        if !a.is_finite() || !b.is_finite() {
            return false;
        }
        (a - b).abs() <= self.atol + self.rtol * b.abs()
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance::relative(1e-2)
    }
}

/// `true` when every element of `a` is close to the matching element of `b`.
/// Tensors of different shapes are never close.
pub fn allclose<T: DataType>(a: &Tensor<T>, b: &Tensor<T>, tolerance: Tolerance) -> bool {
    a.shape() == b.shape()
        && a
            .data()
            .iter()
            .zip(b.data())
            .all(|(x, y)| tolerance.is_close(x.to_f32() as f64, y.to_f32() as f64))
}

/// Largest element-wise `|a - b|`. NaN differences propagate.
pub fn max_abs_diff<T: DataType>(a: &Tensor<T>, b: &Tensor<T>) -> f64 {
    a.data()
        .iter()
        .zip(b.data())
        .map(|(x, y)| (x.to_f32() as f64 - y.to_f32() as f64).abs())
        .fold(0.0, |acc, d| if d.is_nan() || acc.is_nan() { f64::NAN } else { acc.max(d) })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericalReport {
    pub failures: usize,
    pub total: usize,
    pub max_diff: f64,
}

impl NumericalReport {
    pub fn passed(&self) -> bool {
        self.failures == 0
    }
}

impl fmt::Display for NumericalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            write!(f, "Numerical test PASS")
        } else {
            write!(
                f,
                "Numerical test FAIL {}/{}. Max diff is {}",
                self.failures, self.total, self.max_diff
            )
        }
    }
}

/// Compares index-aligned output tensors. `reference` is the side the relative
/// bound is taken from: pair `i` passes when
/// `|outputs[i] - reference[i]| <= atol + rtol * |reference[i]|` element-wise.
///
/// # Panics
///
/// When the two sequences have different lengths.
pub fn numerical_test<T: DataType>(
    outputs: &[Tensor<T>],
    reference: &[Tensor<T>],
    tolerance: Tolerance,
) -> NumericalReport {
    assert_eq!(
        outputs.len(),
        reference.len(),
        "Output sequences differ in length"
    );

    let mut failures = 0;
    let mut max_diff = 0.0f64;
    for (i, (a, b)) in outputs.iter().zip(reference).enumerate() {
        let diff = max_abs_diff(a, b);
        max_diff = if diff.is_nan() { f64::NAN } else { max_diff.max(diff) };
        if !allclose(a, b, tolerance) {
            tracing::debug!(index = i, max_diff = diff, "outputs not close");
            failures += 1;
        }
    }

    let report = NumericalReport {
        failures,
        total: outputs.len(),
        max_diff,
    };
    tracing::debug!(?report, ?tolerance, "numerical comparison finished");
    report
}
