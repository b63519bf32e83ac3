//! Loss interface consumed by the block gradient evaluator.
//!
//! A loss exposes the elementwise derivative of `l(prediction, target)` with
//! respect to the prediction, and optionally the elementwise value. The value
//! is only required by strategies that minimize a merit function
//! (`BackwardLbfgs`); everything else runs on derivatives alone, so the value
//! capability is an explicit flag rather than a runtime probe.

use ndarray::{Array1, ArrayView1, Zip};

pub trait Loss {
    /// Elementwise derivative of the loss with respect to the prediction.
    fn derivative(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Array1<f64>;

    /// Elementwise loss values, when the loss exposes them.
    fn value(&self, _predictions: ArrayView1<f64>, _targets: ArrayView1<f64>) -> Option<Array1<f64>> {
        None
    }

    /// Whether `value` returns `Some`.
    fn has_value(&self) -> bool {
        false
    }

    /// True only for the squared loss, whose gradient map is affine. Gates
    /// the strategies that exploit that structure.
    fn is_quadratic(&self) -> bool {
        false
    }
}

/// The squared loss `l(t, r) = (t - r)^2 / 2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredLoss;

impl Loss for SquaredLoss {
    fn derivative(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Array1<f64> {
        Zip::from(predictions)
            .and(targets)
            .map_collect(|&t, &r| t - r)
    }

    fn value(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Option<Array1<f64>> {
        Some(
            Zip::from(predictions)
                .and(targets)
                .map_collect(|&t, &r| 0.5 * (t - r) * (t - r)),
        )
    }

    fn has_value(&self) -> bool {
        true
    }

    fn is_quadratic(&self) -> bool {
        true
    }
}

/// The logistic loss `l(t, r) = log(1 + exp(-r t))` for labels `r` in {-1, 1}.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogisticLoss;

impl Loss for LogisticLoss {
    fn derivative(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Array1<f64> {
        Zip::from(predictions)
            .and(targets)
            .map_collect(|&t, &r| -r / (1.0 + (r * t).exp()))
    }

    fn value(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Option<Array1<f64>> {
        Some(Zip::from(predictions).and(targets).map_collect(|&t, &r| {
            // log1p(exp(u)) overflows for large u; switch to the stable
            // branch u + log1p(exp(-u)) there.
            let u = -r * t;
            if u > 30.0 { u + (-u).exp().ln_1p() } else { u.exp().ln_1p() }
        }))
    }

    fn has_value(&self) -> bool {
        true
    }
}

/// A loss defined by user-supplied derivative (and optional value) closures.
pub struct PluginLoss {
    derivative: Box<dyn Fn(f64, f64) -> f64 + Send + Sync>,
    value: Option<Box<dyn Fn(f64, f64) -> f64 + Send + Sync>>,
}

impl PluginLoss {
    pub fn new(derivative: impl Fn(f64, f64) -> f64 + Send + Sync + 'static) -> Self {
        PluginLoss {
            derivative: Box::new(derivative),
            value: None,
        }
    }

    pub fn with_value(
        derivative: impl Fn(f64, f64) -> f64 + Send + Sync + 'static,
        value: impl Fn(f64, f64) -> f64 + Send + Sync + 'static,
    ) -> Self {
        PluginLoss {
            derivative: Box::new(derivative),
            value: Some(Box::new(value)),
        }
    }
}

impl Loss for PluginLoss {
    fn derivative(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Array1<f64> {
        Zip::from(predictions)
            .and(targets)
            .map_collect(|&t, &r| (self.derivative)(t, r))
    }

    fn value(&self, predictions: ArrayView1<f64>, targets: ArrayView1<f64>) -> Option<Array1<f64>> {
        self.value.as_ref().map(|value| {
            Zip::from(predictions)
                .and(targets)
                .map_collect(|&t, &r| value(t, r))
        })
    }

    fn has_value(&self) -> bool {
        self.value.is_some()
    }
}
