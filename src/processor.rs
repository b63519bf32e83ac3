//! The strategy interface consumed by the outer splitting driver.
//!
//! Every loss-processing strategy implements `LossProcessor`: `initialize`
//! runs once after the driver has fixed data, partition, and regularizer;
//! `update` runs once per block per outer iteration and rewrites that block's
//! `(x, y)` pair in place. Capability flags let the driver reject invalid
//! (loss, strategy, regularizer) combinations before any iteration runs.

use ndarray::ArrayView1;
use thiserror::Error;

use crate::context::SplitContext;
use crate::faer_ndarray::FaerLinalgError;

#[derive(Error)]
pub enum ProcessorError {
    #[error("Invalid hyperparameter `{name}` = {value}: must be {constraint}")]
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
        constraint: &'static str,
    },

    #[error("`update` called before `initialize`")]
    NotInitialized,

    #[error("{processor} requires the squared loss but the context loss is not quadratic")]
    QuadraticLossRequired { processor: &'static str },

    #[error("{processor} does not support an embedded regularizer")]
    EmbeddedRegularizerUnsupported { processor: &'static str },

    #[error("{processor} requires a loss exposing `value`")]
    LossValueRequired { processor: &'static str },

    #[error("Block index {block} out of range for {n_blocks} blocks")]
    BlockOutOfRange { block: usize, n_blocks: usize },

    #[error("Context shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Linear algebra failure: {0}")]
    LinearAlgebra(#[from] FaerLinalgError),
}

// Debug delegates to Display so multi-line messages print with real breaks.
impl core::fmt::Debug for ProcessorError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self}")
    }
}

pub trait LossProcessor {
    /// One-time setup before the first outer iteration. Validates the
    /// capability contract against the context and builds per-block caches.
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError>;

    /// Recompute `ctx.xdata[block]` and `ctx.ydata[block]` from the current
    /// consensus point and that block's dual variable.
    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError>;

    fn step(&self) -> f64;

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError>;

    /// True for strategies valid only under the squared loss (`BackwardExact`,
    /// `BackwardCg`, `Forward2Affine`).
    fn requires_quadratic_loss(&self) -> bool {
        false
    }

    /// True for strategies that can delegate a proximal evaluation to an
    /// embedded regularizer (the forward families; backward steps cannot).
    fn allows_embedded(&self) -> bool {
        false
    }
}

/// Capability gating run by `initialize` (and available to the driver at
/// problem-construction time).
pub fn check_compatibility(
    processor: &dyn LossProcessor,
    name: &'static str,
    ctx: &SplitContext,
) -> Result<(), ProcessorError> {
    if processor.requires_quadratic_loss() && !ctx.loss.is_quadratic() {
        return Err(ProcessorError::QuadraticLossRequired { processor: name });
    }
    if !processor.allows_embedded() && ctx.embedded.is_some() {
        return Err(ProcessorError::EmbeddedRegularizerUnsupported { processor: name });
    }
    Ok(())
}

pub(crate) fn check_positive(name: &'static str, value: f64) -> Result<f64, ProcessorError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ProcessorError::InvalidHyperparameter {
            name,
            value,
            constraint: "finite and positive",
        })
    }
}

pub(crate) fn check_nonnegative(name: &'static str, value: f64) -> Result<f64, ProcessorError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ProcessorError::InvalidHyperparameter {
            name,
            value,
            constraint: "finite and nonnegative",
        })
    }
}

pub(crate) fn check_open_unit(name: &'static str, value: f64) -> Result<f64, ProcessorError> {
    if value.is_finite() && value > 0.0 && value < 1.0 {
        Ok(value)
    } else {
        Err(ProcessorError::InvalidHyperparameter {
            name,
            value,
            constraint: "strictly between 0 and 1",
        })
    }
}

/// `[0, 1)`, the domain of the relative-error factor `sigma`.
pub(crate) fn check_half_open_unit(name: &'static str, value: f64) -> Result<f64, ProcessorError> {
    if value.is_finite() && (0.0..1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ProcessorError::InvalidHyperparameter {
            name,
            value,
            constraint: "in [0, 1)",
        })
    }
}

pub(crate) fn check_at_least_one(name: &'static str, value: f64) -> Result<f64, ProcessorError> {
    if value.is_finite() && value >= 1.0 {
        Ok(value)
    } else {
        Err(ProcessorError::InvalidHyperparameter {
            name,
            value,
            constraint: "at least 1",
        })
    }
}

pub(crate) fn check_min_count(name: &'static str, value: usize) -> Result<usize, ProcessorError> {
    if value >= 1 {
        Ok(value)
    } else {
        Err(ProcessorError::InvalidHyperparameter {
            name,
            value: value as f64,
            constraint: "at least 1",
        })
    }
}

/// Two-part relative-error acceptance test shared by the approximate backward
/// strategies (`BackwardCg`, `BackwardLbfgs`).
///
/// `e = x + step * grad - t` measures the proximal residual against the prox
/// argument `t = Hz + step * w`. The approximate pair `(x, grad)` is accepted
/// when `e . (Hz - x) + sigma ||Hz - x||^2 >= 0` and
/// `e . (grad - w) - step ||grad - w|| <= 0`.
pub(crate) fn relative_error_ok(
    hz: ArrayView1<f64>,
    x: ArrayView1<f64>,
    t: ArrayView1<f64>,
    grad: ArrayView1<f64>,
    w: ArrayView1<f64>,
    step: f64,
    sigma: f64,
) -> bool {
    let mut e = grad.to_owned();
    e *= step;
    e += &x;
    e -= &t;
    let hz_minus_x = hz.to_owned() - &x;
    let err1 = e.dot(&hz_minus_x) + sigma * hz_minus_x.dot(&hz_minus_x);
    if err1 < 0.0 {
        return false;
    }
    let grad_minus_w = grad.to_owned() - &w;
    let err2 = e.dot(&grad_minus_w) - step * grad_minus_w.dot(&grad_minus_w).sqrt();
    err2 <= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn validation_helpers_reject_out_of_domain_values() {
        assert!(check_positive("step", 0.0).is_err());
        assert!(check_positive("step", f64::NAN).is_err());
        assert!(check_positive("step", f64::INFINITY).is_err());
        assert!(check_open_unit("factor", 1.0).is_err());
        assert!(check_open_unit("factor", 0.7).is_ok());
        assert!(check_half_open_unit("sigma", 0.0).is_ok());
        assert!(check_half_open_unit("sigma", 1.0).is_err());
        assert!(check_at_least_one("grow", 0.9).is_err());
        assert!(check_min_count("iters", 0).is_err());
    }

    #[test]
    fn relative_error_accepts_exact_prox_pair() {
        // For an exact backward step, e = 0 and both conditions hold trivially.
        let hz = array![1.0, 2.0];
        let w = array![0.5, -0.5];
        let step = 0.8;
        let x = array![0.9, 1.4];
        let t = &hz + &(step * &w);
        let grad = (&t - &x) / step;
        assert!(relative_error_ok(
            hz.view(),
            x.view(),
            t.view(),
            grad.view(),
            w.view(),
            step,
            0.0,
        ));
    }

    #[test]
    fn relative_error_rejects_large_residual() {
        let hz = array![1.0, 2.0];
        let w = array![0.0, 0.0];
        let step = 1.0;
        let t = &hz + &(step * &w);
        let x = array![5.0, -4.0];
        let grad = array![3.0, 3.0];
        assert!(!relative_error_ok(
            hz.view(),
            x.view(),
            t.view(),
            grad.view(),
            w.view(),
            step,
            0.1,
        ));
    }
}
