//! Regularizer interface for embedded proximal steps.
//!
//! A regularizer embedded in a loss-processing strategy contributes one
//! proximal evaluation per block update, applied to the non-intercept
//! coordinates of the trial point. The strategy drives the stepsize through
//! `set_step` so the prox scaling tracks the strategy's own stepsize search.

use ndarray::{Array1, ArrayView1};

use crate::processor::{check_nonnegative, check_positive, ProcessorError};

pub trait Regularizer {
    /// `prox_{scale * h}(x)`. Must return a vector of the same length as `x`.
    fn prox(&self, x: ArrayView1<f64>, scale: f64) -> Array1<f64>;

    /// `h(x)`, when the regularizer exposes a value.
    fn value(&self, _x: ArrayView1<f64>) -> Option<f64> {
        None
    }

    fn scaling(&self) -> f64 {
        1.0
    }

    /// Update the scaling. Regularizers without a scaling ignore it.
    fn set_scaling(&mut self, _scaling: f64) -> Result<(), ProcessorError> {
        Ok(())
    }

    fn step(&self) -> f64;

    fn set_step(&mut self, step: f64);

    /// Proximal evaluation at the regularizer's current scaling and stepsize.
    fn apply_prox(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.prox(x, self.scaling() * self.step())
    }
}

/// The `nu * ||x||_1` regularizer with soft-threshold prox.
#[derive(Debug, Clone)]
pub struct L1 {
    nu: f64,
    step: f64,
}

impl L1 {
    pub fn new(scaling: f64, step: f64) -> Result<Self, ProcessorError> {
        Ok(L1 {
            nu: check_nonnegative("scaling", scaling)?,
            step: check_positive("step", step)?,
        })
    }
}

impl Default for L1 {
    fn default() -> Self {
        L1 { nu: 1.0, step: 1.0 }
    }
}

impl Regularizer for L1 {
    fn prox(&self, x: ArrayView1<f64>, scale: f64) -> Array1<f64> {
        x.mapv(|v| {
            if v > scale {
                v - scale
            } else if v < -scale {
                v + scale
            } else {
                0.0
            }
        })
    }

    fn value(&self, x: ArrayView1<f64>) -> Option<f64> {
        Some(self.nu * x.iter().map(|v| v.abs()).sum::<f64>())
    }

    fn scaling(&self) -> f64 {
        self.nu
    }

    fn set_scaling(&mut self, scaling: f64) -> Result<(), ProcessorError> {
        self.nu = check_nonnegative("scaling", scaling)?;
        Ok(())
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) {
        self.step = step;
    }
}

/// The zero regularizer: identity prox, zero value.
#[derive(Debug, Clone)]
pub struct ZeroRegularizer {
    step: f64,
}

impl Default for ZeroRegularizer {
    fn default() -> Self {
        ZeroRegularizer { step: 1.0 }
    }
}

impl Regularizer for ZeroRegularizer {
    fn prox(&self, x: ArrayView1<f64>, _scale: f64) -> Array1<f64> {
        x.to_owned()
    }

    fn value(&self, _x: ArrayView1<f64>) -> Option<f64> {
        Some(0.0)
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) {
        self.step = step;
    }
}
