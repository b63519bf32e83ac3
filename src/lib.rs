//! Block-update core of a projective-splitting method for regularized
//! empirical-risk minimization.
//!
//! The outer splitting iteration (not part of this crate) maintains a
//! consensus point and per-block dual variables; each outer iteration it asks
//! a loss-processing strategy to rewrite one block's primal/gradient pair.
//! This crate provides the strategy interface and its implementations:
//! forward (gradient) steps with fixed, backtracking, or closed-form
//! stepsizes, and backward (proximal) steps computed exactly, by conjugate
//! gradient, or by limited-memory BFGS.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod backward;
pub mod context;
pub mod faer_ndarray;
pub mod forward;
pub mod loss;
pub mod processor;
pub mod regularizer;

pub use backward::{BackwardCg, BackwardExact, BackwardLbfgs, BackwardLbfgsBuilder};
pub use context::{equal_partition, SplitContext};
pub use forward::{
    Forward1Backtrack, Forward1Fixed, Forward2Affine, Forward2Backtrack, Forward2Fixed,
};
pub use loss::{Loss, LogisticLoss, PluginLoss, SquaredLoss};
pub use processor::{check_compatibility, LossProcessor, ProcessorError};
pub use regularizer::{Regularizer, ZeroRegularizer, L1};
