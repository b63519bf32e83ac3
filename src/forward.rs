//! Forward-step loss-processing strategies.
//!
//! Forward strategies update a block from gradient evaluations only (plus at
//! most one embedded proximal evaluation), in one of two families: two
//! gradient calls per update (`Forward2*`) or a single call reusing the
//! previous iteration's cached gradient at a blended point (`Forward1*`).

use log::warn;
use ndarray::{Array1, Array2};

use crate::context::SplitContext;
use crate::processor::{
    check_at_least_one, check_compatibility, check_min_count, check_open_unit, check_positive,
    LossProcessor, ProcessorError,
};

const DEFAULT_MAX_BACKTRACKS: usize = 100;

/// Two forward steps with a fixed stepsize `rho`:
/// `x = prox(Hz - rho (grad f(Hz) - w))`, `y = (t - x)/rho + grad f(x)`.
pub struct Forward2Fixed {
    step: f64,
    ready: bool,
}

impl Forward2Fixed {
    pub fn new(step: f64) -> Result<Self, ProcessorError> {
        Ok(Forward2Fixed {
            step: check_positive("step", step)?,
            ready: false,
        })
    }
}

impl LossProcessor for Forward2Fixed {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "Forward2Fixed", ctx)?;
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        let grad_hz = ctx.block_gradient(ctx.hz.view(), block);
        let w = ctx.wdata.row(block).to_owned();
        let t = &ctx.hz - &(self.step * (&grad_hz - &w));
        let x = ctx.prox_trial_point(&t);
        let grad_x = ctx.block_gradient(x.view(), block);
        let y = (&t - &x) / self.step + &grad_x;

        ctx.xdata.row_mut(block).assign(&x);
        ctx.ydata.row_mut(block).assign(&y);
        Ok(())
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.step = check_positive("step", step)?;
        Ok(())
    }

    fn allows_embedded(&self) -> bool {
        true
    }
}

/// Two forward steps with a per-block backtracking stepsize. A trial stepsize
/// is accepted once `(Hz - x) . (y - w) >= delta ||Hz - x||^2`; the stepsize
/// optionally grows every `grow_freq` outer iterations.
pub struct Forward2Backtrack {
    initial_step: f64,
    delta: f64,
    backtrack_factor: f64,
    grow_factor: f64,
    grow_freq: Option<usize>,
    max_backtracks: usize,
    steps: Array1<f64>,
    ready: bool,
}

impl Forward2Backtrack {
    pub fn new(
        initial_step: f64,
        delta: f64,
        backtrack_factor: f64,
        grow_factor: f64,
        grow_freq: Option<usize>,
    ) -> Result<Self, ProcessorError> {
        Ok(Forward2Backtrack {
            initial_step: check_positive("initial_step", initial_step)?,
            delta: check_positive("delta", delta)?,
            backtrack_factor: check_open_unit("backtrack_factor", backtrack_factor)?,
            grow_factor: check_at_least_one("grow_factor", grow_factor)?,
            grow_freq: grow_freq
                .map(|freq| check_min_count("grow_freq", freq))
                .transpose()?,
            max_backtracks: DEFAULT_MAX_BACKTRACKS,
            steps: Array1::zeros(0),
            ready: false,
        })
    }

    pub fn with_max_backtracks(mut self, cap: usize) -> Result<Self, ProcessorError> {
        self.max_backtracks = check_min_count("max_backtracks", cap)?;
        Ok(self)
    }

    /// Stepsize accepted for `block` by the most recent backtracking search.
    pub fn block_step(&self, block: usize) -> f64 {
        self.steps[block]
    }
}

impl LossProcessor for Forward2Backtrack {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "Forward2Backtrack", ctx)?;
        self.steps = Array1::from_elem(ctx.n_blocks(), self.initial_step);
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        let grad_hz = ctx.block_gradient(ctx.hz.view(), block);
        let w = ctx.wdata.row(block).to_owned();

        if let Some(freq) = self.grow_freq {
            if ctx.iteration % freq == 0 {
                self.steps[block] *= self.grow_factor;
            }
        }
        ctx.set_embedded_step(self.steps[block]);

        let mut accepted = false;
        for _ in 0..self.max_backtracks {
            let rho = self.steps[block];
            let t = &ctx.hz - &(rho * (&grad_hz - &w));
            let x = ctx.prox_trial_point(&t);
            let grad_x = ctx.block_gradient(x.view(), block);
            let y = (&t - &x) / rho + &grad_x;

            ctx.xdata.row_mut(block).assign(&x);
            ctx.ydata.row_mut(block).assign(&y);

            let lhs = &ctx.hz - &x;
            let rhs = &y - &w;
            if lhs.dot(&rhs) >= self.delta * lhs.dot(&lhs) {
                accepted = true;
                break;
            }
            self.steps[block] *= self.backtrack_factor;
            ctx.set_embedded_step(self.steps[block]);
        }
        if !accepted {
            warn!(
                "Forward2Backtrack: block {block} exhausted {} backtracks at stepsize {:.3e}",
                self.max_backtracks, self.steps[block]
            );
        }
        Ok(())
    }

    fn step(&self) -> f64 {
        self.initial_step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.initial_step = check_positive("step", step)?;
        if !self.steps.is_empty() {
            self.steps.fill(self.initial_step);
        }
        Ok(())
    }

    fn allows_embedded(&self) -> bool {
        true
    }
}

/// Two forward steps with a closed-form stepsize, valid only for the squared
/// loss whose gradient map is affine. One gradient evaluation per update; no
/// embedded regularizer.
pub struct Forward2Affine {
    delta: f64,
    // kept for the interface; the working stepsize is recomputed per call
    last_step: f64,
    ready: bool,
}

impl Forward2Affine {
    pub fn new(delta: f64) -> Result<Self, ProcessorError> {
        Ok(Forward2Affine {
            delta: check_positive("delta", delta)?,
            last_step: 1.0,
            ready: false,
        })
    }
}

impl LossProcessor for Forward2Affine {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "Forward2Affine", ctx)?;
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        let grad_hz = ctx.block_gradient(ctx.hz.view(), block);
        let residual = &grad_hz - &ctx.wdata.row(block);

        let norm_sq = residual.dot(&residual);
        if norm_sq == 0.0 {
            // Zero residual: the block already agrees with the consensus
            // point, so the update is a no-op at Hz.
            ctx.xdata.row_mut(block).assign(&ctx.hz);
            ctx.ydata.row_mut(block).assign(&grad_hz);
            return Ok(());
        }

        let rows = ctx.block_rows(block);
        let predictions = crate::faer_ndarray::fast_av(&rows, &residual);
        let mut affine_part = crate::faer_ndarray::fast_atv(&rows, &predictions);
        affine_part /= ctx.n_rows() as f64;
        let step = norm_sq / (self.delta * norm_sq + residual.dot(&affine_part));
        self.last_step = step;

        let x = &ctx.hz - &(step * &residual);
        let y = &grad_hz - &(step * &affine_part);
        ctx.xdata.row_mut(block).assign(&x);
        ctx.ydata.row_mut(block).assign(&y);
        Ok(())
    }

    fn step(&self) -> f64 {
        self.last_step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        // The stepsize is computed in closed form each call; setting it only
        // seeds the reported value.
        self.last_step = check_positive("step", step)?;
        Ok(())
    }

    fn requires_quadratic_loss(&self) -> bool {
        true
    }
}

/// One forward step with a fixed stepsize, reusing the previous iteration's
/// gradient at the blended point `(1 - alpha) x_prev + alpha Hz`.
///
/// Convergence is unproven (though conjectured) when the driver updates
/// fewer than all blocks per outer iteration.
pub struct Forward1Fixed {
    step: f64,
    alpha: f64,
    grad_cache: Array2<f64>,
    ready: bool,
}

impl Forward1Fixed {
    pub fn new(step: f64, blend_factor: f64) -> Result<Self, ProcessorError> {
        Ok(Forward1Fixed {
            step: check_positive("step", step)?,
            alpha: check_open_unit("blend_factor", blend_factor)?,
            grad_cache: Array2::zeros((0, 0)),
            ready: false,
        })
    }
}

impl LossProcessor for Forward1Fixed {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "Forward1Fixed", ctx)?;
        self.grad_cache = Array2::zeros((ctx.n_blocks(), ctx.dim()));
        for block in 0..ctx.n_blocks() {
            let grad = ctx.block_gradient(ctx.xdata.row(block), block);
            self.grad_cache.row_mut(block).assign(&grad);
        }
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        let x_prev = ctx.xdata.row(block).to_owned();
        let w = ctx.wdata.row(block).to_owned();
        let t = (1.0 - self.alpha) * &x_prev + self.alpha * &ctx.hz
            - self.step * (&self.grad_cache.row(block).to_owned() - &w);
        let x = ctx.prox_trial_point(&t);
        let grad_x = ctx.block_gradient(x.view(), block);
        let y = (&t - &x) / self.step + &grad_x;

        self.grad_cache.row_mut(block).assign(&grad_x);
        ctx.xdata.row_mut(block).assign(&x);
        ctx.ydata.row_mut(block).assign(&y);
        Ok(())
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.step = check_positive("step", step)?;
        Ok(())
    }

    fn allows_embedded(&self) -> bool {
        true
    }
}

/// One forward step with a per-block backtracking stepsize.
///
/// `initialize` seeds reference points `theta_hat` (prox at the origin) and
/// `w_hat`, which anchor the non-expansiveness bound of the acceptance test.
/// The running estimate `eta` of the gradient-to-residual ratio caps stepsize
/// growth at `(1 + alpha * eta) * rho`.
///
/// Convergence is unproven (though conjectured) when the driver updates
/// fewer than all blocks per outer iteration.
pub struct Forward1Backtrack {
    initial_step: f64,
    alpha: f64,
    backtrack_factor: f64,
    grow_factor: f64,
    grow_freq: Option<usize>,
    max_backtracks: usize,
    eta: f64,
    steps: Array1<f64>,
    theta_hat: Array2<f64>,
    w_hat: Array2<f64>,
    grad_cache: Array2<f64>,
    ready: bool,
}

impl Forward1Backtrack {
    pub fn new(
        initial_step: f64,
        blend_factor: f64,
        backtrack_factor: f64,
        grow_factor: f64,
        grow_freq: Option<usize>,
    ) -> Result<Self, ProcessorError> {
        Ok(Forward1Backtrack {
            initial_step: check_positive("initial_step", initial_step)?,
            alpha: check_open_unit("blend_factor", blend_factor)?,
            backtrack_factor: check_open_unit("backtrack_factor", backtrack_factor)?,
            grow_factor: check_at_least_one("grow_factor", grow_factor)?,
            grow_freq: grow_freq
                .map(|freq| check_min_count("grow_freq", freq))
                .transpose()?,
            max_backtracks: DEFAULT_MAX_BACKTRACKS,
            eta: f64::INFINITY,
            steps: Array1::zeros(0),
            theta_hat: Array2::zeros((0, 0)),
            w_hat: Array2::zeros((0, 0)),
            grad_cache: Array2::zeros((0, 0)),
            ready: false,
        })
    }

    pub fn with_max_backtracks(mut self, cap: usize) -> Result<Self, ProcessorError> {
        self.max_backtracks = check_min_count("max_backtracks", cap)?;
        Ok(self)
    }

    /// Stepsize accepted for `block` by the most recent backtracking search.
    pub fn block_step(&self, block: usize) -> f64 {
        self.steps[block]
    }
}

impl LossProcessor for Forward1Backtrack {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "Forward1Backtrack", ctx)?;
        let (n_blocks, dim) = (ctx.n_blocks(), ctx.dim());
        self.steps = Array1::from_elem(n_blocks, self.initial_step);
        self.theta_hat = Array2::zeros((n_blocks, dim));
        self.w_hat = Array2::zeros((n_blocks, dim));
        self.grad_cache = Array2::zeros((n_blocks, dim));

        let origin = Array1::zeros(dim);
        for block in 0..n_blocks {
            // theta_hat = prox at the origin, intercept pinned to zero.
            let theta = ctx.prox_trial_point(&origin);
            let grad = ctx.block_gradient(theta.view(), block);
            let w_hat = &grad - &(&theta / ctx.embedded_step());
            self.theta_hat.row_mut(block).assign(&theta);
            self.grad_cache.row_mut(block).assign(&grad);
            self.w_hat.row_mut(block).assign(&w_hat);
            // Seed the shared arrays so the first update's previous iterate
            // is the reference pair.
            ctx.xdata.row_mut(block).assign(&theta);
            ctx.ydata.row_mut(block).assign(&w_hat);
        }
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        if let Some(freq) = self.grow_freq {
            if ctx.iteration % freq == 0 {
                let upper_bound = (1.0 + self.alpha * self.eta) * self.steps[block];
                let desired = self.grow_factor * self.steps[block];
                self.steps[block] = upper_bound.min(desired);
            }
        }
        ctx.set_embedded_step(self.steps[block]);

        let x_old = ctx.xdata.row(block).to_owned();
        let y_old = ctx.ydata.row(block).to_owned();
        let w = ctx.wdata.row(block).to_owned();
        let theta_hat = self.theta_hat.row(block).to_owned();
        let w_hat = self.w_hat.row(block).to_owned();

        let phi = (&ctx.hz - &x_old).dot(&(&y_old - &w));
        let t1 = (1.0 - self.alpha) * &x_old + self.alpha * &ctx.hz;
        let t2 = &self.grad_cache.row(block).to_owned() - &w;

        let y_old_dev_sq = {
            let d = &y_old - &w;
            d.dot(&d)
        };

        let mut accepted = false;
        for _ in 0..self.max_backtracks {
            let rho = self.steps[block];
            let t = &t1 - &(rho * &t2);
            let x = ctx.prox_trial_point(&t);
            let grad_x = ctx.block_gradient(x.view(), block);
            let y = (&t - &x) / rho + &grad_x;
            self.grad_cache.row_mut(block).assign(&grad_x);
            ctx.xdata.row_mut(block).assign(&x);
            ctx.ydata.row_mut(block).assign(&y);

            let y_hat = (&t1 - &x) / rho + &w;
            let phi_plus = (&ctx.hz - &x).dot(&(&y - &w));

            // Non-expansiveness bound relative to the reference pair.
            let lhs1 = {
                let d = &x - &theta_hat;
                d.dot(&d).sqrt()
            };
            let rhs1 = {
                let d_old = &x_old - &theta_hat;
                let d_hz = &ctx.hz - &theta_hat;
                let d_w = &w - &w_hat;
                (1.0 - self.alpha) * d_old.dot(&d_old).sqrt()
                    + self.alpha * d_hz.dot(&d_hz).sqrt()
                    + rho * d_w.dot(&d_w).sqrt()
            };
            if lhs1 <= rhs1 {
                // Energy-decrease bound on the blended potential.
                let numer = {
                    let d = &y_hat - &w;
                    d.dot(&d)
                };
                let denom = {
                    let d = &y - &w;
                    d.dot(&d)
                };
                let rhs2_growth = 0.5 * (rho / self.alpha) * (denom + self.alpha * numer);
                let rhs2_carry =
                    (1.0 - self.alpha) * (phi - 0.5 * (rho / self.alpha) * y_old_dev_sq);
                if phi_plus >= rhs2_growth + rhs2_carry {
                    if denom > 0.0 {
                        self.eta = numer / denom;
                    }
                    accepted = true;
                    break;
                }
            }

            self.steps[block] *= self.backtrack_factor;
            ctx.set_embedded_step(self.steps[block]);
        }
        if !accepted {
            warn!(
                "Forward1Backtrack: block {block} exhausted {} backtracks at stepsize {:.3e}",
                self.max_backtracks, self.steps[block]
            );
        }
        Ok(())
    }

    fn step(&self) -> f64 {
        self.initial_step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.initial_step = check_positive("step", step)?;
        if !self.steps.is_empty() {
            self.steps.fill(self.initial_step);
        }
        Ok(())
    }

    fn allows_embedded(&self) -> bool {
        true
    }
}
