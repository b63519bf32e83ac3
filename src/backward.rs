//! Backward-step (proximal) loss-processing strategies.
//!
//! All three strategies return the pair
//! `x = prox_{rho f_b}(Hz + rho w)`, `y = (Hz + rho w - x) / rho`,
//! computed exactly (`BackwardExact`), by conjugate gradient on the induced
//! linear system (`BackwardCg`), or by limited-memory BFGS with a Wolfe line
//! search (`BackwardLbfgs`). The two approximate strategies accept an iterate
//! once the shared two-part relative-error test passes.

use log::{debug, warn};
use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::context::SplitContext;
use crate::faer_ndarray::{fast_aat, fast_ata, fast_atv, fast_av, CholeskyFactor, FaerCholesky};
use crate::processor::{
    check_compatibility, check_half_open_unit, check_min_count, check_open_unit, check_positive,
    relative_error_ok, LossProcessor, ProcessorError,
};

/// Exact backward step for the squared loss via cached Cholesky
/// factorizations.
///
/// `initialize` factorizes, per block, `I + (rho/n) A_b^T A_b`, or the
/// smaller `I + (rho/n) A_b A_b^T` when blocks are wide (row count below half
/// the column count), applied through the matrix-inversion lemma. This keeps
/// the factorization cost at `min(rows, cols)^3` per block.
///
/// `set_step` marks the caches stale; the next `update` call rebuilds them
/// before computing, so callers see a one-call latency spike after a
/// stepsize change.
pub struct BackwardExact {
    step: f64,
    use_inversion_lemma: bool,
    aty: Vec<Array1<f64>>,
    factors: Vec<CholeskyFactor>,
    step_changed: bool,
    ready: bool,
}

impl BackwardExact {
    pub fn new(step: f64) -> Result<Self, ProcessorError> {
        Ok(BackwardExact {
            step: check_positive("step", step)?,
            use_inversion_lemma: false,
            aty: Vec::new(),
            factors: Vec::new(),
            step_changed: false,
            ready: false,
        })
    }

    fn build_caches(&mut self, ctx: &SplitContext) -> Result<(), ProcessorError> {
        // Block lengths differ by at most one, so the first block decides the
        // wide/tall regime for all of them.
        let block_len = ctx.partition[0].len();
        self.use_inversion_lemma = block_len < ctx.dim() / 2;

        self.aty = (0..ctx.n_blocks())
            .map(|block| {
                let rows = ctx.block_rows(block);
                fast_atv(&rows, &ctx.block_response(block))
            })
            .collect();

        let scale = self.step / ctx.n_rows() as f64;
        let use_lemma = self.use_inversion_lemma;
        // Blocks factorize independently; collect the row views first so the
        // parallel loop borrows plain array views rather than the context.
        let block_views: Vec<_> = (0..ctx.n_blocks()).map(|block| ctx.block_rows(block)).collect();
        self.factors = block_views
            .into_par_iter()
            .map(|rows| {
                let mut gram = if use_lemma {
                    fast_aat(&rows)
                } else {
                    fast_ata(&rows)
                };
                gram *= scale;
                for i in 0..gram.nrows() {
                    gram[[i, i]] += 1.0;
                }
                gram.cholesky(faer::Side::Lower)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

impl LossProcessor for BackwardExact {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "BackwardExact", ctx)?;
        self.build_caches(ctx)?;
        self.step_changed = false;
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        if self.step_changed {
            debug!("BackwardExact: stepsize changed, rebuilding cached factorizations");
            self.build_caches(ctx)?;
            self.step_changed = false;
        }

        let scale = self.step / ctx.n_rows() as f64;
        let w = ctx.wdata.row(block).to_owned();
        let t = &ctx.hz + &(self.step * &w);
        let b = &t + &(scale * &self.aty[block]);

        let x = if self.use_inversion_lemma {
            // (I + c A^T A)^{-1} b = b - c A^T (I + c A A^T)^{-1} A b
            let rows = ctx.block_rows(block);
            let ab = fast_av(&rows, &b);
            let solved = self.factors[block].solve_vec(&ab);
            &b - &(scale * fast_atv(&rows, &solved))
        } else {
            self.factors[block].solve_vec(&b)
        };
        let y = (&t - &x) / self.step;

        ctx.xdata.row_mut(block).assign(&x);
        ctx.ydata.row_mut(block).assign(&y);
        Ok(())
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.step = check_positive("step", step)?;
        self.step_changed = true;
        Ok(())
    }

    fn requires_quadratic_loss(&self) -> bool {
        true
    }
}

/// Approximate backward step for the squared loss via conjugate gradient on
/// `(I + (rho/n) A_b^T A_b) x = Hz + rho w + (rho/n) A_b^T y_b`, warm-started
/// from the block's previous iterate.
///
/// Iterations stop at the relative-error acceptance test, at a degenerate
/// search direction (the iterate already solves the system to machine
/// precision), or at `max_iter`. Hitting `max_iter` is tolerated per call;
/// convergence of the outer method requires it to happen only finitely often.
pub struct BackwardCg {
    step: f64,
    sigma: f64,
    max_iter: usize,
    aty: Vec<Array1<f64>>,
    ready: bool,
}

impl BackwardCg {
    pub fn new(relative_error_factor: f64, step: f64, max_iter: usize) -> Result<Self, ProcessorError> {
        Ok(BackwardCg {
            step: check_positive("step", step)?,
            sigma: check_half_open_unit("relative_error_factor", relative_error_factor)?,
            max_iter: check_min_count("max_iter", max_iter)?,
            aty: Vec::new(),
            ready: false,
        })
    }
}

impl LossProcessor for BackwardCg {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "BackwardCg", ctx)?;
        self.aty = (0..ctx.n_blocks())
            .map(|block| {
                let rows = ctx.block_rows(block);
                fast_atv(&rows, &ctx.block_response(block))
            })
            .collect();
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        let rho = self.step;
        let inv_n = 1.0 / ctx.n_rows() as f64;
        let rows = ctx.block_rows(block);
        // Left-hand side of the proximal linear system.
        let apply = |v: &Array1<f64>| -> Array1<f64> {
            let av = fast_av(&rows, v);
            v + &((rho * inv_n) * fast_atv(&rows, &av))
        };

        let w = ctx.wdata.row(block).to_owned();
        let t = &ctx.hz + &(rho * &w);
        let b = &t + &((rho * inv_n) * &self.aty[block]);
        let mut x = ctx.xdata.row(block).to_owned();

        let mut ax = apply(&x);
        let mut r = &b - &ax;
        let mut p = r.clone();
        let mut grad;
        let mut iters = 0;
        loop {
            let rtr = r.dot(&r);
            let ap = apply(&p);
            let curvature = p.dot(&ap);
            if curvature == 0.0 {
                // The iterate already satisfies the system to machine
                // precision.
                grad = (&ax - &x) / rho - &(inv_n * &self.aty[block]);
                break;
            }
            let alpha = rtr / curvature;
            x += &(alpha * &p);
            ax += &(alpha * &ap);
            grad = (&ax - &x) / rho - &(inv_n * &self.aty[block]);

            iters += 1;
            if iters >= self.max_iter {
                warn!(
                    "BackwardCg: block {block} reached the {} iteration cap",
                    self.max_iter
                );
                break;
            }
            if relative_error_ok(
                ctx.hz.view(),
                x.view(),
                t.view(),
                grad.view(),
                w.view(),
                rho,
                self.sigma,
            ) {
                break;
            }

            let r_next = &r - &(alpha * &ap);
            let beta = r_next.dot(&r_next) / rtr;
            p = &r_next + &(beta * &p);
            r = r_next;
        }

        ctx.xdata.row_mut(block).assign(&x);
        ctx.ydata.row_mut(block).assign(&grad);
        Ok(())
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.step = check_positive("step", step)?;
        Ok(())
    }

    fn requires_quadratic_loss(&self) -> bool {
        true
    }
}

/// Approximate backward step via limited-memory BFGS, for any loss exposing
/// elementwise values. Minimizes the proximal merit function
/// `rho f_b(x) + 0.5 ||t - x||^2` with a two-loop recursion over the last
/// `memory` (gradient-difference, step) pairs and a Wolfe line search, until
/// the relative-error acceptance test or `max_iter`.
pub struct BackwardLbfgs {
    step: f64,
    sigma: f64,
    memory: usize,
    c1: f64,
    c2: f64,
    shrink_factor: f64,
    grow_factor: f64,
    max_iter: usize,
    line_search_iter: usize,
    ready: bool,
}

pub struct BackwardLbfgsBuilder {
    step: f64,
    relative_error_factor: f64,
    memory: usize,
    c1: f64,
    c2: f64,
    shrink_factor: f64,
    grow_factor: f64,
    max_iter: usize,
    line_search_iter: usize,
}

impl Default for BackwardLbfgsBuilder {
    fn default() -> Self {
        BackwardLbfgsBuilder {
            step: 1.0,
            relative_error_factor: 0.9,
            memory: 10,
            c1: 1e-4,
            c2: 0.9,
            shrink_factor: 0.7,
            grow_factor: 1.1,
            max_iter: 100,
            line_search_iter: 20,
        }
    }
}

impl BackwardLbfgsBuilder {
    pub fn step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    pub fn relative_error_factor(mut self, sigma: f64) -> Self {
        self.relative_error_factor = sigma;
        self
    }

    pub fn memory(mut self, memory: usize) -> Self {
        self.memory = memory;
        self
    }

    pub fn wolfe(mut self, c1: f64, c2: f64) -> Self {
        self.c1 = c1;
        self.c2 = c2;
        self
    }

    pub fn shrink_factor(mut self, factor: f64) -> Self {
        self.shrink_factor = factor;
        self
    }

    pub fn grow_factor(mut self, factor: f64) -> Self {
        self.grow_factor = factor;
        self
    }

    pub fn max_iter(mut self, cap: usize) -> Self {
        self.max_iter = cap;
        self
    }

    pub fn line_search_iter(mut self, cap: usize) -> Self {
        self.line_search_iter = cap;
        self
    }

    pub fn build(self) -> Result<BackwardLbfgs, ProcessorError> {
        let c1 = check_open_unit("c1", self.c1)?;
        let c2 = check_open_unit("c2", self.c2)?;
        if c1 >= c2 {
            return Err(ProcessorError::InvalidHyperparameter {
                name: "c1",
                value: c1,
                constraint: "strictly less than c2",
            });
        }
        let grow_factor = self.grow_factor;
        if !(grow_factor.is_finite() && grow_factor > 1.0) {
            return Err(ProcessorError::InvalidHyperparameter {
                name: "grow_factor",
                value: grow_factor,
                constraint: "strictly greater than 1",
            });
        }
        Ok(BackwardLbfgs {
            step: check_positive("step", self.step)?,
            sigma: check_half_open_unit("relative_error_factor", self.relative_error_factor)?,
            memory: check_min_count("memory", self.memory)?,
            c1,
            c2,
            shrink_factor: check_open_unit("shrink_factor", self.shrink_factor)?,
            grow_factor,
            max_iter: check_min_count("max_iter", self.max_iter)?,
            line_search_iter: check_min_count("line_search_iter", self.line_search_iter)?,
            ready: false,
        })
    }
}

impl BackwardLbfgs {
    pub fn builder() -> BackwardLbfgsBuilder {
        BackwardLbfgsBuilder::default()
    }

    /// Proximal merit function `rho f_b(x) + 0.5 ||t - x||^2`.
    fn merit(
        &self,
        ctx: &SplitContext,
        x: &Array1<f64>,
        block: usize,
        t: &Array1<f64>,
    ) -> Result<f64, ProcessorError> {
        let rows = ctx.block_rows(block);
        let predictions = fast_av(&rows, x);
        let values = ctx
            .loss
            .value(predictions.view(), ctx.block_response(block))
            .ok_or(ProcessorError::LossValueRequired {
                processor: "BackwardLbfgs",
            })?;
        let diff = t - x;
        Ok(self.step / ctx.n_rows() as f64 * values.sum() + 0.5 * diff.dot(&diff))
    }

    /// Gradient of the proximal merit function.
    fn merit_gradient(
        &self,
        ctx: &SplitContext,
        x: &Array1<f64>,
        block: usize,
        t: &Array1<f64>,
    ) -> Array1<f64> {
        self.step * ctx.block_gradient(x.view(), block) + x - t
    }

    /// Wolfe line search along `p` from `x`: shrink while sufficient decrease
    /// (Armijo, `c1`) fails, grow while curvature (`c2`) fails, give up after
    /// `line_search_iter` trials and keep the last trial point.
    #[allow(clippy::too_many_arguments)]
    fn wolfe_line_search(
        &self,
        ctx: &SplitContext,
        x: &Array1<f64>,
        p: &Array1<f64>,
        grad: &Array1<f64>,
        f: f64,
        t: &Array1<f64>,
        block: usize,
    ) -> Result<(Array1<f64>, Array1<f64>, f64), ProcessorError> {
        let directional = grad.dot(p);
        let mut trial_step = 1.0;
        let mut trials = 0;
        loop {
            let x_trial = x + &(trial_step * p);
            let f_trial = self.merit(ctx, &x_trial, block, t)?;
            let mut grad_trial = None;
            let mut done = false;

            if f_trial - f - self.c1 * trial_step * directional <= 0.0 {
                let g = self.merit_gradient(ctx, &x_trial, block, t);
                if g.dot(p) - self.c2 * directional >= 0.0 {
                    done = true;
                } else {
                    trial_step *= self.grow_factor;
                }
                grad_trial = Some(g);
            } else {
                trial_step *= self.shrink_factor;
            }

            trials += 1;
            if done || trials >= self.line_search_iter {
                if trials >= self.line_search_iter && !done {
                    warn!(
                        "BackwardLbfgs: line search for block {block} hit the {} trial cap",
                        self.line_search_iter
                    );
                }
                let grad_trial = match grad_trial {
                    Some(g) => g,
                    None => self.merit_gradient(ctx, &x_trial, block, t),
                };
                return Ok((x_trial, grad_trial, f_trial));
            }
        }
    }
}

impl LossProcessor for BackwardLbfgs {
    fn initialize(&mut self, ctx: &mut SplitContext) -> Result<(), ProcessorError> {
        check_compatibility(self, "BackwardLbfgs", ctx)?;
        if !ctx.loss.has_value() {
            return Err(ProcessorError::LossValueRequired {
                processor: "BackwardLbfgs",
            });
        }
        self.ready = true;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SplitContext, block: usize) -> Result<(), ProcessorError> {
        if !self.ready {
            return Err(ProcessorError::NotInitialized);
        }
        ctx.check_block(block)?;

        let rho = self.step;
        let dim = ctx.dim();
        let w = ctx.wdata.row(block).to_owned();
        let t = &ctx.hz + &(rho * &w);
        let mut x = ctx.xdata.row(block).to_owned();

        // Sliding-window memory, oldest pair in row 0.
        let mut y_mem = Array2::<f64>::zeros((self.memory, dim));
        let mut s_mem = Array2::<f64>::zeros((self.memory, dim));
        let mut rho_mem = Array1::<f64>::zeros(self.memory);
        let mut alpha_buf = Array1::<f64>::zeros(self.memory);

        let mut grad = self.merit_gradient(ctx, &x, block, &t);
        let mut f = self.merit(ctx, &x, block, &t)?;
        let mut z = grad.clone();
        let mut prox_grad = (&grad - &(&x - &t)) / rho;

        let mut k = 0;
        while k < self.max_iter {
            let p = -&z;
            let (x_new, grad_new, f_new) = self.wolfe_line_search(ctx, &x, &p, &grad, f, &t, block)?;
            prox_grad = (&grad_new - &(&x_new - &t)) / rho;
            k += 1;

            let converged = relative_error_ok(
                ctx.hz.view(),
                x_new.view(),
                t.view(),
                prox_grad.view(),
                w.view(),
                rho,
                self.sigma,
            );
            if converged || k >= self.max_iter {
                if !converged {
                    warn!(
                        "BackwardLbfgs: block {block} reached the {} iteration cap",
                        self.max_iter
                    );
                }
                x = x_new;
                break;
            }

            let s_new = &x_new - &x;
            x = x_new;
            let y_new = &grad_new - &grad;
            grad = grad_new;
            f = f_new;

            shift_rows(&mut y_mem, &y_new);
            shift_rows(&mut s_mem, &s_new);
            shift_scalar(&mut rho_mem, 1.0 / y_new.dot(&s_new));

            // Two-loop recursion over the stored pairs; empty slots carry a
            // zero curvature scalar and drop out of both loops.
            let mut q = grad.clone();
            for i in (0..self.memory).rev() {
                alpha_buf[i] = rho_mem[i] * s_mem.row(i).dot(&q);
                q -= &(alpha_buf[i] * &y_mem.row(i).to_owned());
            }
            let gamma = s_new.dot(&y_new) / y_new.dot(&y_new);
            z = gamma * q;
            for i in 0..self.memory {
                let beta = rho_mem[i] * y_mem.row(i).dot(&z);
                z += &((alpha_buf[i] - beta) * &s_mem.row(i).to_owned());
            }
        }

        ctx.xdata.row_mut(block).assign(&x);
        ctx.ydata.row_mut(block).assign(&prox_grad);
        Ok(())
    }

    fn step(&self) -> f64 {
        self.step
    }

    fn set_step(&mut self, step: f64) -> Result<(), ProcessorError> {
        self.step = check_positive("step", step)?;
        Ok(())
    }
}

fn shift_rows(buffer: &mut Array2<f64>, newest: &Array1<f64>) {
    let m = buffer.nrows();
    for i in 0..m.saturating_sub(1) {
        let next = buffer.row(i + 1).to_owned();
        buffer.row_mut(i).assign(&next);
    }
    buffer.row_mut(m - 1).assign(newest);
}

fn shift_scalar(buffer: &mut Array1<f64>, newest: f64) {
    let m = buffer.len();
    for i in 0..m.saturating_sub(1) {
        buffer[i] = buffer[i + 1];
    }
    buffer[m - 1] = newest;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn shift_buffers_slide_toward_the_end() {
        let mut rows = Array2::zeros((3, 2));
        shift_rows(&mut rows, &array![1.0, 2.0]);
        shift_rows(&mut rows, &array![3.0, 4.0]);
        assert_eq!(rows.row(1).to_owned(), array![1.0, 2.0]);
        assert_eq!(rows.row(2).to_owned(), array![3.0, 4.0]);
        assert_eq!(rows.row(0).to_owned(), array![0.0, 0.0]);

        let mut scalars = Array1::zeros(2);
        shift_scalar(&mut scalars, 5.0);
        shift_scalar(&mut scalars, 7.0);
        assert_eq!(scalars, array![5.0, 7.0]);
    }

    #[test]
    fn lbfgs_builder_rejects_inverted_wolfe_constants() {
        let err = BackwardLbfgs::builder().wolfe(0.9, 0.5).build();
        assert!(err.is_err());
    }
}
