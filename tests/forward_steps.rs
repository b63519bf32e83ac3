use ndarray::{s, Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use projsplit::{
    Forward1Backtrack, Forward1Fixed, Forward2Affine, Forward2Backtrack, Forward2Fixed,
    LossProcessor, SplitContext, SquaredLoss, L1,
};

fn random_design(seed: u64, n: usize, cols: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut a = Array2::<f64>::zeros((n, cols));
    for i in 0..n {
        a[[i, 0]] = 1.0;
        for j in 1..cols {
            a[[i, j]] = rng.random_range(-2.0..2.0);
        }
    }
    a
}

fn random_vector(seed: u64, len: usize) -> Array1<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array1::from_iter((0..len).map(|_| rng.random_range(-1.0..1.0)))
}

fn squared_loss_context(seed: u64, n: usize, cols: usize, n_blocks: usize) -> SplitContext {
    let design = random_design(seed, n, cols);
    let response = random_vector(seed.wrapping_add(1), n);
    let mut ctx = SplitContext::new(design, response, Box::new(SquaredLoss), n_blocks)
        .expect("context construction");
    ctx.hz = random_vector(seed.wrapping_add(2), cols);
    for block in 0..n_blocks {
        let w = random_vector(seed.wrapping_add(3 + block as u64), cols);
        ctx.wdata.row_mut(block).assign(&w);
    }
    ctx
}

/// Block-averaged squared-loss gradient recomputed directly in the test.
fn reference_gradient(ctx: &SplitContext, point: &Array1<f64>, block: usize) -> Array1<f64> {
    let rows = ctx.design.slice(s![ctx.partition[block].clone(), ..]);
    let resp = ctx.response.slice(s![ctx.partition[block].clone()]);
    let resid = rows.dot(point) - &resp;
    rows.t().dot(&resid) / ctx.design.nrows() as f64
}

fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    (a - b).iter().fold(0.0f64, |acc, e| acc.max(e.abs()))
}

#[test]
fn forward2fixed_without_regularizer_matches_closed_form() {
    let rho = 0.3;
    let mut ctx = squared_loss_context(5, 12, 4, 2);
    let mut processor = Forward2Fixed::new(rho).unwrap();
    processor.initialize(&mut ctx).unwrap();
    for block in 0..2 {
        let w = ctx.wdata.row(block).to_owned();
        let grad_hz = reference_gradient(&ctx, &ctx.hz.to_owned(), block);
        processor.update(&mut ctx, block).unwrap();

        // Identity prox: x is exactly the forward point, y its gradient.
        let expected_x = &ctx.hz - &(rho * (&grad_hz - &w));
        let x = ctx.xdata.row(block).to_owned();
        assert!(max_abs_diff(&x, &expected_x) < 1e-12);
        let expected_y = reference_gradient(&ctx, &x, block);
        assert!(max_abs_diff(&ctx.ydata.row(block).to_owned(), &expected_y) < 1e-12);
    }
}

#[test]
fn forward2fixed_embedded_prox_skips_intercept() {
    let rho = 0.5;
    let mut ctx = squared_loss_context(15, 10, 3, 1)
        .with_embedded(Box::new(L1::new(1.0, 0.4).unwrap()));
    let mut processor = Forward2Fixed::new(rho).unwrap();
    processor.initialize(&mut ctx).unwrap();

    let w = ctx.wdata.row(0).to_owned();
    let grad_hz = reference_gradient(&ctx, &ctx.hz.to_owned(), 0);
    let t = &ctx.hz - &(rho * (&grad_hz - &w));
    processor.update(&mut ctx, 0).unwrap();

    let x = ctx.xdata.row(0).to_owned();
    assert_eq!(x[0], t[0], "intercept must bypass the prox");
    // Soft threshold at nu * step = 0.4 on the feature coordinates.
    for j in 1..3 {
        let expected = if t[j] > 0.4 {
            t[j] - 0.4
        } else if t[j] < -0.4 {
            t[j] + 0.4
        } else {
            0.0
        };
        assert!((x[j] - expected).abs() < 1e-12);
    }
    // y closes the update relation (t - x)/rho + grad(x).
    let expected_y = (&t - &x) / rho + reference_gradient(&ctx, &x, 0);
    assert!(max_abs_diff(&ctx.ydata.row(0).to_owned(), &expected_y) < 1e-12);
}

#[test]
fn forward2backtrack_accepted_iterate_satisfies_termination_test() {
    let delta = 1.0;
    let mut ctx = squared_loss_context(25, 20, 5, 2);
    let mut processor = Forward2Backtrack::new(8.0, delta, 0.7, 1.0, None).unwrap();
    processor.initialize(&mut ctx).unwrap();
    for block in 0..2 {
        processor.update(&mut ctx, block).unwrap();
        let x = ctx.xdata.row(block).to_owned();
        let y = ctx.ydata.row(block).to_owned();
        let w = ctx.wdata.row(block).to_owned();
        let lhs = &ctx.hz - &x;
        let rhs = &y - &w;
        assert!(
            lhs.dot(&rhs) >= delta * lhs.dot(&lhs) - 1e-10,
            "block {block}: acceptance inequality must hold at termination"
        );
        assert!(processor.block_step(block) <= 8.0);
    }
}

#[test]
fn forward2backtrack_grows_stepsize_on_schedule() {
    let mut ctx = squared_loss_context(35, 12, 3, 1);
    // Benign problem with a small initial step: no backtracking happens and
    // the growth schedule is observable directly.
    let mut processor = Forward2Backtrack::new(1e-3, 1.0, 0.7, 2.0, Some(1)).unwrap();
    processor.initialize(&mut ctx).unwrap();
    ctx.iteration = 1;
    processor.update(&mut ctx, 0).unwrap();
    assert!((processor.block_step(0) - 2e-3).abs() < 1e-15);
}

#[test]
fn forward2affine_matches_closed_form_stepsize() {
    let delta = 1.0;
    let mut ctx = squared_loss_context(45, 14, 4, 1);
    let mut processor = Forward2Affine::new(delta).unwrap();
    processor.initialize(&mut ctx).unwrap();

    let w = ctx.wdata.row(0).to_owned();
    let grad_hz = reference_gradient(&ctx, &ctx.hz.to_owned(), 0);
    let residual = &grad_hz - &w;
    let rows = ctx.design.slice(s![ctx.partition[0].clone(), ..]);
    let affine_part = rows.t().dot(&rows.dot(&residual)) / ctx.design.nrows() as f64;
    let norm_sq = residual.dot(&residual);
    let step = norm_sq / (delta * norm_sq + residual.dot(&affine_part));

    processor.update(&mut ctx, 0).unwrap();
    let expected_x = &ctx.hz - &(step * &residual);
    let expected_y = &grad_hz - &(step * &affine_part);
    assert!(max_abs_diff(&ctx.xdata.row(0).to_owned(), &expected_x) < 1e-12);
    assert!(max_abs_diff(&ctx.ydata.row(0).to_owned(), &expected_y) < 1e-12);
}

#[test]
fn forward2affine_update_is_idempotent() {
    let mut ctx = squared_loss_context(55, 16, 4, 2);
    let mut processor = Forward2Affine::new(1.0).unwrap();
    processor.initialize(&mut ctx).unwrap();

    processor.update(&mut ctx, 1).unwrap();
    let first_x = ctx.xdata.row(1).to_owned();
    let first_y = ctx.ydata.row(1).to_owned();
    // Same Hz and w, no outer-iteration advance: the pair must not move.
    processor.update(&mut ctx, 1).unwrap();
    assert_eq!(ctx.xdata.row(1).to_owned(), first_x);
    assert_eq!(ctx.ydata.row(1).to_owned(), first_y);
}

#[test]
fn forward2affine_zero_residual_keeps_the_consensus_point() {
    let mut ctx = squared_loss_context(95, 12, 3, 1);
    // w = grad f(Hz) makes the residual exactly zero.
    let grad_hz = ctx.block_gradient(ctx.hz.view(), 0);
    ctx.wdata.row_mut(0).assign(&grad_hz);

    let mut processor = Forward2Affine::new(1.0).unwrap();
    processor.initialize(&mut ctx).unwrap();
    processor.update(&mut ctx, 0).unwrap();
    assert_eq!(ctx.xdata.row(0).to_owned(), ctx.hz);
    assert_eq!(ctx.ydata.row(0).to_owned(), grad_hz);
}

#[test]
fn forward1fixed_blends_previous_iterate_with_consensus() {
    let rho = 0.2;
    let alpha = 0.1;
    let mut ctx = squared_loss_context(65, 12, 3, 2);
    let mut processor = Forward1Fixed::new(rho, alpha).unwrap();
    processor.initialize(&mut ctx).unwrap();

    // xdata starts at zero, so the cached gradient is grad(0) and the first
    // update reads t = alpha Hz - rho (grad(0) - w).
    for block in 0..2 {
        let w = ctx.wdata.row(block).to_owned();
        let grad0 = reference_gradient(&ctx, &Array1::zeros(3), block);
        let t = alpha * &ctx.hz - &(rho * (&grad0 - &w));
        processor.update(&mut ctx, block).unwrap();
        let x = ctx.xdata.row(block).to_owned();
        assert!(max_abs_diff(&x, &t) < 1e-12);
        let expected_y = reference_gradient(&ctx, &x, block);
        assert!(max_abs_diff(&ctx.ydata.row(block).to_owned(), &expected_y) < 1e-12);
    }
}

#[test]
fn forward1backtrack_seeds_reference_points_at_initialize() {
    let mut ctx = squared_loss_context(75, 12, 3, 2);
    let mut processor = Forward1Backtrack::new(1.0, 0.1, 0.7, 1.0, None).unwrap();
    processor.initialize(&mut ctx).unwrap();
    for block in 0..2 {
        // Identity prox at the origin: theta_hat = 0, w_hat = grad(0).
        assert!(ctx.xdata.row(block).iter().all(|v| *v == 0.0));
        let grad0 = reference_gradient(&ctx, &Array1::zeros(3), block);
        assert!(max_abs_diff(&ctx.ydata.row(block).to_owned(), &grad0) < 1e-12);
    }
}

#[test]
fn forward1backtrack_accepted_step_closes_update_relation() {
    let alpha = 0.1;
    let mut ctx = squared_loss_context(85, 16, 4, 1);
    let mut processor = Forward1Backtrack::new(2.0, alpha, 0.7, 1.0, None).unwrap();
    processor.initialize(&mut ctx).unwrap();

    let x_old = ctx.xdata.row(0).to_owned();
    let y_init = ctx.ydata.row(0).to_owned();
    let w = ctx.wdata.row(0).to_owned();
    ctx.iteration = 1;
    processor.update(&mut ctx, 0).unwrap();

    // With the identity prox, x = t1 - rho t2 for the accepted stepsize,
    // where t2 is the cached gradient minus w.
    let rho = processor.block_step(0);
    let t1 = (1.0 - alpha) * &x_old + alpha * &ctx.hz;
    let t2 = &y_init - &w;
    let expected_x = &t1 - &(rho * &t2);
    let x = ctx.xdata.row(0).to_owned();
    assert!(max_abs_diff(&x, &expected_x) < 1e-12);
    let expected_y = reference_gradient(&ctx, &x, 0);
    assert!(max_abs_diff(&ctx.ydata.row(0).to_owned(), &expected_y) < 1e-12);
}
