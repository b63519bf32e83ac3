//! Driver-owned shared state read (and partially mutated) by every strategy.
//!
//! The outer splitting iteration owns the data, the block partition, the
//! consensus point, and the per-block `(x, y, w)` arrays. A strategy's
//! `update` for block `i` reads the iteration-frozen consensus point and that
//! block's rows only, so block updates never alias each other's state.

use std::ops::Range;

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};

use crate::faer_ndarray::{fast_atv, fast_av};
use crate::loss::Loss;
use crate::processor::ProcessorError;
use crate::regularizer::Regularizer;

/// Split `0..n_rows` into `n_blocks` contiguous ranges whose lengths differ
/// by at most one.
pub fn equal_partition(n_rows: usize, n_blocks: usize) -> Result<Vec<Range<usize>>, ProcessorError> {
    if n_blocks == 0 || n_blocks > n_rows {
        return Err(ProcessorError::ShapeMismatch(format!(
            "cannot partition {n_rows} rows into {n_blocks} blocks"
        )));
    }
    let base = n_rows / n_blocks;
    let remainder = n_rows % n_blocks;
    let mut out = Vec::with_capacity(n_blocks);
    let mut start = 0;
    for block in 0..n_blocks {
        let len = base + usize::from(block < remainder);
        out.push(start..start + len);
        start += len;
    }
    Ok(out)
}

pub struct SplitContext {
    /// Design matrix, `n x (d+1)`, intercept column at index 0.
    pub design: Array2<f64>,
    /// Response vector of length `n`.
    pub response: Array1<f64>,
    /// Ordered row ranges; one block per strategy call per iteration.
    pub partition: Vec<Range<usize>>,
    /// Consensus point, recomputed by the driver once per outer iteration.
    pub hz: Array1<f64>,
    /// Per-block primal iterates, `n_blocks x (d+1)`.
    pub xdata: Array2<f64>,
    /// Per-block gradient/dual-residual vectors, `n_blocks x (d+1)`.
    pub ydata: Array2<f64>,
    /// Per-block dual variables, `n_blocks x (d+1)`.
    pub wdata: Array2<f64>,
    /// Outer iteration counter, advanced by the driver.
    pub iteration: usize,
    pub loss: Box<dyn Loss>,
    /// Regularizer whose prox runs inside strategy updates, when present.
    pub embedded: Option<Box<dyn Regularizer>>,
}

impl SplitContext {
    pub fn new(
        design: Array2<f64>,
        response: Array1<f64>,
        loss: Box<dyn Loss>,
        n_blocks: usize,
    ) -> Result<Self, ProcessorError> {
        if design.nrows() != response.len() {
            return Err(ProcessorError::ShapeMismatch(format!(
                "design has {} rows but response has {} entries",
                design.nrows(),
                response.len()
            )));
        }
        if design.ncols() == 0 {
            return Err(ProcessorError::ShapeMismatch(
                "design matrix has no columns".to_string(),
            ));
        }
        let partition = equal_partition(design.nrows(), n_blocks)?;
        let dim = design.ncols();
        Ok(SplitContext {
            hz: Array1::zeros(dim),
            xdata: Array2::zeros((n_blocks, dim)),
            ydata: Array2::zeros((n_blocks, dim)),
            wdata: Array2::zeros((n_blocks, dim)),
            design,
            response,
            partition,
            iteration: 0,
            loss,
            embedded: None,
        })
    }

    pub fn with_embedded(mut self, regularizer: Box<dyn Regularizer>) -> Self {
        self.embedded = Some(regularizer);
        self
    }

    #[inline]
    pub fn n_rows(&self) -> usize {
        self.design.nrows()
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.design.ncols()
    }

    #[inline]
    pub fn n_blocks(&self) -> usize {
        self.partition.len()
    }

    pub(crate) fn check_block(&self, block: usize) -> Result<(), ProcessorError> {
        if block < self.n_blocks() {
            Ok(())
        } else {
            Err(ProcessorError::BlockOutOfRange {
                block,
                n_blocks: self.n_blocks(),
            })
        }
    }

    #[inline]
    pub fn block_rows(&self, block: usize) -> ArrayView2<'_, f64> {
        self.design.slice(s![self.partition[block].clone(), ..])
    }

    #[inline]
    pub fn block_response(&self, block: usize) -> ArrayView1<'_, f64> {
        self.response.slice(s![self.partition[block].clone()])
    }

    /// Block-averaged loss gradient at `point`:
    /// `(1/n) A_b^T loss.derivative(A_b point, y_b)` with `n` the full row
    /// count, so per-block terms sum to the full-data gradient.
    pub fn block_gradient(&self, point: ArrayView1<f64>, block: usize) -> Array1<f64> {
        let rows = self.block_rows(block);
        let predictions = fast_av(&rows, &point);
        let g = self.loss.derivative(predictions.view(), self.block_response(block));
        let mut grad = fast_atv(&rows, &g);
        grad /= self.n_rows() as f64;
        grad
    }

    /// Stepsize of the embedded regularizer, or 1 when none is present (the
    /// identity prox has no stepsize of its own).
    pub fn embedded_step(&self) -> f64 {
        self.embedded.as_ref().map_or(1.0, |reg| reg.step())
    }

    pub fn set_embedded_step(&mut self, step: f64) {
        if let Some(reg) = self.embedded.as_mut() {
            reg.set_step(step);
        }
    }

    /// Split a trial point into the block iterate: the intercept coordinate
    /// passes through, the rest goes through the embedded prox (identity when
    /// no regularizer is embedded).
    pub fn prox_trial_point(&self, t: &Array1<f64>) -> Array1<f64> {
        match self.embedded.as_ref() {
            Some(reg) => {
                let mut x = Array1::zeros(t.len());
                x[0] = t[0];
                let proxed = reg.apply_prox(t.slice(s![1..]));
                x.slice_mut(s![1..]).assign(&proxed);
                x
            }
            None => t.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::SquaredLoss;
    use ndarray::array;

    #[test]
    fn equal_partition_covers_rows_once_with_balanced_lengths() {
        let parts = equal_partition(23, 5).unwrap();
        assert_eq!(parts.len(), 5);
        let mut covered = 0;
        let mut min_len = usize::MAX;
        let mut max_len = 0;
        for part in &parts {
            assert_eq!(part.start, covered, "blocks must be contiguous in order");
            covered = part.end;
            min_len = min_len.min(part.len());
            max_len = max_len.max(part.len());
        }
        assert_eq!(covered, 23);
        assert!(max_len - min_len <= 1);
    }

    #[test]
    fn equal_partition_rejects_degenerate_requests() {
        assert!(equal_partition(10, 0).is_err());
        assert!(equal_partition(3, 4).is_err());
    }

    #[test]
    fn block_gradient_matches_direct_formula() {
        // 4 rows, 2 blocks; squared loss gradient is A_b^T (A_b p - y_b) / n.
        let design = array![
            [1.0, 2.0],
            [1.0, -1.0],
            [1.0, 0.5],
            [1.0, 3.0],
        ];
        let response = array![1.0, 0.0, 2.0, -1.0];
        let ctx = SplitContext::new(design.clone(), response.clone(), Box::new(SquaredLoss), 2)
            .unwrap();
        let p = array![0.5, -0.25];
        for block in 0..2 {
            let rows = design.slice(s![2 * block..2 * block + 2, ..]);
            let resid = rows.dot(&p) - response.slice(s![2 * block..2 * block + 2]);
            let expected = rows.t().dot(&resid) / 4.0;
            let got = ctx.block_gradient(p.view(), block);
            assert!((&got - &expected).iter().all(|e| e.abs() < 1e-14));
        }
    }

    #[test]
    fn prox_trial_point_skips_intercept() {
        use crate::regularizer::L1;
        let design = array![[1.0, 2.0], [1.0, -1.0]];
        let response = array![1.0, 0.0];
        let ctx = SplitContext::new(design, response, Box::new(SquaredLoss), 1)
            .unwrap()
            .with_embedded(Box::new(L1::new(1.0, 0.5).unwrap()));
        let t = array![3.0, 0.3];
        let x = ctx.prox_trial_point(&t);
        assert_eq!(x[0], 3.0, "intercept must bypass the prox");
        assert!((x[1] - 0.0).abs() < 1e-15, "0.3 soft-thresholded at 0.5");
    }
}
