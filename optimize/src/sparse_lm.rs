use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use argus_core::Progress;

use crate::lm::{numeric_delta, solve_normal_equations};
use crate::{Error, Result};

/// Residual closure for one (a, b) pairing: given the two parameter blocks
/// and the term's measurement vector, writes the error vector.
pub type TermFn =
    Box<dyn Fn(&DVector<f64>, &DVector<f64>, &DVector<f64>, &mut DVector<f64>) + Send + Sync>;

/// Constraint closure for a parameter block, applied after every update to
/// pull over-parameterised representations back onto their manifold.
pub type BlockConstraint = Box<dyn Fn(&mut DVector<f64>) + Send + Sync>;

pub struct SparseLmOptions {
    pub max_iterations: usize,
    pub initial_lambda: f64,
    pub max_lambda: f64,
}

impl Default for SparseLmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 1000,
            initial_lambda: 1e-3,
            max_lambda: 1e100,
        }
    }
}

struct Block {
    para: DVector<f64>,
    trial: DVector<f64>,
    // Accumulated U (for A blocks) or V (for B blocks), and J^T e.
    uv: DMatrix<f64>,
    e: DVector<f64>,
    constrain: Option<BlockConstraint>,
}

impl Block {
    fn new(para: DVector<f64>, size: usize) -> Self {
        Self {
            trial: DVector::zeros(para.len()),
            para,
            uv: DMatrix::zeros(size, size),
            e: DVector::zeros(size),
            constrain: None,
        }
    }
}

struct Term {
    a: usize,
    b: usize,
    m: DVector<f64>,
    f: TermFn,
    covar_inv: Option<DMatrix<f64>>,
    err: DVector<f64>,
    err_new: DVector<f64>,
    a_jac: DMatrix<f64>,
    b_jac: DMatrix<f64>,
    w: DMatrix<f64>,
    y: DMatrix<f64>,
}

/// Sparse Levenberg-Marquardt for bipartite problems, otherwise known as
/// bundle adjustment.
///
/// The parameters split into two lists of fixed-size blocks: list A is
/// expected to be small (cameras), list B large (points). Each residual term
/// couples exactly one block from each list, which makes the Hessian
/// arrowhead-shaped; the B-block diagonal is inverted blockwise and the
/// Schur complement over the A blocks is the only dense system solved. For
/// problems where a dense Jacobian would fit comfortably in memory, plain
/// [`crate::levenberg_marquardt`] is simpler and no slower.
pub struct SparseLm {
    size_a: usize,
    size_b: usize,
    size_err: usize,
    para_a: Vec<Block>,
    para_b: Vec<Block>,
    terms: Vec<Term>,
    keys: HashSet<(usize, usize)>,
    opts: SparseLmOptions,
}

impl SparseLm {
    /// `size_a`, `size_b`, `size_err` fix the block and error vector sizes;
    /// every block and term added later must agree with them.
    pub fn new(size_a: usize, size_b: usize, size_err: usize) -> Self {
        Self {
            size_a,
            size_b,
            size_err,
            para_a: Vec::new(),
            para_b: Vec::new(),
            terms: Vec::new(),
            keys: HashSet::new(),
            opts: SparseLmOptions::default(),
        }
    }

    pub fn with_options(mut self, opts: SparseLmOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Adds a block to the first list, returning its index.
    pub fn add_block_a(&mut self, para: DVector<f64>) -> Result<usize> {
        if para.len() != self.size_a {
            return Err(Error::DimensionMismatch(format!(
                "A block has {} parameters, expected {}",
                para.len(),
                self.size_a
            )));
        }
        self.para_a.push(Block::new(para, self.size_a));
        Ok(self.para_a.len() - 1)
    }

    /// Adds a block to the second list, returning its index.
    pub fn add_block_b(&mut self, para: DVector<f64>) -> Result<usize> {
        if para.len() != self.size_b {
            return Err(Error::DimensionMismatch(format!(
                "B block has {} parameters, expected {}",
                para.len(),
                self.size_b
            )));
        }
        self.para_b.push(Block::new(para, self.size_b));
        Ok(self.para_b.len() - 1)
    }

    /// Attaches a residual term to the (a, b) block pair. Pairs without data
    /// are simply never added; adding the same pair twice is an error.
    pub fn add_term(&mut self, a: usize, b: usize, m: DVector<f64>, f: TermFn) -> Result<()> {
        if a >= self.para_a.len() || b >= self.para_b.len() {
            return Err(Error::InvalidParameter(format!(
                "term references block ({}, {}) outside ({}, {})",
                a,
                b,
                self.para_a.len(),
                self.para_b.len()
            )));
        }
        if !self.keys.insert((a, b)) {
            return Err(Error::InvalidParameter(format!(
                "duplicate term for block pair ({}, {})",
                a, b
            )));
        }
        self.terms.push(Term {
            a,
            b,
            m,
            f,
            covar_inv: None,
            err: DVector::zeros(self.size_err),
            err_new: DVector::zeros(self.size_err),
            a_jac: DMatrix::zeros(self.size_err, self.size_a),
            b_jac: DMatrix::zeros(self.size_err, self.size_b),
            w: DMatrix::zeros(self.size_a, self.size_b),
            y: DMatrix::zeros(self.size_a, self.size_b),
        });
        Ok(())
    }

    /// Sets the measurement covariance for an existing term; identity is
    /// assumed otherwise. Stored inverted, so it must be invertible.
    pub fn set_covariance(&mut self, a: usize, b: usize, covar: DMatrix<f64>) -> Result<()> {
        if covar.nrows() != self.size_err || covar.ncols() != self.size_err {
            return Err(Error::DimensionMismatch(format!(
                "covariance is {}x{}, error size is {}",
                covar.nrows(),
                covar.ncols(),
                self.size_err
            )));
        }
        let inv = covar
            .try_inverse()
            .ok_or_else(|| Error::NumericalFailure("singular covariance".into()))?;
        let term = self
            .terms
            .iter_mut()
            .find(|t| t.a == a && t.b == b)
            .ok_or_else(|| Error::InvalidParameter(format!("no term for pair ({}, {})", a, b)))?;
        term.covar_inv = Some(inv);
        Ok(())
    }

    pub fn set_constraint_a(&mut self, a: usize, c: BlockConstraint) {
        self.para_a[a].constrain = Some(c);
    }

    pub fn set_constraint_b(&mut self, b: usize, c: BlockConstraint) {
        self.para_b[b].constrain = Some(c);
    }

    pub fn block_a(&self, index: usize) -> &DVector<f64> {
        &self.para_a[index].para
    }

    pub fn block_b(&self, index: usize) -> &DVector<f64> {
        &self.para_b[index].para
    }

    /// Runs the minimisation, returning the final residual 2-norm.
    pub fn run(&mut self, prog: &mut Progress) -> Result<f64> {
        if self.terms.is_empty() {
            return Err(Error::InvalidParameter("no residual terms added".into()));
        }

        // Term indices grouped per A block (sorted by b, so the off-diagonal
        // Schur walk can merge two lists) and per B block.
        let mut by_a: Vec<Vec<usize>> = vec![Vec::new(); self.para_a.len()];
        let mut by_b: Vec<Vec<usize>> = vec![Vec::new(); self.para_b.len()];
        for (i, t) in self.terms.iter().enumerate() {
            by_a[t.a].push(i);
            by_b[t.b].push(i);
        }
        for list in &mut by_a {
            list.sort_by_key(|&i| self.terms[i].b);
        }

        // Starting errors and residual.
        let mut residual = 0.0;
        for t in &mut self.terms {
            (t.f)(&self.para_a[t.a].para, &self.para_b[t.b].para, &t.m, &mut t.err);
            residual += t.err.norm_squared();
        }

        prog.push();
        let mut lambda = self.opts.initial_lambda;
        for k in 0..self.opts.max_iterations {
            prog.report(k as u64, (k + 1) as u64);

            self.make_jacobians();
            self.accumulate(&by_a, &by_b);

            let mut improved = false;
            while lambda <= self.opts.max_lambda {
                self.make_trial(&by_a, &by_b, lambda)?;

                let mut new_residual = 0.0;
                for t in &mut self.terms {
                    (t.f)(
                        &self.para_a[t.a].trial,
                        &self.para_b[t.b].trial,
                        &t.m,
                        &mut t.err_new,
                    );
                    new_residual += t.err_new.norm_squared();
                }

                if new_residual < residual {
                    residual = new_residual;
                    for blk in self.para_a.iter_mut().chain(self.para_b.iter_mut()) {
                        std::mem::swap(&mut blk.para, &mut blk.trial);
                    }
                    for t in &mut self.terms {
                        std::mem::swap(&mut t.err, &mut t.err_new);
                    }
                    lambda *= 0.1;
                    if lambda == 0.0 {
                        lambda = 1e-9;
                    }
                    improved = true;
                    tracing::debug!(iteration = k, residual = residual.sqrt(), "sparse lm step");
                    break;
                }
                lambda *= 10.0;
            }
            if !improved {
                break;
            }
        }
        prog.pop();

        Ok(residual.sqrt())
    }

    /// Numeric forward-difference Jacobians for every term, both blocks.
    fn make_jacobians(&mut self) {
        let para_a = &self.para_a;
        let para_b = &self.para_b;
        let size_err = self.size_err;
        self.terms.par_iter_mut().for_each(|t| {
            let pa = &para_a[t.a].para;
            let pb = &para_b[t.b].para;
            let mut probe = DVector::zeros(size_err);

            let mut pa_t = pa.clone();
            for c in 0..pa.len() {
                let delta = numeric_delta(pa[c]);
                pa_t[c] = pa[c] + delta;
                (t.f)(&pa_t, pb, &t.m, &mut probe);
                let inv = 1.0 / delta;
                for r in 0..size_err {
                    t.a_jac[(r, c)] = (probe[r] - t.err[r]) * inv;
                }
                pa_t[c] = pa[c];
            }

            let mut pb_t = pb.clone();
            for c in 0..pb.len() {
                let delta = numeric_delta(pb[c]);
                pb_t[c] = pb[c] + delta;
                (t.f)(pa, &pb_t, &t.m, &mut probe);
                let inv = 1.0 / delta;
                for r in 0..size_err {
                    t.b_jac[(r, c)] = (probe[r] - t.err[r]) * inv;
                }
                pb_t[c] = pb[c];
            }
        });
    }

    /// Everything that does not depend on lambda: the U and V block sums,
    /// the gradient pieces J^T e, and W per term.
    fn accumulate(&mut self, by_a: &[Vec<usize>], by_b: &[Vec<usize>]) {
        for (i, blk) in self.para_a.iter_mut().enumerate() {
            blk.uv.fill(0.0);
            blk.e.fill(0.0);
            for &ti in &by_a[i] {
                let t = &self.terms[ti];
                match &t.covar_inv {
                    Some(ci) => {
                        let weighted = t.a_jac.transpose() * ci;
                        blk.uv += &weighted * &t.a_jac;
                        blk.e += weighted * &t.err;
                    }
                    None => {
                        blk.uv += t.a_jac.transpose() * &t.a_jac;
                        blk.e += t.a_jac.transpose() * &t.err;
                    }
                }
            }
        }

        for (i, blk) in self.para_b.iter_mut().enumerate() {
            blk.uv.fill(0.0);
            blk.e.fill(0.0);
            for &ti in &by_b[i] {
                let t = &self.terms[ti];
                match &t.covar_inv {
                    Some(ci) => {
                        let weighted = t.b_jac.transpose() * ci;
                        blk.uv += &weighted * &t.b_jac;
                        blk.e += weighted * &t.err;
                    }
                    None => {
                        blk.uv += t.b_jac.transpose() * &t.b_jac;
                        blk.e += t.b_jac.transpose() * &t.err;
                    }
                }
            }
        }

        for t in &mut self.terms {
            t.w = match &t.covar_inv {
                Some(ci) => t.a_jac.transpose() * ci * &t.b_jac,
                None => t.a_jac.transpose() * &t.b_jac,
            };
        }
    }

    fn augmented_v_inverse(&self, b: usize, lambda: f64) -> Result<DMatrix<f64>> {
        let mut v = self.para_b[b].uv.clone();
        for i in 0..self.size_b {
            v[(i, i)] *= 1.0 + lambda;
        }
        v.try_inverse()
            .ok_or_else(|| Error::NumericalFailure("singular augmented V block".into()))
    }

    /// One trial update for the given lambda: Schur complement over the A
    /// blocks, dense solve, back-substitution for the B blocks.
    fn make_trial(&mut self, by_a: &[Vec<usize>], by_b: &[Vec<usize>], lambda: f64) -> Result<()> {
        let na = self.para_a.len();
        let sa = self.size_a;

        // Y = W (V*)^-1 per term.
        for b in 0..self.para_b.len() {
            let v_inv = self.augmented_v_inverse(b, lambda)?;
            for &ti in &by_b[b] {
                let t = &mut self.terms[ti];
                t.y = &t.w * &v_inv;
            }
        }

        // S, block (br, bc): diagonal carries augmented U, both sides
        // subtract Y W^T over the B blocks the two A blocks share.
        let mut s = DMatrix::zeros(na * sa, na * sa);
        for br in 0..na {
            for bc in 0..na {
                if br == bc {
                    let mut block = self.para_a[br].uv.clone();
                    for i in 0..sa {
                        block[(i, i)] *= 1.0 + lambda;
                    }
                    for &ti in &by_a[br] {
                        let t = &self.terms[ti];
                        block -= &t.y * t.w.transpose();
                    }
                    s.view_mut((br * sa, bc * sa), (sa, sa)).copy_from(&block);
                } else {
                    // Both lists are sorted by b: a single merge pass finds
                    // the shared B blocks.
                    let (ly, lw) = (&by_a[br], &by_a[bc]);
                    let mut block = DMatrix::zeros(sa, sa);
                    let mut any = false;
                    let (mut i, mut j) = (0, 0);
                    while i < ly.len() && j < lw.len() {
                        let tb_y = self.terms[ly[i]].b;
                        let tb_w = self.terms[lw[j]].b;
                        match tb_y.cmp(&tb_w) {
                            std::cmp::Ordering::Equal => {
                                block -= &self.terms[ly[i]].y * self.terms[lw[j]].w.transpose();
                                any = true;
                                i += 1;
                                j += 1;
                            }
                            std::cmp::Ordering::Less => i += 1,
                            std::cmp::Ordering::Greater => j += 1,
                        }
                    }
                    if any {
                        s.view_mut((br * sa, bc * sa), (sa, sa)).copy_from(&block);
                    }
                }
            }
        }

        // Reduced gradient: e_a - Y e_b per A block.
        let mut es = DVector::zeros(na * sa);
        for (i, blk) in self.para_a.iter().enumerate() {
            let mut seg = blk.e.clone();
            for &ti in &by_a[i] {
                let t = &self.terms[ti];
                seg -= &t.y * &self.para_b[t.b].e;
            }
            es.rows_mut(i * sa, sa).copy_from(&seg);
        }

        // Gauss-Newton sign: delta = -(S)^-1 es.
        let delta_a = -solve_normal_equations(s, &es)?;

        // B deltas by back-substitution, then apply both lists.
        for b in 0..self.para_b.len() {
            let mut rhs = -self.para_b[b].e.clone();
            for &ti in &by_b[b] {
                let t = &self.terms[ti];
                let da = delta_a.rows(t.a * sa, sa);
                rhs -= t.w.transpose() * da;
            }
            let v_inv = self.augmented_v_inverse(b, lambda)?;
            let delta_b = v_inv * rhs;
            let blk = &mut self.para_b[b];
            blk.trial = &blk.para + delta_b;
            if let Some(c) = &blk.constrain {
                c(&mut blk.trial);
            }
        }

        for (i, blk) in self.para_a.iter_mut().enumerate() {
            blk.trial = &blk.para + delta_a.rows(i * sa, sa);
            if let Some(c) = &blk.constrain {
                c(&mut blk.trial);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A small separable quadratic: every term wants a[0] + b[0] to equal the
    // measurement. With one shared A block and several B blocks the solver
    // has to route everything through the Schur complement.
    fn offset_term() -> TermFn {
        Box::new(|a, b, m, err| {
            err[0] = a[0] + b[0] - m[0];
        })
    }

    #[test]
    fn test_two_block_quadratic() {
        let mut slm = SparseLm::new(1, 1, 1);
        let a = slm.add_block_a(DVector::from_vec(vec![0.0])).unwrap();
        for (i, target) in [5.0f64, 7.0, 9.0].iter().enumerate() {
            let b = slm.add_block_b(DVector::from_vec(vec![i as f64])).unwrap();
            slm.add_term(a, b, DVector::from_vec(vec![*target]), offset_term())
                .unwrap();
        }
        let res = slm.run(&mut Progress::silent()).unwrap();
        assert!(res < 1e-6, "residual {}", res);
        // The split between a and each b is unconstrained, but the sums must
        // match the measurements.
        let a_val = slm.block_a(0)[0];
        for (i, target) in [5.0f64, 7.0, 9.0].iter().enumerate() {
            assert!((a_val + slm.block_b(i)[0] - target).abs() < 1e-5);
        }
    }

    #[test]
    fn test_duplicate_pair_rejected() {
        let mut slm = SparseLm::new(1, 1, 1);
        let a = slm.add_block_a(DVector::zeros(1)).unwrap();
        let b = slm.add_block_b(DVector::zeros(1)).unwrap();
        slm.add_term(a, b, DVector::zeros(1), offset_term()).unwrap();
        assert!(slm.add_term(a, b, DVector::zeros(1), offset_term()).is_err());
    }

    #[test]
    fn test_block_size_checked() {
        let mut slm = SparseLm::new(2, 3, 1);
        assert!(slm.add_block_a(DVector::zeros(3)).is_err());
        assert!(slm.add_block_b(DVector::zeros(3)).is_ok());
    }

    #[test]
    fn test_run_without_terms_is_error() {
        let mut slm = SparseLm::new(1, 1, 1);
        slm.add_block_a(DVector::zeros(1)).unwrap();
        assert!(slm.run(&mut Progress::silent()).is_err());
    }
}
