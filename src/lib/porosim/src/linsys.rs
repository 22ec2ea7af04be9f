//! Block-CSR linear system feeding the solver back-end.
//!
//! Rows are local elements in order [interior cells | this rank's open
//! wells]; the diagonal block is always the first entry of a row. Columns
//! use the same local numbering, with ghost cell `g` referenced as
//! `g + num_open_wells`, and are translated to the stable global numbering
//! right before the solve.
//!
//! The back-end contract follows the external-solver interface: `ia` row
//! pointers, `ja` global column indices, block values, rhs, solution slot,
//! and the rank's global row range. The built-in `BsrBicgstab` implements it
//! with a block-Jacobi preconditioned BiCGStab whose matrix-vector products
//! halo-exchange ghost entries.

use crate::domain::Domain;
use nalgebra::DMatrix;
use sprs::{CsMat, TriMatI};
use std::collections::HashMap;
use tracing::warn;

pub struct LinearSystem {
    block_dim: usize,
    dim: usize,
    col_id: Vec<Vec<usize>>,
    val: Vec<Vec<f64>>,
    b: Vec<f64>,
    u: Vec<f64>,
}

impl LinearSystem {
    pub fn new(max_dim: usize, block_dim: usize) -> Self {
        LinearSystem {
            block_dim,
            dim: 0,
            col_id: vec![Vec::new(); max_dim],
            val: vec![Vec::new(); max_dim],
            b: vec![0.0; max_dim * block_dim],
            u: vec![0.0; max_dim * block_dim],
        }
    }

    pub fn block_dim(&self) -> usize {
        self.block_dim
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn add_dim(&mut self, n: usize) -> usize {
        self.dim += n;
        self.dim
    }

    fn bsize(&self) -> usize {
        self.block_dim * self.block_dim
    }

    /// Push the diagonal block, which is always the first entry of a row.
    pub fn new_diag(&mut self, n: usize, block: &[f64]) {
        debug_assert!(self.col_id[n].is_empty(), "diagonal must come first");
        self.col_id[n].push(n);
        self.val[n].extend_from_slice(block);
    }

    pub fn add_diag(&mut self, n: usize, block: &[f64]) {
        debug_assert!(!self.col_id[n].is_empty());
        let bsize = self.bsize();
        for (v, a) in self.val[n][..bsize].iter_mut().zip(block) {
            *v += a;
        }
    }

    pub fn new_off_diag(&mut self, n: usize, col: usize, block: &[f64]) {
        debug_assert!(!self.col_id[n].is_empty(), "diagonal must come first");
        self.col_id[n].push(col);
        self.val[n].extend_from_slice(block);
    }

    pub fn add_rhs(&mut self, n: usize, vals: &[f64]) {
        let bd = self.block_dim;
        for (i, v) in vals.iter().enumerate() {
            self.b[n * bd + i] += v;
        }
    }

    /// Copy a full right-hand side (the negated residual).
    pub fn assemble_rhs_copy(&mut self, rhs: &[f64]) {
        self.b[..rhs.len()].copy_from_slice(rhs);
    }

    pub fn solution(&self) -> &[f64] {
        &self.u
    }

    pub fn clear(&mut self) {
        for r in 0..self.dim {
            self.col_id[r].clear();
            self.val[r].clear();
        }
        self.b.fill(0.0);
        self.u.fill(0.0);
        self.dim = 0;
    }

    /// Translate to CSR with global column ids and hand off to the back-end.
    /// Returns the back-end status (iterations, or negative on failure).
    pub fn solve(
        &mut self,
        solver: &mut dyn LinearSolver,
        domain: &mut Domain,
        n_act_well: usize,
    ) -> i32 {
        let gi = domain.cal_global_index(n_act_well).to_vec();
        let global_begin = gi[0];
        let global_end = gi[self.dim - 1];

        let mut ia = Vec::with_capacity(self.dim + 1);
        let mut ja: Vec<u64> = Vec::new();
        let mut vals: Vec<f64> = Vec::new();
        ia.push(0usize);
        for r in 0..self.dim {
            // interior cells and wells map straight through; ghost columns
            // were emitted as g + n_act_well, which is their slot in the
            // global numbering
            for &c in &self.col_id[r] {
                ja.push(gi[c]);
            }
            vals.extend_from_slice(&self.val[r]);
            ia.push(ja.len());
        }

        let ctx = SolveCtx {
            domain,
            n_act_well,
            global_begin,
            global_end,
        };
        solver.solve(&ia, &ja, &vals, &self.b[..self.dim * self.block_dim], {
            // SAFETY-free split: u is disjoint from the other borrows
            let dim = self.dim * self.block_dim;
            &mut self.u[..dim]
        }, &ctx)
    }
}

pub struct SolveCtx<'a> {
    pub domain: &'a Domain,
    pub n_act_well: usize,
    pub global_begin: u64,
    pub global_end: u64,
}

/// External-solver contract: block dimension is fixed at construction; each
/// call receives one assembled system. Returns the iteration count, or a
/// negative status on failure.
pub trait LinearSolver: Send {
    fn block_dim(&self) -> usize;
    fn solve(
        &mut self,
        ia: &[usize],
        ja: &[u64],
        vals: &[f64],
        b: &[f64],
        x: &mut [f64],
        ctx: &SolveCtx,
    ) -> i32;
}

/// Block-Jacobi preconditioned BiCGStab over the distributed block-CSR
/// matrix. Ghost column values are refreshed by a halo exchange inside
/// every matrix-vector product; dot products are allreduce sums.
pub struct BsrBicgstab {
    block_dim: usize,
    tol: f64,
    max_iter: usize,
}

impl BsrBicgstab {
    pub fn new(block_dim: usize) -> Self {
        BsrBicgstab {
            block_dim,
            tol: 1e-8,
            max_iter: 500,
        }
    }

    pub fn with_tol(block_dim: usize, tol: f64, max_iter: usize) -> Self {
        BsrBicgstab {
            block_dim,
            tol,
            max_iter,
        }
    }
}

struct DistMat<'a> {
    /// local scalar matrix over the extended column space
    /// [owned rows | ghost cells], blocks flattened
    mat: CsMat<f64>,
    bd: usize,
    n_owned: usize,
    ctx: &'a SolveCtx<'a>,
    /// inverted diagonal blocks for the block-Jacobi preconditioner
    dinv: Vec<DMatrix<f64>>,
}

impl<'a> DistMat<'a> {
    fn new(ia: &[usize], ja: &[u64], vals: &[f64], bd: usize, ctx: &'a SolveCtx<'a>) -> Self {
        let nrow = ia.len() - 1;
        let dom = ctx.domain;
        let mut ghost_of = HashMap::new();
        let gi = dom.global_index();
        for g in dom.num_interior..dom.num_local {
            // ghost cell g maps to extended column nrow + (g - num_interior)
            ghost_of.insert(gi[g + ctx.n_act_well], nrow + g - dom.num_interior);
        }
        let ncol_ext = nrow + dom.num_ghost;

        let mut tri = TriMatI::<f64, usize>::new((nrow * bd, ncol_ext * bd));
        let mut dinv = Vec::with_capacity(nrow);
        for r in 0..nrow {
            for k in ia[r]..ia[r + 1] {
                let g = ja[k];
                let c = if g >= ctx.global_begin && g <= ctx.global_end {
                    (g - ctx.global_begin) as usize
                } else {
                    ghost_of[&g]
                };
                let blk = &vals[k * bd * bd..(k + 1) * bd * bd];
                for i in 0..bd {
                    for j in 0..bd {
                        tri.add_triplet(r * bd + i, c * bd + j, blk[i * bd + j]);
                    }
                }
                if k == ia[r] {
                    // diagonal block leads its row
                    let m = DMatrix::from_row_slice(bd, bd, blk);
                    dinv.push(m.try_inverse().unwrap_or_else(|| DMatrix::identity(bd, bd)));
                }
            }
        }
        let mat: CsMat<f64> = tri.to_csr();
        DistMat {
            mat,
            bd,
            n_owned: nrow * bd,
            ctx,
            dinv,
        }
    }

    /// y = A·x, with x given on local rows. Ghost values are fetched from
    /// the owning ranks through the cell-array halo exchange, then appended
    /// to the extended column vector.
    fn matvec(&self, x: &[f64], y: &mut [f64]) {
        let bd = self.bd;
        let dom = self.ctx.domain;
        let nbi = dom.num_interior;
        // cell-indexed scratch with ghost tail
        let mut xc = vec![0.0; dom.num_local * bd];
        xc[..nbi * bd].copy_from_slice(&x[..nbi * bd]);
        if !dom.send_element.is_empty() {
            dom.exchange_f64(&mut xc, bd);
        }
        let mut x_ext = Vec::with_capacity(self.n_owned + dom.num_ghost * bd);
        x_ext.extend_from_slice(x);
        x_ext.extend_from_slice(&xc[nbi * bd..]);

        for (row, vec) in self.mat.outer_iterator().enumerate() {
            let mut sum = 0.0;
            for (col, &val) in vec.indices().iter().zip(vec.data().iter()) {
                sum += val * x_ext[*col];
            }
            y[row] = sum;
        }
    }

    fn dot(&self, a: &[f64], b: &[f64]) -> f64 {
        let local: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        self.ctx.domain.comm.allreduce_sum_f64(local)
    }
}

fn apply_pre(dinv: &[DMatrix<f64>], r: &[f64], z: &mut [f64], bd: usize) {
    for (n, m) in dinv.iter().enumerate() {
        for i in 0..bd {
            let mut sum = 0.0;
            for j in 0..bd {
                sum += m[(i, j)] * r[n * bd + j];
            }
            z[n * bd + i] = sum;
        }
    }
}

impl LinearSolver for BsrBicgstab {
    fn block_dim(&self) -> usize {
        self.block_dim
    }

    fn solve(
        &mut self,
        ia: &[usize],
        ja: &[u64],
        vals: &[f64],
        b: &[f64],
        x: &mut [f64],
        ctx: &SolveCtx,
    ) -> i32 {
        let bd = self.block_dim;
        let mat = DistMat::new(ia, ja, vals, bd, ctx);
        let n = b.len();
        let dinv = &mat.dinv;

        x.fill(0.0);
        let mut r = b.to_vec();
        let rhat = r.clone();
        let b_norm = mat.dot(&r, &r).sqrt();
        if b_norm < 1e-300 {
            return 0;
        }

        let (mut rho, mut alpha, mut omega) = (1.0, 1.0, 1.0);
        let mut v = vec![0.0; n];
        let mut p = vec![0.0; n];
        let mut phat = vec![0.0; n];
        let mut shat = vec![0.0; n];
        let mut t = vec![0.0; n];

        for it in 1..=self.max_iter {
            let rho1 = mat.dot(&rhat, &r);
            if rho1.abs() < 1e-300 {
                warn!(iter = it, "BiCGStab breakdown (rho)");
                return -(it as i32);
            }
            let beta = (rho1 / rho) * (alpha / omega);
            for i in 0..n {
                p[i] = r[i] + beta * (p[i] - omega * v[i]);
            }
            apply_pre(dinv, &p, &mut phat, bd);
            mat.matvec(&phat, &mut v);
            alpha = rho1 / mat.dot(&rhat, &v);
            let mut s = r.clone();
            for i in 0..n {
                s[i] -= alpha * v[i];
            }
            if mat.dot(&s, &s).sqrt() / b_norm < self.tol {
                for i in 0..n {
                    x[i] += alpha * phat[i];
                }
                return it as i32;
            }
            apply_pre(dinv, &s, &mut shat, bd);
            mat.matvec(&shat, &mut t);
            let tt = mat.dot(&t, &t);
            if tt.abs() < 1e-300 {
                warn!(iter = it, "BiCGStab breakdown (t)");
                return -(it as i32);
            }
            omega = mat.dot(&t, &s) / tt;
            for i in 0..n {
                x[i] += alpha * phat[i] + omega * shat[i];
                r[i] = s[i] - omega * t[i];
            }
            if mat.dot(&r, &r).sqrt() / b_norm < self.tol {
                return it as i32;
            }
            rho = rho1;
        }
        warn!(max_iter = self.max_iter, "BiCGStab did not converge");
        -(self.max_iter as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use approx::assert_relative_eq;

    fn serial_solve(block_dim: usize, nb: usize, fill: impl Fn(&mut LinearSystem)) -> Vec<f64> {
        let mut dom = Domain::serial(Box::new(SerialComm), nb, 0);
        let mut ls = LinearSystem::new(nb, block_dim);
        ls.add_dim(nb);
        fill(&mut ls);
        let mut solver = BsrBicgstab::with_tol(block_dim, 1e-12, 1000);
        let status = ls.solve(&mut solver, &mut dom, 0);
        assert!(status > 0, "solver failed with status {status}");
        ls.solution().to_vec()
    }

    #[test]
    fn solves_scalar_laplacian() {
        // 1D chain: 2 on the diagonal, -1 off, rhs picked for x = [1, 2, 3]
        let x = serial_solve(1, 3, |ls| {
            ls.new_diag(0, &[2.0]);
            ls.new_off_diag(0, 1, &[-1.0]);
            ls.new_diag(1, &[2.0]);
            ls.new_off_diag(1, 0, &[-1.0]);
            ls.new_off_diag(1, 2, &[-1.0]);
            ls.new_diag(2, &[2.0]);
            ls.new_off_diag(2, 1, &[-1.0]);
            ls.assemble_rhs_copy(&[0.0, 0.0, 4.0]);
        });
        assert_relative_eq!(x[0], 1.0, max_relative = 1e-8);
        assert_relative_eq!(x[1], 2.0, max_relative = 1e-8);
        assert_relative_eq!(x[2], 3.0, max_relative = 1e-8);
    }

    #[test]
    fn solves_block_system() {
        // two 2x2 diagonal-dominant blocks with weak coupling
        let x = serial_solve(2, 2, |ls| {
            ls.new_diag(0, &[4.0, 1.0, 0.0, 3.0]);
            ls.new_off_diag(0, 1, &[-1.0, 0.0, 0.0, -1.0]);
            ls.new_diag(1, &[5.0, 0.0, 1.0, 4.0]);
            ls.new_off_diag(1, 0, &[-1.0, 0.0, 0.0, -1.0]);
            ls.assemble_rhs_copy(&[1.0, 2.0, 3.0, 4.0]);
        });
        // residual check: A x = b
        let ax0 = 4.0 * x[0] + 1.0 * x[1] - x[2];
        let ax1 = 3.0 * x[1] - x[3];
        let ax2 = 5.0 * x[2] - x[0];
        let ax3 = x[2] + 4.0 * x[3] - x[1];
        assert_relative_eq!(ax0, 1.0, max_relative = 1e-8);
        assert_relative_eq!(ax1, 2.0, max_relative = 1e-8);
        assert_relative_eq!(ax2, 3.0, max_relative = 1e-8);
        assert_relative_eq!(ax3, 4.0, max_relative = 1e-8);
    }
}
