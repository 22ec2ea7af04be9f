//! Data and bookkeeping of the nonlinear loop: residual norms, per-iteration
//! and per-step maximum changes, CFL numbers, iteration counters, and the
//! local physical-plausibility verdicts that feed the collective reset
//! decision.

use crate::bulk::Bulk;
use crate::conn::BulkConn;
use crate::consts::TINY;
use crate::error::{BulkState as BulkCheck, WorkState};
use crate::well::Well;

/// Residual of the coupled system: one block row per interior cell, then
/// one per open well.
#[derive(Clone, Debug, Default)]
pub struct NrResidual {
    /// negated residual (the linear-system right-hand side)
    pub res_abs: Vec<f64>,
    /// per-cell 2-norm of the volume-scaled residual
    pub res_rel_v: Vec<f64>,
    /// per-cell 2-norm of the mole-scaled residual
    pub res_rel_n: Vec<f64>,
    pub max_rel_res_v: f64,
    pub max_rel_res0_v: f64,
    pub max_rel_res_n: f64,
    pub max_well_rel_res: f64,
    pub max_id_v: usize,
    pub max_id_n: usize,
}

impl NrResidual {
    pub fn sized(nbi: usize, nw: usize, len: usize) -> Self {
        NrResidual {
            res_abs: vec![0.0; (nbi + nw) * len],
            res_rel_v: vec![0.0; nbi],
            res_rel_n: vec![0.0; nbi],
            max_rel_res0_v: f64::MAX,
            ..Default::default()
        }
    }

    pub fn set_zero(&mut self) {
        self.res_abs.fill(0.0);
        self.res_rel_v.fill(0.0);
        self.res_rel_n.fill(0.0);
        self.max_rel_res_v = 0.0;
        self.max_rel_res_n = 0.0;
        self.max_well_rel_res = 0.0;
        self.max_id_v = 0;
        self.max_id_n = 0;
    }

    pub fn set_init_res(&mut self) {
        self.max_rel_res0_v = self.max_rel_res_v;
    }
}

/// Nonlinear-iteration dataset of one solution method.
pub struct NrSuite {
    pub res: NrResidual,
    nbi: usize,
    np: usize,
    nc: usize,

    // maxima of the current Newton iteration
    pub nr_dp_max: f64,
    pub nr_dpw_max: f64,
    pub nr_dn_max: f64,
    pub nr_ds_max: f64,
    pub nr_dt_max: f64,
    /// saturation snapshot at the start of the iteration, for dS
    pub s_nr: Vec<f64>,

    // maxima of the whole time step (vs the committed state)
    pub dp_max_t: f64,
    pub dt_max_t: f64,
    pub dn_max_t: f64,
    pub ds_max_t: f64,
    pub ev_max_t: f64,

    /// per-cell, per-phase CFL numbers (explicit marching)
    pub cfl: Vec<f64>,
    pub max_cfl: f64,

    pub iter_nr: usize,
    pub iter_ls: usize,
    pub iter_nr_wasted: usize,
    pub iter_ls_wasted: usize,
}

impl NrSuite {
    pub fn new(nbi: usize, nb: usize, np: usize, nc: usize, nw: usize, len: usize) -> Self {
        NrSuite {
            res: NrResidual::sized(nbi, nw, len),
            nbi,
            np,
            nc,
            nr_dp_max: 0.0,
            nr_dpw_max: 0.0,
            nr_dn_max: 0.0,
            nr_ds_max: 0.0,
            nr_dt_max: 0.0,
            s_nr: vec![0.0; nb * np],
            dp_max_t: 0.0,
            dt_max_t: 0.0,
            dn_max_t: 0.0,
            ds_max_t: 0.0,
            ev_max_t: 0.0,
            cfl: vec![0.0; nb * np],
            max_cfl: 0.0,
            iter_nr: 0,
            iter_ls: 0,
            iter_nr_wasted: 0,
            iter_ls_wasted: 0,
        }
    }

    /// Re-size the well tail of the residual when the open-well count
    /// changes between steps.
    pub fn resize_wells(&mut self, nw: usize, len: usize) {
        self.res.res_abs.resize((self.nbi + nw) * len, 0.0);
    }

    pub fn init_iter(&mut self) {
        self.iter_nr = 0;
        self.iter_ls = 0;
        self.iter_nr_wasted = 0;
        self.iter_ls_wasted = 0;
    }

    pub fn update_iter(&mut self, ls_iters: usize) {
        self.iter_nr += 1;
        self.iter_ls += ls_iters;
    }

    pub fn reset_iter(&mut self) {
        self.iter_nr_wasted += self.iter_nr;
        self.iter_ls_wasted += self.iter_ls;
        self.iter_nr = 0;
        self.iter_ls = 0;
    }

    /// Snapshot the start-of-iteration saturations and clear NR maxima.
    pub fn init_step(&mut self, bulk: &Bulk) {
        self.s_nr.copy_from_slice(&bulk.st.s);
        self.nr_dp_max = 0.0;
        self.nr_dpw_max = 0.0;
        self.nr_dn_max = 0.0;
        self.nr_ds_max = 0.0;
        self.nr_dt_max = 0.0;
    }

    /// Max saturation change of this Newton iteration.
    pub fn cal_ds_max(&mut self, bulk: &Bulk) -> f64 {
        let mut ds = 0.0f64;
        for (s_new, s_old) in bulk.st.s.iter().zip(&self.s_nr) {
            ds = ds.max((s_new - s_old).abs());
        }
        self.nr_ds_max = ds;
        ds
    }

    /// Maximum changes of the whole time step against the committed state,
    /// feeding the Δt prediction.
    pub fn cal_max_change_time(&mut self, bulk: &Bulk, wells: &[Well]) {
        let (np, nc) = (self.np, self.nc);
        self.dp_max_t = 0.0;
        self.dt_max_t = 0.0;
        self.dn_max_t = 0.0;
        self.ds_max_t = 0.0;
        self.ev_max_t = 0.0;
        for n in 0..self.nbi {
            self.dp_max_t = self.dp_max_t.max((bulk.st.p[n] - bulk.last.p[n]).abs());
            self.dt_max_t = self.dt_max_t.max((bulk.st.t[n] - bulk.last.t[n]).abs());
            for j in 0..np {
                let id = n * np + j;
                self.ds_max_t = self.ds_max_t.max((bulk.st.s[id] - bulk.last.s[id]).abs());
            }
            for i in 0..nc {
                let id = n * nc + i;
                if bulk.last.ni[id] > TINY {
                    self.dn_max_t = self
                        .dn_max_t
                        .max(((bulk.st.ni[id] - bulk.last.ni[id]) / bulk.last.ni[id]).abs());
                }
            }
            self.ev_max_t = self
                .ev_max_t
                .max(((bulk.st.vf[n] - bulk.st.rock_vp[n]) / bulk.st.rock_vp[n]).abs());
        }
        for w in wells {
            if w.is_open() {
                self.dp_max_t = self.dp_max_t.max(w.bhp_change().abs());
            }
        }
    }

    /// Per-cell phase CFL numbers from the connection velocities and well
    /// rates; the global maximum is reduced across ranks by the caller.
    pub fn cal_cfl(&mut self, bulk: &Bulk, conn: &BulkConn, wells: &[Well], dt: f64) -> f64 {
        let np = self.np;
        self.cfl.fill(0.0);
        for c in 0..conn.num_conn() {
            for j in 0..np {
                let up = conn.upblock[c * np + j];
                let id = up * np + j;
                if bulk.st.phase_exist[id] {
                    self.cfl[id] += conn.velocity[c * np + j].abs() * dt;
                }
            }
        }
        for w in wells {
            if !w.is_open() {
                continue;
            }
            for perf in &w.perfs {
                let n = perf.location;
                for j in 0..np {
                    let id = n * np + j;
                    if bulk.st.phase_exist[id] {
                        self.cfl[id] += perf.qj_ft3[j].abs() * dt;
                    }
                }
            }
        }
        self.max_cfl = 0.0;
        for n in 0..self.nbi {
            for j in 0..np {
                let id = n * np + j;
                let pv = bulk.st.rock_vp[n] * bulk.st.s[id];
                if pv > TINY {
                    self.cfl[id] /= pv;
                    self.max_cfl = self.max_cfl.max(self.cfl[id]);
                } else {
                    self.cfl[id] = 0.0;
                }
            }
        }
        self.max_cfl
    }

    pub fn check_cfl(&self, lim: f64) -> BulkCheck {
        if self.max_cfl > lim {
            BulkCheck::CflOutRange
        } else {
            BulkCheck::Success
        }
    }

    /// Map local bulk/well verdicts to the work state fed into the
    /// collective minimum.
    pub fn work_state_of(checks: &[BulkCheck]) -> WorkState {
        for c in checks {
            match c {
                BulkCheck::Success => {}
                BulkCheck::CflOutRange => return WorkState::ResetCutCfl,
                _ => return WorkState::ResetCut,
            }
        }
        WorkState::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_state_mapping() {
        assert_eq!(
            NrSuite::work_state_of(&[BulkCheck::Success, BulkCheck::Success]),
            WorkState::Continue
        );
        assert_eq!(
            NrSuite::work_state_of(&[BulkCheck::Success, BulkCheck::NegativeMoles]),
            WorkState::ResetCut
        );
        assert_eq!(
            NrSuite::work_state_of(&[BulkCheck::CflOutRange]),
            WorkState::ResetCutCfl
        );
    }

    #[test]
    fn iteration_bookkeeping_moves_wasted_counts() {
        let mut nr = NrSuite::new(4, 4, 2, 2, 1, 3);
        nr.init_iter();
        nr.update_iter(7);
        nr.update_iter(5);
        assert_eq!(nr.iter_nr, 2);
        assert_eq!(nr.iter_ls, 12);
        nr.reset_iter();
        assert_eq!(nr.iter_nr, 0);
        assert_eq!(nr.iter_nr_wasted, 2);
        assert_eq!(nr.iter_ls_wasted, 12);
    }

    #[test]
    fn initial_residual_is_kept_for_scaling() {
        let mut res = NrResidual::sized(2, 0, 3);
        res.max_rel_res_v = 0.5;
        res.set_init_res();
        res.set_zero();
        assert_eq!(res.max_rel_res0_v, 0.5);
        assert_eq!(res.max_rel_res_v, 0.0);
    }
}
