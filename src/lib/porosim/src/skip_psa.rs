//! Skip-stability-analysis accelerator for the compositional flash.
//!
//! Per cell it keeps the last accepted (P, T, z) and the smallest eigenvalue
//! of the stability Hessian there. A new flash may skip the full stability
//! test when the state has moved less than that eigenvalue allows; the
//! record is refreshed at the end of every step from the path the flash
//! actually took.

use crate::consts::TINY;
use crate::flash::CompMixture;
use crate::pvt::Mixture;
use nalgebra::DMatrix;

/// Per-cell accelerator state with its last-time-step shadow.
#[derive(Clone, Debug, Default)]
pub struct SkipPsaVarset {
    pub nb: usize,
    pub np: usize,
    pub nc: usize,

    pub flag: Vec<bool>,
    pub min_eigen: Vec<f64>,
    pub p: Vec<f64>,
    pub t: Vec<f64>,
    pub zi: Vec<f64>,

    lflag: Vec<bool>,
    lmin_eigen: Vec<f64>,
    lp: Vec<f64>,
    lt: Vec<f64>,
    lzi: Vec<f64>,
}

impl SkipPsaVarset {
    pub fn setup(&mut self, nb: usize, np: usize, nc: usize) {
        self.nb = nb;
        self.np = np;
        self.nc = nc;
        self.flag = vec![false; nb];
        self.min_eigen = vec![0.0; nb];
        self.p = vec![0.0; nb];
        self.t = vec![0.0; nb];
        self.zi = vec![0.0; nb * nc];
        self.lflag = self.flag.clone();
        self.lmin_eigen = self.min_eigen.clone();
        self.lp = self.p.clone();
        self.lt = self.t.clone();
        self.lzi = self.zi.clone();
    }

    pub fn reset_to_last_time_step(&mut self) {
        self.flag.copy_from_slice(&self.lflag);
        self.min_eigen.copy_from_slice(&self.lmin_eigen);
        self.p.copy_from_slice(&self.lp);
        self.t.copy_from_slice(&self.lt);
        self.zi.copy_from_slice(&self.lzi);
    }

    pub fn update_last_time_step(&mut self) {
        self.lflag.copy_from_slice(&self.flag);
        self.lmin_eigen.copy_from_slice(&self.min_eigen);
        self.lp.copy_from_slice(&self.p);
        self.lt.copy_from_slice(&self.t);
        self.lzi.copy_from_slice(&self.zi);
    }
}

pub struct SkipPsa {
    if_use: bool,
    pub vs: SkipPsaVarset,
}

impl SkipPsa {
    pub fn setup(nb: usize, np: usize, nc: usize, if_use: bool) -> Self {
        let mut vs = SkipPsaVarset::default();
        vs.setup(nb, np, nc);
        SkipPsa { if_use, vs }
    }

    pub fn if_use(&self) -> bool {
        self.if_use
    }

    fn if_skip(&self, p: f64, t: f64, ni: &[f64], bid: usize) -> bool {
        if !self.vs.flag[bid] {
            return false;
        }
        let eig = self.vs.min_eigen[bid];
        let nt: f64 = ni.iter().sum();
        if (1.0 - self.vs.p[bid] / p).abs() >= eig / 10.0 {
            return false;
        }
        if (t - self.vs.t[bid]).abs() >= eig * 10.0 {
            return false;
        }
        for i in 0..self.vs.nc {
            if (ni[i] / nt.max(TINY) - self.vs.zi[bid * self.vs.nc + i]).abs() >= eig / 10.0 {
                return false;
            }
        }
        true
    }

    /// Flash type without predicted saturations: 1 = skip stability and
    /// stay single-phase, 0 = full path.
    pub fn cal_ftype(&self, p: f64, t: f64, ni: &[f64], bid: usize) -> u8 {
        if self.if_use && self.if_skip(p, t, ni, bid) { 1 } else { 0 }
    }

    /// Flash type with the saturations predicted by the Newton update: when
    /// the phase count survives the update, resume the split directly.
    pub fn cal_ftype_s(
        &self,
        p: f64,
        t: f64,
        ni: &[f64],
        s: &[f64],
        np_prev: usize,
        bid: usize,
    ) -> u8 {
        if !self.if_use {
            return 0;
        }
        if self.if_skip(p, t, ni, bid) {
            1
        } else if np_prev >= 2 {
            let surviving = s.iter().filter(|&&sj| sj >= 1e-4).count();
            // same phase count: flash from np phases directly; otherwise
            // restart from a single phase
            if surviving == np_prev { 2 } else { 0 }
        } else {
            0
        }
    }

    /// Refresh the per-cell record after a flash, from the path it took.
    pub fn cal_skip_for_next_step(&mut self, bid: usize, p: f64, t: f64, mix: &CompMixture) {
        if !self.if_use {
            return;
        }
        match mix.ftype_used() {
            0 => {
                // full path stayed single-phase: assemble the stability
                // Hessian and keep its smallest eigenvalue
                let nc = self.vs.nc;
                let zi = mix.zi();
                let nt = mix.nt();
                let lnphi_n = mix.eos().ln_phi_n(p, crate::consts::rankine(t), zi, nt);
                let mut m = DMatrix::zeros(nc, nc);
                for i in 0..nc {
                    for j in 0..=i {
                        let sym = 0.5 * (lnphi_n[(i, j)] + lnphi_n[(j, i)]);
                        let v = if i == j { 1.0 } else { 0.0 }
                            + nt * (zi[i] * zi[j]).max(0.0).sqrt() * sym;
                        m[(i, j)] = v;
                        m[(j, i)] = v;
                    }
                }
                let eig = m.symmetric_eigen();
                let min_eig = eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
                self.vs.flag[bid] = true;
                self.vs.min_eigen[bid] = min_eig;
                self.vs.p[bid] = p;
                self.vs.t[bid] = t;
                self.vs.zi[bid * nc..(bid + 1) * nc].copy_from_slice(zi);
            }
            1 => {
                self.vs.flag[bid] = true;
            }
            _ => {
                self.vs.flag[bid] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompRecord;
    use crate::pvt::Mixture;

    fn mixture() -> CompMixture {
        CompMixture::new(
            &[
                CompRecord {
                    name: "C1".into(),
                    tc: 343.0,
                    pc: 667.8,
                    vc: 1.59,
                    acf: 0.0115,
                    mw: 16.04,
                    shift: 0.0,
                },
                CompRecord {
                    name: "C10".into(),
                    tc: 1111.8,
                    pc: 304.0,
                    vc: 9.66,
                    acf: 0.4923,
                    mw: 142.29,
                    shift: 0.0,
                },
            ],
            &[],
            &[0.9, 0.1],
        )
        .unwrap()
    }

    #[test]
    fn identical_point_fires_the_skip_predicate() {
        let mut skip = SkipPsa::setup(1, 2, 2, true);
        let mut m = mixture();
        let ni = [9.0, 1.0];
        // single-phase gas-rich mixture at high pressure
        m.flash(4000.0, 200.0, &ni);
        assert_eq!(m.vs().phase_num, 1);
        skip.cal_skip_for_next_step(0, 4000.0, 200.0, &m);
        assert!(skip.vs.flag[0]);
        assert!(skip.vs.min_eigen[0] > 0.0, "stable point has a positive min eigenvalue");
        // the exact same point must skip
        assert_eq!(skip.cal_ftype(4000.0, 200.0, &ni, 0), 1);
    }

    #[test]
    fn far_point_runs_the_full_path() {
        let mut skip = SkipPsa::setup(1, 2, 2, true);
        let mut m = mixture();
        let ni = [9.0, 1.0];
        m.flash(4000.0, 200.0, &ni);
        skip.cal_skip_for_next_step(0, 4000.0, 200.0, &m);
        // a large pressure move breaks the proximity test
        assert_eq!(skip.cal_ftype(1000.0, 200.0, &ni, 0), 0);
    }

    #[test]
    fn two_phase_clears_the_stable_flag() {
        let mut skip = SkipPsa::setup(1, 2, 2, true);
        let mut m = CompMixture::new(
            &[
                CompRecord {
                    name: "C1".into(),
                    tc: 343.0,
                    pc: 667.8,
                    vc: 1.59,
                    acf: 0.0115,
                    mw: 16.04,
                    shift: 0.0,
                },
                CompRecord {
                    name: "C10".into(),
                    tc: 1111.8,
                    pc: 304.0,
                    vc: 9.66,
                    acf: 0.4923,
                    mw: 142.29,
                    shift: 0.0,
                },
            ],
            &[],
            &[0.5, 0.5],
        )
        .unwrap();
        m.flash(1000.0, 200.0, &[5.0, 5.0]);
        assert_eq!(m.vs().phase_num, 2);
        skip.cal_skip_for_next_step(0, 1000.0, 200.0, &m);
        assert!(!skip.vs.flag[0]);
    }

    #[test]
    fn surviving_phase_count_resumes_the_split() {
        let skip = SkipPsa::setup(1, 2, 2, true);
        // no stored record: skip refuses, but a surviving two-phase pattern
        // returns the resume hint
        assert_eq!(
            skip.cal_ftype_s(1000.0, 200.0, &[5.0, 5.0], &[0.6, 0.4], 2, 0),
            2
        );
        assert_eq!(
            skip.cal_ftype_s(1000.0, 200.0, &[5.0, 5.0], &[0.9999, 1e-5], 2, 0),
            0
        );
    }

    #[test]
    fn commit_and_revert_round_trip() {
        let mut skip = SkipPsa::setup(1, 2, 2, true);
        let mut m = mixture();
        m.flash(4000.0, 200.0, &[9.0, 1.0]);
        skip.cal_skip_for_next_step(0, 4000.0, 200.0, &m);
        skip.vs.update_last_time_step();
        let saved = skip.vs.clone();
        // scribble, then revert
        skip.vs.flag[0] = false;
        skip.vs.min_eigen[0] = -1.0;
        skip.vs.reset_to_last_time_step();
        assert_eq!(skip.vs.flag, saved.flag);
        assert_eq!(skip.vs.min_eigen, saved.min_eigen);
    }
}
