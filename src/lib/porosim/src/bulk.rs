//! Per-cell state arrays (current and last-time-step snapshots), the
//! commit/revert pair the reset logic depends on, and the physical
//! plausibility checks.
//!
//! All per-cell fields are flat vectors over local cells (interior first,
//! then ghosts); phase-indexed fields are `nb × np` row-major, component
//! fields `nb × nc`.

use crate::consts::TINY;
use crate::error::BulkState as BulkCheck;
use crate::mesh::Mesh;
use crate::pvt::MixtureVarSet;
use crate::rock::Rock;
use crate::satfunc::{KrPc, SatFunc};
use tracing::warn;

/// Everything that participates in the current/last snapshot pair.
#[derive(Clone, Debug, Default)]
pub struct BulkState {
    // rock
    pub poro: Vec<f64>,
    pub poro_p: Vec<f64>,
    pub rock_vp: Vec<f64>,
    // fluid primaries and totals
    pub p: Vec<f64>,
    pub t: Vec<f64>,
    pub ni: Vec<f64>,
    pub nt: Vec<f64>,
    pub vf: Vec<f64>,
    pub phase_num: Vec<usize>,
    // phase-indexed state
    pub phase_exist: Vec<bool>,
    pub s: Vec<f64>,
    pub xij: Vec<f64>,
    pub rho: Vec<f64>,
    pub xi: Vec<f64>,
    pub mu: Vec<f64>,
    pub pj: Vec<f64>,
    pub pc: Vec<f64>,
    pub kr: Vec<f64>,
    pub h: Vec<f64>,
    // derivatives (live for the duration of a Newton iteration, but revert
    // with the state so a reset restores a consistent snapshot)
    pub vf_p: Vec<f64>,
    pub vf_t: Vec<f64>,
    pub vfi: Vec<f64>,
    pub rho_p: Vec<f64>,
    pub xi_p: Vec<f64>,
    pub mu_p: Vec<f64>,
    pub rho_t: Vec<f64>,
    pub xi_t: Vec<f64>,
    pub mu_t: Vec<f64>,
    pub rho_x: Vec<f64>,
    pub xi_x: Vec<f64>,
    pub mu_x: Vec<f64>,
    pub h_t: Vec<f64>,
    pub dkr_ds: Vec<f64>,
    pub dpc_ds: Vec<f64>,
    pub dsec_dpri: Vec<f64>,
}

impl BulkState {
    fn sized(nb: usize, np: usize, nc: usize, ncol: usize) -> Self {
        BulkState {
            poro: vec![0.0; nb],
            poro_p: vec![0.0; nb],
            rock_vp: vec![0.0; nb],
            p: vec![0.0; nb],
            t: vec![0.0; nb],
            ni: vec![0.0; nb * nc],
            nt: vec![0.0; nb],
            vf: vec![0.0; nb],
            phase_num: vec![0; nb],
            phase_exist: vec![false; nb * np],
            s: vec![0.0; nb * np],
            xij: vec![0.0; nb * np * nc],
            rho: vec![0.0; nb * np],
            xi: vec![0.0; nb * np],
            mu: vec![0.0; nb * np],
            pj: vec![0.0; nb * np],
            pc: vec![0.0; nb * np],
            kr: vec![0.0; nb * np],
            h: vec![0.0; nb * np],
            vf_p: vec![0.0; nb],
            vf_t: vec![0.0; nb],
            vfi: vec![0.0; nb * nc],
            rho_p: vec![0.0; nb * np],
            xi_p: vec![0.0; nb * np],
            mu_p: vec![0.0; nb * np],
            rho_t: vec![0.0; nb * np],
            xi_t: vec![0.0; nb * np],
            mu_t: vec![0.0; nb * np],
            rho_x: vec![0.0; nb * np * nc],
            xi_x: vec![0.0; nb * np * nc],
            mu_x: vec![0.0; nb * np * nc],
            h_t: vec![0.0; nb * np],
            dkr_ds: vec![0.0; nb * np * np],
            dpc_ds: vec![0.0; nb * np * np],
            dsec_dpri: vec![0.0; nb * (np + np * nc) * ncol],
        }
    }
}

pub struct Bulk {
    pub nb: usize,
    pub nbi: usize,
    pub np: usize,
    pub nc: usize,
    pub ncol: usize,
    pub thermal: bool,

    // static geometry and rock statics
    pub v: Vec<f64>,
    pub depth: Vec<f64>,
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
    pub dz: Vec<f64>,
    pub ntg: Vec<f64>,
    pub kx: Vec<f64>,
    pub ky: Vec<f64>,
    pub kz: Vec<f64>,
    pub poro_init: Vec<f64>,
    pub rock: Rock,

    pub st: BulkState,
    pub last: BulkState,

    /// cells perforated by a well, for the AIMc classifier
    pub well_bulk_id: Vec<usize>,

    krpc_scratch: KrPc,
}

impl Bulk {
    pub fn new(mesh: &Mesh, nbi: usize, np: usize, nc: usize, thermal: bool, rock: Rock) -> Self {
        let nb = mesh.cells.len();
        let ncol = nc + 1 + usize::from(thermal);
        Bulk {
            nb,
            nbi,
            np,
            nc,
            ncol,
            thermal,
            v: mesh.cells.iter().map(|c| c.bulk_volume()).collect(),
            depth: mesh.cells.iter().map(|c| c.depth).collect(),
            dx: mesh.cells.iter().map(|c| c.dx).collect(),
            dy: mesh.cells.iter().map(|c| c.dy).collect(),
            dz: mesh.cells.iter().map(|c| c.dz).collect(),
            ntg: mesh.cells.iter().map(|c| c.ntg).collect(),
            kx: mesh.cells.iter().map(|c| c.kx).collect(),
            ky: mesh.cells.iter().map(|c| c.ky).collect(),
            kz: mesh.cells.iter().map(|c| c.kz).collect(),
            poro_init: mesh.cells.iter().map(|c| c.poro_init).collect(),
            rock,
            st: BulkState::sized(nb, np, nc, ncol),
            last: BulkState::sized(nb, np, nc, ncol),
            well_bulk_id: Vec::new(),
            krpc_scratch: KrPc::sized(np),
        }
    }

    /// Snapshot current -> last. On success of a step.
    pub fn commit(&mut self) {
        self.last.clone_from(&self.st);
    }

    /// Restore current from last. On reset.
    pub fn revert(&mut self) {
        self.st.clone_from(&self.last);
    }

    /// Update rock properties from the current pressure.
    pub fn cal_rock(&mut self) {
        for n in 0..self.nb {
            let (poro, poro_p) = self.rock.porosity(self.poro_init[n], self.st.p[n]);
            self.st.poro[n] = poro;
            self.st.poro_p[n] = poro_p;
            self.st.rock_vp[n] = self.v[n] * poro;
        }
    }

    /// Copy one cell's flash output into the flat arrays.
    pub fn pass_flash_value(&mut self, n: usize, mvs: &MixtureVarSet) {
        let (np, nc) = (self.np, self.nc);
        self.st.nt[n] = mvs.nt;
        self.st.vf[n] = mvs.vf;
        self.st.vf_p[n] = mvs.vf_p;
        self.st.vf_t[n] = mvs.vf_t;
        self.st.phase_num[n] = mvs.phase_num;
        self.st.vfi[n * nc..(n + 1) * nc].copy_from_slice(&mvs.vfi);
        for j in 0..np {
            let id = n * np + j;
            self.st.phase_exist[id] = mvs.phase_exist[j];
            self.st.s[id] = mvs.s[j];
            self.st.rho[id] = mvs.rho[j];
            self.st.xi[id] = mvs.xi[j];
            self.st.mu[id] = mvs.mu[j];
            self.st.h[id] = mvs.h[j];
            self.st.rho_p[id] = mvs.rho_p[j];
            self.st.xi_p[id] = mvs.xi_p[j];
            self.st.mu_p[id] = mvs.mu_p[j];
            self.st.rho_t[id] = mvs.rho_t[j];
            self.st.xi_t[id] = mvs.xi_t[j];
            self.st.mu_t[id] = mvs.mu_t[j];
            self.st.h_t[id] = mvs.h_t[j];
        }
        self.st.xij[n * np * nc..(n + 1) * np * nc].copy_from_slice(&mvs.xij);
        self.st.rho_x[n * np * nc..(n + 1) * np * nc].copy_from_slice(&mvs.rho_x);
        self.st.xi_x[n * np * nc..(n + 1) * np * nc].copy_from_slice(&mvs.xi_x);
        self.st.mu_x[n * np * nc..(n + 1) * np * nc].copy_from_slice(&mvs.mu_x);
        let lensec = (np + np * nc) * self.ncol;
        self.st.dsec_dpri[n * lensec..(n + 1) * lensec].copy_from_slice(&mvs.dsec_dpri);
    }

    /// Relative permeability, capillary pressure, and phase pressures for
    /// every local cell.
    pub fn cal_kr_pc(&mut self, satfunc: &dyn SatFunc) {
        let np = self.np;
        for n in 0..self.nb {
            let s = self.st.s[n * np..(n + 1) * np].to_vec();
            satfunc.cal_kr_pc(&s, &mut self.krpc_scratch);
            for j in 0..np {
                let id = n * np + j;
                self.st.kr[id] = self.krpc_scratch.kr[j];
                self.st.pc[id] = self.krpc_scratch.pc[j];
                self.st.pj[id] = self.st.p[n] + self.krpc_scratch.pc[j];
            }
            self.st.dkr_ds[n * np * np..(n + 1) * np * np]
                .copy_from_slice(&self.krpc_scratch.dkr_ds);
            self.st.dpc_ds[n * np * np..(n + 1) * np * np]
                .copy_from_slice(&self.krpc_scratch.dpc_ds);
        }
    }

    /// Negative pressure check over interior cells.
    pub fn check_p(&self) -> BulkCheck {
        for n in 0..self.nbi {
            if self.st.p[n] < 0.0 {
                warn!(cell = n, p = self.st.p[n], "negative bulk pressure");
                return BulkCheck::NegativePressure;
            }
        }
        BulkCheck::Success
    }

    pub fn check_t(&self) -> BulkCheck {
        for n in 0..self.nbi {
            if self.st.t[n] < 0.0 {
                warn!(cell = n, t = self.st.t[n], "negative bulk temperature");
                return BulkCheck::NegativeTemperature;
            }
        }
        BulkCheck::Success
    }

    /// Component-mole check; tiny negative values are clamped, larger ones
    /// trigger a reset.
    pub fn check_ni(&mut self) -> BulkCheck {
        let nc = self.nc;
        for n in 0..self.nbi {
            let max_n = self.st.ni[n * nc..(n + 1) * nc]
                .iter()
                .cloned()
                .fold(0.0f64, f64::max);
            for i in 0..nc {
                let ni = self.st.ni[n * nc + i];
                if ni < 0.0 {
                    if ni > -1e-3 * max_n.max(TINY) {
                        self.st.ni[n * nc + i] = 1e-20;
                    } else {
                        warn!(cell = n, comp = i, ni, "negative component moles");
                        return BulkCheck::NegativeMoles;
                    }
                }
            }
        }
        BulkCheck::Success
    }

    /// Volume-error check: |Vf - Vp| / Vp within `ev_lim`.
    pub fn check_ve(&self, ev_lim: f64) -> BulkCheck {
        for n in 0..self.nbi {
            let vp = self.st.rock_vp[n];
            if ((self.st.vf[n] - vp) / vp).abs() > ev_lim {
                warn!(
                    cell = n,
                    vf = self.st.vf[n],
                    vp,
                    "volume error out of range"
                );
                return BulkCheck::VolumeErrorOutRange;
            }
        }
        BulkCheck::Success
    }

    /// Max relative volume error over interior cells.
    pub fn max_volume_err(&self) -> f64 {
        (0..self.nbi)
            .map(|n| ((self.st.vf[n] - self.st.rock_vp[n]) / self.st.rock_vp[n]).abs())
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RockConfig;

    fn small_bulk() -> Bulk {
        let mesh = Mesh::structured(2, 1, 1, (100.0, 100.0, 20.0), 8000.0, 0.2, (100.0, 100.0, 10.0));
        Bulk::new(&mesh, 2, 2, 2, false, Rock::new(&RockConfig::default()))
    }

    #[test]
    fn commit_then_revert_is_byte_identical() {
        let mut bulk = small_bulk();
        bulk.st.p = vec![3000.0, 3100.0];
        bulk.st.ni = vec![1.0, 2.0, 3.0, 4.0];
        bulk.commit();
        let saved_p = bulk.st.p.clone();
        let saved_ni = bulk.st.ni.clone();
        bulk.st.p[0] = 1.0;
        bulk.st.ni[2] = -5.0;
        bulk.revert();
        assert_eq!(bulk.st.p, saved_p);
        assert_eq!(bulk.st.ni, saved_ni);
    }

    #[test]
    fn tiny_negative_moles_are_clamped() {
        let mut bulk = small_bulk();
        bulk.st.ni = vec![100.0, -1e-6, 50.0, 1.0];
        assert_eq!(bulk.check_ni(), BulkCheck::Success);
        assert!(bulk.st.ni[1] > 0.0);
    }

    #[test]
    fn large_negative_moles_fail() {
        let mut bulk = small_bulk();
        bulk.st.ni = vec![100.0, -5.0, 50.0, 1.0];
        assert_eq!(bulk.check_ni(), BulkCheck::NegativeMoles);
    }

    #[test]
    fn volume_error_bound() {
        let mut bulk = small_bulk();
        bulk.st.rock_vp = vec![1000.0, 1000.0];
        bulk.st.vf = vec![1000.5, 999.2];
        assert_eq!(bulk.check_ve(0.01), BulkCheck::Success);
        bulk.st.vf[1] = 900.0;
        assert_eq!(bulk.check_ve(0.01), BulkCheck::VolumeErrorOutRange);
    }
}
