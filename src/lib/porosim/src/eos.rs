//! Peng-Robinson equation of state: compressibility factor, fugacity
//! coefficients, and the composition derivatives the stability accelerator
//! needs. Field units: psia, °R, ft³/lbmol.

use crate::config::CompRecord;
use crate::consts::GAS_CONSTANT;
use crate::error::SetupError;
use nalgebra::DMatrix;

const SQRT2: f64 = std::f64::consts::SQRT_2;

#[derive(Clone, Debug)]
pub struct PengRobinson {
    nc: usize,
    pub tc: Vec<f64>,
    pub pc: Vec<f64>,
    pub vc: Vec<f64>,
    pub acf: Vec<f64>,
    pub mw: Vec<f64>,
    shift: Vec<f64>,
    bic: Vec<f64>,
}

impl PengRobinson {
    pub fn new(comps: &[CompRecord], bic: &[f64]) -> Result<Self, SetupError> {
        let nc = comps.len();
        if nc == 0 {
            return Err(SetupError::MissingSection("fluid.comps"));
        }
        let bic = if bic.is_empty() {
            vec![0.0; nc * nc]
        } else {
            bic.to_vec()
        };
        Ok(PengRobinson {
            nc,
            tc: comps.iter().map(|c| c.tc).collect(),
            pc: comps.iter().map(|c| c.pc).collect(),
            vc: comps.iter().map(|c| c.vc).collect(),
            acf: comps.iter().map(|c| c.acf).collect(),
            mw: comps.iter().map(|c| c.mw).collect(),
            shift: comps.iter().map(|c| c.shift).collect(),
            bic,
        })
    }

    pub fn nc(&self) -> usize {
        self.nc
    }

    /// Dimensionless mixture parameters (A, B) and the per-component
    /// aggregates needed by ln φ.
    fn mix_params(&self, p: f64, t: f64, x: &[f64]) -> MixParams {
        let rt = GAS_CONSTANT * t;
        let mut ai = vec![0.0; self.nc];
        let mut bi = vec![0.0; self.nc];
        for i in 0..self.nc {
            let tr = t / self.tc[i];
            let w = self.acf[i];
            let m = 0.37464 + 1.54226 * w - 0.26992 * w * w;
            let alpha = {
                let s = 1.0 + m * (1.0 - tr.sqrt());
                s * s
            };
            ai[i] = 0.45724 * GAS_CONSTANT * GAS_CONSTANT * self.tc[i] * self.tc[i]
                / self.pc[i]
                * alpha;
            bi[i] = 0.07780 * GAS_CONSTANT * self.tc[i] / self.pc[i];
        }
        let mut a = 0.0;
        let mut aij_x = vec![0.0; self.nc];
        for i in 0..self.nc {
            for j in 0..self.nc {
                let aij = (1.0 - self.bic[i * self.nc + j]) * (ai[i] * ai[j]).sqrt();
                a += x[i] * x[j] * aij;
                aij_x[i] += x[j] * aij;
            }
        }
        let b: f64 = x.iter().zip(&bi).map(|(x, b)| x * b).sum();
        MixParams {
            a_big: a * p / (rt * rt),
            b_big: b * p / rt,
            b,
            bi,
            aij_x,
            a,
        }
    }

    /// Real roots of Z³ + c2 Z² + c1 Z + c0 = 0.
    fn cubic_roots(c2: f64, c1: f64, c0: f64) -> Vec<f64> {
        let q = (3.0 * c1 - c2 * c2) / 9.0;
        let r = (9.0 * c2 * c1 - 27.0 * c0 - 2.0 * c2 * c2 * c2) / 54.0;
        let d = q * q * q + r * r;
        if d > 0.0 {
            let s = (r + d.sqrt()).cbrt();
            let t = (r - d.sqrt()).cbrt();
            vec![s + t - c2 / 3.0]
        } else {
            let theta = (r / (-q * q * q).sqrt()).clamp(-1.0, 1.0).acos();
            let m = 2.0 * (-q).sqrt();
            (0..3)
                .map(|k| m * ((theta + 2.0 * std::f64::consts::PI * k as f64) / 3.0).cos() - c2 / 3.0)
                .collect()
        }
    }

    /// Compressibility factor of the root with the lowest normalized Gibbs
    /// energy.
    pub fn z_factor(&self, p: f64, t: f64, x: &[f64]) -> f64 {
        let mp = self.mix_params(p, t, x);
        let (a, b) = (mp.a_big, mp.b_big);
        let roots = Self::cubic_roots(
            -(1.0 - b),
            a - 3.0 * b * b - 2.0 * b,
            -(a * b - b * b - b * b * b),
        );
        let g = |z: f64| -> f64 {
            (z - 1.0)
                - (z - b).ln()
                - a / (2.0 * SQRT2 * b)
                    * ((z + (1.0 + SQRT2) * b) / (z + (1.0 - SQRT2) * b)).ln()
        };
        roots
            .into_iter()
            .filter(|&z| z > b)
            .min_by(|&za, &zb| g(za).partial_cmp(&g(zb)).unwrap())
            .unwrap_or(b + 1e-6)
    }

    /// ln φ_i of every component at (p, t, x).
    pub fn ln_phi(&self, p: f64, t: f64, x: &[f64]) -> Vec<f64> {
        let mp = self.mix_params(p, t, x);
        let z = self.z_factor(p, t, x);
        let (a, b) = (mp.a_big, mp.b_big);
        let log_term = ((z + (1.0 + SQRT2) * b) / (z + (1.0 - SQRT2) * b)).ln();
        (0..self.nc)
            .map(|i| {
                let bk = mp.bi[i] / mp.b;
                bk * (z - 1.0)
                    - (z - b).ln()
                    - a / (2.0 * SQRT2 * b) * (2.0 * mp.aij_x[i] / mp.a - bk) * log_term
            })
            .collect()
    }

    /// Molar volume [ft³/lbmol] with the volume-shift correction.
    pub fn molar_volume(&self, p: f64, t: f64, x: &[f64]) -> f64 {
        let mp = self.mix_params(p, t, x);
        let z = self.z_factor(p, t, x);
        let v_eos = z * GAS_CONSTANT * t / p;
        let c: f64 = x
            .iter()
            .zip(self.shift.iter().zip(&mp.bi))
            .map(|(x, (s, b))| x * s * b)
            .sum();
        (v_eos - c).max(1e-10)
    }

    pub fn mix_mw(&self, x: &[f64]) -> f64 {
        x.iter().zip(&self.mw).map(|(x, m)| x * m).sum()
    }

    /// Mass density [lb/ft³].
    pub fn mass_density(&self, p: f64, t: f64, x: &[f64]) -> f64 {
        self.mix_mw(x) / self.molar_volume(p, t, x)
    }

    /// ∂ ln φ_i / ∂ n_j at overall moles `nt·z`, by one-sided perturbation.
    /// Feeds the skip-stability Hessian; the accelerator only needs its
    /// smallest eigenvalue to a few digits.
    pub fn ln_phi_n(&self, p: f64, t: f64, z: &[f64], nt: f64) -> DMatrix<f64> {
        let base = self.ln_phi(p, t, z);
        let mut out = DMatrix::zeros(self.nc, self.nc);
        let h = (nt * 1e-6).max(1e-9);
        let mut n: Vec<f64> = z.iter().map(|zi| zi * nt).collect();
        for j in 0..self.nc {
            n[j] += h;
            let ntp: f64 = n.iter().sum();
            let xp: Vec<f64> = n.iter().map(|ni| ni / ntp).collect();
            let lp = self.ln_phi(p, t, &xp);
            for i in 0..self.nc {
                out[(i, j)] = (lp[i] - base[i]) / h;
            }
            n[j] -= h;
        }
        out
    }

    /// Wilson K-value estimate.
    pub fn wilson_k(&self, p: f64, t: f64) -> Vec<f64> {
        (0..self.nc)
            .map(|i| {
                self.pc[i] / p
                    * (5.373 * (1.0 + self.acf[i]) * (1.0 - self.tc[i] / t)).exp()
            })
            .collect()
    }
}

struct MixParams {
    a_big: f64,
    b_big: f64,
    b: f64,
    bi: Vec<f64>,
    aij_x: Vec<f64>,
    a: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn methane_decane() -> PengRobinson {
        PengRobinson::new(
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
        )
        .unwrap()
    }

    #[test]
    fn ideal_gas_limit() {
        let eos = methane_decane();
        // methane at low pressure behaves nearly ideally
        let z = eos.z_factor(14.7, 660.0, &[1.0, 0.0]);
        assert_relative_eq!(z, 1.0, max_relative = 1e-2);
    }

    #[test]
    fn liquid_root_is_denser() {
        let eos = methane_decane();
        // nearly pure decane at moderate T is a liquid
        let v = eos.molar_volume(500.0, 660.0, &[0.01, 0.99]);
        let rho = eos.mass_density(500.0, 660.0, &[0.01, 0.99]);
        assert!(v < 5.0, "liquid molar volume should be small, got {v}");
        assert!(rho > 20.0, "liquid density should be liquid-like, got {rho}");
    }

    #[test]
    fn ln_phi_pure_component_consistency() {
        let eos = methane_decane();
        // fugacity coefficient of a near-ideal gas approaches 1
        let lp = eos.ln_phi(14.7, 660.0, &[1.0, 0.0]);
        assert!(lp[0].abs() < 0.02);
    }

    #[test]
    fn ln_phi_n_matrix_is_near_symmetric() {
        let eos = methane_decane();
        let m = eos.ln_phi_n(2000.0, 660.0, &[0.6, 0.4], 10.0);
        // Gibbs second-derivative symmetry, up to perturbation error
        assert_relative_eq!(m[(0, 1)], m[(1, 0)], max_relative = 1e-2, epsilon = 1e-6);
    }
}
