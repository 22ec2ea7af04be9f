//! Per-cell thermodynamic state: the `Mixture` trait answered by the
//! black-oil (this file), compositional (`flash`) and thermal (`thermal`)
//! models, and the table-driven black-oil property functions.
//!
//! Black-oil "moles" are surface volumes: one mole of the oil component is
//! one stock-tank barrel, one mole of gas is one Mscf, one mole of water one
//! stb. With that convention the usual Bo/Bg/Bw/Rs algebra doubles as molar
//! bookkeeping and the well surface-rate weights become unit vectors.

use crate::config::{FluidConfig, InjFluid};
use crate::consts::{CONV_BBL_FT3, TINY};
use crate::error::SetupError;
use crate::satfunc::Table;

/// Everything the assembler reads from a cell after a flash. Derivative
/// arrays are only valid after `flash_der`.
#[derive(Clone, Debug)]
pub struct MixtureVarSet {
    pub np: usize,
    pub nc: usize,
    /// number of primary columns: nc + 1, or nc + 2 for thermal
    pub ncol: usize,
    pub phase_exist: Vec<bool>,
    pub s: Vec<f64>,
    /// phase volumes [ft³]
    pub vj: Vec<f64>,
    pub vf: f64,
    pub nt: f64,
    pub vf_p: f64,
    pub vf_t: f64,
    pub vfi: Vec<f64>,
    /// mole fraction of component i in phase j, np×nc row-major
    pub xij: Vec<f64>,
    /// mass density [lb/ft³]
    pub rho: Vec<f64>,
    /// molar density [mole/ft³]
    pub xi: Vec<f64>,
    /// viscosity [cP]
    pub mu: Vec<f64>,
    pub rho_p: Vec<f64>,
    pub xi_p: Vec<f64>,
    pub mu_p: Vec<f64>,
    pub rho_t: Vec<f64>,
    pub xi_t: Vec<f64>,
    pub mu_t: Vec<f64>,
    /// molar enthalpy [Btu/mole] and its T-derivative (thermal runs)
    pub h: Vec<f64>,
    pub h_t: Vec<f64>,
    /// per-phase derivatives w.r.t. own mole fractions, np×nc
    pub rho_x: Vec<f64>,
    pub xi_x: Vec<f64>,
    pub mu_x: Vec<f64>,
    /// secondary-w.r.t.-primary block, (np + np·nc) × ncol row-major;
    /// rows (S_1..S_np, x_11..x_np,nc), columns (P, N_1..N_nc[, T])
    pub dsec_dpri: Vec<f64>,
    /// number of existing phases
    pub phase_num: usize,
}

impl MixtureVarSet {
    pub fn new(np: usize, nc: usize, thermal: bool) -> Self {
        let ncol = nc + 1 + usize::from(thermal);
        MixtureVarSet {
            np,
            nc,
            ncol,
            phase_exist: vec![false; np],
            s: vec![0.0; np],
            vj: vec![0.0; np],
            vf: 0.0,
            nt: 0.0,
            vf_p: 0.0,
            vf_t: 0.0,
            vfi: vec![0.0; nc],
            xij: vec![0.0; np * nc],
            rho: vec![0.0; np],
            xi: vec![0.0; np],
            mu: vec![0.0; np],
            rho_p: vec![0.0; np],
            xi_p: vec![0.0; np],
            mu_p: vec![0.0; np],
            rho_t: vec![0.0; np],
            xi_t: vec![0.0; np],
            mu_t: vec![0.0; np],
            h: vec![0.0; np],
            h_t: vec![0.0; np],
            rho_x: vec![0.0; np * nc],
            xi_x: vec![0.0; np * nc],
            mu_x: vec![0.0; np * nc],
            dsec_dpri: vec![0.0; (np + np * nc) * ncol],
            phase_num: 0,
        }
    }

    /// number of secondary rows
    pub fn nrow_sec(&self) -> usize {
        self.np + self.np * self.nc
    }

    /// Fill the saturation rows of `dsec_dpri` from phase-volume
    /// derivatives: S_j = V_j / ΣV_k.
    pub fn fill_sat_rows(&mut self, dvj_dp: &[f64], dvj_dni: &[f64]) {
        let (np, nc, ncol) = (self.np, self.nc, self.ncol);
        let vf = self.vf.max(TINY);
        for j in 0..np {
            let row = j * ncol;
            self.dsec_dpri[row] = (dvj_dp[j] * vf - self.vj[j] * self.vf_p) / (vf * vf);
            for i in 0..nc {
                let dvf_dni = self.vfi[i];
                self.dsec_dpri[row + 1 + i] =
                    (dvj_dni[j * nc + i] * vf - self.vj[j] * dvf_dni) / (vf * vf);
            }
        }
    }
}

/// Phase-behaviour model of one PVT region.
pub trait Mixture: Send {
    fn np(&self) -> usize;
    fn nc(&self) -> usize;
    fn vs(&self) -> &MixtureVarSet;

    /// Component moles that realise the target phase volumes at (p, t);
    /// used once at initialization. Compositional models take the overall
    /// composition from their deck and honour only the total pore volume.
    fn init_moles(&mut self, p: f64, t: f64, vj_target: &[f64]) -> Vec<f64>;

    /// Equilibrium split without derivatives (IMPEC property update).
    fn flash(&mut self, p: f64, t: f64, ni: &[f64]);

    /// Equilibrium split with the full derivative set (FIM assembly).
    fn flash_der(&mut self, p: f64, t: f64, ni: &[f64]);

    /// Molar density of an injected stream at local conditions.
    fn xi_phase(&self, p: f64, t: f64, z: &[f64], phase: InjFluid) -> f64;

    /// Mass density of an injected stream at local conditions [lb/ft³].
    fn rho_phase(&self, p: f64, t: f64, z: &[f64], phase: InjFluid) -> f64;

    /// Surface-condition phase volumes of the component stream `qi`
    /// [stb | Mscf | stb per phase index].
    fn cal_v_std(&self, qi: &[f64]) -> Vec<f64>;

    /// Molar enthalpy of an injected stream [Btu/mole]; zero for
    /// isothermal models.
    fn enthalpy_inj(&self, _t: f64, _z: &[f64], _phase: InjFluid) -> f64 {
        0.0
    }

    fn oil_index(&self) -> Option<usize>;
    fn gas_index(&self) -> Option<usize>;
    fn wat_index(&self) -> Option<usize>;

    /// Skip-stability hint, compositional models only.
    fn set_ftype(&mut self, _ftype: u8) {}
    /// Ftype the last flash actually took, for the accelerator update.
    fn ftype_used(&self) -> u8 {
        0
    }
    /// (min-eigen Hessian inputs) overall composition of the last flash.
    fn zi(&self) -> &[f64] {
        &[]
    }
    /// Compositional models expose themselves to the skip accelerator.
    fn as_comp(&self) -> Option<&crate::flash::CompMixture> {
        None
    }
}

pub fn build(cfg: &FluidConfig, z_init: &[f64]) -> Result<Box<dyn Mixture>, SetupError> {
    match cfg {
        FluidConfig::DeadOilWater { pvdo, pvtw, rho_std } => {
            Ok(Box::new(BlackOilOw::new(pvdo, *pvtw, *rho_std)?))
        }
        FluidConfig::LiveOilGasWater {
            pvco,
            pvdg,
            pvtw,
            rho_std,
        } => Ok(Box::new(BlackOilOgw::new(pvco, pvdg, *pvtw, *rho_std)?)),
        FluidConfig::Compositional { comps, bic } => Ok(Box::new(
            crate::flash::CompMixture::new(comps, bic, z_init)?,
        )),
        FluidConfig::ThermalOilWater {
            oil,
            water,
            cp_molar,
            mw,
        } => Ok(Box::new(crate::thermal::ThermalOilWater::new(
            *oil, *water, *cp_molar, *mw,
        ))),
    }
}

// ---------------------------------------------------------------- tables --

/// PVTW: single record {Pref, Bw, Cw, muw, Cmuw}, compressibility form.
#[derive(Clone, Copy, Debug)]
pub struct Pvtw {
    p_ref: f64,
    bw_ref: f64,
    cw: f64,
    muw_ref: f64,
    c_muw: f64,
}

impl Pvtw {
    pub fn new(row: [f64; 5]) -> Self {
        Pvtw {
            p_ref: row[0],
            bw_ref: row[1],
            cw: row[2],
            muw_ref: row[3],
            c_muw: row[4],
        }
    }

    /// (Bw, dBw/dP)
    pub fn bw(&self, p: f64) -> (f64, f64) {
        let x = self.cw * (p - self.p_ref);
        let den = 1.0 + x + 0.5 * x * x;
        let bw = self.bw_ref / den;
        let dden = self.cw * (1.0 + x);
        (bw, -self.bw_ref * dden / (den * den))
    }

    /// (muw, dmuw/dP)
    pub fn muw(&self, p: f64) -> (f64, f64) {
        let y = -self.c_muw * (p - self.p_ref);
        let den = 1.0 + y + 0.5 * y * y;
        let mu = self.muw_ref / den;
        let dden = -self.c_muw * (1.0 + y);
        (mu, -self.muw_ref * dden / (den * den))
    }
}

/// PVDO: dead-oil table {P, Bo, muo}.
#[derive(Clone, Debug)]
pub struct Pvdo {
    table: Table,
}

impl Pvdo {
    pub fn new(rows: &[[f64; 3]]) -> Result<Self, SetupError> {
        Ok(Pvdo {
            table: Table::from_rows(rows)?,
        })
    }
    pub fn bo(&self, p: f64) -> (f64, f64) {
        self.table.eval(p, 1)
    }
    pub fn muo(&self, p: f64) -> (f64, f64) {
        self.table.eval(p, 2)
    }
}

/// PVDG: dry-gas table {P, Bg, mug}; Bg in rb/Mscf.
#[derive(Clone, Debug)]
pub struct Pvdg {
    table: Table,
}

impl Pvdg {
    pub fn new(rows: &[[f64; 3]]) -> Result<Self, SetupError> {
        Ok(Pvdg {
            table: Table::from_rows(rows)?,
        })
    }
    pub fn bg(&self, p: f64) -> (f64, f64) {
        self.table.eval(p, 1)
    }
    pub fn mug(&self, p: f64) -> (f64, f64) {
        self.table.eval(p, 2)
    }
}

/// PVCO: live-oil table {Pbub, Rs, Bo, muo, Cb, Cmu} in compressibility
/// form, plus the inverse lookup keyed on Rs for undersaturated cells.
#[derive(Clone, Debug)]
pub struct Pvco {
    by_p: Table,
    by_rs: Table,
}

impl Pvco {
    pub fn new(rows: &[[f64; 6]]) -> Result<Self, SetupError> {
        let by_p = Table::from_rows(rows)?;
        let inv: Vec<[f64; 6]> = rows
            .iter()
            .map(|r| [r[1], r[0], r[2], r[3], r[4], r[5]])
            .collect();
        let by_rs = Table::from_rows(&inv)?;
        Ok(Pvco { by_p, by_rs })
    }

    /// saturated Rs at pressure p: (Rs, dRs/dP)
    pub fn rs_sat(&self, p: f64) -> (f64, f64) {
        self.by_p.eval(p, 1)
    }
    /// saturated Bo at pressure p
    pub fn bo_sat(&self, p: f64) -> (f64, f64) {
        self.by_p.eval(p, 2)
    }
    pub fn muo_sat(&self, p: f64) -> (f64, f64) {
        self.by_p.eval(p, 3)
    }

    /// Undersaturated oil at (p, Rs): returns (Bo, dBo/dP, dBo/dRs,
    /// muo, dmuo/dP, dmuo/dRs).
    pub fn undersat(&self, p: f64, rs: f64) -> (f64, f64, f64, f64, f64, f64) {
        let (pb, dpb_drs) = self.by_rs.eval(rs, 1);
        let (bo_b, dbo_b) = self.by_rs.eval(rs, 2);
        let (mu_b, dmu_b) = self.by_rs.eval(rs, 3);
        let (cb, _) = self.by_rs.eval(rs, 4);
        let (cmu, _) = self.by_rs.eval(rs, 5);
        let dp = p - pb;
        let bo = bo_b * (-cb * dp).exp();
        let dbo_dp = -cb * bo;
        // Rs moves both the bubble point and the saturated anchor
        let dbo_drs = (dbo_b + bo_b * cb * dpb_drs) * (-cb * dp).exp();
        let mu = mu_b * (1.0 + cmu * dp);
        let dmu_dp = mu_b * cmu;
        let dmu_drs = dmu_b * (1.0 + cmu * dp) - mu_b * cmu * dpb_drs;
        (bo, dbo_dp, dbo_drs, mu, dmu_dp, dmu_drs)
    }
}

// ------------------------------------------------- dead-oil/water mixture --

/// Two-phase, two-component black-oil: component 0 = oil, 1 = water; same
/// phase order.
pub struct BlackOilOw {
    pvdo: Pvdo,
    pvtw: Pvtw,
    /// surface densities [lb/ft³]: oil, water
    rho_std: [f64; 2],
    vs: MixtureVarSet,
}

impl BlackOilOw {
    pub fn new(pvdo: &[[f64; 3]], pvtw: [f64; 5], rho_std: [f64; 2]) -> Result<Self, SetupError> {
        Ok(BlackOilOw {
            pvdo: Pvdo::new(pvdo)?,
            pvtw: Pvtw::new(pvtw),
            rho_std,
            vs: MixtureVarSet::new(2, 2, false),
        })
    }

    fn props(&mut self, p: f64) -> (f64, f64, f64, f64) {
        let (bo, dbo) = self.pvdo.bo(p);
        let (muo, dmuo) = self.pvdo.muo(p);
        let (bw, dbw) = self.pvtw.bw(p);
        let (muw, dmuw) = self.pvtw.muw(p);
        let vs = &mut self.vs;
        vs.xi[0] = 1.0 / (CONV_BBL_FT3 * bo);
        vs.xi[1] = 1.0 / (CONV_BBL_FT3 * bw);
        vs.xi_p[0] = -dbo / (CONV_BBL_FT3 * bo * bo);
        vs.xi_p[1] = -dbw / (CONV_BBL_FT3 * bw * bw);
        vs.rho[0] = self.rho_std[0] / bo;
        vs.rho[1] = self.rho_std[1] / bw;
        vs.rho_p[0] = -self.rho_std[0] * dbo / (bo * bo);
        vs.rho_p[1] = -self.rho_std[1] * dbw / (bw * bw);
        vs.mu[0] = muo;
        vs.mu[1] = muw;
        vs.mu_p[0] = dmuo;
        vs.mu_p[1] = dmuw;
        (bo, dbo, bw, dbw)
    }
}

impl Mixture for BlackOilOw {
    fn np(&self) -> usize {
        2
    }
    fn nc(&self) -> usize {
        2
    }
    fn vs(&self) -> &MixtureVarSet {
        &self.vs
    }

    fn init_moles(&mut self, p: f64, _t: f64, vj_target: &[f64]) -> Vec<f64> {
        self.props(p);
        vec![vj_target[0] * self.vs.xi[0], vj_target[1] * self.vs.xi[1]]
    }

    fn flash(&mut self, p: f64, _t: f64, ni: &[f64]) {
        let (bo, _, bw, _) = self.props(p);
        let vs = &mut self.vs;
        vs.vj[0] = CONV_BBL_FT3 * bo * ni[0];
        vs.vj[1] = CONV_BBL_FT3 * bw * ni[1];
        vs.vf = vs.vj[0] + vs.vj[1];
        vs.nt = ni[0] + ni[1];
        vs.s[0] = vs.vj[0] / vs.vf.max(TINY);
        vs.s[1] = vs.vj[1] / vs.vf.max(TINY);
        vs.phase_exist = vec![true, true];
        vs.phase_num = 2;
        vs.xij.copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        vs.vfi[0] = CONV_BBL_FT3 * bo;
        vs.vfi[1] = CONV_BBL_FT3 * bw;
    }

    fn flash_der(&mut self, p: f64, t: f64, ni: &[f64]) {
        self.flash(p, t, ni);
        let (_, dbo, _, dbw) = self.props(p);
        let dvj_dp = [CONV_BBL_FT3 * dbo * ni[0], CONV_BBL_FT3 * dbw * ni[1]];
        self.vs.vf_p = dvj_dp[0] + dvj_dp[1];
        let dvj_dni = [self.vs.vfi[0], 0.0, 0.0, self.vs.vfi[1]];
        self.vs.dsec_dpri.fill(0.0);
        self.vs.fill_sat_rows(&dvj_dp, &dvj_dni);
        // mole fractions are fixed, their rows stay zero
        self.vs.xi_x.fill(0.0);
        self.vs.mu_x.fill(0.0);
        self.vs.rho_x.fill(0.0);
    }

    fn xi_phase(&self, p: f64, _t: f64, _z: &[f64], phase: InjFluid) -> f64 {
        match phase {
            InjFluid::Water => 1.0 / (CONV_BBL_FT3 * self.pvtw.bw(p).0),
            InjFluid::Gas => unreachable!("dead-oil model has no gas phase"),
        }
    }

    fn rho_phase(&self, p: f64, _t: f64, _z: &[f64], phase: InjFluid) -> f64 {
        match phase {
            InjFluid::Water => self.rho_std[1] / self.pvtw.bw(p).0,
            InjFluid::Gas => unreachable!("dead-oil model has no gas phase"),
        }
    }

    fn cal_v_std(&self, qi: &[f64]) -> Vec<f64> {
        // component moles are surface volumes already
        vec![qi[0], qi[1]]
    }

    fn oil_index(&self) -> Option<usize> {
        Some(0)
    }
    fn gas_index(&self) -> Option<usize> {
        None
    }
    fn wat_index(&self) -> Option<usize> {
        Some(1)
    }
}

// -------------------------------------------- live-oil/gas/water mixture --

/// Three-phase, three-component black-oil with dissolved gas: components
/// 0 = oil [stb], 1 = gas [Mscf], 2 = water [stb]; phases oil, gas, water.
pub struct BlackOilOgw {
    pvco: Pvco,
    pvdg: Pvdg,
    pvtw: Pvtw,
    /// surface densities [lb/ft³]: oil, gas, water
    rho_std: [f64; 3],
    vs: MixtureVarSet,
}

impl BlackOilOgw {
    pub fn new(
        pvco: &[[f64; 6]],
        pvdg: &[[f64; 3]],
        pvtw: [f64; 5],
        rho_std: [f64; 3],
    ) -> Result<Self, SetupError> {
        Ok(BlackOilOgw {
            pvco: Pvco::new(pvco)?,
            pvdg: Pvdg::new(pvdg)?,
            pvtw: Pvtw::new(pvtw),
            rho_std,
            vs: MixtureVarSet::new(3, 3, false),
        })
    }

    /// mass per mole of oil-phase pseudo-mole at solution ratio rs
    fn oil_phase_mass(&self, rs: f64) -> f64 {
        self.rho_std[0] * CONV_BBL_FT3 + rs * self.rho_std[1] * 1000.0
    }

    fn water_props(&mut self, p: f64) {
        let (bw, dbw) = self.pvtw.bw(p);
        let (muw, dmuw) = self.pvtw.muw(p);
        let vs = &mut self.vs;
        vs.xi[2] = 1.0 / (CONV_BBL_FT3 * bw);
        vs.xi_p[2] = -dbw / (CONV_BBL_FT3 * bw * bw);
        vs.rho[2] = self.rho_std[2] / bw;
        vs.rho_p[2] = -self.rho_std[2] * dbw / (bw * bw);
        vs.mu[2] = muw;
        vs.mu_p[2] = dmuw;
    }

    fn gas_props(&mut self, p: f64) {
        let (bg, dbg) = self.pvdg.bg(p);
        let (mug, dmug) = self.pvdg.mug(p);
        let vs = &mut self.vs;
        vs.xi[1] = 1.0 / (CONV_BBL_FT3 * bg);
        vs.xi_p[1] = -dbg / (CONV_BBL_FT3 * bg * bg);
        vs.rho[1] = self.rho_std[1] * 1000.0 / (CONV_BBL_FT3 * bg);
        vs.rho_p[1] = -self.rho_std[1] * 1000.0 * dbg / (CONV_BBL_FT3 * bg * bg);
        vs.mu[1] = mug;
        vs.mu_p[1] = dmug;
    }

    fn flash_inner(&mut self, p: f64, ni: &[f64], with_der: bool) {
        let (no, ng, nw) = (ni[0].max(0.0), ni[1].max(0.0), ni[2].max(0.0));
        self.water_props(p);
        self.gas_props(p);
        let (rs_sat, drs_sat) = self.pvco.rs_sat(p);
        let saturated = ng > rs_sat * no + TINY || no <= TINY;

        let vs_nc = 3usize;
        let mut dvj_dp = [0.0; 3];
        let mut dvj_dni = [0.0; 9];

        if saturated {
            let (bo, dbo) = self.pvco.bo_sat(p);
            let (muo, dmuo) = self.pvco.muo_sat(p);
            let rs = rs_sat;
            let free_gas = (ng - rs * no).max(0.0);
            let (bg, dbg) = self.pvdg.bg(p);
            let (bw, dbw) = self.pvtw.bw(p);
            let mass_o = self.oil_phase_mass(rs);
            let dmass_o = self.rho_std[1] * 1000.0 * drs_sat;

            let vs = &mut self.vs;
            vs.vj[0] = CONV_BBL_FT3 * bo * no;
            vs.vj[1] = CONV_BBL_FT3 * bg * free_gas;
            vs.vj[2] = CONV_BBL_FT3 * bw * nw;
            vs.phase_exist = vec![no > TINY, free_gas > TINY, nw > TINY];
            vs.phase_num = vs.phase_exist.iter().filter(|e| **e).count();
            let inv = 1.0 / (1.0 + rs);
            vs.xij.copy_from_slice(&[
                inv,
                rs * inv,
                0.0, // oil phase
                0.0,
                1.0,
                0.0, // gas phase
                0.0,
                0.0,
                1.0, // water phase
            ]);
            vs.xi[0] = (1.0 + rs) / (CONV_BBL_FT3 * bo);
            vs.xi_p[0] = (drs_sat * bo - (1.0 + rs) * dbo) / (CONV_BBL_FT3 * bo * bo);
            // mass of 1 stb oil + rs Mscf gas over the phase volume
            vs.rho[0] = mass_o / (CONV_BBL_FT3 * bo);
            vs.rho_p[0] = (dmass_o * bo - mass_o * dbo) / (CONV_BBL_FT3 * bo * bo);
            vs.mu[0] = muo;
            vs.mu_p[0] = dmuo;

            vs.vfi[0] = CONV_BBL_FT3 * (bo - bg * rs);
            vs.vfi[1] = CONV_BBL_FT3 * bg;
            vs.vfi[2] = CONV_BBL_FT3 * bw;

            if with_der {
                dvj_dp[0] = CONV_BBL_FT3 * dbo * no;
                dvj_dp[1] = CONV_BBL_FT3 * (dbg * free_gas - bg * drs_sat * no);
                dvj_dp[2] = CONV_BBL_FT3 * dbw * nw;
                dvj_dni[0] = CONV_BBL_FT3 * bo; // dVo/dNo
                dvj_dni[vs_nc] = -CONV_BBL_FT3 * bg * rs; // dVg/dNo
                dvj_dni[vs_nc + 1] = CONV_BBL_FT3 * bg; // dVg/dNg
                dvj_dni[2 * vs_nc + 2] = CONV_BBL_FT3 * bw; // dVw/dNw
            }
        } else {
            // all gas dissolved: two phases, oil holds rs = Ng/No
            let rs = if no > TINY { ng / no } else { 0.0 };
            let (bo, dbo_dp, dbo_drs, muo, dmuo_dp, _dmuo_drs) = self.pvco.undersat(p, rs);
            let mass_o = self.oil_phase_mass(rs);
            let (bw, dbw) = self.pvtw.bw(p);

            let vs = &mut self.vs;
            vs.vj[0] = CONV_BBL_FT3 * bo * no;
            vs.vj[1] = 0.0;
            vs.vj[2] = CONV_BBL_FT3 * bw * nw;
            vs.phase_exist = vec![no > TINY, false, nw > TINY];
            vs.phase_num = vs.phase_exist.iter().filter(|e| **e).count();
            let inv = 1.0 / (1.0 + rs);
            vs.xij.copy_from_slice(&[
                inv,
                rs * inv,
                0.0,
                0.0,
                1.0,
                0.0,
                0.0,
                0.0,
                1.0,
            ]);
            vs.xi[0] = (1.0 + rs) / (CONV_BBL_FT3 * bo);
            vs.xi_p[0] = -(1.0 + rs) * dbo_dp / (CONV_BBL_FT3 * bo * bo);
            vs.rho[0] = mass_o / (CONV_BBL_FT3 * bo);
            vs.rho_p[0] = -mass_o * dbo_dp / (CONV_BBL_FT3 * bo * bo);
            vs.mu[0] = muo;
            vs.mu_p[0] = dmuo_dp;
            // gas-phase slots keep the pure-gas properties set in gas_props
            // for wells that may cross into free-gas conditions

            let drs_dno = if no > TINY { -ng / (no * no) } else { 0.0 };
            let drs_dng = if no > TINY { 1.0 / no } else { 0.0 };
            vs.vfi[0] = CONV_BBL_FT3 * (bo + no * dbo_drs * drs_dno);
            vs.vfi[1] = CONV_BBL_FT3 * no * dbo_drs * drs_dng;
            vs.vfi[2] = CONV_BBL_FT3 * bw;

            if with_der {
                dvj_dp[0] = CONV_BBL_FT3 * dbo_dp * no;
                dvj_dp[2] = CONV_BBL_FT3 * dbw * nw;
                dvj_dni[0] = vs.vfi[0];
                dvj_dni[1] = vs.vfi[1];
                dvj_dni[2 * vs_nc + 2] = CONV_BBL_FT3 * bw;
            }
        }

        let vs = &mut self.vs;
        vs.vf = vs.vj.iter().sum();
        vs.nt = no + ng + nw;
        for j in 0..3 {
            vs.s[j] = vs.vj[j] / vs.vf.max(TINY);
        }

        if with_der {
            vs.vf_p = dvj_dp.iter().sum();
            vs.dsec_dpri.fill(0.0);
            vs.fill_sat_rows(&dvj_dp, &dvj_dni);
            // x_oil varies with P through Rs on the saturated branch
            if saturated {
                let (rs, drs) = self.pvco.rs_sat(p);
                let d = drs / ((1.0 + rs) * (1.0 + rs));
                let ncol = self.vs.ncol;
                let base = 3 * ncol; // first xij row
                self.vs.dsec_dpri[base] = -d; // dx_oo/dP
                self.vs.dsec_dpri[base + ncol] = d; // dx_og/dP
            }
            self.vs.xi_x.fill(0.0);
            self.vs.mu_x.fill(0.0);
            self.vs.rho_x.fill(0.0);
        }
    }
}

impl Mixture for BlackOilOgw {
    fn np(&self) -> usize {
        3
    }
    fn nc(&self) -> usize {
        3
    }
    fn vs(&self) -> &MixtureVarSet {
        &self.vs
    }

    fn init_moles(&mut self, p: f64, _t: f64, vj_target: &[f64]) -> Vec<f64> {
        self.water_props(p);
        self.gas_props(p);
        let (rs, _) = self.pvco.rs_sat(p);
        let (bo, _) = self.pvco.bo_sat(p);
        let no = vj_target[0] / (CONV_BBL_FT3 * bo);
        let free_g = vj_target[1] * self.vs.xi[1];
        vec![no, rs * no + free_g, vj_target[2] * self.vs.xi[2]]
    }

    fn flash(&mut self, p: f64, _t: f64, ni: &[f64]) {
        self.flash_inner(p, ni, false);
    }

    fn flash_der(&mut self, p: f64, _t: f64, ni: &[f64]) {
        self.flash_inner(p, ni, true);
    }

    fn xi_phase(&self, p: f64, _t: f64, _z: &[f64], phase: InjFluid) -> f64 {
        match phase {
            InjFluid::Water => 1.0 / (CONV_BBL_FT3 * self.pvtw.bw(p).0),
            InjFluid::Gas => 1.0 / (CONV_BBL_FT3 * self.pvdg.bg(p).0),
        }
    }

    fn rho_phase(&self, p: f64, _t: f64, _z: &[f64], phase: InjFluid) -> f64 {
        match phase {
            InjFluid::Water => self.rho_std[2] / self.pvtw.bw(p).0,
            InjFluid::Gas => self.rho_std[1] * 1000.0 / (CONV_BBL_FT3 * self.pvdg.bg(p).0),
        }
    }

    fn cal_v_std(&self, qi: &[f64]) -> Vec<f64> {
        vec![qi[0], qi[1], qi[2]]
    }

    fn oil_index(&self) -> Option<usize> {
        Some(0)
    }
    fn gas_index(&self) -> Option<usize> {
        Some(1)
    }
    fn wat_index(&self) -> Option<usize> {
        Some(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ow() -> BlackOilOw {
        BlackOilOw::new(
            &[[400.0, 1.012, 1.16], [5000.0, 1.0, 1.2]],
            [3600.0, 1.00341, 3.0e-6, 0.52, 0.0],
            [49.1, 64.79],
        )
        .unwrap()
    }

    #[test]
    fn ow_saturations_sum_to_one() {
        let mut m = ow();
        m.flash_der(3000.0, 150.0, &[100.0, 50.0]);
        let vs = m.vs();
        assert_relative_eq!(vs.s.iter().sum::<f64>(), 1.0, max_relative = 1e-12);
        assert_eq!(vs.phase_num, 2);
    }

    #[test]
    fn ow_init_moles_round_trip() {
        let mut m = ow();
        let vp = 10_000.0;
        let ni = m.init_moles(3000.0, 150.0, &[0.7 * vp, 0.3 * vp]);
        m.flash(3000.0, 150.0, &ni);
        assert_relative_eq!(m.vs().vf, vp, max_relative = 1e-10);
        assert_relative_eq!(m.vs().s[1], 0.3, max_relative = 1e-10);
    }

    #[test]
    fn ow_sat_rows_match_finite_difference() {
        let mut m = ow();
        let ni = [120.0, 60.0];
        m.flash_der(3000.0, 150.0, &ni);
        let ncol = m.vs().ncol;
        let ds_dp = m.vs().dsec_dpri[0];
        let s0 = m.vs().s[0];
        let dp = 1.0;
        m.flash(3000.0 + dp, 150.0, &ni);
        let fd = (m.vs().s[0] - s0) / dp;
        assert_relative_eq!(ds_dp, fd, max_relative = 2e-2, epsilon = 1e-12);
        // dS_o/dN_o by finite difference
        m.flash_der(3000.0, 150.0, &ni);
        let ds_dno = m.vs().dsec_dpri[1];
        let s0 = m.vs().s[0];
        m.flash(3000.0, 150.0, &[120.1, 60.0]);
        let fd = (m.vs().s[0] - s0) / 0.1;
        assert_relative_eq!(ds_dno, fd, max_relative = 1e-2, epsilon = 1e-12);
        assert_eq!(ncol, 3);
    }

    fn ogw() -> BlackOilOgw {
        BlackOilOgw::new(
            &[
                [400.0, 0.165, 1.012, 1.17, 1.0e-5, 0.0],
                [1200.0, 0.335, 1.063, 1.08, 1.0e-5, 0.0],
                [2800.0, 0.652, 1.160, 0.89, 1.0e-5, 0.0],
                [4500.0, 0.960, 1.260, 0.80, 1.0e-5, 0.0],
            ],
            &[
                [400.0, 5.90, 0.013],
                [1200.0, 1.95, 0.0140],
                [2800.0, 0.85, 0.0160],
                [4500.0, 0.54, 0.0180],
            ],
            [3600.0, 1.00341, 3.0e-6, 0.52, 0.0],
            [49.1, 0.06054, 64.79],
        )
        .unwrap()
    }

    #[test]
    fn ogw_saturated_when_gas_exceeds_solution() {
        let mut m = ogw();
        // Rs at 2000 psia ~ 0.49; 100 stb oil dissolves ~49 Mscf
        m.flash_der(2000.0, 150.0, &[100.0, 80.0, 40.0]);
        assert_eq!(m.vs().phase_num, 3);
        assert!(m.vs().phase_exist[1]);
        assert_relative_eq!(m.vs().s.iter().sum::<f64>(), 1.0, max_relative = 1e-12);
    }

    #[test]
    fn ogw_undersaturated_dissolves_all_gas() {
        let mut m = ogw();
        m.flash_der(4000.0, 150.0, &[100.0, 20.0, 40.0]);
        assert_eq!(m.vs().phase_num, 2);
        assert!(!m.vs().phase_exist[1]);
        // oil mole fractions carry the dissolved gas
        let rs = 20.0 / 100.0;
        assert_relative_eq!(m.vs().xij[1], rs / (1.0 + rs), max_relative = 1e-12);
    }

    #[test]
    fn ogw_vf_derivative_consistent() {
        let mut m = ogw();
        let ni = [100.0, 80.0, 40.0];
        m.flash_der(2000.0, 150.0, &ni);
        let vf_p = m.vs().vf_p;
        let vf0 = m.vs().vf;
        m.flash(2001.0, 150.0, &ni);
        let fd = m.vs().vf - vf0;
        assert_relative_eq!(vf_p, fd, max_relative = 5e-2, epsilon = 1e-10);
    }
}
