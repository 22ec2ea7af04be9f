//! Thermal model: the temperature-dependent oil/water mixture and the
//! thermal fully-implicit method. Temperature joins the primaries as the
//! last column; the energy balance joins the residual as the last row, with
//! convective enthalpy transport and an always-on conductive term.

use crate::bulk::Bulk;
use crate::config::{InjFluid, RunConfig, WellMode};
use crate::conn::{FluxJac, assemble_fim};
use crate::consts::{DARCY_CONST, GRAVITY_FACTOR, PRESSURE_STD, TEMPERATURE_STD, TINY, rankine};
use crate::control::Control;
use crate::error::WorkState;
use crate::linsys::{BsrBicgstab, LinearSystem};
use crate::nr::NrSuite;
use crate::pvt::{Mixture, MixtureVarSet};
use crate::reservoir::Reservoir;
use crate::well::{Well, mat_acc};
use tracing::warn;

/// Two-phase dead-oil/water mixture with temperature-dependent density,
/// viscosity, and molar enthalpy. Phase and component order: oil, water.
pub struct ThermalOilWater {
    /// per fluid: rho_std [lb/ft³], compressibility [1/psi], thermal
    /// expansion [1/°F], viscosity A [cP], viscosity B [°R]
    oil: [f64; 5],
    water: [f64; 5],
    /// molar heat capacities [Btu/(lbmol·°F)]
    cp: [f64; 2],
    /// molecular weights [lb/lbmol]
    mw: [f64; 2],
    vs: MixtureVarSet,
}

impl ThermalOilWater {
    pub fn new(oil: [f64; 5], water: [f64; 5], cp: [f64; 2], mw: [f64; 2]) -> Self {
        ThermalOilWater {
            oil,
            water,
            cp,
            mw,
            vs: MixtureVarSet::new(2, 2, true),
        }
    }

    fn params(&self, j: usize) -> &[f64; 5] {
        if j == 0 { &self.oil } else { &self.water }
    }

    /// (rho, drho/dP, drho/dT) [lb/ft³]
    fn rho(&self, j: usize, p: f64, t: f64) -> (f64, f64, f64) {
        let prm = self.params(j);
        let fp = 1.0 + prm[1] * (p - PRESSURE_STD);
        let ft = 1.0 - prm[2] * (t - TEMPERATURE_STD);
        (
            prm[0] * fp * ft,
            prm[0] * prm[1] * ft,
            -prm[0] * fp * prm[2],
        )
    }

    /// (mu, dmu/dT) [cP], Arrhenius in absolute temperature
    fn mu(&self, j: usize, t: f64) -> (f64, f64) {
        let prm = self.params(j);
        let tr = rankine(t);
        let mu = prm[3] * (prm[4] / tr).exp();
        (mu, -mu * prm[4] / (tr * tr))
    }
}

impl Mixture for ThermalOilWater {
    fn np(&self) -> usize {
        2
    }
    fn nc(&self) -> usize {
        2
    }
    fn vs(&self) -> &MixtureVarSet {
        &self.vs
    }

    fn init_moles(&mut self, p: f64, t: f64, vj_target: &[f64]) -> Vec<f64> {
        (0..2)
            .map(|j| {
                let (rho, _, _) = self.rho(j, p, t);
                vj_target[j] * rho / self.mw[j]
            })
            .collect()
    }

    fn flash(&mut self, p: f64, t: f64, ni: &[f64]) {
        self.flash_der(p, t, ni);
    }

    fn flash_der(&mut self, p: f64, t: f64, ni: &[f64]) {
        let mut dvj_dp = [0.0; 2];
        let mut dvj_dt = [0.0; 2];
        let mut dvj_dni = [0.0; 4];
        for j in 0..2 {
            let (rho, rho_p, rho_t) = self.rho(j, p, t);
            let (mu, mu_t) = self.mu(j, t);
            let n = ni[j].max(0.0);
            let xi = rho / self.mw[j];
            let vs = &mut self.vs;
            vs.rho[j] = rho;
            vs.rho_p[j] = rho_p;
            vs.rho_t[j] = rho_t;
            vs.xi[j] = xi;
            vs.xi_p[j] = rho_p / self.mw[j];
            vs.xi_t[j] = rho_t / self.mw[j];
            vs.mu[j] = mu;
            vs.mu_p[j] = 0.0;
            vs.mu_t[j] = mu_t;
            vs.h[j] = self.cp[j] * (t - TEMPERATURE_STD);
            vs.h_t[j] = self.cp[j];
            vs.vj[j] = n / xi;
            vs.phase_exist[j] = true;
            dvj_dp[j] = -n * vs.xi_p[j] / (xi * xi);
            dvj_dt[j] = -n * vs.xi_t[j] / (xi * xi);
            dvj_dni[j * 2 + j] = 1.0 / xi;
        }
        let vs = &mut self.vs;
        vs.phase_num = 2;
        vs.nt = ni[0].max(0.0) + ni[1].max(0.0);
        vs.vf = vs.vj[0] + vs.vj[1];
        vs.vf_p = dvj_dp[0] + dvj_dp[1];
        vs.vf_t = dvj_dt[0] + dvj_dt[1];
        vs.vfi[0] = dvj_dni[0];
        vs.vfi[1] = dvj_dni[3];
        for j in 0..2 {
            vs.s[j] = vs.vj[j] / vs.vf.max(TINY);
        }
        vs.xij.copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);

        vs.dsec_dpri.fill(0.0);
        vs.fill_sat_rows(&dvj_dp, &dvj_dni);
        // temperature column of the saturation rows
        let ncol = vs.ncol;
        let vf = vs.vf.max(TINY);
        for j in 0..2 {
            vs.dsec_dpri[j * ncol + ncol - 1] =
                (dvj_dt[j] * vf - vs.vj[j] * vs.vf_t) / (vf * vf);
        }
        vs.xi_x.fill(0.0);
        vs.mu_x.fill(0.0);
        vs.rho_x.fill(0.0);
    }

    fn xi_phase(&self, p: f64, t: f64, _z: &[f64], phase: InjFluid) -> f64 {
        let j = match phase {
            InjFluid::Water => 1,
            InjFluid::Gas => 1,
        };
        self.rho(j, p, t).0 / self.mw[j]
    }

    fn rho_phase(&self, p: f64, t: f64, _z: &[f64], phase: InjFluid) -> f64 {
        let j = match phase {
            InjFluid::Water => 1,
            InjFluid::Gas => 1,
        };
        self.rho(j, p, t).0
    }

    fn cal_v_std(&self, qi: &[f64]) -> Vec<f64> {
        // surface volumes in barrels-equivalent: moles over standard molar
        // density
        (0..2)
            .map(|j| {
                let rho = self.params(j)[0];
                qi[j] * self.mw[j] / rho / crate::consts::CONV_BBL_FT3
            })
            .collect()
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

    fn enthalpy_inj(&self, t: f64, _z: &[f64], _phase: InjFluid) -> f64 {
        self.cp[1] * (t - TEMPERATURE_STD)
    }
}

/// Energy-row contributions of the wells: convected enthalpy through every
/// open perforation, appended to the thermal residual.
fn well_energy_res(rs: &Reservoir, res: &mut [f64], dt: f64) {
    let bulk = &rs.bulk;
    let (np, nc) = (bulk.np, bulk.nc);
    let len = nc + 2;
    for w in rs.wells.iter().filter(|w| w.is_open()) {
        for perf in &w.perfs {
            let n = perf.location;
            if w.opt.injector {
                // energy carried by the injected stream at its own
                // temperature
                let h_inj = rs.mixture.enthalpy_inj(
                    w.opt.inj_temp,
                    &w.opt.inj_zi,
                    w.opt.inj_fluid.unwrap_or(InjFluid::Water),
                );
                res[n * len + 1 + nc] += perf.qt_ft3 * perf.xi * h_inj * dt;
            } else {
                for j in 0..np {
                    let id = n * np + j;
                    if bulk.st.phase_exist[id] {
                        let e = perf.qj_ft3[j] * bulk.st.xi[id] * bulk.st.h[id];
                        res[n * len + 1 + nc] += e * dt;
                    }
                }
            }
        }
    }
}

/// Thermal fully-implicit method: primaries (P, N_1..N_nc, T) per cell plus
/// the well BHPs.
pub struct TFim {
    pub nr: NrSuite,
    ls: LinearSystem,
    solver: BsrBicgstab,
    /// committed total energy per interior cell
    energy_last: Vec<f64>,
}

impl TFim {
    pub fn setup(rs: &Reservoir) -> Self {
        let bulk = &rs.bulk;
        let ncol = bulk.nc + 2;
        let max_dim = bulk.nbi + rs.wells.len();
        TFim {
            nr: NrSuite::new(
                bulk.nbi,
                bulk.nb,
                bulk.np,
                bulk.nc,
                rs.num_open_wells(),
                ncol,
            ),
            ls: LinearSystem::new(max_dim, ncol),
            solver: BsrBicgstab::new(ncol),
            energy_last: vec![0.0; bulk.nbi],
        }
    }

    /// Total energy of a cell: fluid enthalpy plus rock heat. In this
    /// model component j is the sole constituent of phase j, so phase
    /// moles are the component moles.
    fn cell_energy(bulk: &Bulk, n: usize) -> f64 {
        let (np, nc) = (bulk.np, bulk.nc);
        let mut e = 0.0;
        for j in 0..np {
            let id = n * np + j;
            if bulk.st.phase_exist[id] {
                e += bulk.st.ni[n * nc + j] * bulk.st.h[id];
            }
        }
        let (h_r, _) = bulk.rock.enthalpy(bulk.st.t[n]);
        e + bulk.v[n] * (1.0 - bulk.st.poro[n]) * h_r
    }

    pub fn init_reservoir(&mut self, rs: &mut Reservoir, cfg: &RunConfig) {
        rs.init_state(cfg);
        rs.bulk.cal_rock();
        thermal_flash(rs);
        let Reservoir {
            bulk,
            wells,
            satfunc,
            ..
        } = &mut *rs;
        bulk.cal_kr_pc(satfunc.as_ref());
        for w in wells.iter_mut() {
            w.cal_wi_peaceman(bulk);
            w.init_bhp(bulk);
        }
        rs.conn.cal_flux(&rs.bulk);
        rs.commit();
        for n in 0..rs.bulk.nbi {
            self.energy_last[n] = Self::cell_energy(&rs.bulk, n);
        }
    }

    pub fn prepare(&mut self, rs: &mut Reservoir, dt: f64) {
        rs.prepare_wells();
        self.nr.resize_wells(rs.num_open_wells(), rs.bulk.nc + 2);
        self.nr.init_step(&rs.bulk);
        self.nr.init_iter();
        self.cal_res(rs, dt, true);
    }

    fn cal_res(&mut self, rs: &mut Reservoir, dt: f64, reset_res0: bool) {
        let bulk = &rs.bulk;
        let (np, nc, nbi) = (bulk.np, bulk.nc, bulk.nbi);
        let len = nc + 2;
        let res = &mut self.nr.res;
        res.set_zero();

        for n in 0..nbi {
            res.res_abs[n * len] = bulk.st.rock_vp[n] - bulk.st.vf[n];
            for i in 0..nc {
                res.res_abs[n * len + 1 + i] = bulk.st.ni[n * nc + i] - bulk.last.ni[n * nc + i];
            }
            res.res_abs[n * len + 1 + nc] = Self::cell_energy(bulk, n) - self.energy_last[n];
        }

        rs.conn.cal_flux(&rs.bulk);
        let bulk = &rs.bulk;
        let kappa = bulk.rock.conductivity();
        for c in 0..rs.conn.num_conn() {
            let pair = rs.conn.conns[c];
            let (b, e) = (pair.b, pair.e);
            for i in 0..nc {
                let f = dt * rs.conn.flux_ni[c * nc + i];
                res.res_abs[b * len + 1 + i] += f;
                if e < nbi {
                    res.res_abs[e * len + 1 + i] -= f;
                }
            }
            // convective enthalpy plus conduction
            let mut fe = 0.0;
            for j in 0..np {
                let up = rs.conn.upblock[c * np + j];
                let idu = up * np + j;
                if bulk.st.phase_exist[idu] {
                    fe += rs.conn.velocity[c * np + j] * bulk.st.xi[idu] * bulk.st.h[idu];
                }
            }
            fe += kappa * pair.area_over_dist * (bulk.st.t[b] - bulk.st.t[e]);
            res.res_abs[b * len + 1 + nc] += dt * fe;
            if e < nbi {
                res.res_abs[e * len + 1 + nc] -= dt * fe;
            }
        }

        // well sources: mass rows then energy
        let mut w_row = nbi;
        for w in rs.wells.iter().filter(|w| w.is_open()) {
            for perf in &w.perfs {
                let k = perf.location;
                for i in 0..nc {
                    res.res_abs[k * len + 1 + i] += perf.qi_mol[i] * dt;
                }
            }
            match w.opt.mode {
                WellMode::Bhp => {
                    res.res_abs[w_row * len] = w.bhp - w.opt.bhp_limit;
                }
                _ => {
                    let sign = if w.opt.injector { 1.0 } else { -1.0 };
                    res.res_abs[w_row * len] = sign * w.opt.max_rate;
                    for i in 0..nc {
                        let f = if w.opt.injector { 1.0 } else { w.factor[i] };
                        res.res_abs[w_row * len] += w.qi_mol[i] * f;
                    }
                    res.max_well_rel_res = res
                        .max_well_rel_res
                        .max((res.res_abs[w_row * len] / w.opt.max_rate).abs());
                }
            }
            w_row += 1;
        }
        well_energy_res(rs, &mut self.nr.res.res_abs, dt);

        let res = &mut self.nr.res;
        for n in 0..nbi {
            let vp = rs.bulk.st.rock_vp[n];
            let nt = rs.bulk.st.nt[n];
            let mut sum_v = 0.0;
            for i in 0..len {
                let tmp = (res.res_abs[n * len + i] / vp).abs();
                if res.max_rel_res_v < tmp {
                    res.max_rel_res_v = tmp;
                    res.max_id_v = n;
                }
                sum_v += tmp * tmp;
            }
            res.res_rel_v[n] = sum_v.sqrt();
            for i in 1..=nc {
                let tmp = (res.res_abs[n * len + i] / nt).abs();
                if res.max_rel_res_n < tmp {
                    res.max_rel_res_n = tmp;
                    res.max_id_n = n;
                }
            }
        }
        for v in res.res_abs.iter_mut() {
            *v = -*v;
        }
        if reset_res0 {
            res.set_init_res();
            res.max_rel_res0_v = rs.domain.comm.allreduce_min_f64(res.max_rel_res0_v);
        }
    }

    pub fn assemble_mat(&mut self, rs: &Reservoir, dt: f64) {
        let bulk = &rs.bulk;
        let (np, nc, nbi) = (bulk.np, bulk.nc, bulk.nbi);
        let ncol = nc + 2;
        let nsec = np + np * nc;
        let bsize = ncol * ncol;
        let lensec = nsec * ncol;
        let nw = rs.num_open_wells();
        let kappa = bulk.rock.conductivity();

        self.ls.add_dim(nbi);

        let mut bmat = vec![0.0; bsize];
        for n in 0..nbi {
            bmat.fill(0.0);
            for i in 1..=nc {
                bmat[i * ncol + i] = 1.0;
            }
            // volume row
            bmat[0] = bulk.v[n] * bulk.st.poro_p[n] - bulk.st.vf_p[n];
            for i in 0..nc {
                bmat[i + 1] = -bulk.st.vfi[n * nc + i];
            }
            bmat[ncol - 1] = -bulk.st.vf_t[n];
            // energy row
            let erow = ncol - 1;
            let (h_r, h_r_t) = bulk.rock.enthalpy(bulk.st.t[n]);
            let mut de_dt = bulk.v[n] * (1.0 - bulk.st.poro[n]) * h_r_t;
            for j in 0..np {
                let id = n * np + j;
                if bulk.st.phase_exist[id] {
                    de_dt += bulk.st.ni[n * nc + j] * bulk.st.h_t[id];
                    // dE/dN_j: component j lives in phase j for this model
                    bmat[erow * ncol + 1 + j] = bulk.st.h[id];
                }
            }
            bmat[erow * ncol + erow] = de_dt;
            bmat[erow * ncol] = -bulk.v[n] * bulk.st.poro_p[n] * h_r;
            self.ls.new_diag(n, &bmat);
        }

        // flux terms: component rows via the isothermal machinery, then the
        // energy row
        let mut jac = FluxJac::sized(ncol, nsec);
        for c in 0..rs.conn.num_conn() {
            assemble_fim(&rs.conn, c, bulk, &mut jac);
            let pair = rs.conn.conns[c];
            let (b, e) = (pair.b, pair.e);
            let erow = ncol - 1;

            // energy convection: scale each phase's pressure coupling by
            // the upstream enthalpy; conduction sits on the T columns
            let mut de_dpb = 0.0;
            let mut de_dpe = 0.0;
            let mut de_dtb = kappa * pair.area_over_dist;
            let mut de_dte = -kappa * pair.area_over_dist;
            let gz = GRAVITY_FACTOR * (bulk.depth[b] - bulk.depth[e]);
            for j in 0..np {
                let up = rs.conn.upblock[c * np + j];
                let idu = up * np + j;
                if !bulk.st.phase_exist[idu] {
                    continue;
                }
                let (idb, ide) = (b * np + j, e * np + j);
                let dphi =
                    bulk.st.pj[idb] - bulk.st.pj[ide] - rs.conn.rho_face[c * np + j] * gz;
                let trans_j = DARCY_CONST * pair.trans * bulk.st.kr[idu] / bulk.st.mu[idu];
                let xih = bulk.st.xi[idu] * bulk.st.h[idu];
                de_dpb += trans_j * xih;
                de_dpe += -trans_j * xih;
                let dt_term = trans_j
                    * dphi
                    * (bulk.st.xi_t[idu] * bulk.st.h[idu] + bulk.st.xi[idu] * bulk.st.h_t[idu]
                        - xih * bulk.st.mu_t[idu] / bulk.st.mu[idu]);
                if up == b {
                    de_dtb += dt_term;
                } else {
                    de_dte += dt_term;
                }
            }

            for (side, dfdxp, dfdxs) in [
                (b, &jac.dfdxp_b, &jac.dfdxs_b),
                (e, &jac.dfdxp_e, &jac.dfdxs_e),
            ] {
                bmat.copy_from_slice(dfdxp);
                if side == b {
                    bmat[erow * ncol] = de_dpb;
                    bmat[erow * ncol + erow] = de_dtb;
                } else {
                    bmat[erow * ncol] = de_dpe;
                    bmat[erow * ncol + erow] = de_dte;
                }
                mat_acc(
                    ncol,
                    nsec,
                    dfdxs,
                    &bulk.st.dsec_dpri[side * lensec..(side + 1) * lensec],
                    &mut bmat,
                );
                for v in bmat.iter_mut() {
                    *v *= dt;
                }
                if side == b {
                    self.ls.add_diag(b, &bmat);
                    if e < nbi {
                        let neg: Vec<f64> = bmat.iter().map(|v| -v).collect();
                        self.ls.new_off_diag(e, b, &neg);
                    }
                } else if e < nbi {
                    self.ls.new_off_diag(b, e, &bmat);
                    let neg: Vec<f64> = bmat.iter().map(|v| -v).collect();
                    self.ls.add_diag(e, &neg);
                } else {
                    self.ls.new_off_diag(b, e + nw, &bmat);
                }
            }
        }

        // wells: mass rows widened to the thermal block; energy coupling
        // stays explicit in the perforation temperature
        let mut w_row = nbi;
        for w in rs.wells.iter().filter(|w| w.is_open()) {
            assemble_well_fim_t(w, &mut self.ls, bulk, w_row, dt);
            w_row += 1;
        }

        self.ls.assemble_rhs_copy(&self.nr.res.res_abs);
    }

    pub fn solve_linear_system(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        let nw = rs.num_open_wells();
        let status = self.ls.solve(&mut self.solver, &mut rs.domain, nw);
        let iters = if status < 0 {
            warn!(status, "linear solver failure, treating as non-convergence");
            (-status) as usize
        } else {
            status as usize
        };
        ctrl.iters.update_ls(iters);
        ctrl.iters.update_nr();
        self.nr.update_iter(iters);
        self.get_solution(rs, ctrl);
        self.ls.clear();
    }

    fn get_solution(&mut self, rs: &mut Reservoir, ctrl: &Control) {
        let bulk = &mut rs.bulk;
        let (np, nc, nb, nbi) = (bulk.np, bulk.nc, bulk.nb, bulk.nbi);
        let col = nc + 2;
        let nsec = np + np * nc;
        let lensec = nsec * col;
        let u = self.ls.solution().to_vec();
        self.nr.nr_dp_max = 0.0;
        self.nr.nr_dn_max = 0.0;
        self.nr.nr_dt_max = 0.0;
        self.nr.nr_dpw_max = 0.0;

        let mut w_row = nbi;
        for w in rs.wells.iter_mut().filter(|w| w.is_open()) {
            let dbhp = u[w_row * col];
            w.bhp += dbhp;
            self.nr.nr_dpw_max = self.nr.nr_dpw_max.max(dbhp.abs());
            w_row += 1;
        }

        let mut ucell = vec![0.0; nb * col];
        ucell[..nbi * col].copy_from_slice(&u[..nbi * col]);
        if rs.domain.comm.size() > 1 {
            rs.domain.exchange_f64(&mut ucell, col);
        }

        let ds_lim = ctrl.nr.ds_max;
        self.nr.s_nr.copy_from_slice(&bulk.st.s);
        let mut dtmp = vec![0.0; nsec];
        for n in 0..nb {
            dtmp.fill(0.0);
            let dsec = &bulk.st.dsec_dpri[n * lensec..(n + 1) * lensec];
            for r in 0..nsec {
                let mut sum = 0.0;
                for cidx in 0..col {
                    sum += dsec[r * col + cidx] * ucell[n * col + cidx];
                }
                dtmp[r] = sum;
            }
            let mut chopmin = 1.0f64;
            for j in 0..np {
                let s = bulk.st.s[n * np + j];
                let ds = dtmp[j];
                let mut choptmp = 1.0;
                if ds.abs() > ds_lim {
                    choptmp = ds_lim / ds.abs();
                } else if s + ds < 0.0 {
                    choptmp = 0.9 * s / ds.abs();
                }
                chopmin = chopmin.min(choptmp);
            }
            for j in 0..np {
                bulk.st.s[n * np + j] += chopmin * dtmp[j];
            }
            let dp = ucell[n * col];
            let dtemp = ucell[n * col + col - 1];
            if n < nbi {
                self.nr.nr_dp_max = self.nr.nr_dp_max.max(dp.abs());
                self.nr.nr_dt_max = self.nr.nr_dt_max.max(dtemp.abs());
            }
            bulk.st.p[n] += dp;
            bulk.st.t[n] += dtemp;
            for i in 0..nc {
                bulk.st.ni[n * nc + i] += ucell[n * col + 1 + i] * chopmin;
            }
        }
    }

    pub fn update_property(&mut self, rs: &mut Reservoir, ctrl: &mut Control) -> bool {
        let checks = [rs.bulk.check_ni(), rs.bulk.check_p(), rs.bulk.check_t()];
        let local = NrSuite::work_state_of(&checks);
        let global = ctrl.check(local, 0.0, &*rs.domain.comm);
        if global != WorkState::Continue {
            warn!(dt = ctrl.current_dt, "cut time step size and repeat");
            self.reset_to_last(rs, ctrl);
            return false;
        }
        thermal_flash(rs);
        let Reservoir { bulk, satfunc, .. } = &mut *rs;
        bulk.cal_kr_pc(satfunc.as_ref());
        rs.bulk.cal_rock();
        rs.cal_well_flux();
        self.cal_res(rs, ctrl.current_dt, false);
        true
    }

    pub fn finish_nr(&mut self, rs: &mut Reservoir, ctrl: &mut Control) -> bool {
        self.nr.cal_ds_max(&rs.bulk);
        let res = &self.nr.res;
        let nr = &ctrl.nr;
        let converged_loc = ((res.max_rel_res_v <= res.max_rel_res0_v * nr.tol
            || res.max_rel_res_v <= nr.tol
            || res.max_rel_res_n <= nr.tol)
            && res.max_well_rel_res <= nr.tol)
            || (self.nr.nr_dp_max.abs() <= nr.dp_min && self.nr.nr_ds_max.abs() <= nr.ds_min);
        let conflag = rs
            .domain
            .comm
            .allreduce_min_i32(if converged_loc { 0 } else { -1 });
        if conflag == 0 {
            let local = match rs.check_wells() {
                crate::error::WellCheck::Success => WorkState::Continue,
                crate::error::WellCheck::NegativePressure => WorkState::ResetCut,
                _ => WorkState::Reset,
            };
            let global = ctrl.check(local, 0.0, &*rs.domain.comm);
            if global != WorkState::Continue {
                self.reset_to_last(rs, ctrl);
                return false;
            }
            true
        } else if ctrl.iters.nr >= ctrl.nr.max_iter {
            ctrl.cut_dt();
            self.reset_to_last(rs, ctrl);
            false
        } else {
            false
        }
    }

    pub fn finish_step(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        rs.cal_ipr(ctrl.current_dt);
        self.nr.cal_max_change_time(&rs.bulk, &rs.wells);
        rs.commit();
        for n in 0..rs.bulk.nbi {
            self.energy_last[n] = Self::cell_energy(&rs.bulk, n);
        }
        ctrl.iters.update_total();
        ctrl.cal_next_time_step(
            self.nr.dp_max_t,
            self.nr.dt_max_t,
            self.nr.dn_max_t,
            self.nr.ds_max_t,
            self.nr.ev_max_t,
            &["dP", "dT", "dS", "iter"],
            &*rs.domain.comm,
        );
    }

    fn reset_to_last(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        rs.revert();
        ctrl.iters.reset();
        self.nr.reset_iter();
        self.cal_res(rs, ctrl.current_dt, true);
    }
}

fn thermal_flash(rs: &mut Reservoir) {
    let Reservoir { bulk, mixture, .. } = &mut *rs;
    let nc = bulk.nc;
    for n in 0..bulk.nb {
        let ni = bulk.st.ni[n * nc..(n + 1) * nc].to_vec();
        mixture.flash_der(bulk.st.p[n], bulk.st.t[n], &ni);
        let vs = mixture.vs().clone();
        bulk.pass_flash_value(n, &vs);
    }
}

/// Thermal well assembly: the isothermal mass-row pattern widened to the
/// (nc + 2)-block, with the well control row closing the block. Energy
/// coupling of the wells stays explicit in the perforation temperature.
pub fn assemble_well_fim_t(w: &Well, ls: &mut LinearSystem, bulk: &Bulk, w_row: usize, dt: f64) {
    let (np, nc) = (bulk.np, bulk.nc);
    let ncol = nc + 2;
    let nsec = np + np * nc;
    let bsize = ncol * ncol;
    let lensec = nsec * ncol;

    let mut bmat = vec![0.0; bsize];
    let mut dqdxp_b = vec![0.0; bsize];
    let mut dqdxp_w = vec![0.0; bsize];
    let mut dqdxs_b = vec![0.0; ncol * nsec];

    ls.new_diag(w_row, &vec![0.0; bsize]);

    for (pi, perf) in w.perfs.iter().enumerate() {
        let n = perf.location;
        dqdxp_b.fill(0.0);
        dqdxp_w.fill(0.0);
        dqdxs_b.fill(0.0);

        if w.opt.injector {
            let dp = bulk.st.p[n] - perf.p;
            for j in 0..np {
                let id = n * np + j;
                if !bulk.st.phase_exist[id] {
                    continue;
                }
                let mu = bulk.st.mu[id];
                for i in 0..nc {
                    let trans_ij = perf.transj[j] * perf.xi * w.opt.inj_zi[i];
                    dqdxp_b[(i + 1) * ncol] += trans_ij * (1.0 - dp * bulk.st.mu_p[id] / mu);
                    dqdxp_w[(i + 1) * ncol] += -trans_ij;
                    // temperature moves the cell-side mobility
                    dqdxp_b[(i + 1) * ncol + ncol - 1] +=
                        -trans_ij * dp * bulk.st.mu_t[id] / mu;
                    for k in 0..np {
                        dqdxs_b[(i + 1) * nsec + k] += perf.wi
                            * perf.multiplier
                            * perf.xi
                            * w.opt.inj_zi[i]
                            * bulk.st.dkr_ds[id * np + k]
                            * dp
                            / mu;
                    }
                }
            }
        } else {
            for j in 0..np {
                let id = n * np + j;
                if !bulk.st.phase_exist[id] {
                    continue;
                }
                let dp = bulk.st.pj[id] - w.bhp - w.dg[pi];
                let xi = bulk.st.xi[id];
                let mu = bulk.st.mu[id];
                for i in 0..nc {
                    let xij = bulk.st.xij[id * nc + i];
                    let trans_ij = perf.transj[j] * xi * xij;
                    dqdxp_b[(i + 1) * ncol] += trans_ij * (1.0 - dp * bulk.st.mu_p[id] / mu)
                        + dp * perf.transj[j] * xij * bulk.st.xi_p[id];
                    dqdxp_w[(i + 1) * ncol] += -trans_ij;
                    dqdxp_b[(i + 1) * ncol + ncol - 1] += dp
                        * perf.transj[j]
                        * xij
                        * (bulk.st.xi_t[id] - xi * bulk.st.mu_t[id] / mu);
                    for k in 0..np {
                        let mut tmp = perf.wi * perf.multiplier * dp / mu
                            * xi
                            * xij
                            * bulk.st.dkr_ds[id * np + k];
                        tmp += trans_ij * bulk.st.dpc_ds[id * np + k];
                        dqdxs_b[(i + 1) * nsec + k] += tmp;
                    }
                }
            }
        }

        bmat.copy_from_slice(&dqdxp_b);
        mat_acc(
            ncol,
            nsec,
            &dqdxs_b,
            &bulk.st.dsec_dpri[n * lensec..(n + 1) * lensec],
            &mut bmat,
        );
        for v in bmat.iter_mut() {
            *v *= dt;
        }
        ls.add_diag(n, &bmat);

        bmat.copy_from_slice(&dqdxp_w);
        for v in bmat.iter_mut() {
            *v *= dt;
        }
        ls.new_off_diag(n, w_row, &bmat);

        match w.opt.mode {
            WellMode::Bhp => {
                bmat.fill(0.0);
                for i in 0..ncol {
                    bmat[i * ncol + i] = 1.0;
                }
                ls.add_diag(w_row, &bmat);
                bmat.fill(0.0);
                ls.new_off_diag(w_row, n, &bmat);
            }
            _ => {
                bmat.fill(0.0);
                for i in 0..nc {
                    let f = if w.opt.injector { 1.0 } else { w.factor[i] };
                    bmat[0] += dqdxp_w[(i + 1) * ncol] * f;
                    bmat[(i + 1) * ncol + i + 1] = 1.0;
                }
                bmat[(ncol - 1) * ncol + ncol - 1] = 1.0;
                ls.add_diag(w_row, &bmat);

                bmat.copy_from_slice(&dqdxp_b);
                mat_acc(
                    ncol,
                    nsec,
                    &dqdxs_b,
                    &bulk.st.dsec_dpri[n * lensec..(n + 1) * lensec],
                    &mut bmat,
                );
                let mut bmat2 = vec![0.0; bsize];
                for i in 0..nc {
                    let f = if w.opt.injector { 1.0 } else { w.factor[i] };
                    for c in 0..ncol {
                        bmat2[c] += f * bmat[(i + 1) * ncol + c];
                    }
                }
                ls.new_off_diag(w_row, n, &bmat2);
            }
        }
    }
}
