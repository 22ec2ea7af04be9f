//! Isothermal solution methods: fully implicit (FIM), implicit pressure
//! explicit composition (IMPEC), and adaptive implicit (AIMc). Each exposes
//! the same step surface the orchestrator drives: prepare, assemble, solve,
//! update properties, finish the Newton loop, finish the step.

use crate::aimc::set_fim_bulk;
use crate::conn::{FluxJac, assemble_fim, assemble_impec};
use crate::control::Control;
use crate::error::{WellCheck, WorkState};
use crate::linsys::{BsrBicgstab, LinearSystem};
use crate::nr::NrSuite;
use crate::reservoir::Reservoir;
use crate::well::mat_acc;
use tracing::{debug, warn};

/// Flash every local cell, with derivatives for cells where `der` says so,
/// routing through the skip-stability accelerator when present.
fn cal_flash(rs: &mut Reservoir, der: impl Fn(usize) -> bool) {
    let Reservoir {
        bulk,
        mixture,
        skip,
        ..
    } = &mut *rs;
    let (np, nc) = (bulk.np, bulk.nc);
    for n in 0..bulk.nb {
        let p = bulk.st.p[n];
        let t = bulk.st.t[n];
        let ni = bulk.st.ni[n * nc..(n + 1) * nc].to_vec();
        if let Some(sk) = skip.as_ref() {
            let s = &bulk.st.s[n * np..(n + 1) * np];
            let ftype = sk.cal_ftype_s(p, t, &ni, s, bulk.st.phase_num[n], n);
            mixture.set_ftype(ftype);
        }
        let with_der = der(n);
        if with_der {
            mixture.flash_der(p, t, &ni);
        } else {
            mixture.flash(p, t, &ni);
        }
        let vs = mixture.vs().clone();
        bulk.pass_flash_value(n, &vs);
        if !with_der {
            // the shared varset still carries the previous cell's
            // derivative block; this cell contributes none
            let lensec = (np + np * nc) * bulk.ncol;
            bulk.st.dsec_dpri[n * lensec..(n + 1) * lensec].fill(0.0);
        }
        if let Some(sk) = skip.as_mut() {
            if let Some(comp) = mixture.as_comp() {
                sk.cal_skip_for_next_step(n, p, t, comp);
            }
        }
    }
}

/// Initialization shared by every method: initial state, rock, flash,
/// saturation functions, wells, then the first commit.
fn init_reservoir(rs: &mut Reservoir, cfg: &crate::config::RunConfig) {
    rs.init_state(cfg);
    rs.bulk.cal_rock();
    cal_flash(rs, |_| true);
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
}

/// Physical checks common to the implicit methods, already mapped to a
/// work state.
fn check_bulk_pn(rs: &mut Reservoir) -> WorkState {
    let checks = [rs.bulk.check_ni(), rs.bulk.check_p()];
    NrSuite::work_state_of(&checks)
}

fn well_check_state(check: WellCheck) -> WorkState {
    match check {
        WellCheck::Success => WorkState::Continue,
        WellCheck::NegativePressure => WorkState::ResetCut,
        WellCheck::SwitchToBhpMode | WellCheck::CrossFlow => WorkState::Reset,
    }
}

// ------------------------------------------------------------------- FIM --

pub struct IsoTFim {
    pub nr: NrSuite,
    ls: LinearSystem,
    solver: BsrBicgstab,
}

impl IsoTFim {
    pub fn setup(rs: &Reservoir) -> Self {
        let bulk = &rs.bulk;
        let ncol = bulk.nc + 1;
        let max_dim = bulk.nbi + rs.wells.len();
        IsoTFim {
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
        }
    }

    pub fn init_reservoir(&mut self, rs: &mut Reservoir, cfg: &crate::config::RunConfig) {
        init_reservoir(rs, cfg);
    }

    pub fn prepare(&mut self, rs: &mut Reservoir, dt: f64) {
        rs.prepare_wells();
        self.nr.resize_wells(rs.num_open_wells(), rs.bulk.nc + 1);
        self.nr.init_step(&rs.bulk);
        self.nr.init_iter();
        self.cal_res(rs, dt, true);
    }

    fn cal_res(&mut self, rs: &mut Reservoir, dt: f64, reset_res0: bool) {
        let nbi = rs.bulk.nbi;
        let nc = rs.bulk.nc;
        let len = nc + 1;
        let res = &mut self.nr.res;
        res.set_zero();

        // accumulation
        for n in 0..nbi {
            res.res_abs[n * len] = rs.bulk.st.rock_vp[n] - rs.bulk.st.vf[n];
            for i in 0..nc {
                res.res_abs[n * len + 1 + i] =
                    rs.bulk.st.ni[n * nc + i] - rs.bulk.last.ni[n * nc + i];
            }
        }

        // connection fluxes
        rs.conn.cal_flux(&rs.bulk);
        for c in 0..rs.conn.num_conn() {
            let (b, e) = (rs.conn.conns[c].b, rs.conn.conns[c].e);
            for i in 0..nc {
                let f = dt * rs.conn.flux_ni[c * nc + i];
                res.res_abs[b * len + 1 + i] += f;
                if e < nbi {
                    res.res_abs[e * len + 1 + i] -= f;
                }
            }
        }

        // wells
        let mut w_row = nbi;
        for w in rs.wells.iter().filter(|w| w.is_open()) {
            w.cal_res_fim(w_row, res, dt);
            w_row += 1;
        }

        // relative norms
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
            let mut sum_n = 0.0;
            for i in 1..len {
                let tmp = (res.res_abs[n * len + i] / nt).abs();
                if res.max_rel_res_n < tmp {
                    res.max_rel_res_n = tmp;
                    res.max_id_n = n;
                }
                sum_n += tmp * tmp;
            }
            res.res_rel_n[n] = sum_n.sqrt();
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
        let ncol = nc + 1;
        let nsec = np + np * nc;
        let bsize = ncol * ncol;
        let lensec = nsec * ncol;
        let nw = rs.num_open_wells();

        self.ls.add_dim(nbi);

        // accumulation term
        let mut bmat = vec![0.0; bsize];
        for n in 0..nbi {
            bmat.fill(0.0);
            for i in 1..ncol {
                bmat[i * ncol + i] = 1.0;
            }
            bmat[0] = bulk.v[n] * bulk.st.poro_p[n] - bulk.st.vf_p[n];
            for i in 0..nc {
                bmat[i + 1] = -bulk.st.vfi[n * nc + i];
            }
            self.ls.new_diag(n, &bmat);
        }

        // flux term
        let mut jac = FluxJac::sized(ncol, nsec);
        for c in 0..rs.conn.num_conn() {
            assemble_fim(&rs.conn, c, bulk, &mut jac);
            let (b, e) = (rs.conn.conns[c].b, rs.conn.conns[c].e);

            bmat.copy_from_slice(&jac.dfdxp_b);
            mat_acc(
                ncol,
                nsec,
                &jac.dfdxs_b,
                &bulk.st.dsec_dpri[b * lensec..(b + 1) * lensec],
                &mut bmat,
            );
            for v in bmat.iter_mut() {
                *v *= dt;
            }
            self.ls.add_diag(b, &bmat);
            if e < nbi {
                let neg: Vec<f64> = bmat.iter().map(|v| -v).collect();
                self.ls.new_off_diag(e, b, &neg);
            }

            bmat.copy_from_slice(&jac.dfdxp_e);
            mat_acc(
                ncol,
                nsec,
                &jac.dfdxs_e,
                &bulk.st.dsec_dpri[e * lensec..(e + 1) * lensec],
                &mut bmat,
            );
            for v in bmat.iter_mut() {
                *v *= dt;
            }
            if e < nbi {
                self.ls.new_off_diag(b, e, &bmat);
                let neg: Vec<f64> = bmat.iter().map(|v| -v).collect();
                self.ls.add_diag(e, &neg);
            } else {
                // ghost column
                self.ls.new_off_diag(b, e + nw, &bmat);
            }
        }

        // wells
        let mut w_row = nbi;
        for w in rs.wells.iter().filter(|w| w.is_open()) {
            w.assemble_fim(&mut self.ls, bulk, w_row, dt);
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

    /// Apply the Newton update with the per-cell chop-and-limit, well BHPs
    /// first, ghosts refreshed by a halo exchange of the solution.
    fn get_solution(&mut self, rs: &mut Reservoir, ctrl: &Control) {
        let bulk = &mut rs.bulk;
        let (np, nc, nb, nbi) = (bulk.np, bulk.nc, bulk.nb, bulk.nbi);
        let col = nc + 1;
        let nsec = np + np * nc;
        let lensec = nsec * col;
        let u = self.ls.solution().to_vec();
        self.nr.nr_dp_max = 0.0;
        self.nr.nr_dn_max = 0.0;
        self.nr.nr_dpw_max = 0.0;

        let mut w_row = nbi;
        for w in rs.wells.iter_mut().filter(|w| w.is_open()) {
            let dbhp = u[w_row * col];
            w.bhp += dbhp;
            self.nr.nr_dpw_max = self.nr.nr_dpw_max.max(dbhp.abs());
            w_row += 1;
        }

        // exchange the bulk part of the solution so ghosts see their update
        let mut ucell = vec![0.0; nb * col];
        ucell[..nbi * col].copy_from_slice(&u[..nbi * col]);
        if rs.domain.comm.size() > 1 {
            rs.domain.exchange_f64(&mut ucell, col);
        }

        let ds_lim = ctrl.nr.ds_max;
        self.nr.s_nr.copy_from_slice(&bulk.st.s);
        let is_comp = rs.mixture.as_comp().is_some();

        let mut dtmp = vec![0.0; nsec];
        for n in 0..nb {
            // secondary move implied by this cell's primary update
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
            if is_comp && bulk.st.phase_num[n] >= 2 {
                // compositional: move the mole fractions of the hydrocarbon
                // phases along the chopped direction
                for j in 0..2 {
                    for i in 0..nc {
                        bulk.st.xij[(n * np + j) * nc + i] +=
                            chopmin * dtmp[np + j * nc + i];
                    }
                }
            }

            let dp = ucell[n * col];
            if n < nbi {
                self.nr.nr_dp_max = self.nr.nr_dp_max.max(dp.abs());
            }
            bulk.st.p[n] += dp;
            for i in 0..nc {
                let dn = ucell[n * col + 1 + i] * chopmin;
                if n < nbi && bulk.st.nt[n] > 0.0 {
                    self.nr.nr_dn_max = self.nr.nr_dn_max.max((dn / bulk.st.nt[n]).abs());
                }
                bulk.st.ni[n * nc + i] += dn;
            }
        }
    }

    pub fn update_property(&mut self, rs: &mut Reservoir, ctrl: &mut Control) -> bool {
        let local = check_bulk_pn(rs);
        let global = ctrl.check(local, 0.0, &*rs.domain.comm);
        if global != WorkState::Continue {
            warn!(dt = ctrl.current_dt, "cut time step size and repeat");
            self.reset_to_last(rs, ctrl);
            return false;
        }

        cal_flash(rs, |_| true);
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
            let local = well_check_state(rs.check_wells());
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
        ctrl.iters.update_total();
        ctrl.cal_next_time_step(
            self.nr.dp_max_t,
            self.nr.dt_max_t,
            self.nr.dn_max_t,
            self.nr.ds_max_t,
            self.nr.ev_max_t,
            &["dP", "dS", "iter"],
            &*rs.domain.comm,
        );
        debug!(
            time = ctrl.current_time,
            next_dt = ctrl.current_dt,
            nr = ctrl.iters.nr_total,
            "FIM step finished"
        );
    }

    fn reset_to_last(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        rs.revert();
        ctrl.iters.reset();
        self.nr.reset_iter();
        self.cal_res(rs, ctrl.current_dt, true);
    }
}

// ----------------------------------------------------------------- IMPEC --

pub struct IsoTImpec {
    pub nr: NrSuite,
    ls: LinearSystem,
    solver: BsrBicgstab,
}

impl IsoTImpec {
    pub fn setup(rs: &Reservoir) -> Self {
        let bulk = &rs.bulk;
        let max_dim = bulk.nbi + rs.wells.len();
        IsoTImpec {
            nr: NrSuite::new(bulk.nbi, bulk.nb, bulk.np, bulk.nc, rs.num_open_wells(), 1),
            ls: LinearSystem::new(max_dim, 1),
            solver: BsrBicgstab::new(1),
        }
    }

    pub fn init_reservoir(&mut self, rs: &mut Reservoir, cfg: &crate::config::RunConfig) {
        init_reservoir(rs, cfg);
    }

    /// CFL-limited preparation: cut the stepsize until the explicit
    /// marching is stable.
    pub fn prepare(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        rs.prepare_wells();
        self.nr.init_step(&rs.bulk);
        self.nr.init_iter();
        loop {
            let max_cfl = self.nr.cal_cfl(&rs.bulk, &rs.conn, &rs.wells, ctrl.current_dt);
            let local = NrSuite::work_state_of(&[self.nr.check_cfl(1.0)]);
            let global = ctrl.check(local, max_cfl, &*rs.domain.comm);
            if global == WorkState::Continue {
                break;
            }
        }
    }

    pub fn assemble_mat(&mut self, rs: &Reservoir, dt: f64) {
        let bulk = &rs.bulk;
        let nbi = bulk.nbi;
        let nw = rs.num_open_wells();
        self.ls.add_dim(nbi);

        for n in 0..nbi {
            let vpp = bulk.v[n] * bulk.st.poro_p[n];
            let diag = vpp - bulk.st.vf_p[n];
            self.ls.new_diag(n, &[diag]);
            self.ls.add_rhs(
                n,
                &[diag * bulk.last.p[n] + (bulk.st.vf[n] - bulk.st.rock_vp[n])],
            );
        }

        for c in 0..rs.conn.num_conn() {
            let coef = assemble_impec(&rs.conn, c, bulk);
            let (b, e) = (rs.conn.conns[c].b, rs.conn.conns[c].e);
            if e < nbi {
                self.ls.add_diag(b, &[dt * coef.valbb]);
                self.ls.add_diag(e, &[dt * coef.valee]);
                self.ls.new_off_diag(b, e, &[-dt * coef.valbb]);
                self.ls.new_off_diag(e, b, &[-dt * coef.valee]);
                self.ls.add_rhs(b, &[dt * coef.rhsb]);
                self.ls.add_rhs(e, &[dt * coef.rhse]);
            } else {
                self.ls.add_diag(b, &[dt * coef.valbb]);
                self.ls.new_off_diag(b, e + nw, &[-dt * coef.valbb]);
                self.ls.add_rhs(b, &[dt * coef.rhsb]);
            }
        }

        let mut w_row = nbi;
        for w in rs.wells.iter().filter(|w| w.is_open()) {
            w.assemble_impec(&mut self.ls, bulk, w_row, dt);
            w_row += 1;
        }
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
        self.get_solution(rs);
        self.ls.clear();
    }

    fn get_solution(&mut self, rs: &mut Reservoir) {
        let bulk = &mut rs.bulk;
        let (np, nb, nbi) = (bulk.np, bulk.nb, bulk.nbi);
        let u = self.ls.solution().to_vec();

        let mut w_row = nbi;
        for w in rs.wells.iter_mut().filter(|w| w.is_open()) {
            w.bhp = u[w_row];
            w_row += 1;
        }

        let mut ucell = vec![0.0; nb];
        ucell[..nbi].copy_from_slice(&u[..nbi]);
        if rs.domain.comm.size() > 1 {
            rs.domain.exchange_f64(&mut ucell, 1);
        }
        for n in 0..nb {
            if n < nbi {
                self.nr.nr_dp_max = self.nr.nr_dp_max.max((ucell[n] - bulk.st.p[n]).abs());
            }
            bulk.st.p[n] = ucell[n];
            for j in 0..np {
                bulk.st.pj[n * np + j] = bulk.st.p[n] + bulk.st.pc[n * np + j];
            }
        }
    }

    pub fn update_property(&mut self, rs: &mut Reservoir, ctrl: &mut Control) -> bool {
        let dt = ctrl.current_dt;

        // pressure checks before any mass movement
        let local = {
            let b = rs.bulk.check_p();
            let w = well_check_state(rs.check_wells());
            let bs = NrSuite::work_state_of(&[b]);
            WorkState::from_code(bs.code().min(w.code()))
        };
        if ctrl.check(local, 0.0, &*rs.domain.comm) != WorkState::Continue {
            return false;
        }

        // explicit mass conservation
        rs.conn.cal_flux(&rs.bulk);
        rs.cal_well_flux();
        rs.conn.mass_conserve(&mut rs.bulk, dt);
        {
            let Reservoir { bulk, wells, .. } = &mut *rs;
            for w in wells.iter().filter(|w| w.is_open()) {
                for perf in &w.perfs {
                    for i in 0..bulk.nc {
                        bulk.st.ni[perf.location * bulk.nc + i] -= perf.qi_mol[i] * dt;
                    }
                }
            }
        }
        rs.exchange_ni();

        // CFL and moles checks
        let max_cfl = self.nr.cal_cfl(&rs.bulk, &rs.conn, &rs.wells, dt);
        let local = NrSuite::work_state_of(&[self.nr.check_cfl(1.0), rs.bulk.check_ni()]);
        if ctrl.check(local, max_cfl, &*rs.domain.comm) != WorkState::Continue {
            self.reset_to_last(rs);
            ctrl.iters.reset();
            return false;
        }

        rs.bulk.cal_rock();
        cal_flash(rs, |_| false);

        let local = NrSuite::work_state_of(&[rs.bulk.check_ve(0.01)]);
        if ctrl.check(local, 0.0, &*rs.domain.comm) != WorkState::Continue {
            self.reset_to_last(rs);
            ctrl.iters.reset();
            return false;
        }

        let Reservoir { bulk, satfunc, .. } = &mut *rs;
        bulk.cal_kr_pc(satfunc.as_ref());
        rs.conn.cal_flux(&rs.bulk);
        true
    }

    pub fn finish_nr(&mut self) -> bool {
        true
    }

    pub fn finish_step(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        rs.cal_ipr(ctrl.current_dt);
        self.nr.cal_max_change_time(&rs.bulk, &rs.wells);
        rs.commit();
        ctrl.iters.update_total();
        ctrl.cal_next_time_step(
            self.nr.dp_max_t,
            self.nr.dt_max_t,
            self.nr.dn_max_t,
            self.nr.ds_max_t,
            self.nr.ev_max_t,
            &["dP", "dN", "dS", "eV"],
            &*rs.domain.comm,
        );
    }

    fn reset_to_last(&mut self, rs: &mut Reservoir) {
        rs.revert();
        self.nr.reset_iter();
    }
}

// ------------------------------------------------------------------ AIMc --

/// Adaptive implicit: the FIM machinery with explicit cells contributing
/// only their pressure coupling. Implicit cells carry full derivative
/// blocks composed via `dSec_dPri`.
pub struct IsoTAimc {
    fim: IsoTFim,
}

impl IsoTAimc {
    pub fn setup(rs: &Reservoir) -> Self {
        IsoTAimc {
            fim: IsoTFim::setup(rs),
        }
    }

    pub fn nr(&self) -> &NrSuite {
        &self.fim.nr
    }

    pub fn nr_mut(&mut self) -> &mut NrSuite {
        &mut self.fim.nr
    }

    pub fn init_reservoir(&mut self, rs: &mut Reservoir, cfg: &crate::config::RunConfig) {
        init_reservoir(rs, cfg);
    }

    pub fn prepare(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        rs.prepare_wells();
        self.fim.nr.resize_wells(rs.num_open_wells(), rs.bulk.nc + 1);
        self.fim.nr.init_step(&rs.bulk);
        self.fim.nr.init_iter();
        self.fim.cal_res(rs, ctrl.current_dt, true);

        // classify cells for this step, consistently across ranks
        self.fim
            .nr
            .cal_cfl(&rs.bulk, &rs.conn, &rs.wells, ctrl.current_dt);
        {
            let Reservoir {
                aim,
                bulk,
                conn,
                domain,
                ..
            } = &mut *rs;
            set_fim_bulk(aim, bulk, conn, &self.fim.nr, domain);
        }
        // fresh derivative set on the implicit cells
        let implicit: Vec<bool> = (0..rs.bulk.nb).map(|n| rs.aim.is_implicit(n)).collect();
        cal_flash(rs, |n| implicit[n]);
        let Reservoir { bulk, satfunc, .. } = &mut *rs;
        bulk.cal_kr_pc(satfunc.as_ref());
        rs.commit();
    }

    pub fn assemble_mat(&mut self, rs: &Reservoir, dt: f64) {
        // explicit cells keep a zeroed secondary block, so the composed
        // coupling degenerates to the pressure column on its own
        self.fim.assemble_mat(rs, dt);
    }

    pub fn solve_linear_system(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        self.fim.solve_linear_system(rs, ctrl);
    }

    pub fn update_property(&mut self, rs: &mut Reservoir, ctrl: &mut Control) -> bool {
        let local = check_bulk_pn(rs);
        let global = ctrl.check(local, 0.0, &*rs.domain.comm);
        if global != WorkState::Continue {
            warn!(dt = ctrl.current_dt, "cut time step size and repeat");
            self.fim.reset_to_last(rs, ctrl);
            return false;
        }
        let implicit: Vec<bool> = (0..rs.bulk.nb).map(|n| rs.aim.is_implicit(n)).collect();
        cal_flash(rs, |n| implicit[n]);
        let Reservoir { bulk, satfunc, .. } = &mut *rs;
        bulk.cal_kr_pc(satfunc.as_ref());
        rs.bulk.cal_rock();
        rs.cal_well_flux();
        self.fim.cal_res(rs, ctrl.current_dt, false);
        true
    }

    pub fn finish_nr(&mut self, rs: &mut Reservoir, ctrl: &mut Control) -> bool {
        let ok = self.fim.finish_nr(rs, ctrl);
        if ok {
            // final property evaluation of the explicit cells at the
            // accepted state
            let implicit: Vec<bool> = (0..rs.bulk.nb).map(|n| rs.aim.is_implicit(n)).collect();
            cal_flash(rs, |n| implicit[n]);
            let Reservoir { bulk, satfunc, .. } = &mut *rs;
            bulk.cal_kr_pc(satfunc.as_ref());
        }
        ok
    }

    pub fn finish_step(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        self.fim.finish_step(rs, ctrl);
    }
}
