//! Solution control: per-window tuning schedule, the global reset decision
//! (a collective minimum over integer work states), and adaptive time-step
//! prediction.

use crate::comm::Communicator;
use crate::config::{Method, Model, NrParams, RunConfig, TuningParams};
use crate::consts::TINY;
use crate::error::WorkState;
use tracing::{debug, warn};

/// Cumulative iteration bookkeeping across the run.
#[derive(Clone, Copy, Debug, Default)]
pub struct ItersInfo {
    pub num_tstep: usize,
    /// Newton iterations in the current step
    pub nr: usize,
    pub nr_total: usize,
    pub nr_wasted: usize,
    /// linear iterations in the current step
    pub ls: usize,
    pub ls_total: usize,
    pub ls_wasted: usize,
}

impl ItersInfo {
    pub fn update_nr(&mut self) {
        self.nr += 1;
    }

    pub fn update_ls(&mut self, n: usize) {
        self.ls += n;
    }

    /// Close out a successful step.
    pub fn update_total(&mut self) {
        self.num_tstep += 1;
        self.nr_total += self.nr;
        self.ls_total += self.ls;
        self.nr = 0;
        self.ls = 0;
    }

    /// A reset wastes the iterations spent so far.
    pub fn reset(&mut self) {
        self.nr_wasted += self.nr;
        self.ls_wasted += self.ls;
        self.nr = 0;
        self.ls = 0;
    }
}

/// Per-run solution control. Windows are the intervals between consecutive
/// report times; each carries its own tuning and Newton parameter sets.
pub struct Control {
    pub model: Model,
    pub method: Method,
    windows: Vec<(TuningParams, NrParams)>,
    critical_time: Vec<f64>,

    /// active tuning (current window)
    pub time: TuningParams,
    pub nr: NrParams,
    pub end_time: f64,

    pub predict_dt: f64,
    pub current_dt: f64,
    pub last_dt: f64,
    pub current_time: f64,

    pub iters: ItersInfo,
    pub stop_sim: bool,
    first_step: bool,
}

impl Control {
    pub fn new(cfg: &RunConfig) -> Self {
        let windows = cfg.tuning_per_window();
        Control {
            model: cfg.model,
            method: cfg.method,
            time: windows[0].0,
            nr: windows[0].1,
            windows,
            critical_time: cfg.tstep.clone(),
            end_time: cfg.tstep[0],
            predict_dt: 0.0,
            current_dt: 0.0,
            last_dt: 0.0,
            current_time: 0.0,
            iters: ItersInfo::default(),
            stop_sim: false,
            first_step: true,
        }
    }

    pub fn num_windows(&self) -> usize {
        self.critical_time.len()
    }

    /// Install window `i`'s tuning and pick its first stepsize: `dt_init`
    /// on the very first window or when the well schedule changed, else the
    /// prediction carried over from the previous step. The choice is made
    /// collectively through the well-change flag reduction.
    pub fn apply_control(&mut self, i: usize, well_opt_change: bool, comm: &dyn Communicator) {
        let (time, nr) = self.windows[i];
        self.time = time;
        self.nr = nr;
        self.end_time = self.critical_time[i];

        let change = comm.allreduce_min_i32(i32::from(well_opt_change)) != 0;
        let dt = self.end_time - self.current_time;
        assert!(dt > 0.0, "non-positive time stepsize");
        if change || self.first_step {
            self.current_dt = dt.min(self.time.dt_init);
            self.first_step = false;
        } else {
            self.current_dt = dt.min(self.predict_dt);
        }
    }

    /// Turn local verdicts into the global work state and apply the
    /// corresponding stepsize action. Returns the global state.
    pub fn check(&mut self, local: WorkState, max_cfl: f64, comm: &dyn Communicator) -> WorkState {
        let global = WorkState::from_code(comm.allreduce_min_i32(local.code()));
        match global {
            WorkState::Continue | WorkState::Reset => {}
            WorkState::ResetCut => {
                self.current_dt *= self.time.cut_fac_nr;
            }
            WorkState::ResetCutCfl => {
                let cfl = comm.allreduce_max_f64(max_cfl);
                self.current_dt /= cfl + 1.0;
            }
        }
        if global != WorkState::Continue {
            debug!(state = global.code(), dt = self.current_dt, "time step reset");
        }
        global
    }

    /// Cut after a failed Newton loop.
    pub fn cut_dt(&mut self) {
        self.current_dt *= self.time.cut_fac_nr;
        warn!(
            dt = self.current_dt,
            "Newton loop not converged, cutting time step"
        );
    }

    /// Predict the next stepsize from the maximum changes of the finished
    /// step. `items` selects the enabled heuristics.
    #[allow(clippy::too_many_arguments)]
    pub fn cal_next_time_step(
        &mut self,
        dp_max: f64,
        dt_max: f64,
        dn_max: f64,
        ds_max: f64,
        ev_max: f64,
        items: &[&str],
        comm: &dyn Communicator,
    ) {
        self.last_dt = self.current_dt;
        self.current_time += self.current_dt;

        let mut factor = self.time.max_incre_fac;
        for &item in items {
            match item {
                "dP" => {
                    if dp_max > TINY {
                        factor = factor.min(self.time.dp_lim / dp_max);
                    }
                }
                "dT" => {
                    if dt_max > TINY {
                        factor = factor.min(self.time.dt_lim / dt_max);
                    }
                }
                "dN" => {
                    if dn_max > TINY {
                        factor = factor.min(self.time.dn_lim / dn_max);
                    }
                }
                "dS" => {
                    if ds_max > TINY {
                        factor = factor.min(self.time.ds_lim / ds_max);
                    }
                }
                "eV" => {
                    if ev_max > TINY {
                        factor = factor.min(self.time.ev_lim / ev_max);
                    }
                }
                "iter" => {
                    if self.iters.nr < 5 {
                        factor = factor.min(2.0);
                    } else if self.iters.nr > 10 {
                        factor = factor.min(0.5);
                    } else {
                        factor = factor.min(1.5);
                    }
                }
                _ => unreachable!("unknown time-step heuristic {item}"),
            }
        }
        factor = factor.max(self.time.min_chop_fac);

        let dt_loc = (self.current_dt * factor).clamp(self.time.dt_min, self.time.dt_max);
        self.current_dt = comm.allreduce_min_f64(dt_loc);
        self.predict_dt = self.current_dt;

        // never step past the next report time
        if self.current_dt > self.end_time - self.current_time {
            self.current_dt = self.end_time - self.current_time;
        }
    }

    /// Has the current window's report time been reached.
    pub fn window_finished(&self) -> bool {
        self.end_time - self.current_time < TINY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SerialComm;
    use crate::config::{FluidConfig, SatConfig};

    fn cfg() -> RunConfig {
        RunConfig {
            model: Model::Isothermal,
            method: Method::Fim,
            tstep: vec![30.0, 60.0],
            tuning: vec![],
            rock: Default::default(),
            sat: SatConfig::Corey {
                s_wc: 0.2,
                s_or: 0.2,
                n_w: 2.0,
                n_o: 2.0,
                krw_max: 1.0,
                kro_max: 1.0,
                p_entry: 0.0,
                lambda: 2.0,
            },
            fluid: FluidConfig::DeadOilWater {
                pvdo: vec![[400.0, 1.012, 1.16], [5000.0, 1.0, 1.2]],
                pvtw: [3600.0, 1.00341, 3.0e-6, 0.52, 0.0],
                rho_std: [49.1, 64.79],
            },
            wells: vec![],
            p_init: 3000.0,
            t_init: 150.0,
            sw_init: 0.25,
            sg_init: 0.0,
            z_init: vec![],
        }
    }

    #[test]
    fn first_step_uses_dt_init() {
        let mut ctrl = Control::new(&cfg());
        ctrl.apply_control(0, false, &SerialComm);
        assert_eq!(ctrl.current_dt, 1.0);
    }

    #[test]
    fn reset_cut_shrinks_dt_by_the_configured_factor() {
        let mut ctrl = Control::new(&cfg());
        ctrl.apply_control(0, false, &SerialComm);
        let dt0 = ctrl.current_dt;
        let state = ctrl.check(WorkState::ResetCut, 0.0, &SerialComm);
        assert_eq!(state, WorkState::ResetCut);
        assert!((ctrl.current_dt - dt0 * ctrl.time.cut_fac_nr).abs() < 1e-12);
    }

    #[test]
    fn cfl_reset_divides_by_cfl_plus_one() {
        let mut ctrl = Control::new(&cfg());
        ctrl.apply_control(0, false, &SerialComm);
        let dt0 = ctrl.current_dt;
        ctrl.check(WorkState::ResetCutCfl, 3.0, &SerialComm);
        assert!((ctrl.current_dt - dt0 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn prediction_caps_at_report_time() {
        let mut ctrl = Control::new(&cfg());
        ctrl.apply_control(0, false, &SerialComm);
        ctrl.current_dt = 29.5;
        ctrl.current_time = 0.0;
        // tiny changes -> prediction wants to grow, but the report time at
        // day 30 clips it
        ctrl.cal_next_time_step(1.0, 0.0, 0.0, 0.001, 0.0, &["dP", "dS", "iter"], &SerialComm);
        assert!(ctrl.current_dt <= 30.0 - ctrl.current_time + 1e-12);
        assert!((ctrl.current_time - 29.5).abs() < 1e-12);
    }

    #[test]
    fn large_saturation_move_limits_growth() {
        let mut ctrl = Control::new(&cfg());
        ctrl.apply_control(0, false, &SerialComm);
        ctrl.current_dt = 1.0;
        ctrl.cal_next_time_step(1.0, 0.0, 0.0, 0.4, 0.0, &["dP", "dS"], &SerialComm);
        // ds_lim = 0.2, ds_max = 0.4 -> factor 0.5
        assert!((ctrl.predict_dt - 0.5).abs() < 1e-9);
    }
}
