//! Strategy orchestrator: wires the solution methods into one of
//! {FIM, IMPEC, AIMc, thermal-FIM} and drives the adaptive time marching.
//!
//! Per time step: prepare wells, then loop (assemble, linear solve, get
//! solution, update properties) until convergence or reset; finally update
//! rates, swap last <-> current, and predict the next stepsize. The loop
//! halts the whole run when the stepsize falls under `MIN_TIME_CURSTEP`.

use crate::config::{Method, Model, RunConfig};
use crate::consts::MIN_TIME_CURSTEP;
use crate::control::Control;
use crate::method::{IsoTAimc, IsoTFim, IsoTImpec};
use crate::reservoir::Reservoir;
use crate::thermal::TFim;
use tracing::{info, warn};

enum Strategy {
    Fim(IsoTFim),
    Impec(IsoTImpec),
    Aimc(IsoTAimc),
    ThermalFim(TFim),
}

pub struct Solver {
    strategy: Strategy,
}

impl Solver {
    pub fn setup(rs: &Reservoir, ctrl: &Control) -> Self {
        let strategy = match (ctrl.model, ctrl.method) {
            (Model::Thermal, _) => Strategy::ThermalFim(TFim::setup(rs)),
            (Model::Isothermal, Method::Fim) => Strategy::Fim(IsoTFim::setup(rs)),
            (Model::Isothermal, Method::Impec) => Strategy::Impec(IsoTImpec::setup(rs)),
            (Model::Isothermal, Method::Aimc) => Strategy::Aimc(IsoTAimc::setup(rs)),
        };
        Solver { strategy }
    }

    pub fn init_reservoir(&mut self, rs: &mut Reservoir, cfg: &RunConfig) {
        match &mut self.strategy {
            Strategy::Fim(m) => m.init_reservoir(rs, cfg),
            Strategy::Impec(m) => m.init_reservoir(rs, cfg),
            Strategy::Aimc(m) => m.init_reservoir(rs, cfg),
            Strategy::ThermalFim(m) => m.init_reservoir(rs, cfg),
        }
    }

    /// One time step of dynamic simulation with adaptive stepsize.
    pub fn go_one_step(&mut self, rs: &mut Reservoir, ctrl: &mut Control) {
        match &mut self.strategy {
            Strategy::Fim(m) => {
                m.prepare(rs, ctrl.current_dt);
                loop {
                    if halt_on_tiny_dt(ctrl) {
                        return;
                    }
                    m.assemble_mat(rs, ctrl.current_dt);
                    m.solve_linear_system(rs, ctrl);
                    if !m.update_property(rs, ctrl) {
                        continue;
                    }
                    if m.finish_nr(rs, ctrl) {
                        break;
                    }
                }
                m.finish_step(rs, ctrl);
            }
            Strategy::Impec(m) => {
                m.prepare(rs, ctrl);
                loop {
                    if halt_on_tiny_dt(ctrl) {
                        return;
                    }
                    m.assemble_mat(rs, ctrl.current_dt);
                    m.solve_linear_system(rs, ctrl);
                    if !m.update_property(rs, ctrl) {
                        continue;
                    }
                    if m.finish_nr() {
                        break;
                    }
                }
                m.finish_step(rs, ctrl);
            }
            Strategy::Aimc(m) => {
                m.prepare(rs, ctrl);
                loop {
                    if halt_on_tiny_dt(ctrl) {
                        return;
                    }
                    m.assemble_mat(rs, ctrl.current_dt);
                    m.solve_linear_system(rs, ctrl);
                    if !m.update_property(rs, ctrl) {
                        continue;
                    }
                    if m.finish_nr(rs, ctrl) {
                        break;
                    }
                }
                m.finish_step(rs, ctrl);
            }
            Strategy::ThermalFim(m) => {
                m.prepare(rs, ctrl.current_dt);
                loop {
                    if halt_on_tiny_dt(ctrl) {
                        return;
                    }
                    m.assemble_mat(rs, ctrl.current_dt);
                    m.solve_linear_system(rs, ctrl);
                    if !m.update_property(rs, ctrl) {
                        continue;
                    }
                    if m.finish_nr(rs, ctrl) {
                        break;
                    }
                }
                m.finish_step(rs, ctrl);
            }
        }
    }
}

fn halt_on_tiny_dt(ctrl: &mut Control) -> bool {
    if ctrl.current_dt < MIN_TIME_CURSTEP {
        warn!(dt = ctrl.current_dt, "time stepsize is too small, halting");
        ctrl.stop_sim = true;
        return true;
    }
    false
}

/// Run the whole schedule: one tuning window per report time.
pub fn run(rs: &mut Reservoir, ctrl: &mut Control, solver: &mut Solver) {
    for i in 0..ctrl.num_windows() {
        ctrl.apply_control(i, rs.well_opt_change, &*rs.domain.comm);
        while !ctrl.window_finished() && !ctrl.stop_sim {
            solver.go_one_step(rs, ctrl);
        }
        if ctrl.stop_sim {
            break;
        }
        info!(
            window = i,
            time = ctrl.current_time,
            steps = ctrl.iters.num_tstep,
            nr_total = ctrl.iters.nr_total,
            ls_total = ctrl.iters.ls_total,
            "report window finished"
        );
    }
}
