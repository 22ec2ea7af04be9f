//! Thermal FIM: hot-water injection must push a monotone temperature front
//! through the line while keeping the mass balance closed.

mod common;

use common::*;
use porosim::config::{FluidConfig, Model, RunConfig, SatConfig};
use porosim::{Control, Mesh, Reservoir, SerialComm, Solver};

fn thermal_config(nx: usize) -> RunConfig {
    let mut cfg = base_config(
        vec![60.0],
        vec![
            injector_bhp("INJ1", 0, 4500.0),
            producer_bhp("PROD1", nx - 1, 2000.0),
        ],
    );
    cfg.model = Model::Thermal;
    cfg.fluid = FluidConfig::ThermalOilWater {
        // rho_std, compressibility, thermal expansion, visc A, visc B
        oil: [56.0, 5.0e-6, 3.8e-4, 0.048, 2100.0],
        water: [62.4, 3.0e-6, 1.2e-4, 0.018, 1900.0],
        cp_molar: [90.0, 18.0],
        mw: [180.0, 18.0],
    };
    cfg.sat = SatConfig::Corey {
        s_wc: 0.15,
        s_or: 0.2,
        n_w: 2.0,
        n_o: 2.0,
        krw_max: 0.7,
        kro_max: 0.9,
        p_entry: 0.0,
        lambda: 2.0,
    };
    cfg.sw_init = 0.3;
    cfg.t_init = 150.0;
    // steam-quality injection is approximated by hot water well above the
    // reservoir temperature
    cfg.wells[0].inj_temp = Some(450.0);
    cfg.tuning = vec![tuning(0.1, 1.0)];
    cfg
}

#[test]
fn hot_water_front_propagates_downstream() {
    let nx = 6;
    let mesh = Mesh::structured(nx, 1, 1, (25.0, 100.0, 20.0), 8000.0, 0.25, (300.0, 300.0, 30.0));
    let cfg = thermal_config(nx);

    let mut rs = Reservoir::new(&cfg, &mesh, Box::new(SerialComm)).unwrap();
    let mut ctrl = Control::new(&cfg);
    let mut sol = Solver::setup(&rs, &ctrl);
    sol.init_reservoir(&mut rs, &cfg);

    let w0 = rs.total_moles()[1];
    let mut injected = 0.0;
    let mut produced_w = 0.0;
    ctrl.apply_control(0, rs.well_opt_change, &SerialComm);
    while !ctrl.window_finished() && !ctrl.stop_sim {
        let t_before = ctrl.current_time;
        sol.go_one_step(&mut rs, &mut ctrl);
        let dt = ctrl.current_time - t_before;
        injected += rs.wells[0].wwir * dt;
        produced_w += rs.wells[1].wwpr * dt;
    }
    assert!(!ctrl.stop_sim, "thermal run must finish");

    // the near-well cell heats up markedly, and no cell cools below the
    // initial temperature
    let t = &rs.bulk.st.t;
    assert!(
        t[0] > 200.0,
        "injection cell should heat well above initial, got {}",
        t[0]
    );
    for n in 0..nx {
        assert!(
            t[n] >= 150.0 - 1e-6,
            "cell {n} must not cool below initial, got {}",
            t[n]
        );
    }
    // temperature decreases monotonically away from the injector
    for n in 1..nx {
        assert!(
            t[n] <= t[n - 1] + 1e-6,
            "thermal front must be monotone: T[{}] = {} vs T[{}] = {}",
            n - 1,
            t[n - 1],
            n,
            t[n]
        );
    }
    // convection moved heat at least one cell into the field
    assert!(
        t[1] > 151.0,
        "the front should have advanced past the first cell, T[1] = {}",
        t[1]
    );

    // water mass balance still closes under the energy equation
    let dw = rs.total_moles()[1] - w0;
    let net = injected - produced_w;
    assert!(
        (dw - net).abs() / net.abs().max(1.0) < 2e-2,
        "thermal water balance: in-place {dw} vs net {net}"
    );
}
