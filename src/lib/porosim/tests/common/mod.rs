//! Shared deck builders for the integration scenarios.
#![allow(dead_code)]

use porosim::config::{
    FluidConfig, Method, Model, NrParams, PerfConfig, PerfDir, RockConfig, RunConfig, SatConfig,
    TuningEntry, TuningParams, WellConfig, WellMode,
};

pub fn corey_ow() -> SatConfig {
    SatConfig::Corey {
        s_wc: 0.2,
        s_or: 0.2,
        n_w: 2.0,
        n_o: 2.0,
        krw_max: 0.8,
        kro_max: 0.9,
        p_entry: 0.0,
        lambda: 2.0,
    }
}

pub fn corey_water_only() -> SatConfig {
    SatConfig::Corey {
        s_wc: 0.0,
        s_or: 0.0,
        n_w: 1.0,
        n_o: 2.0,
        krw_max: 1.0,
        kro_max: 1.0,
        p_entry: 0.0,
        lambda: 2.0,
    }
}

pub fn dead_oil_fluid() -> FluidConfig {
    FluidConfig::DeadOilWater {
        pvdo: vec![
            [400.0, 1.0120, 1.16],
            [1200.0, 1.0040, 1.164],
            [2000.0, 0.9960, 1.167],
            [2800.0, 0.9880, 1.172],
            [3600.0, 0.9802, 1.177],
            [4400.0, 0.9724, 1.181],
            [5200.0, 0.9646, 1.185],
        ],
        pvtw: [3600.0, 1.00341, 3.0e-6, 0.52, 0.0],
        rho_std: [49.1, 64.79],
    }
}

pub fn perf(cell: usize) -> PerfConfig {
    PerfConfig {
        cell,
        wi: None,
        kh: None,
        radius: 0.25,
        skin: 0.0,
        direction: PerfDir::Z,
    }
}

pub fn injector_rate(name: &str, cell: usize, rate: f64, max_bhp: f64) -> WellConfig {
    WellConfig {
        name: name.into(),
        injector: true,
        open: true,
        mode: WellMode::Wrate,
        target_rate: rate,
        bhp_limit: max_bhp,
        ref_depth: None,
        perfs: vec![perf(cell)],
        inj_fluid: Some(porosim::config::InjFluid::Water),
        inj_temp: Some(150.0),
    }
}

pub fn injector_bhp(name: &str, cell: usize, bhp: f64) -> WellConfig {
    WellConfig {
        name: name.into(),
        injector: true,
        open: true,
        mode: WellMode::Bhp,
        target_rate: 0.0,
        bhp_limit: bhp,
        ref_depth: None,
        perfs: vec![perf(cell)],
        inj_fluid: Some(porosim::config::InjFluid::Water),
        inj_temp: Some(150.0),
    }
}

pub fn producer_bhp(name: &str, cell: usize, bhp: f64) -> WellConfig {
    WellConfig {
        name: name.into(),
        injector: false,
        open: true,
        mode: WellMode::Bhp,
        target_rate: 0.0,
        bhp_limit: bhp,
        ref_depth: None,
        perfs: vec![perf(cell)],
        inj_fluid: None,
        inj_temp: None,
    }
}

pub fn producer_rate(name: &str, cell: usize, rate: f64, min_bhp: f64) -> WellConfig {
    WellConfig {
        name: name.into(),
        injector: false,
        open: true,
        mode: WellMode::Orate,
        target_rate: rate,
        bhp_limit: min_bhp,
        ref_depth: None,
        perfs: vec![perf(cell)],
        inj_fluid: None,
        inj_temp: None,
    }
}

pub fn tuning(dt_init: f64, dt_max: f64) -> TuningEntry {
    TuningEntry {
        from_window: 0,
        time: TuningParams {
            dt_init,
            dt_max,
            dt_min: 1e-3,
            ..Default::default()
        },
        nr: NrParams {
            max_iter: 15,
            tol: 1e-6,
            dp_min: 1e-3,
            ds_min: 1e-5,
            ..Default::default()
        },
    }
}

pub fn base_config(tstep: Vec<f64>, wells: Vec<WellConfig>) -> RunConfig {
    RunConfig {
        model: Model::Isothermal,
        method: Method::Fim,
        tstep,
        tuning: vec![tuning(0.5, 5.0)],
        rock: RockConfig::default(),
        sat: corey_ow(),
        fluid: dead_oil_fluid(),
        wells,
        p_init: 3000.0,
        t_init: 150.0,
        sw_init: 0.25,
        sg_init: 0.0,
        z_init: vec![],
    }
}

/// Average interior pressure, for monotonicity checks.
pub fn avg_pressure(rs: &porosim::Reservoir) -> f64 {
    let nbi = rs.bulk.nbi;
    rs.bulk.st.p[..nbi].iter().sum::<f64>() / nbi as f64
}
