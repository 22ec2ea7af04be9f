//! Two-rank runs over the channel communicator must reproduce the serial
//! answer: the partition, halo exchanges, global numbering, distributed
//! solve, and collective reset logic all sit on this path.

mod common;

use common::*;
use porosim::domain::partition_slabs;
use porosim::{ChannelComm, Control, Mesh, Reservoir, SerialComm, Solver, solver};
use std::thread;

fn flood_config(nx: usize) -> porosim::RunConfig {
    base_config(
        vec![5.0],
        vec![
            injector_bhp("INJ1", 0, 4000.0),
            producer_bhp("PROD1", nx - 1, 2200.0),
        ],
    )
}

#[test]
fn two_ranks_match_serial_pressures() {
    let nx = 8;
    let mesh = Mesh::structured(nx, 2, 1, (50.0, 100.0, 20.0), 8000.0, 0.2, (150.0, 150.0, 15.0));
    let cfg = flood_config(nx);
    // wells sit in cells 0 and nx-1 of row j = 0
    let well_cells: Vec<usize> = cfg.wells.iter().map(|w| w.perfs[0].cell).collect();

    // serial reference
    let mut rs = Reservoir::new(&cfg, &mesh, Box::new(SerialComm)).unwrap();
    let mut ctrl = Control::new(&cfg);
    let mut sol = Solver::setup(&rs, &ctrl);
    sol.init_reservoir(&mut rs, &cfg);
    solver::run(&mut rs, &mut ctrl, &mut sol);
    assert!(!ctrl.stop_sim);
    let p_serial = rs.bulk.st.p[..rs.bulk.nbi].to_vec();

    // two ranks over the same mesh
    let plans = partition_slabs(&mesh, 2, &well_cells);
    let comms = ChannelComm::group(2);
    let rank_results: Vec<Vec<(usize, f64)>> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .zip(plans.iter())
            .map(|(comm, plan)| {
                let cfg = cfg.clone();
                let mesh = mesh.clone();
                s.spawn(move || {
                    let mut rs = Reservoir::from_plan(&cfg, &mesh, plan, Box::new(comm)).unwrap();
                    let mut ctrl = Control::new(&cfg);
                    let mut sol = Solver::setup(&rs, &ctrl);
                    sol.init_reservoir(&mut rs, &cfg);
                    solver::run(&mut rs, &mut ctrl, &mut sol);
                    assert!(!ctrl.stop_sim);
                    (0..rs.bulk.nbi)
                        .map(|n| (rs.domain.l2g[n], rs.bulk.st.p[n]))
                        .collect()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut p_parallel = vec![f64::NAN; p_serial.len()];
    for rank in rank_results {
        for (g, p) in rank {
            p_parallel[g] = p;
        }
    }
    for (g, (ps, pp)) in p_serial.iter().zip(&p_parallel).enumerate() {
        assert!(
            pp.is_finite(),
            "cell {g} was not covered by any rank"
        );
        assert!(
            (ps - pp).abs() < 1.0,
            "cell {g}: serial {ps} psia vs parallel {pp} psia"
        );
    }
}

#[test]
fn two_rank_injection_total_matches_serial() {
    let nx = 6;
    let mesh = Mesh::structured(nx, 1, 1, (50.0, 100.0, 20.0), 8000.0, 0.2, (150.0, 150.0, 15.0));
    let mut cfg = base_config(vec![10.0], vec![injector_rate("INJ1", 0, 50.0, 10_000.0)]);
    cfg.sat = corey_water_only();
    cfg.sw_init = 1.0;

    let run_serial = {
        let mut rs = Reservoir::new(&cfg, &mesh, Box::new(SerialComm)).unwrap();
        let mut ctrl = Control::new(&cfg);
        let mut sol = Solver::setup(&rs, &ctrl);
        sol.init_reservoir(&mut rs, &cfg);
        solver::run(&mut rs, &mut ctrl, &mut sol);
        rs.wells[0].wwit
    };

    let plans = partition_slabs(&mesh, 2, &[0]);
    let comms = ChannelComm::group(2);
    let totals: Vec<Option<f64>> = thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .zip(plans.iter())
            .map(|(comm, plan)| {
                let cfg = cfg.clone();
                let mesh = mesh.clone();
                s.spawn(move || {
                    let mut rs = Reservoir::from_plan(&cfg, &mesh, plan, Box::new(comm)).unwrap();
                    let mut ctrl = Control::new(&cfg);
                    let mut sol = Solver::setup(&rs, &ctrl);
                    sol.init_reservoir(&mut rs, &cfg);
                    solver::run(&mut rs, &mut ctrl, &mut sol);
                    rs.wells.first().map(|w| w.wwit)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let parallel_total: f64 = totals.into_iter().flatten().sum();
    assert!(
        (run_serial - 500.0).abs() / 500.0 < 1e-3,
        "serial injected {run_serial}, want 50 stb/d for 10 days"
    );
    assert!(
        (parallel_total - run_serial).abs() / run_serial < 1e-3,
        "parallel injected {parallel_total} vs serial {run_serial}"
    );
}
