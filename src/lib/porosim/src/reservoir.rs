//! Top-level reservoir state: the partitioned domain, bulk arrays,
//! connection list, wells, and the fluid/rock property models. The
//! orchestrator owns this and threads references through the call graph.

use crate::aimc::BulkTypeAim;
use crate::bulk::Bulk;
use crate::comm::Communicator;
use crate::config::RunConfig;
use crate::conn::BulkConn;
use crate::domain::{Domain, RankPlan, extract_local};
use crate::error::{SetupError, WellCheck};
use crate::mesh::Mesh;
use crate::pvt::{self, Mixture};
use crate::rock::Rock;
use crate::satfunc::{self, SatFunc};
use crate::skip_psa::SkipPsa;
use crate::well::Well;
use std::collections::HashMap;

pub struct Reservoir {
    pub domain: Domain,
    pub bulk: Bulk,
    pub conn: BulkConn,
    pub wells: Vec<Well>,
    pub mixture: Box<dyn Mixture>,
    pub satfunc: Box<dyn SatFunc>,
    pub skip: Option<SkipPsa>,
    pub aim: BulkTypeAim,
    /// set when the well schedule changed entering the current window
    pub well_opt_change: bool,
}

impl Reservoir {
    /// Single-rank reservoir over the whole mesh.
    pub fn new(cfg: &RunConfig, mesh: &Mesh, comm: Box<dyn Communicator>) -> Result<Self, SetupError> {
        let wells: Vec<usize> = (0..cfg.wells.len()).collect();
        let domain = Domain::serial(comm, mesh.cells.len(), cfg.wells.len());
        Self::build(cfg, mesh.clone(), domain, &wells)
    }

    /// One rank of a partitioned reservoir.
    pub fn from_plan(
        cfg: &RunConfig,
        global_mesh: &Mesh,
        plan: &RankPlan,
        comm: Box<dyn Communicator>,
    ) -> Result<Self, SetupError> {
        let local = extract_local(global_mesh, plan);
        let domain = Domain::from_plan(comm, plan);
        let wells = plan.wells.clone();
        Self::build(cfg, local, domain, &wells)
    }

    fn build(
        cfg: &RunConfig,
        local_mesh: Mesh,
        domain: Domain,
        well_ids: &[usize],
    ) -> Result<Self, SetupError> {
        let mixture = pvt::build(&cfg.fluid, &cfg.z_init)?;
        let (np, nc) = (mixture.np(), mixture.nc());
        let thermal = matches!(cfg.model, crate::config::Model::Thermal);
        let satfunc = satfunc::build(&cfg.sat, np)?;
        let rock = Rock::new(&cfg.rock);
        let mut bulk = Bulk::new(&local_mesh, domain.num_interior, np, nc, thermal, rock);
        let conn = BulkConn::new(&local_mesh, bulk.nb, np, nc);

        // global -> local cell mapping for the perforation list
        let g2l: HashMap<usize, usize> =
            domain.l2g.iter().enumerate().map(|(l, &g)| (g, l)).collect();
        let mut wells = Vec::with_capacity(well_ids.len());
        for &w in well_ids {
            let wcfg = &cfg.wells[w];
            let locations: Result<Vec<usize>, SetupError> = wcfg
                .perfs
                .iter()
                .map(|p| {
                    g2l.get(&p.cell).copied().ok_or_else(|| {
                        SetupError::Inconsistent(format!(
                            "well `{}` perforates cell {} outside its rank",
                            wcfg.name, p.cell
                        ))
                    })
                })
                .collect();
            let locations = locations?;
            for &loc in &locations {
                bulk.well_bulk_id.push(loc);
            }
            wells.push(Well::new(wcfg, &locations, &bulk, mixture.as_ref()));
        }

        let skip = if matches!(cfg.fluid, crate::config::FluidConfig::Compositional { .. }) {
            Some(SkipPsa::setup(bulk.nb, np, nc, true))
        } else {
            None
        };

        let aim = BulkTypeAim::new(bulk.nb);
        Ok(Reservoir {
            domain,
            bulk,
            conn,
            wells,
            mixture,
            satfunc,
            skip,
            aim,
            well_opt_change: false,
        })
    }

    /// Uniform initial pressure/temperature and the target phase volumes
    /// behind the initialization flash.
    pub fn init_state(&mut self, cfg: &RunConfig) {
        let Reservoir { bulk, mixture, .. } = self;
        bulk.st.p.fill(cfg.p_init);
        bulk.st.t.fill(cfg.t_init);
        bulk.cal_rock();
        let np = bulk.np;
        for n in 0..bulk.nb {
            let vp = bulk.st.rock_vp[n];
            let mut vj = vec![0.0; np];
            match np {
                2 => {
                    vj[1] = cfg.sw_init * vp;
                    vj[0] = vp - vj[1];
                    if mixture.wat_index().is_none() {
                        // compositional: only the total volume matters
                        vj[0] = vp;
                        vj[1] = 0.0;
                    }
                }
                3 => {
                    vj[1] = cfg.sg_init * vp;
                    vj[2] = cfg.sw_init * vp;
                    vj[0] = vp - vj[1] - vj[2];
                }
                _ => unreachable!("unsupported phase count {np}"),
            }
            let ni = mixture.init_moles(cfg.p_init, cfg.t_init, &vj);
            bulk.st.ni[n * bulk.nc..(n + 1) * bulk.nc].copy_from_slice(&ni);
        }
    }

    pub fn num_open_wells(&self) -> usize {
        self.wells.iter().filter(|w| w.is_open()).count()
    }

    /// Well preparation at the start of a step: transmissibilities, control
    /// feasibility, hydrostatic column, surface factors, and fluxes.
    pub fn prepare_wells(&mut self) {
        let Reservoir {
            bulk,
            wells,
            mixture,
            ..
        } = self;
        for w in wells.iter_mut().filter(|w| w.is_open()) {
            w.cal_trans(bulk);
            w.check_opt_mode(bulk, mixture.as_ref());
            w.cal_dg(bulk, mixture.as_mut());
            w.cal_factor(bulk, mixture.as_ref());
            w.cal_flux(bulk, mixture.as_ref(), true);
        }
    }

    /// Refresh well transmissibilities and fluxes after a property update.
    pub fn cal_well_flux(&mut self) {
        let Reservoir {
            bulk,
            wells,
            mixture,
            ..
        } = self;
        for w in wells.iter_mut().filter(|w| w.is_open()) {
            w.cal_trans(bulk);
            w.cal_flux(bulk, mixture.as_ref(), false);
        }
    }

    /// Worst well verdict after a Newton update.
    pub fn check_wells(&mut self) -> WellCheck {
        let Reservoir { bulk, wells, .. } = self;
        let mut worst = WellCheck::Success;
        for w in wells.iter_mut().filter(|w| w.is_open()) {
            let check = w.check_p(bulk);
            worst = match (worst, check) {
                (WellCheck::NegativePressure, _) | (_, WellCheck::NegativePressure) => {
                    WellCheck::NegativePressure
                }
                (WellCheck::SwitchToBhpMode, _) | (_, WellCheck::SwitchToBhpMode) => {
                    WellCheck::SwitchToBhpMode
                }
                (WellCheck::CrossFlow, _) | (_, WellCheck::CrossFlow) => WellCheck::CrossFlow,
                _ => WellCheck::Success,
            };
        }
        worst
    }

    /// Well surface-rate accounting at the end of a converged step.
    pub fn cal_ipr(&mut self, dt: f64) {
        let Reservoir { wells, mixture, .. } = self;
        for w in wells.iter_mut() {
            w.cal_qj(mixture.as_ref(), dt);
        }
    }

    /// Snapshot everything current -> last.
    pub fn commit(&mut self) {
        self.bulk.commit();
        self.conn.commit();
        for w in &mut self.wells {
            w.commit();
        }
        if let Some(skip) = &mut self.skip {
            skip.vs.update_last_time_step();
        }
    }

    /// Restore last -> current, then rebuild the dependent well state.
    pub fn revert(&mut self) {
        self.bulk.revert();
        self.conn.revert();
        for w in &mut self.wells {
            w.revert();
        }
        if let Some(skip) = &mut self.skip {
            skip.vs.reset_to_last_time_step();
        }
        let Reservoir {
            bulk,
            wells,
            mixture,
            ..
        } = self;
        for w in wells.iter_mut().filter(|w| w.is_open()) {
            w.cal_trans(bulk);
            w.cal_dg(bulk, mixture.as_mut());
            w.cal_flux(bulk, mixture.as_ref(), true);
        }
    }

    /// Exchange a per-cell field's ghost entries.
    pub fn exchange_ni(&mut self) {
        let nc = self.bulk.nc;
        self.domain.exchange_f64(&mut self.bulk.st.ni, nc);
    }

    /// Total component moles in place over interior cells (diagnostics and
    /// mass-balance tests).
    pub fn total_moles(&self) -> Vec<f64> {
        let nc = self.bulk.nc;
        let mut tot = vec![0.0; nc];
        for n in 0..self.bulk.nbi {
            for i in 0..nc {
                tot[i] += self.bulk.st.ni[n * nc + i];
            }
        }
        tot
    }
}
