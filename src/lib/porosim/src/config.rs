//! Run configuration: control tuning, Newton controls, well deck, fluid and
//! saturation decks. Loaded from a TOML run file into plain serde structs;
//! unknown keys and missing sections are fatal at setup time.

use crate::error::SetupError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Fim,
    Impec,
    Aimc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    #[default]
    Isothermal,
    Thermal,
}

/// Params for choosing the time stepsize in time marching.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParams {
    /// length of the first time step beginning the next report window [day]
    pub dt_init: f64,
    /// maximum time step during running [day]
    pub dt_max: f64,
    /// minimum time step during running [day]
    pub dt_min: f64,
    /// maximum timestep increase factor
    pub max_incre_fac: f64,
    /// minimum timestep cutback factor
    pub min_chop_fac: f64,
    /// cutback factor after a convergence failure
    pub cut_fac_nr: f64,

    // Limits for changes at the next time step (prediction heuristics)
    /// ideal max pressure change [psi]
    pub dp_lim: f64,
    /// ideal max temperature change [°F]
    pub dt_lim: f64,
    /// ideal max saturation change
    pub ds_lim: f64,
    /// ideal max relative component-mole change
    pub dn_lim: f64,
    /// ideal max relative volume error (pore vs fluid)
    pub ev_lim: f64,
}

impl Default for TuningParams {
    fn default() -> Self {
        TuningParams {
            dt_init: 1.0,
            dt_max: 10.0,
            dt_min: 0.1,
            max_incre_fac: 3.0,
            min_chop_fac: 0.15,
            cut_fac_nr: 0.3,
            dp_lim: 300.0,
            dt_lim: 100.0,
            ds_lim: 0.2,
            dn_lim: 0.3,
            ev_lim: 0.001,
        }
    }
}

/// Params for Newton iteration control.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NrParams {
    /// maximum number of Newton iterations in a time step
    pub max_iter: usize,
    /// nonlinear convergence tolerance
    pub tol: f64,
    /// maximum pressure change in one Newton iteration [psi]
    pub dp_max: f64,
    /// maximum saturation change in one Newton iteration
    pub ds_max: f64,
    /// pressure change under which the iteration counts as stagnant [psi]
    pub dp_min: f64,
    /// saturation change under which the iteration counts as stagnant
    pub ds_min: f64,
    /// maximum admissible volume error between fluid and pore volume
    pub ev_max: f64,
}

impl Default for NrParams {
    fn default() -> Self {
        NrParams {
            max_iter: 10,
            tol: 1e-3,
            dp_max: 200.0,
            ds_max: 0.1,
            dp_min: 1.0,
            ds_min: 0.01,
            ev_max: 0.01,
        }
    }
}

/// Tuning valid from report window `from_window` until the next entry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TuningEntry {
    #[serde(default)]
    pub from_window: usize,
    #[serde(default)]
    pub time: TuningParams,
    #[serde(default)]
    pub nr: NrParams,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WellMode {
    /// fixed bottom-hole pressure
    Bhp,
    /// surface oil rate
    Orate,
    /// surface gas rate
    Grate,
    /// surface water rate
    Wrate,
    /// surface liquid (oil + water) rate
    Lrate,
    /// total molar rate
    TotalRate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfDir {
    X,
    Y,
    Z,
}

impl Default for PerfDir {
    fn default() -> Self {
        PerfDir::Z
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerfConfig {
    /// global cell index of the perforated bulk
    pub cell: usize,
    /// explicit well index [mD·ft]; computed by Peaceman's formula if absent
    #[serde(default)]
    pub wi: Option<f64>,
    /// explicit permeability-thickness [mD·ft]
    #[serde(default)]
    pub kh: Option<f64>,
    /// wellbore radius [ft]
    #[serde(default = "default_radius")]
    pub radius: f64,
    /// skin factor
    #[serde(default)]
    pub skin: f64,
    #[serde(default)]
    pub direction: PerfDir,
}

fn default_radius() -> f64 {
    0.25
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjFluid {
    Water,
    Gas,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WellConfig {
    pub name: String,
    /// true for injector, false for producer
    pub injector: bool,
    #[serde(default = "default_open")]
    pub open: bool,
    pub mode: WellMode,
    /// target surface rate for rate modes [stb/d or Mscf/d]
    #[serde(default)]
    pub target_rate: f64,
    /// BHP limit: upper for injectors, lower for producers [psia]
    pub bhp_limit: f64,
    /// depth of the BHP reference [ft]; defaults to the first perforation
    #[serde(default)]
    pub ref_depth: Option<f64>,
    pub perfs: Vec<PerfConfig>,
    /// injected fluid, injectors only
    #[serde(default)]
    pub inj_fluid: Option<InjFluid>,
    /// injection temperature [°F], injectors only
    #[serde(default)]
    pub inj_temp: Option<f64>,
}

fn default_open() -> bool {
    true
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RockConfig {
    /// reference pressure for porosity [psia]
    pub p_ref: f64,
    /// pore-volume compressibility [1/psi]
    pub compressibility: f64,
    /// volumetric rock heat capacity [Btu/(ft³·°F)], thermal runs
    pub heat_capacity: f64,
    /// rock thermal conductivity [Btu/(ft·day·°F)], thermal runs
    pub conductivity: f64,
}

impl Default for RockConfig {
    fn default() -> Self {
        RockConfig {
            p_ref: 14.7,
            compressibility: 4e-6,
            heat_capacity: 35.0,
            conductivity: 24.0,
        }
    }
}

/// Saturation-function deck: tabulated industry tables or a Corey fallback.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SatConfig {
    /// Sw, krw, krow, Pcow rows
    Swof { rows: Vec<[f64; 4]> },
    /// Sg, krg, krog, Pcgo rows (combined with SWOF for three phases)
    SwofSgof {
        swof: Vec<[f64; 4]>,
        sgof: Vec<[f64; 4]>,
    },
    /// Corey-Brooks analytic curves
    Corey {
        s_wc: f64,
        s_or: f64,
        n_w: f64,
        n_o: f64,
        krw_max: f64,
        kro_max: f64,
        /// Brooks-Corey entry pressure [psi]; zero disables capillarity
        p_entry: f64,
        lambda: f64,
    },
}

/// Component record for the compositional model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompRecord {
    pub name: String,
    /// critical temperature [°R]
    pub tc: f64,
    /// critical pressure [psia]
    pub pc: f64,
    /// critical volume [ft³/lbmol]
    pub vc: f64,
    /// acentric factor
    pub acf: f64,
    /// molecular weight [lb/lbmol]
    pub mw: f64,
    /// volume-shift parameter
    #[serde(default)]
    pub shift: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum FluidConfig {
    /// Dead-oil / water black-oil: PVDO {P, Bo, muo}, PVTW one row
    /// {Pref, Bw, Cw, muw, Cmuw}
    DeadOilWater {
        pvdo: Vec<[f64; 3]>,
        pvtw: [f64; 5],
        /// surface densities [lb/ft³]: oil, water
        rho_std: [f64; 2],
    },
    /// Live-oil / gas / water black-oil: PVCO {Pbub, Rs, Bo, muo, Cb, Cmu},
    /// PVDG {P, Bg, mug}, PVTW
    LiveOilGasWater {
        pvco: Vec<[f64; 6]>,
        pvdg: Vec<[f64; 3]>,
        pvtw: [f64; 5],
        /// surface densities [lb/ft³]: oil, gas, water
        rho_std: [f64; 3],
    },
    /// Compositional Peng-Robinson
    Compositional {
        comps: Vec<CompRecord>,
        /// binary interaction coefficients, row-major nc×nc
        #[serde(default)]
        bic: Vec<f64>,
    },
    /// Thermal water/oil with k-values and T-dependent properties
    ThermalOilWater {
        /// oil: {rho_std [lb/ft³], compressibility [1/psi], thermal expansion
        /// [1/°F], visc A, visc B} with mu = A·exp(B/T_R)
        oil: [f64; 5],
        /// water: same layout
        water: [f64; 5],
        /// specific enthalpy slopes [Btu/(lbmol·°F)]: oil, water
        cp_molar: [f64; 2],
        /// molecular weights [lb/lbmol]: oil, water
        mw: [f64; 2],
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub model: Model,
    #[serde(default)]
    pub method: Method,
    /// report times [day], ascending, first entry > 0; windows are the
    /// intervals between 0 and each entry
    pub tstep: Vec<f64>,
    #[serde(default)]
    pub tuning: Vec<TuningEntry>,
    #[serde(default)]
    pub rock: RockConfig,
    pub sat: SatConfig,
    pub fluid: FluidConfig,
    pub wells: Vec<WellConfig>,
    /// initial pressure at datum [psia]
    pub p_init: f64,
    /// initial temperature [°F]
    #[serde(default = "default_t_init")]
    pub t_init: f64,
    /// initial water saturation
    #[serde(default)]
    pub sw_init: f64,
    /// initial gas saturation (three-phase runs)
    #[serde(default)]
    pub sg_init: f64,
    /// initial overall composition, compositional runs
    #[serde(default)]
    pub z_init: Vec<f64>,
}

fn default_t_init() -> f64 {
    150.0
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self, SetupError> {
        let text = std::fs::read_to_string(path).map_err(|source| SetupError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, SetupError> {
        let cfg: RunConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), SetupError> {
        if self.tstep.is_empty() {
            return Err(SetupError::MissingSection("tstep"));
        }
        if self.tstep.windows(2).any(|w| w[1] <= w[0]) || self.tstep[0] <= 0.0 {
            return Err(SetupError::Inconsistent(
                "tstep entries must be positive and strictly increasing".into(),
            ));
        }
        for w in &self.wells {
            if w.perfs.is_empty() {
                return Err(SetupError::Inconsistent(format!(
                    "well `{}` has no perforations",
                    w.name
                )));
            }
            if w.injector && w.inj_fluid.is_none() {
                return Err(SetupError::Inconsistent(format!(
                    "injector `{}` needs an inj_fluid",
                    w.name
                )));
            }
            if w.mode != WellMode::Bhp && w.target_rate <= 0.0 {
                return Err(SetupError::Inconsistent(format!(
                    "well `{}` in rate mode needs a positive target_rate",
                    w.name
                )));
            }
        }
        if let FluidConfig::Compositional { comps, bic } = &self.fluid {
            let nc = comps.len();
            if !bic.is_empty() && bic.len() != nc * nc {
                return Err(SetupError::Inconsistent(format!(
                    "bic must have {}x{} entries",
                    nc, nc
                )));
            }
            if !self.z_init.is_empty() && self.z_init.len() != nc {
                return Err(SetupError::Inconsistent(
                    "z_init length must match the component count".into(),
                ));
            }
        }
        Ok(())
    }

    /// Expand the tuning entries into one (time, nr) pair per report window,
    /// each entry holding from its `from_window` until the next entry.
    pub fn tuning_per_window(&self) -> Vec<(TuningParams, NrParams)> {
        let n = self.tstep.len();
        let mut out = vec![(TuningParams::default(), NrParams::default()); n];
        let mut entries = self.tuning.clone();
        entries.sort_by_key(|e| e.from_window);
        for e in entries {
            for w in out.iter_mut().skip(e.from_window) {
                *w = (e.time, e.nr);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECK: &str = r#"
        method = "FIM"
        tstep = [30.0, 60.0]
        p_init = 3500.0
        sw_init = 0.25

        [[tuning]]
        from_window = 1
        time = { dt_init = 0.5, dt_max = 5.0 }

        [sat]
        kind = "corey"
        s_wc = 0.2
        s_or = 0.2
        n_w = 2.0
        n_o = 2.0
        krw_max = 0.6
        kro_max = 0.9
        p_entry = 0.0
        lambda = 2.0

        [fluid]
        model = "dead_oil_water"
        pvdo = [[400.0, 1.012, 1.16], [5000.0, 1.0, 1.2]]
        pvtw = [3600.0, 1.00341, 3.0e-6, 0.52, 0.0]
        rho_std = [49.1, 64.79]

        [[wells]]
        name = "INJ1"
        injector = true
        mode = "BHP"
        bhp_limit = 5000.0
        inj_fluid = "water"
        perfs = [{ cell = 0 }]

        [[wells]]
        name = "PROD1"
        injector = false
        mode = "ORATE"
        target_rate = 1000.0
        bhp_limit = 1500.0
        perfs = [{ cell = 99, radius = 0.3 }]
    "#;

    #[test]
    fn parses_a_full_deck() {
        let cfg = RunConfig::from_str(DECK).unwrap();
        assert_eq!(cfg.method, Method::Fim);
        assert_eq!(cfg.wells.len(), 2);
        assert!(cfg.wells[0].injector);
        assert_eq!(cfg.wells[1].mode, WellMode::Orate);
        let per_window = cfg.tuning_per_window();
        // window 0 keeps defaults, window 1 picks up the entry
        assert_eq!(per_window[0].0.dt_init, 1.0);
        assert_eq!(per_window[1].0.dt_init, 0.5);
    }

    #[test]
    fn rejects_rate_mode_without_target() {
        let bad = DECK.replace("target_rate = 1000.0", "target_rate = 0.0");
        assert!(matches!(
            RunConfig::from_str(&bad),
            Err(SetupError::Inconsistent(_))
        ));
    }

    #[test]
    fn rejects_decreasing_tstep() {
        let bad = DECK.replace("tstep = [30.0, 60.0]", "tstep = [30.0, 10.0]");
        assert!(RunConfig::from_str(&bad).is_err());
    }
}
