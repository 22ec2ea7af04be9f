//! Physical constants and unit-conversion factors (oil-field units).

/// Universal gas constant [psia·ft³/(lbmol·°R)]
pub const GAS_CONSTANT: f64 = 10.73159;
/// Small constant for guards against division by near-zero
pub const TINY: f64 = 1e-8;

/// Gravity factor [psi·ft²/lb]: multiply by density [lb/ft³] and height [ft]
/// to get a hydrostatic pressure difference [psi]
pub const GRAVITY_FACTOR: f64 = 0.006_944_44;

/// Water density at surface conditions [lb/ft³]
pub const RHOW_STD: f64 = 62.3664;
/// Air density at surface conditions [lb/ft³]
pub const RHOAIR_STD: f64 = 0.076362;
/// Standard pressure [psia]
pub const PRESSURE_STD: f64 = 14.7;
/// Standard temperature [°F]
pub const TEMPERATURE_STD: f64 = 60.0;

/// 1 bbl = 5.61458 ft³
pub const CONV_BBL_FT3: f64 = 5.61458;
/// Darcy constant in field units: mD·ft²·psi/(ft·cP) -> ft³/day
pub const DARCY_CONST: f64 = 1.12712e-3;
/// 0 °F = 459.67 °R
pub const RANKINE_OFFSET: f64 = 459.67;

/// Time stepsize below which the run halts with a warning [day]
pub const MIN_TIME_CURSTEP: f64 = 1e-6;

/// Hydrostatic-column integration segment length [ft]
pub const DG_SEG_LEN: f64 = 10.0;

/// CFL threshold above which an AIMc cell goes implicit
pub const AIM_CFL_LIM: f64 = 0.8;
/// Volume-error threshold above which an AIMc cell goes implicit
pub const AIM_EV_LIM: f64 = 1e-3;
/// Implicit halo width around wells and flagged cells
pub const AIM_NEIGHBOR_LAYERS: i32 = 2;

/// °F to °R
#[inline]
pub fn rankine(t_f: f64) -> f64 {
    t_f + RANKINE_OFFSET
}
