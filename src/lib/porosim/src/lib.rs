// UNIT SYSTEM: OIL-FIELD UNITS (CONSISTENT THROUGHOUT)
// =====================================================
// Pressure: psia
// Distance: foot (ft)
// Time: day (d)
// Volume: cubic foot (ft³) in place, barrel (bbl) at surface
// Amount: pound-mole (lbmol)
// Permeability: milliDarcy (mD) [1 D = 9.8692e-13 m²]
// Viscosity: centiPoise (cP) [1 cP = 0.001 Pa·s]
// Temperature: Fahrenheit (°F), Rankine (°R) inside the EoS
// Saturation: dimensionless [0, 1]
//
// CONVERSION FACTORS USED:
// - Transmissibility calculation includes the Darcy constant 1.12712e-3
//   converting mD·ft²·psi/(ft·cP) to ft³/day
// - All calculations maintain consistency in these base units with no hidden
//   conversions

pub mod aimc;
pub mod bulk;
pub mod comm;
pub mod config;
pub mod conn;
pub mod consts;
pub mod control;
pub mod domain;
pub mod eos;
pub mod error;
pub mod flash;
pub mod linsys;
pub mod mesh;
pub mod method;
pub mod nr;
pub mod pvt;
pub mod reservoir;
pub mod rock;
pub mod satfunc;
pub mod skip_psa;
pub mod solver;
pub mod thermal;
pub mod well;

pub use comm::{ChannelComm, Communicator, SerialComm};
pub use config::{NrParams, RunConfig, TuningParams};
pub use control::Control;
pub use domain::Domain;
pub use error::{SetupError, WorkState};
pub use mesh::Mesh;
pub use reservoir::Reservoir;
pub use solver::Solver;
