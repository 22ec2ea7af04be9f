//! Error kinds: fatal setup failures and the integer-coded work states that
//! travel through collective reductions at solve time.

use thiserror::Error;

/// Fatal input-consistency failure at setup time. No runtime recovery.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to read run file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse run file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required section `{0}`")]
    MissingSection(&'static str),
    #[error("inconsistent input: {0}")]
    Inconsistent(String),
}

/// Work state of the nonlinear loop. The global state at each check is the
/// minimum of the local codes across ranks, so any rank can force a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WorkState {
    /// continue solving
    #[default]
    Continue,
    /// reset to last time step
    Reset,
    /// reset to last time step and cut the stepsize (failed Newton loop)
    ResetCut,
    /// reset to last time step and cut the stepsize (out-ranged CFL number)
    ResetCutCfl,
}

impl WorkState {
    pub fn code(self) -> i32 {
        match self {
            WorkState::Continue => 0,
            WorkState::Reset => -1,
            WorkState::ResetCut => -2,
            WorkState::ResetCutCfl => -3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            0 => WorkState::Continue,
            -1 => WorkState::Reset,
            -2 => WorkState::ResetCut,
            -3 => WorkState::ResetCutCfl,
            _ => unreachable!("unknown work-state code {code}"),
        }
    }
}

/// Outcome of a per-bulk physical-plausibility check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkState {
    Success,
    NegativePressure,
    NegativeTemperature,
    NegativeMoles,
    VolumeErrorOutRange,
    CflOutRange,
}

/// Outcome of a per-well pressure/constraint check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WellCheck {
    Success,
    NegativePressure,
    SwitchToBhpMode,
    CrossFlow,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_state_codes_round_trip() {
        for ws in [
            WorkState::Continue,
            WorkState::Reset,
            WorkState::ResetCut,
            WorkState::ResetCutCfl,
        ] {
            assert_eq!(WorkState::from_code(ws.code()), ws);
        }
    }

    #[test]
    fn min_reduction_prefers_most_severe() {
        // The collective takes the MIN of the codes, so the most severe
        // (most negative) state wins.
        let local = [WorkState::Continue, WorkState::ResetCutCfl, WorkState::ResetCut];
        let global = local.iter().map(|w| w.code()).min().unwrap();
        assert_eq!(WorkState::from_code(global), WorkState::ResetCutCfl);
    }
}
