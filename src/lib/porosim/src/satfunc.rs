//! Relative permeability and capillary pressure with derivatives, from the
//! industry saturation tables (SWOF/SGOF) or Corey-Brooks analytic curves.
//!
//! Phase ordering convention throughout the crate: oil, gas, water for
//! three-phase systems; oil, water for two-phase.

use crate::config::SatConfig;
use crate::error::SetupError;

/// Piecewise-linear table: column 0 is the abscissa, ascending. Lookups
/// return value and slope, with flat extrapolation outside the range.
#[derive(Clone, Debug)]
pub struct Table {
    cols: Vec<Vec<f64>>,
}

impl Table {
    pub fn new(cols: Vec<Vec<f64>>) -> Result<Self, SetupError> {
        let n = cols.first().map(|c| c.len()).unwrap_or(0);
        if n < 2 || cols.iter().any(|c| c.len() != n) {
            return Err(SetupError::Inconsistent(
                "table needs at least two rows of equal length".into(),
            ));
        }
        if cols[0].windows(2).any(|w| w[1] <= w[0]) {
            return Err(SetupError::Inconsistent(
                "table abscissa must be strictly increasing".into(),
            ));
        }
        Ok(Table { cols })
    }

    pub fn from_rows<const W: usize>(rows: &[[f64; W]]) -> Result<Self, SetupError> {
        let mut cols = vec![Vec::with_capacity(rows.len()); W];
        for row in rows {
            for (c, v) in cols.iter_mut().zip(row) {
                c.push(*v);
            }
        }
        Table::new(cols)
    }

    pub fn col(&self, j: usize) -> &[f64] {
        &self.cols[j]
    }

    /// Value and d(value)/d(abscissa) of column `ycol` at `x`.
    pub fn eval(&self, x: f64, ycol: usize) -> (f64, f64) {
        let xs = &self.cols[0];
        let ys = &self.cols[ycol];
        let n = xs.len();
        if x <= xs[0] {
            return (ys[0], 0.0);
        }
        if x >= xs[n - 1] {
            return (ys[n - 1], 0.0);
        }
        let hi = xs.partition_point(|&v| v < x).max(1);
        let (x0, x1) = (xs[hi - 1], xs[hi]);
        let (y0, y1) = (ys[hi - 1], ys[hi]);
        let slope = (y1 - y0) / (x1 - x0);
        (y0 + slope * (x - x0), slope)
    }
}

/// kr, Pc and their saturation derivatives for all phases of a cell.
/// `dkr_ds` and `dpc_ds` are np×np row-major: ∂kr_j/∂S_k.
#[derive(Clone, Debug, Default)]
pub struct KrPc {
    pub kr: Vec<f64>,
    pub pc: Vec<f64>,
    pub dkr_ds: Vec<f64>,
    pub dpc_ds: Vec<f64>,
}

impl KrPc {
    pub fn sized(np: usize) -> Self {
        KrPc {
            kr: vec![0.0; np],
            pc: vec![0.0; np],
            dkr_ds: vec![0.0; np * np],
            dpc_ds: vec![0.0; np * np],
        }
    }
}

pub trait SatFunc: Send {
    fn np(&self) -> usize;
    /// Connate water saturation.
    fn swco(&self) -> f64;
    /// Evaluate kr/Pc at the phase saturations `s` (crate phase order).
    fn cal_kr_pc(&self, s: &[f64], out: &mut KrPc);
}

pub fn build(cfg: &SatConfig, np: usize) -> Result<Box<dyn SatFunc>, SetupError> {
    match (cfg, np) {
        (SatConfig::Corey { .. }, 2) | (SatConfig::Swof { .. }, 2) => {
            Ok(Box::new(SatFuncOw::new(cfg)?))
        }
        (SatConfig::SwofSgof { swof, sgof }, 3) => {
            Ok(Box::new(SatFuncOgw::new(swof, sgof)?))
        }
        _ => Err(SetupError::Inconsistent(format!(
            "saturation deck does not cover a {np}-phase run"
        ))),
    }
}

/// Two-phase oil/water functions. Phase order: oil = 0, water = 1.
pub struct SatFuncOw {
    kind: OwKind,
}

enum OwKind {
    Swof(Table),
    Corey {
        s_wc: f64,
        s_or: f64,
        n_w: f64,
        n_o: f64,
        krw_max: f64,
        kro_max: f64,
        p_entry: f64,
        lambda: f64,
    },
}

impl SatFuncOw {
    pub fn new(cfg: &SatConfig) -> Result<Self, SetupError> {
        let kind = match cfg {
            SatConfig::Swof { rows } => OwKind::Swof(Table::from_rows(rows)?),
            SatConfig::Corey {
                s_wc,
                s_or,
                n_w,
                n_o,
                krw_max,
                kro_max,
                p_entry,
                lambda,
            } => {
                if s_wc + s_or >= 1.0 {
                    return Err(SetupError::Inconsistent(
                        "s_wc + s_or must be below 1".into(),
                    ));
                }
                OwKind::Corey {
                    s_wc: *s_wc,
                    s_or: *s_or,
                    n_w: *n_w,
                    n_o: *n_o,
                    krw_max: *krw_max,
                    kro_max: *kro_max,
                    p_entry: *p_entry,
                    lambda: *lambda,
                }
            }
            SatConfig::SwofSgof { .. } => {
                return Err(SetupError::Inconsistent(
                    "three-phase deck supplied to a two-phase run".into(),
                ));
            }
        };
        Ok(SatFuncOw { kind })
    }
}

impl SatFunc for SatFuncOw {
    fn np(&self) -> usize {
        2
    }

    fn swco(&self) -> f64 {
        match &self.kind {
            OwKind::Swof(t) => t.col(0)[0],
            OwKind::Corey { s_wc, .. } => *s_wc,
        }
    }

    fn cal_kr_pc(&self, s: &[f64], out: &mut KrPc) {
        let sw = s[1];
        match &self.kind {
            OwKind::Swof(t) => {
                // SWOF columns: Sw, krw, krow, Pcow
                let (krw, dkrw) = t.eval(sw, 1);
                let (kro, dkro) = t.eval(sw, 2);
                let (pcow, dpcow) = t.eval(sw, 3);
                out.kr[0] = kro;
                out.kr[1] = krw;
                // oil is the reference phase: Pj = P + pc[j]
                out.pc[0] = 0.0;
                out.pc[1] = -pcow;
                out.dkr_ds.fill(0.0);
                out.dpc_ds.fill(0.0);
                out.dkr_ds[0 * 2 + 1] = dkro;
                out.dkr_ds[1 * 2 + 1] = dkrw;
                out.dpc_ds[1 * 2 + 1] = -dpcow;
            }
            OwKind::Corey {
                s_wc,
                s_or,
                n_w,
                n_o,
                krw_max,
                kro_max,
                p_entry,
                lambda,
            } => {
                let span = 1.0 - s_wc - s_or;
                let se = ((sw - s_wc) / span).clamp(0.0, 1.0);
                let soe = ((1.0 - sw - s_or) / span).clamp(0.0, 1.0);
                let krw = krw_max * se.powf(*n_w);
                let kro = kro_max * soe.powf(*n_o);
                let dkrw = if se > 0.0 && se < 1.0 {
                    krw_max * n_w * se.powf(n_w - 1.0) / span
                } else {
                    0.0
                };
                let dkro = if soe > 0.0 && soe < 1.0 {
                    -kro_max * n_o * soe.powf(n_o - 1.0) / span
                } else {
                    0.0
                };
                // Brooks-Corey Pcow, clamped at the connate end
                let (pcow, dpcow) = if *p_entry <= 0.0 {
                    (0.0, 0.0)
                } else if se <= 0.0 {
                    (1000.0_f64.min(p_entry * 1e3), 0.0)
                } else if se >= 1.0 {
                    (0.0, 0.0)
                } else {
                    let pc = (p_entry * se.powf(-1.0 / lambda)).clamp(0.0, 500.0);
                    let dpc = -p_entry / lambda * se.powf(-1.0 / lambda - 1.0) / span;
                    (pc, dpc)
                };
                out.kr[0] = kro;
                out.kr[1] = krw;
                out.pc[0] = 0.0;
                out.pc[1] = -pcow;
                out.dkr_ds.fill(0.0);
                out.dpc_ds.fill(0.0);
                out.dkr_ds[0 * 2 + 1] = dkro;
                out.dkr_ds[1 * 2 + 1] = dkrw;
                out.dpc_ds[1 * 2 + 1] = -dpcow;
            }
        }
    }
}

/// Three-phase oil/gas/water functions from SWOF + SGOF, oil relative
/// permeability combined with Stone's model II. Phase order: oil, gas, water.
pub struct SatFuncOgw {
    swof: Table,
    sgof: Table,
    /// krow at connate water, the normalisation of Stone II
    krocw: f64,
}

impl SatFuncOgw {
    pub fn new(swof: &[[f64; 4]], sgof: &[[f64; 4]]) -> Result<Self, SetupError> {
        let swof = Table::from_rows(swof)?;
        let sgof = Table::from_rows(sgof)?;
        let krocw = swof.col(2)[0];
        if krocw <= 0.0 {
            return Err(SetupError::Inconsistent(
                "SWOF krow must be positive at connate water".into(),
            ));
        }
        Ok(SatFuncOgw { swof, sgof, krocw })
    }
}

impl SatFunc for SatFuncOgw {
    fn np(&self) -> usize {
        3
    }

    fn swco(&self) -> f64 {
        self.swof.col(0)[0]
    }

    fn cal_kr_pc(&self, s: &[f64], out: &mut KrPc) {
        let (sg, sw) = (s[1], s[2]);
        let (krw, dkrw_dsw) = self.swof.eval(sw, 1);
        let (krow, dkrow_dsw) = self.swof.eval(sw, 2);
        let (pcow, dpcow_dsw) = self.swof.eval(sw, 3);
        let (krg, dkrg_dsg) = self.sgof.eval(sg, 1);
        let (krog, dkrog_dsg) = self.sgof.eval(sg, 2);
        let (pcgo, dpcgo_dsg) = self.sgof.eval(sg, 3);

        // Stone II: kro = krocw·[(krow/krocw + krw)(krog/krocw + krg) − krw − krg]
        let a = krow / self.krocw + krw;
        let b = krog / self.krocw + krg;
        let kro_raw = self.krocw * (a * b - krw - krg);
        let kro = kro_raw.max(0.0);
        let (dkro_dsw, dkro_dsg) = if kro_raw > 0.0 {
            (
                self.krocw * ((dkrow_dsw / self.krocw + dkrw_dsw) * b - dkrw_dsw),
                self.krocw * (a * (dkrog_dsg / self.krocw + dkrg_dsg) - dkrg_dsg),
            )
        } else {
            (0.0, 0.0)
        };

        out.kr[0] = kro;
        out.kr[1] = krg;
        out.kr[2] = krw;
        out.pc[0] = 0.0;
        out.pc[1] = pcgo;
        out.pc[2] = -pcow;
        out.dkr_ds.fill(0.0);
        out.dpc_ds.fill(0.0);
        // columns: dS_o, dS_g, dS_w
        out.dkr_ds[0 * 3 + 1] = dkro_dsg;
        out.dkr_ds[0 * 3 + 2] = dkro_dsw;
        out.dkr_ds[1 * 3 + 1] = dkrg_dsg;
        out.dkr_ds[2 * 3 + 2] = dkrw_dsw;
        out.dpc_ds[1 * 3 + 1] = dpcgo_dsg;
        out.dpc_ds[2 * 3 + 2] = -dpcow_dsw;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn corey() -> SatFuncOw {
        SatFuncOw::new(&SatConfig::Corey {
            s_wc: 0.2,
            s_or: 0.2,
            n_w: 2.0,
            n_o: 2.0,
            krw_max: 1.0,
            kro_max: 1.0,
            p_entry: 0.0,
            lambda: 2.0,
        })
        .unwrap()
    }

    #[test]
    fn corey_endpoints() {
        let f = corey();
        let mut out = KrPc::sized(2);
        f.cal_kr_pc(&[0.8, 0.2], &mut out);
        assert_relative_eq!(out.kr[1], 0.0);
        assert_relative_eq!(out.kr[0], 1.0);
        f.cal_kr_pc(&[0.2, 0.8], &mut out);
        assert_relative_eq!(out.kr[1], 1.0);
        assert_relative_eq!(out.kr[0], 0.0);
    }

    #[test]
    fn corey_midpoint_and_slope_sign() {
        let f = corey();
        let mut out = KrPc::sized(2);
        f.cal_kr_pc(&[0.5, 0.5], &mut out);
        assert_relative_eq!(out.kr[1], 0.25, max_relative = 1e-12);
        assert!(out.dkr_ds[3] > 0.0, "krw rises with Sw");
        assert!(out.dkr_ds[1] < 0.0, "kro falls with Sw");
    }

    #[test]
    fn table_eval_interpolates_and_clamps() {
        let t = Table::from_rows(&[[0.2, 0.0], [0.8, 0.6]]).unwrap();
        let (v, s) = t.eval(0.5, 1);
        assert_relative_eq!(v, 0.3, max_relative = 1e-12);
        assert_relative_eq!(s, 1.0, max_relative = 1e-12);
        assert_eq!(t.eval(0.0, 1), (0.0, 0.0));
        assert_eq!(t.eval(1.0, 1), (0.6, 0.0));
    }

    #[test]
    fn swof_pc_sign_convention() {
        // water-phase pressure lies below oil by Pcow
        let f = SatFuncOw::new(&SatConfig::Swof {
            rows: vec![[0.2, 0.0, 0.9, 6.0], [0.8, 0.6, 0.0, 0.5]],
        })
        .unwrap();
        let mut out = KrPc::sized(2);
        f.cal_kr_pc(&[0.5, 0.5], &mut out);
        assert!(out.pc[1] < 0.0);
        assert_eq!(out.pc[0], 0.0);
    }

    #[test]
    fn stone_ii_reduces_to_two_phase_without_gas() {
        let f = SatFuncOgw::new(
            &[[0.2, 0.0, 0.9, 0.0], [0.8, 0.6, 0.0, 0.0]],
            &[[0.0, 0.0, 0.9, 0.0], [0.7, 0.8, 0.0, 0.0]],
        )
        .unwrap();
        let mut out = KrPc::sized(3);
        f.cal_kr_pc(&[0.5, 0.0, 0.5], &mut out);
        // with Sg = 0: krog = krocw so kro = krow
        let (krow, _) = f.swof.eval(0.5, 2);
        assert_relative_eq!(out.kr[0], krow, max_relative = 1e-12);
        assert_relative_eq!(out.kr[1], 0.0);
    }
}
