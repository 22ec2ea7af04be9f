//! Rock properties: pressure-dependent porosity and the thermal terms.

use crate::config::RockConfig;
use crate::consts::TEMPERATURE_STD;

#[derive(Clone, Copy, Debug)]
pub struct Rock {
    p_ref: f64,
    cr: f64,
    heat_capacity: f64,
    conductivity: f64,
}

impl Rock {
    pub fn new(cfg: &RockConfig) -> Self {
        Rock {
            p_ref: cfg.p_ref,
            cr: cfg.compressibility,
            heat_capacity: cfg.heat_capacity,
            conductivity: cfg.conductivity,
        }
    }

    /// Porosity and ∂ϕ/∂P at pressure `p`, linear in pore-volume
    /// compressibility about the reference pressure.
    pub fn porosity(&self, poro_init: f64, p: f64) -> (f64, f64) {
        let poro = poro_init * (1.0 + self.cr * (p - self.p_ref));
        (poro, poro_init * self.cr)
    }

    /// Volumetric rock enthalpy [Btu/ft³] and ∂H_r/∂T.
    pub fn enthalpy(&self, t: f64) -> (f64, f64) {
        (self.heat_capacity * (t - TEMPERATURE_STD), self.heat_capacity)
    }

    /// Rock thermal conductivity [Btu/(ft·day·°F)].
    pub fn conductivity(&self) -> f64 {
        self.conductivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn porosity_grows_with_pressure() {
        let rock = Rock::new(&RockConfig {
            p_ref: 14.7,
            compressibility: 4e-6,
            ..Default::default()
        });
        let (phi0, dphi) = rock.porosity(0.2, 14.7);
        let (phi1, _) = rock.porosity(0.2, 1014.7);
        assert_relative_eq!(phi0, 0.2);
        assert_relative_eq!(phi1 - phi0, dphi * 1000.0, max_relative = 1e-12);
    }
}
