// Simulation configuration: serde + JSON on disk.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Time-integration scheme.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Scheme {
    /// Single perturbative displacement to `aend`; `astart` is ignored.
    Lpt { order: usize },
    /// Leapfrog from `astart` to `aend` in `nsteps` equal steps of a.
    KickDriftKick { nsteps: usize },
}

/// Simulation configuration, immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub nmesh: [usize; 3],
    pub box_size: [f64; 3],
    /// Force mesh refinement factor B.
    pub force_resolution: usize,
    /// Grid offset in units of one base cell.
    pub shift: f64,
    pub omega_m: f64,
    pub omega_lambda: f64,
    pub scheme: Scheme,
    pub astart: f64,
    pub aend: f64,
    /// Seed of the initial Gaussian field.
    pub seed: u64,
    /// Gaussian smoothing scale applied before comparing with data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<f64>,
    /// Sharp low-pass cut applied before comparing with data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kmax: Option<f64>,
}

impl SimulationConfig {
    /// Tiny leapfrog setup for fast tests.
    pub fn test_config() -> Self {
        SimulationConfig {
            nmesh: [4, 4, 4],
            box_size: [4.0; 3],
            force_resolution: 1,
            shift: 0.0,
            omega_m: 0.3,
            omega_lambda: 0.7,
            scheme: Scheme::KickDriftKick { nsteps: 2 },
            astart: 0.1,
            aend: 1.0,
            seed: 42,
            smoothing: None,
            kmax: None,
        }
    }

    /// Same mesh and cosmology, first- or second-order LPT.
    pub fn lpt_config(order: usize) -> Self {
        SimulationConfig { scheme: Scheme::Lpt { order }, ..Self::test_config() }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(EngineError::Config(msg));
        if self.nmesh.iter().any(|&n| n == 0) {
            return bad(format!("nmesh {:?} has an empty axis", self.nmesh));
        }
        if self.box_size.iter().any(|&l| !(l > 0.0) || !l.is_finite()) {
            return bad(format!("box_size {:?} must be positive", self.box_size));
        }
        if self.force_resolution == 0 {
            return bad("force_resolution must be >= 1".into());
        }
        if !self.shift.is_finite() {
            return bad(format!("shift {} is not finite", self.shift));
        }
        if !(self.omega_m > 0.0) || !self.omega_m.is_finite() || !self.omega_lambda.is_finite() {
            return bad(format!("invalid densities Ω_m = {}, Ω_Λ = {}", self.omega_m, self.omega_lambda));
        }
        if !(self.aend > 0.0) || !self.aend.is_finite() {
            return bad(format!("aend {} must be positive", self.aend));
        }
        match self.scheme {
            Scheme::Lpt { order } if order != 1 && order != 2 => {
                return bad(format!("LPT order must be 1 or 2, got {order}"));
            }
            Scheme::KickDriftKick { nsteps } => {
                if nsteps == 0 {
                    return bad("nsteps must be >= 1".into());
                }
                if !(self.astart > 0.0) || self.astart >= self.aend {
                    return bad(format!("need 0 < astart < aend, got {} and {}", self.astart, self.aend));
                }
            }
            Scheme::Lpt { .. } => {}
        }
        if let Some(r) = self.smoothing {
            if !(r >= 0.0) {
                return bad(format!("smoothing {r} must be >= 0"));
            }
        }
        if let Some(k) = self.kmax {
            if !(k > 0.0) {
                return bad(format!("kmax {k} must be positive"));
            }
        }
        Ok(())
    }
}

pub fn save_config(path: &Path, config: &SimulationConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config).map_err(|e| EngineError::Config(e.to_string()))?;
    std::fs::write(path, json).map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))
}

/// Read and validate a configuration.
pub fn load_config(path: &Path) -> Result<SimulationConfig> {
    let json = std::fs::read_to_string(path).map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
    let config: SimulationConfig = serde_json::from_str(&json).map_err(|e| EngineError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
