// Gaussian initial conditions and power spectrum helpers.
//
// With r2c normalized by 1/N, a field with power spectrum P has
// <|δ_k|²> = P(k) / V. White noise of unit variance per cell has
// <|w_k|²> = 1 / N, so δ_k = w_k · sqrt(N · P(k) / V). The mean mode is
// set to zero.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::complex::Complex64;
use crate::error::{EngineError, Result};
use crate::mesh::{ComplexField, ParticleMesh};
use crate::tape::PowerSpectrum;

/// Gaussian random linear density field in Fourier space.
///
/// Deterministic for a given `seed` and mesh.
pub fn linear_field(pm: &ParticleMesh, power: &PowerSpectrum, seed: u64) -> Result<ComplexField> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).map_err(|e| EngineError::InvalidParameter(e.to_string()))?;
    let noise: Vec<f64> = (0..pm.ncells()).map(|_| normal.sample(&mut rng)).collect();
    let white = pm.r2c(&pm.real_from_vec(noise)?)?;

    let scale = pm.ncells() as f64 / pm.volume();
    let mut out = white.clone();
    for (i, v) in out.values_mut().iter_mut().enumerate() {
        let k = white.wavevector(i).kmag();
        let p = if k == 0.0 { 0.0 } else { power(k) };
        *v = if p > 0.0 { v.scale((scale * p).sqrt()) } else { Complex64::ZERO };
    }
    Ok(out)
}

/// P(k) = amplitude · k^index.
pub fn power_law(amplitude: f64, index: f64) -> PowerSpectrum {
    Arc::new(move |k: f64| amplitude * k.powf(index))
}

/// Log-log interpolation of a tabulated spectrum; zero outside the table.
pub fn tabulated(k: Vec<f64>, p: Vec<f64>) -> Result<PowerSpectrum> {
    if k.len() != p.len() || k.len() < 2 {
        return Err(EngineError::InvalidParameter(format!(
            "power spectrum table needs at least two (k, P) rows of equal length, got {} and {}",
            k.len(),
            p.len()
        )));
    }
    if k.iter().any(|&x| !(x > 0.0)) || p.iter().any(|&x| !(x > 0.0)) {
        return Err(EngineError::InvalidParameter("power spectrum table must be positive".into()));
    }
    if k.windows(2).any(|w| w[1] <= w[0]) {
        return Err(EngineError::InvalidParameter("power spectrum k must increase".into()));
    }
    let lk: Vec<f64> = k.iter().map(|x| x.ln()).collect();
    let lp: Vec<f64> = p.iter().map(|x| x.ln()).collect();
    Ok(Arc::new(move |k: f64| {
        if !(k > 0.0) {
            return 0.0;
        }
        let x = k.ln();
        if x < lk[0] || x > lk[lk.len() - 1] {
            return 0.0;
        }
        let j = lk.partition_point(|&v| v <= x).clamp(1, lk.len() - 1);
        let t = (x - lk[j - 1]) / (lk[j] - lk[j - 1]);
        (lp[j - 1] + t * (lp[j] - lp[j - 1])).exp()
    }))
}
