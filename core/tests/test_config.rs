//! Configuration on disk, and the full objective pipeline built from it:
//! evolution + Paint + Transfer + Diff + Chi2 + Prior, differentiated end
//! to end and checked against finite differences.

use pm_adjoint_core::config::{load_config, save_config, Scheme, SimulationConfig};
use pm_adjoint_core::gradient::directional_derivative;
use pm_adjoint_core::ic::{linear_field, power_law};
use pm_adjoint_core::simulation::Simulation;
use pm_adjoint_core::{EngineError, Value};

// ── Group 1: File I/O ────────────────────────────────────────────────

#[test]
fn test_save_load_config() {
    let dir = std::env::temp_dir().join("pm_adjoint_test_config");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.json");

    let config = SimulationConfig { smoothing: Some(0.75), kmax: Some(3.0), ..SimulationConfig::test_config() };
    save_config(&path, &config).unwrap();
    let loaded = load_config(&path).unwrap();
    assert_eq!(config, loaded);

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_load_nonexistent_config() {
    let path = std::env::temp_dir().join("pm_adjoint_nonexistent_config_abc123.json");
    assert!(matches!(load_config(&path), Err(EngineError::Config(_))));
}

#[test]
fn test_load_rejects_invalid_config() {
    let dir = std::env::temp_dir().join("pm_adjoint_test_invalid_config");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.json");

    let config = SimulationConfig { astart: 2.0, ..SimulationConfig::test_config() };
    save_config(&path, &config).unwrap();
    assert!(matches!(load_config(&path), Err(EngineError::Config(_))));

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(load_config(&path), Err(EngineError::Config(_))));

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_dir(&dir);
}

#[test]
fn test_validation_errors() {
    let base = SimulationConfig::test_config();
    let cases = [
        SimulationConfig { nmesh: [4, 0, 4], ..base.clone() },
        SimulationConfig { box_size: [4.0, -1.0, 4.0], ..base.clone() },
        SimulationConfig { force_resolution: 0, ..base.clone() },
        SimulationConfig { scheme: Scheme::KickDriftKick { nsteps: 0 }, ..base.clone() },
        SimulationConfig { scheme: Scheme::Lpt { order: 0 }, ..base.clone() },
        SimulationConfig { kmax: Some(0.0), ..base.clone() },
        SimulationConfig { smoothing: Some(-1.0), ..base.clone() },
        SimulationConfig { omega_m: 0.0, omega_lambda: 1.0, ..base.clone() },
    ];
    for c in cases {
        assert!(c.validate().is_err(), "{c:?} should be rejected");
        assert!(Simulation::new(c).is_err());
    }
    // LPT ignores astart.
    SimulationConfig { astart: 5.0, ..SimulationConfig::lpt_config(2) }.validate().unwrap();
}

// ── Group 2: End-to-end gradient ─────────────────────────────────────

#[test_log::test]
fn test_objective_gradient_matches_finite_differences() {
    let config = SimulationConfig { smoothing: Some(0.8), ..SimulationConfig::test_config() };
    let sim = Simulation::new(config).unwrap();
    let pm = sim.evolution().pm().clone();
    let power = power_law(0.05, 0.0);

    let truth = sim.initial_field(&power).unwrap();
    let data = sim.observe(truth).unwrap();
    let objective = sim.objective(data, 0.5, Some(power.clone())).unwrap();

    let x = linear_field(&pm, &power, 7).unwrap();
    let dx = linear_field(&pm, &power, 11).unwrap();
    let eval = sim.gradient(&objective, &x).unwrap();
    assert!(eval.chi2 > 0.0 && eval.prior > 0.0);
    assert!((eval.value() - sim.evaluate(&objective, &x).unwrap()).abs() < 1e-12 * eval.value());

    let f = |v: &Value| sim.evaluate(&objective, v.as_complex("objective")?);
    let fd = directional_derivative(f, &Value::Complex(x), &Value::Complex(dx.clone()), 1e-6).unwrap();
    let ad = eval.gradient.dot(&dx).unwrap();
    let rel = (fd - ad).abs() / fd.abs().max(ad.abs());
    assert!(rel < 1e-4, "finite difference {fd} vs adjoint {ad} (rel err {rel:.3e})");
}

#[test]
fn test_lpt_gradient_matches_finite_differences() {
    let sim = Simulation::new(SimulationConfig::lpt_config(2)).unwrap();
    let pm = sim.evolution().pm().clone();
    let power = power_law(0.05, 0.0);

    let data = sim.observe(sim.initial_field(&power).unwrap()).unwrap();
    let objective = sim.objective(data, 0.5, None).unwrap();
    let x = linear_field(&pm, &power, 3).unwrap();
    let dx = linear_field(&pm, &power, 4).unwrap();

    let eval = sim.gradient(&objective, &x).unwrap();
    assert_eq!(eval.prior, 0.0);
    let f = |v: &Value| sim.evaluate(&objective, v.as_complex("objective")?);
    let fd = directional_derivative(f, &Value::Complex(x), &Value::Complex(dx.clone()), 1e-6).unwrap();
    let ad = eval.gradient.dot(&dx).unwrap();
    let rel = (fd - ad).abs() / fd.abs().max(ad.abs());
    assert!(rel < 1e-4, "finite difference {fd} vs adjoint {ad} (rel err {rel:.3e})");
}
