//! Adjoint dot-product tests for every physics operator.
//!
//! For each operator F at a random point x, with random δx and ȳ:
//!   <J δx, ȳ>  (central differences of the forward procedure)
//! must match
//!   <δx, Jᵀ ȳ> (the registered gradient procedure).

use pm_adjoint_core::gradient::{dot_product_test, random_like};
use pm_adjoint_core::ic::power_law;
use pm_adjoint_core::mesh::{ParticleArray, ParticleMesh};
use pm_adjoint_core::operators::{evolution_table, Evolution};
use pm_adjoint_core::{Params, Value};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ── Helpers ──────────────────────────────────────────────────────────

fn context(force_resolution: usize) -> Evolution {
    Evolution::new(ParticleMesh::cubic(4, 4.0).unwrap(), force_resolution, 0.0).unwrap()
}

fn particles(ctx: &Evolution) -> Value {
    Value::Particles(ParticleArray::zeros(ctx.q().len()))
}

fn real(ctx: &Evolution) -> Value {
    Value::Real(ctx.pm().create_real())
}

fn complex(ctx: &Evolution) -> Value {
    Value::Complex(ctx.pm().create_complex())
}

/// Draw inputs, perturbations and seeds, then run the dot-product test.
fn check(
    ctx: &Evolution,
    op: &str,
    inputs: &[(Value, f64)],
    outputs: &[Value],
    params: &Params,
    eps: f64,
    tol: f64,
    seed: u64,
) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x: Vec<Value> = inputs.iter().map(|(like, s)| random_like(like, *s, &mut rng)).collect();
    let dx: Vec<Value> = inputs.iter().map(|(like, _)| random_like(like, 1.0, &mut rng)).collect();
    let seeds: Vec<Value> = outputs.iter().map(|like| random_like(like, 1.0, &mut rng)).collect();
    let table = evolution_table();
    let report = dot_product_test(&table, ctx, op, &x, params, &dx, &seeds, eps).unwrap();
    assert!(
        report.relative_error() < tol,
        "{op}: forward {} vs adjoint {} (rel err {:.3e})",
        report.forward,
        report.adjoint,
        report.relative_error()
    );
}

fn displace_params(d2: f64, v2: f64) -> Params {
    Params::new().with("D1", 0.8).with("v1", 1.1).with("D2", d2).with("v2", v2)
}

// ── Group 1: Displace ────────────────────────────────────────────────

#[test]
fn test_displace_first_order_adjoint() {
    let c = context(1);
    check(&c, "Displace", &[(complex(&c), 0.1)], &[particles(&c), particles(&c)], &displace_params(0.0, 0.0), 1e-3, 1e-8, 1);
}

#[test]
fn test_displace_second_order_adjoint() {
    let c = context(1);
    check(&c, "Displace", &[(complex(&c), 0.1)], &[particles(&c), particles(&c)], &displace_params(-0.3, 0.4), 1e-3, 1e-8, 2);
}

#[test]
fn test_displace_velocity_only_seed() {
    // Only `p` carries a gradient: the `s` adjoint is Zero.
    let c = context(1);
    check(&c, "Displace", &[(complex(&c), 0.1)], &[Value::Zero, particles(&c)], &displace_params(-0.3, 0.4), 1e-3, 1e-8, 3);
}

// ── Group 2: Gravity ─────────────────────────────────────────────────

#[test]
fn test_force_adjoint() {
    let c = context(1);
    let params = Params::new().with("factor", 0.45);
    check(&c, "Force", &[(particles(&c), 0.3)], &[particles(&c)], &params, 1e-6, 1e-5, 4);
}

#[test]
fn test_force_adjoint_on_refined_mesh() {
    let c = context(2);
    let params = Params::new().with("factor", 0.45);
    check(&c, "Force", &[(particles(&c), 0.3)], &[particles(&c)], &params, 1e-6, 1e-5, 5);
}

#[test]
fn test_mesh_force_adjoint() {
    let c = context(1);
    let params = Params::new().with("d", 1usize).with("factor", 0.7);
    check(&c, "MeshForce", &[(real(&c), 1.0)], &[real(&c)], &params, 1e-3, 1e-9, 6);
}

#[test]
fn test_readout_adjoint() {
    let c = context(1);
    let params = Params::new().with("d", 2usize);
    check(
        &c,
        "Readout",
        &[(particles(&c), 0.3), (real(&c), 1.0), (particles(&c), 1.0)],
        &[particles(&c)],
        &params,
        1e-6,
        1e-5,
        7,
    );
}

// ── Group 3: Density and likelihood ──────────────────────────────────

#[test]
fn test_paint_adjoint() {
    let c = context(1);
    check(&c, "Paint", &[(particles(&c), 0.3)], &[real(&c)], &Params::new(), 1e-6, 1e-5, 8);
}

#[test]
fn test_transfer_adjoint() {
    let c = context(1);
    let params = Params::new().with("smoothing", 0.7).with("kmax", 2.0);
    check(&c, "Transfer", &[(real(&c), 1.0)], &[real(&c)], &params, 1e-3, 1e-9, 9);
}

#[test]
fn test_diff_adjoint_scalar_and_field_sigma() {
    let c = context(1);
    let data = c.pm().real_from_vec((0..64).map(|i| (i as f64 * 0.3).cos()).collect()).unwrap();
    let sigma = c.pm().real_from_vec((0..64).map(|i| 0.5 + (i % 5) as f64 * 0.1).collect()).unwrap();

    let params = Params::new().with("data", data.clone()).with("sigma", 0.5);
    check(&c, "Diff", &[(real(&c), 1.0)], &[real(&c)], &params, 1e-3, 1e-9, 10);

    let params = Params::new().with("data", data).with("sigma", sigma);
    check(&c, "Diff", &[(real(&c), 1.0)], &[real(&c)], &params, 1e-3, 1e-9, 11);
}

#[test]
fn test_chi2_adjoint_for_fields_and_particles() {
    let c = context(1);
    check(&c, "Chi2", &[(real(&c), 1.0)], &[Value::Scalar(0.0)], &Params::new(), 1e-3, 1e-9, 12);
    check(&c, "Chi2", &[(particles(&c), 1.0)], &[Value::Scalar(0.0)], &Params::new(), 1e-3, 1e-9, 13);
}

#[test]
fn test_prior_adjoint() {
    let c = context(1);
    let params = Params::new().with("powerspectrum", power_law(2.0, -1.0));
    check(&c, "Prior", &[(complex(&c), 0.1)], &[Value::Scalar(0.0)], &params, 1e-3, 1e-9, 14);
}

// ── Group 4: Leapfrog ────────────────────────────────────────────────

#[test]
fn test_kick_drift_copy_adjoints() {
    let c = context(1);
    let kick = Params::new().with("dda", 0.37);
    check(&c, "Kick", &[(particles(&c), 1.0), (particles(&c), 1.0)], &[particles(&c)], &kick, 1e-3, 1e-9, 15);
    let drift = Params::new().with("dyyy", -1.25);
    check(&c, "Drift", &[(particles(&c), 1.0), (particles(&c), 1.0)], &[particles(&c)], &drift, 1e-3, 1e-9, 16);
    check(&c, "Copy", &[(particles(&c), 1.0)], &[particles(&c)], &Params::new(), 1e-3, 1e-9, 17);
    check(&c, "Copy", &[(real(&c), 1.0)], &[real(&c)], &Params::new(), 1e-3, 1e-9, 18);
}
