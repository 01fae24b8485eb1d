//! Integration schedules end to end: free streaming, exact zero-input
//! evolution, paint normalization, and LPT order agreement.

use pm_adjoint_core::config::SimulationConfig;
use pm_adjoint_core::cosmology::{drift_factor, Background, Cosmology};
use pm_adjoint_core::gradient::random_like;
use pm_adjoint_core::integrator::{kick_drift_kick, lpt};
use pm_adjoint_core::mesh::{ComplexField, ParticleArray, ParticleMesh};
use pm_adjoint_core::operators::{evolution_table, Evolution};
use pm_adjoint_core::simulation::Simulation;
use pm_adjoint_core::{environment, Engine, Params, TapeBuilder, Value};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Matter-free background: the Force factor 1.5 Ω_m is zero, so particles
/// stream freely while the growth functions stay well defined.
struct FreeStreaming;

impl Background for FreeStreaming {
    fn d1(&self, a: f64) -> f64 {
        a
    }
    fn d2(&self, a: f64) -> f64 {
        a * a
    }
    fn f1(&self, _: f64) -> f64 {
        1.0
    }
    fn f2(&self, _: f64) -> f64 {
        2.0
    }
    fn e(&self, a: f64) -> f64 {
        a.powf(-1.5)
    }
    fn omega_m(&self) -> f64 {
        0.0
    }
    fn kick_growth_rate(&self, a: f64) -> f64 {
        1.5 * a.sqrt()
    }
}

fn random_field(pm: &ParticleMesh, sigma: f64, seed: u64) -> ComplexField {
    let mut rng = StdRng::seed_from_u64(seed);
    match random_like(&Value::Complex(pm.create_complex()), sigma, &mut rng) {
        Value::Complex(f) => f,
        other => panic!("unexpected {}", other.kind()),
    }
}

fn particles(v: &Value) -> &ParticleArray {
    v.as_particles("test").unwrap()
}

// ── Group 1: Leapfrog ────────────────────────────────────────────────

#[test_log::test]
fn test_single_step_without_force_streams_freely() {
    let ctx = Evolution::new(ParticleMesh::cubic(4, 4.0).unwrap(), 1, 0.0).unwrap();
    let table = evolution_table();
    let bg = FreeStreaming;
    let (astart, aend) = (0.2, 0.9);
    let tape = kick_drift_kick(TapeBuilder::new(&table), &bg, astart, aend, 1).unwrap().finish();

    let dlin_k = random_field(ctx.pm(), 0.05, 3);
    let engine = Engine::new(&table, &ctx);
    let exec = engine.forward(&tape, environment([("dlin_k", Value::Complex(dlin_k))])).unwrap();

    // Invocation 2 is the first Kick (inputs f, p); 3 the first Drift (p, s).
    let p0 = particles(&exec.inputs_of(2).unwrap()[1]).clone();
    let s0 = particles(&exec.inputs_of(3).unwrap()[1]).clone();
    assert!(particles(&exec.inputs_of(2).unwrap()[0]).sum_squares() == 0.0);

    let ac = (astart * aend).sqrt();
    let coef = (bg.drift_growth(aend) - bg.drift_growth(astart))
        / (ac * ac * ac * bg.e(ac) * bg.drift_growth_rate(ac));
    let expect_s = s0.axpy(coef, &p0).unwrap();

    let s = particles(exec.value("s").unwrap());
    let p = particles(exec.value("p").unwrap());
    assert_eq!(p, &p0);
    for (a, b) in s.rows().iter().zip(expect_s.rows()) {
        for d in 0..3 {
            assert!((a[d] - b[d]).abs() < 1e-12, "{a:?} vs {b:?}");
        }
    }
    // The two half drifts add up to the full one.
    let halves = drift_factor(&bg, astart, ac, ac) + drift_factor(&bg, ac, aend, ac);
    assert!((halves - coef).abs() < 1e-12);
}

#[test]
fn test_zero_linear_field_stays_exactly_at_rest() {
    let config = SimulationConfig {
        nmesh: [4, 4, 4],
        box_size: [1.0; 3],
        astart: 0.1,
        aend: 1.0,
        scheme: pm_adjoint_core::config::Scheme::KickDriftKick { nsteps: 1 },
        ..SimulationConfig::test_config()
    };
    let sim = Simulation::new(config).unwrap();
    let out = sim.run(sim.evolution().pm().create_complex()).unwrap();
    assert!(out.s.rows().iter().flatten().all(|&v| v == 0.0));
    assert!(out.p.rows().iter().flatten().all(|&v| v == 0.0));
}

// ── Group 2: Paint and LPT ───────────────────────────────────────────

#[test]
fn test_paint_of_grid_is_all_ones() {
    let ctx = Evolution::new(ParticleMesh::cubic(4, 1.0).unwrap(), 1, 0.0).unwrap();
    let table = evolution_table();
    let mut b = TapeBuilder::new(&table);
    b.invoke("Paint", Params::new()).unwrap();
    let tape = b.finish();
    let env = environment([("s", Value::Particles(ParticleArray::zeros(64)))]);
    let exec = Engine::new(&table, &ctx).forward(&tape, env).unwrap();
    let mesh = exec.value("mesh").unwrap().as_real("test").unwrap();
    assert!(mesh.values().iter().all(|&v| v == 1.0));
}

#[test]
fn test_first_order_matches_displace_without_second_order_terms() {
    let ctx = Evolution::new(ParticleMesh::cubic(4, 4.0).unwrap(), 1, 0.25).unwrap();
    let table = evolution_table();
    let cosmo = Cosmology::flat(0.3).unwrap();
    let aend = 0.5;

    let lpt1 = lpt(TapeBuilder::new(&table), &cosmo, aend, 1).unwrap().finish();
    let mut b = TapeBuilder::new(&table);
    let v1 = cosmo.f1(aend) * cosmo.d1(aend) * aend * aend * cosmo.e(aend);
    b.invoke("Displace", Params::new().with("D1", cosmo.d1(aend)).with("v1", v1).with("D2", 0.0).with("v2", 0.0))
        .unwrap();
    let manual = b.finish();

    let engine = Engine::new(&table, &ctx);
    let dlin_k = random_field(ctx.pm(), 0.05, 9);
    let a = engine.forward(&lpt1, environment([("dlin_k", Value::Complex(dlin_k.clone()))])).unwrap();
    let m = engine.forward(&manual, environment([("dlin_k", Value::Complex(dlin_k))])).unwrap();
    assert_eq!(a.value("s").unwrap(), m.value("s").unwrap());
    assert_eq!(a.value("p").unwrap(), m.value("p").unwrap());
}

#[test]
fn test_orders_agree_when_second_order_source_vanishes() {
    // A single plane wave has no second-order source.
    let pm = ParticleMesh::cubic(8, 8.0).unwrap();
    let ctx = Evolution::new(pm.clone(), 1, 0.0).unwrap();
    let table = evolution_table();
    let cosmo = Cosmology::flat(0.3).unwrap();
    let wave: Vec<f64> = (0..pm.ncells())
        .map(|i| 0.2 * (2.0 * std::f64::consts::PI * (i % 8) as f64 / 8.0).sin())
        .collect();
    let dlin_k = pm.r2c(&pm.real_from_vec(wave).unwrap()).unwrap();

    let engine = Engine::new(&table, &ctx);
    let run = |order| {
        let tape = lpt(TapeBuilder::new(&table), &cosmo, 1.0, order).unwrap().finish();
        let exec = engine.forward(&tape, environment([("dlin_k", Value::Complex(dlin_k.clone()))])).unwrap();
        particles(exec.value("s").unwrap()).clone()
    };
    let (s1, s2) = (run(1), run(2));
    assert!(s1.sum_squares() > 1e-6);
    let diff = s1.axpy(-1.0, &s2).unwrap();
    assert!(diff.sum_squares() < 1e-20);
}
