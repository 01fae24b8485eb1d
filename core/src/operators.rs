/// Physics operator set for particle-mesh evolution.
///
/// Every operator reads its inputs without mutating them and returns fresh
/// outputs. Particle positions are always `s + q`, with `q` the unperturbed
/// grid owned by the context; the CIC layout is rebuilt from the current
/// positions inside every call that paints or reads out.
///
/// | op        | inputs              | outputs    | params                 |
/// |-----------|---------------------|------------|------------------------|
/// | Displace  | dlin_k              | s, p       | D1, v1, D2, v2         |
/// | Force     | s                   | f          | factor                 |
/// | MeshForce | mesh                | meshforce  | d, factor              |
/// | Readout   | s, meshforce, f     | f          | d                      |
/// | Paint     | s                   | mesh       |                        |
/// | Transfer  | mesh                | mesh       | smoothing?, kmax?      |
/// | Diff      | mesh                | mesh       | data, sigma            |
/// | Chi2      | variable            | chi2       |                        |
/// | Prior     | dlin_k              | prior      | powerspectrum          |
/// | Kick      | f, p                | p          | dda                    |
/// | Drift     | p, s                | s          | dyyy                   |
/// | Copy      | a                   | b          |                        |

use std::sync::Arc;

use crate::comm::{Communicator, FixedSum, SingleProcess};
use crate::complex::Complex64;
use crate::error::{EngineError, Result};
use crate::gravity::{force_kernel, gravity, gravity_gradient};
use crate::lpt::{lpt1, lpt1_gradient, lpt2source, lpt2source_gradient};
use crate::mesh::{ParticleArray, ParticleMesh, RealField, Wavevector};
use crate::registry::{OperatorDescriptor, OperatorTable};
use crate::tape::{Param, Params};
use crate::value::Value;

// ── Context ──────────────────────────────────────────────────────────

/// Shared state of every operator: base mesh, force mesh, unperturbed grid,
/// and the communicator used for global sums.
pub struct Evolution {
    pm: ParticleMesh,
    fpm: ParticleMesh,
    q: ParticleArray,
    comm: Arc<dyn Communicator>,
}

impl Evolution {
    /// `force_resolution` is the refinement factor B of the force mesh;
    /// `shift` offsets the grid in units of the base cell.
    pub fn new(pm: ParticleMesh, force_resolution: usize, shift: f64) -> Result<Self> {
        let fpm = pm.refined(force_resolution)?;
        let q = pm.grid(shift);
        Ok(Evolution { pm, fpm, q, comm: Arc::new(SingleProcess) })
    }

    pub fn with_communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    pub fn pm(&self) -> &ParticleMesh {
        &self.pm
    }

    pub fn fpm(&self) -> &ParticleMesh {
        &self.fpm
    }

    pub fn q(&self) -> &ParticleArray {
        &self.q
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }

    /// Ratio of force-mesh to base-mesh cells: rescales a density painted on
    /// the force mesh to one particle per base cell.
    pub fn density_factor(&self) -> f64 {
        self.fpm.ncells() as f64 / self.pm.ncells() as f64
    }

    /// Absolute positions `s + q`.
    pub fn positions(&self, s: &ParticleArray) -> Result<ParticleArray> {
        self.q.axpy(1.0, s)
    }
}

/// Mesh geometry a field lives on.
fn mesh_of(field: &RealField) -> Result<ParticleMesh> {
    ParticleMesh::new(field.nmesh(), field.box_size())
}

// ── Displace ─────────────────────────────────────────────────────────

fn displace(ctx: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Displace";
    let dlin_k = inputs[0].as_complex(op)?;
    let (d1, v1) = (params.scalar(op, "D1")?, params.scalar(op, "v1")?);
    let (d2, v2) = (params.scalar(op, "D2")?, params.scalar(op, "v2")?);

    let layout = ctx.pm.decompose(&ctx.q);
    let dx1 = lpt1(&ctx.pm, dlin_k, &layout)?;
    let mut s = dx1.scaled(d1);
    let mut p = dx1.scaled(v1);
    if d2 != 0.0 || v2 != 0.0 {
        let dx2 = lpt1(&ctx.pm, &lpt2source(&ctx.pm, dlin_k)?, &layout)?;
        s = s.axpy(d2, &dx2)?;
        p = p.axpy(v2, &dx2)?;
    }
    Ok(vec![s.into(), p.into()])
}

/// `Σ c_i · v_i`, skipping Zero values and zero coefficients. Zero if every
/// term is skipped.
fn combine(terms: &[(&Value, f64)]) -> Result<Value> {
    let mut acc = Value::Zero;
    for (v, c) in terms {
        if *c != 0.0 && !v.is_zero() {
            acc = acc.axpy(*c, v)?;
        }
    }
    Ok(acc)
}

fn displace_gradient(ctx: &Evolution, inputs: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Displace";
    let dlin_k = inputs[0].as_complex(op)?;
    let (d1, v1) = (params.scalar(op, "D1")?, params.scalar(op, "v1")?);
    let (d2, v2) = (params.scalar(op, "D2")?, params.scalar(op, "v2")?);
    let (s_bar, p_bar) = (&d_out[0], &d_out[1]);

    let grad_dx1 = combine(&[(p_bar, v1), (s_bar, d1)])?;
    let grad_dx2 = combine(&[(p_bar, v2), (s_bar, d2)])?;

    let layout = ctx.pm.decompose(&ctx.q);
    let mut grad = Value::Zero;
    if !grad_dx1.is_zero() {
        grad.accumulate(lpt1_gradient(&ctx.pm, &layout, grad_dx1.as_particles(op)?)?.into())?;
    }
    if !grad_dx2.is_zero() {
        let grad_source = lpt1_gradient(&ctx.pm, &layout, grad_dx2.as_particles(op)?)?;
        grad.accumulate(lpt2source_gradient(&ctx.pm, dlin_k, &grad_source)?.into())?;
    }
    Ok(vec![grad])
}

// ── Gravity: Force, MeshForce, Readout ───────────────────────────────

fn force(ctx: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Force";
    let factor = params.scalar(op, "factor")?;
    let x = ctx.positions(inputs[0].as_particles(op)?)?;
    let f = gravity(&ctx.fpm, &x, ctx.density_factor(), factor)?;
    Ok(vec![f.into()])
}

fn force_gradient(ctx: &Evolution, inputs: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Force";
    let factor = params.scalar(op, "factor")?;
    let x = ctx.positions(inputs[0].as_particles(op)?)?;
    let grad = gravity_gradient(&ctx.fpm, &x, ctx.density_factor(), factor, d_out[0].as_particles(op)?)?;
    Ok(vec![grad.into()])
}

fn mesh_force(_: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let op = "MeshForce";
    let (d, factor) = (params.axis(op, "d")?, params.scalar(op, "factor")?);
    let mesh = inputs[0].as_real(op)?;
    let pm = mesh_of(mesh)?;
    let mut f = pm.c2r(&pm.r2c(mesh)?.apply(force_kernel(d)))?;
    f.scale_in_place(factor);
    Ok(vec![f.into()])
}

fn mesh_force_gradient(_: &Evolution, inputs: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let op = "MeshForce";
    let (d, factor) = (params.axis(op, "d")?, params.scalar(op, "factor")?);
    let pm = mesh_of(inputs[0].as_real(op)?)?;
    let seed = d_out[0].as_real(op)?;
    let mut grad = pm.r2c_gradient(&pm.c2r_gradient(seed)?.apply_conjugate(force_kernel(d)))?;
    grad.scale_in_place(factor);
    Ok(vec![grad.into()])
}

fn readout(ctx: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Readout";
    let d = params.axis(op, "d")?;
    let x = ctx.positions(inputs[0].as_particles(op)?)?;
    let field = inputs[1].as_real(op)?;
    let pm = mesh_of(field)?;
    let column = pm.readout(field, &pm.decompose(&x))?;

    let mut f = match inputs[2] {
        Value::Zero => ParticleArray::zeros(x.len()),
        v => v.as_particles(op)?.clone(),
    };
    f.set_column(d, &column)?;
    Ok(vec![f.into()])
}

fn readout_gradient(ctx: &Evolution, inputs: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Readout";
    let d = params.axis(op, "d")?;
    let x = ctx.positions(inputs[0].as_particles(op)?)?;
    let field = inputs[1].as_real(op)?;
    let pm = mesh_of(field)?;
    let layout = pm.decompose(&x);

    let f_bar = d_out[0].as_particles(op)?;
    let seed = f_bar.column(d);
    let s_grad = pm.readout_gradient(field, &layout, &seed)?;
    let mesh_grad = pm.readout_mesh_gradient(&layout, &seed)?;
    let f_grad = if inputs[2].is_zero() {
        Value::Zero
    } else {
        let mut g = f_bar.clone();
        g.set_column(d, &vec![0.0; g.len()])?;
        g.into()
    };
    Ok(vec![s_grad.into(), mesh_grad.into(), f_grad])
}

// ── Paint ────────────────────────────────────────────────────────────

// One particle per base cell, so the painted mesh is 1 + δ.
fn paint(ctx: &Evolution, inputs: &[&Value], _: &Params) -> Result<Vec<Value>> {
    let x = ctx.positions(inputs[0].as_particles("Paint")?)?;
    let mesh = ctx.pm.paint(&ctx.pm.decompose(&x), None)?;
    Ok(vec![mesh.into()])
}

fn paint_gradient(ctx: &Evolution, inputs: &[&Value], d_out: &[Value], _: &Params) -> Result<Vec<Value>> {
    let op = "Paint";
    let x = ctx.positions(inputs[0].as_particles(op)?)?;
    let grad = ctx.pm.paint_gradient(&ctx.pm.decompose(&x), d_out[0].as_real(op)?, None)?;
    Ok(vec![grad.into()])
}

// ── Transfer ─────────────────────────────────────────────────────────

/// Gaussian smoothing of scale `smoothing` times a sharp cut above `kmax`.
fn transfer_kernel(params: &Params) -> Result<impl Fn(&Wavevector) -> Complex64 + Sync> {
    let op = "Transfer";
    let r = params.scalar_or(op, "smoothing", 0.0)?;
    let kmax = params.scalar_or(op, "kmax", f64::INFINITY)?;
    if !(r >= 0.0) || !(kmax > 0.0) {
        return Err(EngineError::InvalidParameter(format!(
            "`Transfer` needs smoothing ≥ 0 and kmax > 0, got {r}, {kmax}"
        )));
    }
    Ok(move |w: &Wavevector| {
        let k2 = w.k2();
        if k2 > kmax * kmax {
            Complex64::ZERO
        } else {
            Complex64::real((-0.5 * k2 * r * r).exp())
        }
    })
}

fn transfer(_: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let mesh = inputs[0].as_real("Transfer")?;
    let pm = mesh_of(mesh)?;
    let out = pm.c2r(&pm.r2c(mesh)?.apply(transfer_kernel(params)?))?;
    Ok(vec![out.into()])
}

fn transfer_gradient(_: &Evolution, inputs: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Transfer";
    let pm = mesh_of(inputs[0].as_real(op)?)?;
    let seed = d_out[0].as_real(op)?;
    let grad = pm.r2c_gradient(&pm.c2r_gradient(seed)?.apply_conjugate(transfer_kernel(params)?))?;
    Ok(vec![grad.into()])
}

// ── Likelihood terms: Diff, Chi2, Prior ──────────────────────────────

enum Sigma<'a> {
    Uniform(f64),
    Field(&'a RealField),
}

fn sigma(params: &Params) -> Result<Sigma<'_>> {
    let op = "Diff";
    let bad = || EngineError::InvalidParameter("`Diff` noise level `sigma` must be positive".into());
    match params.get("sigma") {
        None => Err(EngineError::MissingParameter { op: op.into(), name: "sigma".into() }),
        Some(Param::Scalar(s)) if *s > 0.0 => Ok(Sigma::Uniform(*s)),
        Some(Param::Field(f)) if f.values().iter().all(|&s| s > 0.0) => Ok(Sigma::Field(f)),
        Some(_) => Err(bad()),
    }
}

fn divide(x: &RealField, sigma: &Sigma<'_>) -> Result<RealField> {
    match sigma {
        Sigma::Uniform(s) => Ok(x.scaled(1.0 / s)),
        Sigma::Field(f) => x.zip_map(f, "Diff", |a, s| a / s),
    }
}

fn diff(_: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Diff";
    let mesh = inputs[0].as_real(op)?;
    let data = params.field(op, "data")?;
    let residual = mesh.axpy(-1.0, data)?;
    Ok(vec![divide(&residual, &sigma(params)?)?.into()])
}

fn diff_gradient(_: &Evolution, _: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let seed = d_out[0].as_real("Diff")?;
    Ok(vec![divide(seed, &sigma(params)?)?.into()])
}

fn chi2(ctx: &Evolution, inputs: &[&Value], _: &Params) -> Result<Vec<Value>> {
    let op = "Chi2";
    let local = match inputs[0] {
        Value::Real(f) => FixedSum::sum(f.values().iter().map(|v| v * v))?,
        Value::Particles(p) => FixedSum::sum(p.rows().iter().flatten().map(|v| v * v))?,
        Value::Complex(c) => FixedSum::sum(c.values().iter().map(|v| v.abs_sq()))?,
        Value::Scalar(x) => FixedSum::from_f64(x * x)?,
        Value::Zero => return Err(EngineError::ZeroMisuse { op: op.into() }),
    };
    Ok(vec![Value::Scalar(ctx.comm.allreduce_sum(local)?.to_f64())])
}

fn chi2_gradient(_: &Evolution, inputs: &[&Value], d_out: &[Value], _: &Params) -> Result<Vec<Value>> {
    let seed = d_out[0].as_scalar("Chi2")?;
    Ok(vec![inputs[0].scale(2.0 * seed)])
}

/// Prior weight V / P(k); zero on the mean mode and where P(k) ≤ 0.
fn prior_weight(params: &Params, volume: f64) -> Result<impl Fn(&Wavevector) -> f64 + '_> {
    let spectrum = params.spectrum("Prior", "powerspectrum")?;
    Ok(move |w: &Wavevector| {
        let k = w.kmag();
        if k == 0.0 {
            return 0.0;
        }
        let p = spectrum(k);
        if p > 0.0 {
            volume / p
        } else {
            0.0
        }
    })
}

fn prior(_: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let dlin_k = inputs[0].as_complex("Prior")?;
    let volume: f64 = dlin_k.box_size().iter().product();
    let value = dlin_k.cdot(dlin_k, prior_weight(params, volume)?)?;
    Ok(vec![Value::Scalar(value)])
}

fn prior_gradient(_: &Evolution, inputs: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let op = "Prior";
    let dlin_k = inputs[0].as_complex(op)?;
    let seed = d_out[0].as_scalar(op)?;
    let volume: f64 = dlin_k.box_size().iter().product();
    let grad = dlin_k.cdot_gradient(dlin_k, prior_weight(params, volume)?, seed)?;
    // Self inner product: both slots depend on dlin_k.
    Ok(vec![grad.scaled(2.0).into()])
}

// ── Leapfrog: Kick, Drift, Copy ──────────────────────────────────────

fn kick(_: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let dda = params.scalar("Kick", "dda")?;
    Ok(vec![inputs[1].axpy(dda, inputs[0])?])
}

fn kick_gradient(_: &Evolution, _: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let dda = params.scalar("Kick", "dda")?;
    Ok(vec![d_out[0].scale(dda), d_out[0].clone()])
}

fn drift(_: &Evolution, inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
    let dyyy = params.scalar("Drift", "dyyy")?;
    Ok(vec![inputs[1].axpy(dyyy, inputs[0])?])
}

fn drift_gradient(_: &Evolution, _: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
    let dyyy = params.scalar("Drift", "dyyy")?;
    Ok(vec![d_out[0].scale(dyyy), d_out[0].clone()])
}

fn copy(_: &Evolution, inputs: &[&Value], _: &Params) -> Result<Vec<Value>> {
    Ok(vec![inputs[0].clone()])
}

fn copy_gradient(_: &Evolution, _: &[&Value], d_out: &[Value], _: &Params) -> Result<Vec<Value>> {
    Ok(vec![d_out[0].clone()])
}

// ── Table ────────────────────────────────────────────────────────────

/// Operator table with every physics operator registered.
pub fn evolution_table() -> OperatorTable<Evolution> {
    let mut t = OperatorTable::new();
    t.register(OperatorDescriptor {
        name: "Displace",
        inputs: &["dlin_k"],
        outputs: &["s", "p"],
        forward: displace,
        gradient: displace_gradient,
    })
    .register(OperatorDescriptor {
        name: "Force",
        inputs: &["s"],
        outputs: &["f"],
        forward: force,
        gradient: force_gradient,
    })
    .register(OperatorDescriptor {
        name: "MeshForce",
        inputs: &["mesh"],
        outputs: &["meshforce"],
        forward: mesh_force,
        gradient: mesh_force_gradient,
    })
    .register(OperatorDescriptor {
        name: "Readout",
        inputs: &["s", "meshforce", "f"],
        outputs: &["f"],
        forward: readout,
        gradient: readout_gradient,
    })
    .register(OperatorDescriptor {
        name: "Paint",
        inputs: &["s"],
        outputs: &["mesh"],
        forward: paint,
        gradient: paint_gradient,
    })
    .register(OperatorDescriptor {
        name: "Transfer",
        inputs: &["mesh"],
        outputs: &["mesh"],
        forward: transfer,
        gradient: transfer_gradient,
    })
    .register(OperatorDescriptor {
        name: "Diff",
        inputs: &["mesh"],
        outputs: &["mesh"],
        forward: diff,
        gradient: diff_gradient,
    })
    .register(OperatorDescriptor {
        name: "Chi2",
        inputs: &["variable"],
        outputs: &["chi2"],
        forward: chi2,
        gradient: chi2_gradient,
    })
    .register(OperatorDescriptor {
        name: "Prior",
        inputs: &["dlin_k"],
        outputs: &["prior"],
        forward: prior,
        gradient: prior_gradient,
    })
    .register(OperatorDescriptor {
        name: "Kick",
        inputs: &["f", "p"],
        outputs: &["p"],
        forward: kick,
        gradient: kick_gradient,
    })
    .register(OperatorDescriptor {
        name: "Drift",
        inputs: &["p", "s"],
        outputs: &["s"],
        forward: drift,
        gradient: drift_gradient,
    })
    .register(OperatorDescriptor {
        name: "Copy",
        inputs: &["a"],
        outputs: &["b"],
        forward: copy,
        gradient: copy_gradient,
    });
    t
}
