/// Gradient verification.
///
/// Provides:
/// - `random_like`: Gaussian perturbation shaped like a value
/// - `dot_product_test`: adjoint check of one operator, <J δx, ȳ> vs <δx, Jᵀ ȳ>
/// - `directional_derivative`: central finite differences of a scalar function
///
/// The Jacobian action J δx is measured by central differences of the
/// operator's forward procedure, so the check covers nonlinear operators
/// (Force, Paint, lpt2source) at the linearization point.

use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::complex::Complex64;
use crate::error::{EngineError, Result};
use crate::mesh::ParticleArray;
use crate::registry::OperatorTable;
use crate::tape::Params;
use crate::value::Value;

/// Gaussian value of the same kind and shape as `like`, scaled by `sigma`.
/// Zero stays Zero.
pub fn random_like(like: &Value, sigma: f64, rng: &mut StdRng) -> Value {
    let normal = match Normal::new(0.0, sigma.abs()) {
        Ok(n) => n,
        Err(_) => return like.zeros_like(),
    };
    let mut draw = || normal.sample(&mut *rng);
    match like {
        Value::Zero => Value::Zero,
        Value::Scalar(_) => Value::Scalar(draw()),
        Value::Real(f) => {
            let mut out = f.zeros_like();
            out.values_mut().iter_mut().for_each(|v| *v = draw());
            Value::Real(out)
        }
        Value::Complex(f) => {
            let mut out = f.zeros_like();
            out.values_mut().iter_mut().for_each(|v| *v = Complex64::new(draw(), draw()));
            Value::Complex(out)
        }
        Value::Particles(p) => {
            let data = (0..p.len()).map(|_| [draw(), draw(), draw()]).collect();
            Value::Particles(ParticleArray::new(data))
        }
    }
}

/// Both sides of an adjoint dot-product test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DotProductReport {
    /// Σ_outputs <J δx, ȳ>
    pub forward: f64,
    /// Σ_inputs <δx, x̄>
    pub adjoint: f64,
}

impl DotProductReport {
    pub fn relative_error(&self) -> f64 {
        let scale = self.forward.abs().max(self.adjoint.abs()).max(f64::MIN_POSITIVE);
        (self.forward - self.adjoint).abs() / scale
    }
}

/// Adjoint dot-product test of operator `op` at `inputs`.
///
/// `perturbations` holds one δx per input (Zero to hold an input fixed) and
/// `seeds` one ȳ per output.
pub fn dot_product_test<C>(
    table: &OperatorTable<C>,
    ctx: &C,
    op: &str,
    inputs: &[Value],
    params: &Params,
    perturbations: &[Value],
    seeds: &[Value],
    eps: f64,
) -> Result<DotProductReport> {
    let desc = table.get(op).ok_or_else(|| EngineError::UnregisteredOperator(op.to_string()))?;
    if inputs.len() != desc.inputs.len() || perturbations.len() != inputs.len() {
        return Err(EngineError::ArityMismatch {
            op: op.to_string(),
            expected: desc.inputs.len(),
            found: inputs.len().min(perturbations.len()),
        });
    }
    if seeds.len() != desc.outputs.len() {
        return Err(EngineError::ArityMismatch { op: op.to_string(), expected: desc.outputs.len(), found: seeds.len() });
    }

    let shifted = |s: f64| -> Result<Vec<Value>> {
        let moved: Vec<Value> = inputs
            .iter()
            .zip(perturbations)
            .map(|(x, dx)| x.axpy(s, dx))
            .collect::<Result<_>>()?;
        let refs: Vec<&Value> = moved.iter().collect();
        (desc.forward)(ctx, &refs, params)
    };
    let plus = shifted(eps)?;
    let minus = shifted(-eps)?;

    let mut forward = 0.0;
    for ((p, m), seed) in plus.iter().zip(&minus).zip(seeds) {
        let jdx = p.axpy(-1.0, m)?.scale(0.5 / eps);
        forward += jdx.dot(seed)?;
    }

    let refs: Vec<&Value> = inputs.iter().collect();
    let grads = (desc.gradient)(ctx, &refs, seeds, params)?;
    let mut adjoint = 0.0;
    for (g, dx) in grads.iter().zip(perturbations) {
        adjoint += g.dot(dx)?;
    }
    Ok(DotProductReport { forward, adjoint })
}

/// Central difference (f(x + ε dx) − f(x − ε dx)) / 2ε.
pub fn directional_derivative<F>(f: F, x: &Value, dx: &Value, eps: f64) -> Result<f64>
where
    F: Fn(&Value) -> Result<f64>,
{
    let fp = f(&x.axpy(eps, dx)?)?;
    let fm = f(&x.axpy(-eps, dx)?)?;
    Ok((fp - fm) / (2.0 * eps))
}
