// Values flowing through the tape: operator inputs/outputs and adjoints.
//
// `Zero` marks a quantity that provably does not influence the objective.
// It is the additive identity, scales to itself, and never allocates. Asking
// for a concrete array out of `Zero` is an error, never a silent coercion.

use crate::error::{EngineError, Result};
use crate::mesh::{ComplexField, ParticleArray, RealField};

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Zero,
    Scalar(f64),
    Real(RealField),
    Complex(ComplexField),
    Particles(ParticleArray),
}

impl Value {
    pub fn is_zero(&self) -> bool {
        matches!(self, Value::Zero)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Zero => "zero",
            Value::Scalar(_) => "scalar",
            Value::Real(_) => "real field",
            Value::Complex(_) => "complex field",
            Value::Particles(_) => "particle array",
        }
    }

    // ── Typed access ────────────────────────────────────────────

    pub fn as_scalar(&self, op: &str) -> Result<f64> {
        match self {
            Value::Scalar(x) => Ok(*x),
            Value::Zero => Err(EngineError::ZeroMisuse { op: op.to_string() }),
            other => Err(EngineError::shape(op, "scalar", other.kind())),
        }
    }

    pub fn as_real(&self, op: &str) -> Result<&RealField> {
        match self {
            Value::Real(f) => Ok(f),
            Value::Zero => Err(EngineError::ZeroMisuse { op: op.to_string() }),
            other => Err(EngineError::shape(op, "real field", other.kind())),
        }
    }

    pub fn as_complex(&self, op: &str) -> Result<&ComplexField> {
        match self {
            Value::Complex(f) => Ok(f),
            Value::Zero => Err(EngineError::ZeroMisuse { op: op.to_string() }),
            other => Err(EngineError::shape(op, "complex field", other.kind())),
        }
    }

    pub fn as_particles(&self, op: &str) -> Result<&ParticleArray> {
        match self {
            Value::Particles(p) => Ok(p),
            Value::Zero => Err(EngineError::ZeroMisuse { op: op.to_string() }),
            other => Err(EngineError::shape(op, "particle array", other.kind())),
        }
    }

    // ── Zero-aware arithmetic ───────────────────────────────────

    /// `s * self`. Zero stays Zero.
    pub fn scale(&self, s: f64) -> Value {
        match self {
            Value::Zero => Value::Zero,
            Value::Scalar(x) => Value::Scalar(x * s),
            Value::Real(f) => Value::Real(f.scaled(s)),
            Value::Complex(f) => Value::Complex(f.scaled(s)),
            Value::Particles(p) => Value::Particles(p.scaled(s)),
        }
    }

    /// `self + s * other`, with Zero as the additive identity on either side.
    pub fn axpy(&self, s: f64, other: &Value) -> Result<Value> {
        match (self, other) {
            (_, Value::Zero) => Ok(self.clone()),
            (Value::Zero, _) => Ok(other.scale(s)),
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(a + s * b)),
            (Value::Real(a), Value::Real(b)) => Ok(Value::Real(a.axpy(s, b)?)),
            (Value::Complex(a), Value::Complex(b)) => Ok(Value::Complex(a.axpy(s, b)?)),
            (Value::Particles(a), Value::Particles(b)) => Ok(Value::Particles(a.axpy(s, b)?)),
            (a, b) => Err(EngineError::shape("axpy", a.kind(), b.kind())),
        }
    }

    /// `self + other`.
    pub fn add(&self, other: &Value) -> Result<Value> {
        self.axpy(1.0, other)
    }

    /// Accumulate `other` into `self` without cloning when `self` is Zero.
    pub fn accumulate(&mut self, other: Value) -> Result<()> {
        if other.is_zero() {
            return Ok(());
        }
        if self.is_zero() {
            *self = other;
            return Ok(());
        }
        *self = self.add(&other)?;
        Ok(())
    }

    /// Real inner product. Zero on either side gives 0.
    pub fn dot(&self, other: &Value) -> Result<f64> {
        match (self, other) {
            (Value::Zero, _) | (_, Value::Zero) => Ok(0.0),
            (Value::Scalar(a), Value::Scalar(b)) => Ok(a * b),
            (Value::Real(a), Value::Real(b)) => a.dot(b),
            (Value::Complex(a), Value::Complex(b)) => a.dot(b),
            (Value::Particles(a), Value::Particles(b)) => a.dot(b),
            (a, b) => Err(EngineError::shape("dot", a.kind(), b.kind())),
        }
    }

    /// A concrete all-zero value of the same kind and shape. Zero stays Zero.
    pub fn zeros_like(&self) -> Value {
        match self {
            Value::Zero => Value::Zero,
            Value::Scalar(_) => Value::Scalar(0.0),
            Value::Real(f) => Value::Real(f.zeros_like()),
            Value::Complex(f) => Value::Complex(f.zeros_like()),
            Value::Particles(p) => Value::Particles(p.zeros_like()),
        }
    }

    /// Replace Zero by concrete zeros shaped like `like`.
    pub fn densify(self, like: &Value) -> Value {
        match self {
            Value::Zero => like.zeros_like(),
            v => v,
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(x)
    }
}

impl From<RealField> for Value {
    fn from(f: RealField) -> Self {
        Value::Real(f)
    }
}

impl From<ComplexField> for Value {
    fn from(f: ComplexField) -> Self {
        Value::Complex(f)
    }
}

impl From<ParticleArray> for Value {
    fn from(p: ParticleArray) -> Self {
        Value::Particles(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn particles(v: f64) -> Value {
        Value::Particles(ParticleArray::new(vec![[v, 2.0 * v, -v]; 3]))
    }

    #[test]
    fn test_zero_is_additive_identity() {
        let a = particles(1.5);
        assert_eq!(a.add(&Value::Zero).unwrap(), a);
        assert_eq!(Value::Zero.add(&a).unwrap(), a);
        assert!(Value::Zero.add(&Value::Zero).unwrap().is_zero());
    }

    #[test]
    fn test_zero_scales_to_zero() {
        assert!(Value::Zero.scale(3.0).is_zero());
    }

    #[test]
    fn test_zero_misuse_is_rejected() {
        assert!(matches!(Value::Zero.as_particles("Kick"), Err(EngineError::ZeroMisuse { .. })));
        assert!(matches!(Value::Zero.as_scalar("Chi2"), Err(EngineError::ZeroMisuse { .. })));
    }

    #[test]
    fn test_kind_mismatch_is_shape_error() {
        let r = Value::Scalar(1.0).add(&particles(1.0));
        assert!(matches!(r, Err(EngineError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_accumulate_sums() {
        let mut acc = Value::Zero;
        acc.accumulate(particles(1.0)).unwrap();
        acc.accumulate(particles(2.0)).unwrap();
        acc.accumulate(Value::Zero).unwrap();
        assert_eq!(acc, particles(3.0));
    }

    #[test]
    fn test_densify() {
        let like = particles(4.0);
        let d = Value::Zero.densify(&like);
        assert_eq!(d.dot(&like).unwrap(), 0.0);
        assert_eq!(d.kind(), "particle array");
    }
}
