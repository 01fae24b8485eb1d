// Operator tape: an ordered, replayable record of operator invocations.
//
// Recording does not execute anything. A tape is built once by an integrator
// (through TapeBuilder), then run forward and backward by the engine any
// number of times with different initial environments.
//
// Each invocation binds an operator's declared ports to concrete symbols and
// carries the non-differentiated parameters (step coefficients, axis
// indices, constant data fields, power spectra) baked in at build time.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::mesh::RealField;
use crate::registry::OperatorTable;

/// Name of a slot in an environment.
pub type Symbol = String;

/// Scalar function of wavenumber magnitude.
pub type PowerSpectrum = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

// ── Parameters ───────────────────────────────────────────────────────

/// An auxiliary, non-differentiated invocation parameter.
#[derive(Clone)]
pub enum Param {
    Scalar(f64),
    Axis(usize),
    Field(Arc<RealField>),
    Spectrum(PowerSpectrum),
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Scalar(x) => write!(f, "{x}"),
            Param::Axis(d) => write!(f, "axis {d}"),
            Param::Field(field) => write!(f, "field {:?}", field.nmesh()),
            Param::Spectrum(_) => write!(f, "<power spectrum>"),
        }
    }
}

impl From<f64> for Param {
    fn from(x: f64) -> Self {
        Param::Scalar(x)
    }
}

impl From<usize> for Param {
    fn from(d: usize) -> Self {
        Param::Axis(d)
    }
}

impl From<RealField> for Param {
    fn from(f: RealField) -> Self {
        Param::Field(Arc::new(f))
    }
}

impl From<Arc<RealField>> for Param {
    fn from(f: Arc<RealField>) -> Self {
        Param::Field(f)
    }
}

impl From<PowerSpectrum> for Param {
    fn from(p: PowerSpectrum) -> Self {
        Param::Spectrum(p)
    }
}

/// Named parameters of one invocation.
#[derive(Clone, Debug, Default)]
pub struct Params(BTreeMap<String, Param>);

impl Params {
    pub fn new() -> Self {
        Params(BTreeMap::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<Param>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Param>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Param)> {
        self.0.iter()
    }

    fn lookup(&self, op: &str, name: &str) -> Result<&Param> {
        self.0.get(name).ok_or_else(|| EngineError::MissingParameter {
            op: op.to_string(),
            name: name.to_string(),
        })
    }

    fn wrong_kind(op: &str, name: &str, want: &str) -> EngineError {
        EngineError::InvalidParameter(format!("`{op}` parameter `{name}` must be {want}"))
    }

    pub fn scalar(&self, op: &str, name: &str) -> Result<f64> {
        match self.lookup(op, name)? {
            Param::Scalar(x) => Ok(*x),
            _ => Err(Self::wrong_kind(op, name, "a scalar")),
        }
    }

    /// Scalar parameter with a default when absent.
    pub fn scalar_or(&self, op: &str, name: &str, default: f64) -> Result<f64> {
        match self.0.get(name) {
            None => Ok(default),
            Some(_) => self.scalar(op, name),
        }
    }

    pub fn axis(&self, op: &str, name: &str) -> Result<usize> {
        match self.lookup(op, name)? {
            Param::Axis(d) if *d < 3 => Ok(*d),
            Param::Axis(d) => Err(EngineError::InvalidParameter(format!("`{op}` axis {d} out of range"))),
            _ => Err(Self::wrong_kind(op, name, "an axis index")),
        }
    }

    pub fn field(&self, op: &str, name: &str) -> Result<&RealField> {
        match self.lookup(op, name)? {
            Param::Field(f) => Ok(f),
            _ => Err(Self::wrong_kind(op, name, "a real field")),
        }
    }

    pub fn spectrum(&self, op: &str, name: &str) -> Result<&PowerSpectrum> {
        match self.lookup(op, name)? {
            Param::Spectrum(p) => Ok(p),
            _ => Err(Self::wrong_kind(op, name, "a power spectrum")),
        }
    }
}

// ── Invocations ──────────────────────────────────────────────────────

/// One operator call bound to concrete symbols.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub op: String,
    pub inputs: Vec<Symbol>,
    pub outputs: Vec<Symbol>,
    pub params: Params,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {}", self.op, self.inputs.join(", "), self.outputs.join(", "))?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { "; " } else { ", " };
            write!(f, "{sep}{name}={value:?}")?;
        }
        write!(f, ")")
    }
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Immutable, ordered record of invocations. Cheap to clone and share.
#[derive(Clone, Debug, Default)]
pub struct Tape {
    invocations: Vec<Invocation>,
}

impl Tape {
    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Invocation> {
        self.invocations.iter()
    }

    /// Symbols read before any invocation writes them, in first-read order.
    /// These must be supplied in the initial environment.
    pub fn free_symbols(&self) -> Vec<Symbol> {
        let mut written: HashSet<&str> = HashSet::new();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut free = Vec::new();
        for inv in &self.invocations {
            for s in &inv.inputs {
                if !written.contains(s.as_str()) && seen.insert(s.as_str()) {
                    free.push(s.clone());
                }
            }
            written.extend(inv.outputs.iter().map(String::as_str));
        }
        free
    }

    /// Every symbol some invocation writes, in first-write order.
    pub fn produced_symbols(&self) -> Vec<Symbol> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for inv in &self.invocations {
            for s in &inv.outputs {
                if seen.insert(s.as_str()) {
                    out.push(s.clone());
                }
            }
        }
        out
    }
}

impl fmt::Display for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, inv) in self.invocations.iter().enumerate() {
            writeln!(f, "{i:4}: {inv}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Tape {
    type Item = &'a Invocation;
    type IntoIter = std::slice::Iter<'a, Invocation>;

    fn into_iter(self) -> Self::IntoIter {
        self.invocations.iter()
    }
}

// ── TapeBuilder ──────────────────────────────────────────────────────

/// Appends invocations to a tape, validating each against an operator table.
///
/// Unknown operators and unknown port names are rejected here, before any
/// execution can begin.
pub struct TapeBuilder<'t, C> {
    table: &'t OperatorTable<C>,
    invocations: Vec<Invocation>,
}

impl<'t, C> TapeBuilder<'t, C> {
    pub fn new(table: &'t OperatorTable<C>) -> Self {
        TapeBuilder { table, invocations: Vec::new() }
    }

    /// Continue appending to an existing tape.
    pub fn extend(table: &'t OperatorTable<C>, tape: Tape) -> Self {
        TapeBuilder { table, invocations: tape.invocations }
    }

    pub fn table(&self) -> &'t OperatorTable<C> {
        self.table
    }

    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    /// Append `op` with every port bound to the symbol of the same name.
    pub fn invoke(&mut self, op: &str, params: Params) -> Result<&mut Self> {
        self.invoke_bound(op, params, &[])
    }

    /// Append `op`, rebinding the listed ports (`(port, symbol)`) and leaving
    /// the others bound to their own names.
    pub fn invoke_bound(&mut self, op: &str, params: Params, bindings: &[(&str, &str)]) -> Result<&mut Self> {
        let desc = self
            .table
            .get(op)
            .ok_or_else(|| EngineError::UnregisteredOperator(op.to_string()))?;

        for (port, _) in bindings {
            if !desc.inputs.contains(port) && !desc.outputs.contains(port) {
                return Err(EngineError::UnknownPort { op: op.to_string(), port: port.to_string() });
            }
        }
        let bind = |port: &str| -> Symbol {
            bindings
                .iter()
                .find(|(p, _)| *p == port)
                .map_or_else(|| port.to_string(), |(_, s)| s.to_string())
        };

        self.invocations.push(Invocation {
            op: desc.name.to_string(),
            inputs: desc.inputs.iter().map(|p| bind(p)).collect(),
            outputs: desc.outputs.iter().map(|p| bind(p)).collect(),
            params,
        });
        Ok(self)
    }

    pub fn finish(self) -> Tape {
        Tape { invocations: self.invocations }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{OperatorDescriptor, OperatorTable};
    use crate::value::Value;

    fn identity_fwd(_: &(), inputs: &[&Value], _: &Params) -> Result<Vec<Value>> {
        Ok(vec![inputs[0].clone()])
    }

    fn identity_grad(_: &(), _: &[&Value], d_out: &[Value], _: &Params) -> Result<Vec<Value>> {
        Ok(vec![d_out[0].clone()])
    }

    fn table() -> OperatorTable<()> {
        let mut t = OperatorTable::new();
        t.register(OperatorDescriptor {
            name: "Id",
            inputs: &["x"],
            outputs: &["y"],
            forward: identity_fwd,
            gradient: identity_grad,
        });
        t
    }

    #[test]
    fn test_default_binding_uses_port_names() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke("Id", Params::new()).unwrap();
        let tape = b.finish();
        assert_eq!(tape.invocations()[0].inputs, vec!["x"]);
        assert_eq!(tape.invocations()[0].outputs, vec!["y"]);
    }

    #[test]
    fn test_rebinding_and_free_symbols() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke_bound("Id", Params::new(), &[("x", "a"), ("y", "b")])
            .unwrap()
            .invoke_bound("Id", Params::new(), &[("x", "b"), ("y", "c")])
            .unwrap()
            .invoke_bound("Id", Params::new(), &[("x", "z"), ("y", "a")])
            .unwrap();
        let tape = b.finish();
        assert_eq!(tape.free_symbols(), vec!["a", "z"]);
        assert_eq!(tape.produced_symbols(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_unregistered_operator_fails_at_build() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        let err = b.invoke("Nope", Params::new()).err();
        assert_eq!(err, Some(EngineError::UnregisteredOperator("Nope".into())));
        assert!(b.is_empty());
    }

    #[test]
    fn test_unknown_port_rejected() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        let err = b.invoke_bound("Id", Params::new(), &[("w", "a")]).err();
        assert!(matches!(err, Some(EngineError::UnknownPort { .. })));
    }

    #[test]
    fn test_params_typed_access() {
        let p = Params::new().with("dda", 0.5).with("d", 2usize);
        assert_eq!(p.scalar("Kick", "dda").unwrap(), 0.5);
        assert_eq!(p.axis("Readout", "d").unwrap(), 2);
        assert!(matches!(p.scalar("Kick", "dyyy"), Err(EngineError::MissingParameter { .. })));
        assert!(matches!(p.scalar("Readout", "d"), Err(EngineError::InvalidParameter(_))));
        assert_eq!(p.scalar_or("Transfer", "smoothing", 0.0).unwrap(), 0.0);
    }

    #[test]
    fn test_display_lists_params() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke("Id", Params::new().with("c", 1.5)).unwrap();
        let tape = b.finish();
        assert_eq!(tape.invocations()[0].to_string(), "Id(x -> y; c=1.5)");
    }
}
