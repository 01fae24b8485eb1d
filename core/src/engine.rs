// Tape execution: forward replay and reverse-mode adjoint replay.
//
// Forward runs invocations in order against an environment of shared values
// and records, per invocation, the exact input values it saw. Symbols such as
// `s` and `p` are rebound many times during a leapfrog run, so the final
// environment alone is not enough to run the adjoint.
//
// Backward walks the same invocations in reverse. For each one it takes
// (removes) the adjoints accumulated on its outputs. If they are all Zero the
// gradient procedure is skipped entirely; otherwise its per-input results are
// added into the input accumulators. Removing before adding matters when an
// invocation reads and writes the same symbol (Kick reads and writes `p`).

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, trace};

use crate::error::{EngineError, Result};
use crate::registry::OperatorTable;
use crate::tape::{Symbol, Tape};
use crate::value::Value;

/// Forward environment: symbol to shared, immutable value.
pub type Environment = HashMap<Symbol, Arc<Value>>;

static ZERO: Value = Value::Zero;

/// Build an environment from `(symbol, value)` pairs.
pub fn environment<I, S>(pairs: I) -> Environment
where
    I: IntoIterator<Item = (S, Value)>,
    S: Into<Symbol>,
{
    pairs.into_iter().map(|(s, v)| (s.into(), Arc::new(v))).collect()
}

// ── Execution ────────────────────────────────────────────────────────

/// Result of a forward pass: final environment plus the input trace.
#[derive(Clone, Debug)]
pub struct Execution {
    env: Environment,
    trace: Vec<Vec<Arc<Value>>>,
}

impl Execution {
    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn get(&self, symbol: &str) -> Option<&Value> {
        self.env.get(symbol).map(|v| v.as_ref())
    }

    /// Value of `symbol` in the final environment.
    pub fn value(&self, symbol: &str) -> Result<&Value> {
        self.get(symbol).ok_or_else(|| EngineError::MissingSymbol {
            symbol: symbol.to_string(),
            op: "<result>".to_string(),
        })
    }

    /// Inputs seen by invocation `i` during the forward pass.
    pub fn inputs_of(&self, i: usize) -> Option<&[Arc<Value>]> {
        self.trace.get(i).map(Vec::as_slice)
    }

    pub fn into_env(self) -> Environment {
        self.env
    }
}

// ── Gradients ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackwardStats {
    /// Gradient procedures actually called.
    pub executed: usize,
    /// Invocations skipped because every output adjoint was Zero.
    pub elided: usize,
}

/// Adjoints left after the reverse sweep: gradients with respect to the
/// initial environment (and any seeded symbol no invocation consumed).
#[derive(Clone, Debug, Default)]
pub struct Gradients {
    adjoints: HashMap<Symbol, Value>,
    stats: BackwardStats,
}

impl Gradients {
    /// Adjoint of `symbol`, Zero when nothing reached it.
    pub fn get(&self, symbol: &str) -> &Value {
        self.adjoints.get(symbol).unwrap_or(&ZERO)
    }

    pub fn take(&mut self, symbol: &str) -> Value {
        self.adjoints.remove(symbol).unwrap_or_default()
    }

    pub fn stats(&self) -> BackwardStats {
        self.stats
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &Value)> {
        self.adjoints.iter()
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Runs tapes against one operator table and context.
pub struct Engine<'a, C> {
    table: &'a OperatorTable<C>,
    ctx: &'a C,
}

impl<'a, C> Engine<'a, C> {
    pub fn new(table: &'a OperatorTable<C>, ctx: &'a C) -> Self {
        Engine { table, ctx }
    }

    pub fn context(&self) -> &'a C {
        self.ctx
    }

    pub fn forward(&self, tape: &Tape, mut env: Environment) -> Result<Execution> {
        let mut trace = Vec::with_capacity(tape.len());
        for (i, inv) in tape.iter().enumerate() {
            let desc = self
                .table
                .get(&inv.op)
                .ok_or_else(|| EngineError::UnregisteredOperator(inv.op.clone()))?;
            debug!("forward [{i}] {inv}");

            let inputs: Vec<Arc<Value>> = inv
                .inputs
                .iter()
                .map(|s| {
                    env.get(s).cloned().ok_or_else(|| EngineError::MissingSymbol {
                        symbol: s.clone(),
                        op: inv.op.clone(),
                    })
                })
                .collect::<Result<_>>()?;
            let refs: Vec<&Value> = inputs.iter().map(|v| v.as_ref()).collect();

            let outputs = (desc.forward)(self.ctx, &refs, &inv.params)?;
            if outputs.len() != inv.outputs.len() {
                return Err(EngineError::ArityMismatch {
                    op: inv.op.clone(),
                    expected: inv.outputs.len(),
                    found: outputs.len(),
                });
            }
            for (sym, value) in inv.outputs.iter().zip(outputs) {
                env.insert(sym.clone(), Arc::new(value));
            }
            trace.push(inputs);
        }
        Ok(Execution { env, trace })
    }

    /// Reverse sweep of `tape`, seeded with adjoints of symbols in the final
    /// environment (typically one scalar objective seeded with 1.0).
    pub fn backward<I, S>(&self, tape: &Tape, execution: &Execution, seeds: I) -> Result<Gradients>
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<Symbol>,
    {
        if execution.trace.len() != tape.len() {
            return Err(EngineError::ArityMismatch {
                op: "backward".to_string(),
                expected: tape.len(),
                found: execution.trace.len(),
            });
        }

        let mut adjoints: HashMap<Symbol, Value> = HashMap::new();
        for (s, v) in seeds {
            adjoints.entry(s.into()).or_default().accumulate(v)?;
        }

        let mut stats = BackwardStats::default();
        for (i, inv) in tape.iter().enumerate().rev() {
            let desc = self
                .table
                .get(&inv.op)
                .ok_or_else(|| EngineError::UnregisteredOperator(inv.op.clone()))?;

            let d_outputs: Vec<Value> = inv
                .outputs
                .iter()
                .map(|s| adjoints.remove(s).unwrap_or_default())
                .collect();
            if d_outputs.iter().all(Value::is_zero) {
                trace!("backward [{i}] {} elided", inv.op);
                stats.elided += 1;
                continue;
            }
            debug!("backward [{i}] {inv}");

            let inputs: Vec<&Value> = execution.trace[i].iter().map(|v| v.as_ref()).collect();
            let d_inputs = (desc.gradient)(self.ctx, &inputs, &d_outputs, &inv.params)?;
            if d_inputs.len() != inv.inputs.len() {
                return Err(EngineError::ArityMismatch {
                    op: inv.op.clone(),
                    expected: inv.inputs.len(),
                    found: d_inputs.len(),
                });
            }
            stats.executed += 1;

            for ((sym, input), grad) in inv.inputs.iter().zip(&inputs).zip(d_inputs) {
                if !grad.is_zero() && !input.is_zero() && grad.kind() != input.kind() {
                    return Err(EngineError::shape(&inv.op, input.kind(), grad.kind()));
                }
                adjoints.entry(sym.clone()).or_default().accumulate(grad)?;
            }
        }

        adjoints.retain(|_, v| !v.is_zero());
        Ok(Gradients { adjoints, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ParticleArray;
    use crate::registry::OperatorDescriptor;
    use crate::tape::{Params, TapeBuilder};

    // y = c * x
    fn scale_fwd(_: &(), inputs: &[&Value], params: &Params) -> Result<Vec<Value>> {
        let c = params.scalar("Scale", "c")?;
        Ok(vec![inputs[0].scale(c)])
    }

    fn scale_grad(_: &(), _: &[&Value], d_out: &[Value], params: &Params) -> Result<Vec<Value>> {
        let c = params.scalar("Scale", "c")?;
        Ok(vec![d_out[0].scale(c)])
    }

    // z = x + y
    fn add_fwd(_: &(), inputs: &[&Value], _: &Params) -> Result<Vec<Value>> {
        Ok(vec![inputs[0].add(inputs[1])?])
    }

    fn add_grad(_: &(), _: &[&Value], d_out: &[Value], _: &Params) -> Result<Vec<Value>> {
        Ok(vec![d_out[0].clone(), d_out[0].clone()])
    }

    fn broken_fwd(_: &(), _: &[&Value], _: &Params) -> Result<Vec<Value>> {
        Ok(vec![])
    }

    fn table() -> OperatorTable<()> {
        let mut t = OperatorTable::new();
        t.register(OperatorDescriptor {
            name: "Scale",
            inputs: &["x"],
            outputs: &["y"],
            forward: scale_fwd,
            gradient: scale_grad,
        })
        .register(OperatorDescriptor {
            name: "Add",
            inputs: &["x", "y"],
            outputs: &["z"],
            forward: add_fwd,
            gradient: add_grad,
        })
        .register(OperatorDescriptor {
            name: "Broken",
            inputs: &["x"],
            outputs: &["y"],
            forward: broken_fwd,
            gradient: scale_grad,
        });
        t
    }

    fn p(v: f64) -> Value {
        Value::Particles(ParticleArray::new(vec![[v, v, v]; 2]))
    }

    #[test]
    fn test_rebinding_traces_historical_inputs() {
        // x -> x (c=2) -> x (c=3): the second Scale must see 2x, not x.
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke_bound("Scale", Params::new().with("c", 2.0), &[("y", "x")]).unwrap();
        b.invoke_bound("Scale", Params::new().with("c", 3.0), &[("y", "x")]).unwrap();
        let tape = b.finish();

        let engine = Engine::new(&t, &());
        let exec = engine.forward(&tape, environment([("x", p(1.0))])).unwrap();
        assert_eq!(exec.get("x"), Some(&p(6.0)));
        assert_eq!(exec.inputs_of(1).unwrap()[0].as_ref(), &p(2.0));

        let grads = engine.backward(&tape, &exec, [("x", p(1.0))]).unwrap();
        assert_eq!(grads.get("x"), &p(6.0));
        assert_eq!(grads.stats(), BackwardStats { executed: 2, elided: 0 });
    }

    #[test]
    fn test_missing_symbol() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke("Scale", Params::new().with("c", 1.0)).unwrap();
        let tape = b.finish();
        let err = Engine::new(&t, &()).forward(&tape, Environment::new()).unwrap_err();
        assert_eq!(err, EngineError::MissingSymbol { symbol: "x".into(), op: "Scale".into() });
    }

    #[test]
    fn test_output_arity_checked() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke("Broken", Params::new()).unwrap();
        let tape = b.finish();
        let err = Engine::new(&t, &()).forward(&tape, environment([("x", p(1.0))])).unwrap_err();
        assert!(matches!(err, EngineError::ArityMismatch { expected: 1, found: 0, .. }));
    }

    #[test]
    fn test_unseeded_backward_elides_everything() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke("Scale", Params::new().with("c", 2.0)).unwrap();
        b.invoke_bound("Scale", Params::new().with("c", 2.0), &[("x", "y"), ("y", "w")]).unwrap();
        let tape = b.finish();
        let engine = Engine::new(&t, &());
        let exec = engine.forward(&tape, environment([("x", p(1.0))])).unwrap();
        let grads = engine.backward(&tape, &exec, Vec::<(Symbol, Value)>::new()).unwrap();
        assert!(grads.get("x").is_zero());
        assert_eq!(grads.stats(), BackwardStats { executed: 0, elided: 2 });
    }

    #[test]
    fn test_trace_length_mismatch() {
        let t = table();
        let mut b = TapeBuilder::new(&t);
        b.invoke("Scale", Params::new().with("c", 2.0)).unwrap();
        let tape = b.finish();
        let engine = Engine::new(&t, &());
        let exec = engine.forward(&Tape::default(), Environment::new()).unwrap();
        assert!(engine.backward(&tape, &exec, [("y", p(1.0))]).is_err());
    }
}
