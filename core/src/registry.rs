// Explicit operator registry.
//
// A table maps operator names to descriptors: ordered input/output port names
// plus forward and gradient procedures. Tables are built once, then shared
// read-only by the tape builder and every execution.
//
// The context type `C` carries whatever the procedures need beyond their
// inputs (meshes, the unperturbed grid, the communicator). Test tables use
// `()`.

use std::collections::HashMap;

use crate::error::Result;
use crate::tape::Params;
use crate::value::Value;

/// `forward(ctx, inputs, params) -> outputs`, one output per declared port.
pub type ForwardFn<C> = fn(&C, &[&Value], &Params) -> Result<Vec<Value>>;

/// `gradient(ctx, inputs, d_outputs, params) -> d_inputs`.
///
/// `inputs` are the values the forward pass saw. `d_outputs` holds one
/// adjoint per output port, any of which may be `Zero` (but not all of them;
/// the engine elides that case). Returns one adjoint per input port.
pub type GradientFn<C> = fn(&C, &[&Value], &[Value], &Params) -> Result<Vec<Value>>;

pub struct OperatorDescriptor<C> {
    pub name: &'static str,
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    pub forward: ForwardFn<C>,
    pub gradient: GradientFn<C>,
}

impl<C> Clone for OperatorDescriptor<C> {
    fn clone(&self) -> Self {
        OperatorDescriptor {
            name: self.name,
            inputs: self.inputs,
            outputs: self.outputs,
            forward: self.forward,
            gradient: self.gradient,
        }
    }
}

impl<C> std::fmt::Debug for OperatorDescriptor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

pub struct OperatorTable<C> {
    ops: HashMap<&'static str, OperatorDescriptor<C>>,
}

impl<C> Default for OperatorTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> OperatorTable<C> {
    pub fn new() -> Self {
        OperatorTable { ops: HashMap::new() }
    }

    /// Register `desc`, replacing any operator of the same name.
    pub fn register(&mut self, desc: OperatorDescriptor<C>) -> &mut Self {
        self.ops.insert(desc.name, desc);
        self
    }

    pub fn get(&self, name: &str) -> Option<&OperatorDescriptor<C>> {
        self.ops.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ops.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
