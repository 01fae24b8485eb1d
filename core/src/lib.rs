//! Differentiable particle-mesh evolution.
//!
//! A tape of named operators (Displace, Force, Kick, Drift, Paint, ...) is
//! recorded once by an integrator, run forward to evolve particles from a
//! linear density field, and run backward to carry the gradient of a scalar
//! objective back to that field.

pub mod error;
pub mod complex;
pub mod fft;
pub mod mesh;
pub mod value;
pub mod comm;
pub mod tape;
pub mod registry;
pub mod engine;
pub mod lpt;
pub mod gravity;
pub mod operators;
pub mod cosmology;
pub mod integrator;
pub mod ic;
pub mod config;
pub mod simulation;
pub mod gradient;

pub use engine::{environment, BackwardStats, Engine, Environment, Execution, Gradients};
pub use error::{EngineError, Result};
pub use tape::{Param, Params, PowerSpectrum, Symbol, Tape, TapeBuilder};
pub use value::Value;
