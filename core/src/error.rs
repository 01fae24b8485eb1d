// Engine errors.
//
// Every failure in tape construction, execution, or the mesh library is fatal
// for the execution that raised it. Nothing here is retried.

use thiserror::Error;

/// All fatal error kinds raised by the tape engine and the operators it runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// An invocation read a symbol that no earlier invocation produced and
    /// that was not supplied in the initial environment.
    #[error("operator `{op}` reads symbol `{symbol}` which has not been produced")]
    MissingSymbol { symbol: String, op: String },

    /// Inputs of incompatible shape, box size, or kind.
    #[error("shape mismatch in `{op}`: expected {expected}, found {found}")]
    ShapeMismatch { op: String, expected: String, found: String },

    /// A tape references an operator absent from the operator table.
    #[error("operator `{0}` is not registered")]
    UnregisteredOperator(String),

    /// A symbol binding names a port the operator does not declare.
    #[error("operator `{op}` has no port named `{port}`")]
    UnknownPort { op: String, port: String },

    /// A forward or gradient procedure returned the wrong number of values.
    #[error("operator `{op}` returned {found} values, expected {expected}")]
    ArityMismatch { op: String, expected: usize, found: usize },

    #[error("operator `{op}` requires parameter `{name}`")]
    MissingParameter { op: String, name: String },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The Zero sentinel reached a place that needs a concrete array.
    #[error("Zero sentinel used as a concrete value in `{op}`")]
    ZeroMisuse { op: String },

    #[error("mesh error: {0}")]
    Mesh(String),

    /// A collective reduction could not represent or combine its partial sums.
    #[error("reduction error: {0}")]
    Reduction(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub(crate) fn shape(op: &str, expected: impl ToString, found: impl ToString) -> Self {
        EngineError::ShapeMismatch {
            op: op.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}
