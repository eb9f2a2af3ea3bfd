use jx_core::{JaxprValidationError, ShapeError, ValueError, VarId};
use jx_runtime::BackendError;

/// Failures raised while bridging host values to the backend or lowering
/// jaxprs into backend computations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum XlaError {
    #[error("No {kind} handler for type: {type_name}")]
    UnsupportedType {
        kind: &'static str,
        type_name: String,
    },
    #[error("XLA translation rule for primitive '{primitive}' not found")]
    NoTranslationRule { primitive: String },
    #[error("device value has been deleted")]
    UseAfterDelete,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Validation(#[from] JaxprValidationError),
    #[error("lowering `{primitive}` produced an ill-typed computation: {source}")]
    Lowering {
        primitive: String,
        source: BackendError,
    },
    #[error("unbound axis name: {name}")]
    UnboundAxisName { name: String },
    #[error("{nreps} replicas cannot be split evenly over a mesh of {mesh_size}")]
    RaggedAxisEnv { nreps: usize, mesh_size: usize },
    #[error("invalid axis grouping: {detail}")]
    InvalidAxisGroup { detail: String },
    #[error("malformed `{primitive}` equation: {detail}")]
    MalformedEquation { primitive: String, detail: String },
    #[error("{what}: expected {expected}, got {actual}")]
    Arity {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("variable {0} read before it was bound")]
    UnboundVar(VarId),
}
