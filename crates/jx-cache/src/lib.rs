#![forbid(unsafe_code)]

//! Compilation cache: structural keys, memo tables, and the memoized
//! primitive and whole-jaxpr compilation entry points.

pub mod compile;
pub mod key;
pub mod memo;

pub use compile::{CacheStats, CompilationCache, CompileContext, CompiledJaxpr, CompiledPrimitive};
pub use key::{CacheKey, JaxprKeyInput, PrimitiveKeyInput, jaxpr_key, primitive_key};
pub use memo::{CachePolicy, LruConfig, MemoTable, TableStats};

use jx_core::{JaxprValidationError, ShapeError};
use jx_interpreters::XlaError;
use jx_runtime::BackendError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error(
        "compiling computation that requires {required} replicas, but only {available} XLA devices are available"
    )]
    ReplicaOversubscription { required: usize, available: usize },
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Validation(#[from] JaxprValidationError),
    #[error(transparent)]
    Xla(#[from] XlaError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::CompileError;
    use jx_interpreters::XlaError;
    use jx_runtime::BackendError;

    #[test]
    fn wrapped_errors_keep_their_message() {
        let err = CompileError::from(XlaError::NoTranslationRule {
            primitive: "psum".to_owned(),
        });
        assert_eq!(
            err.to_string(),
            "XLA translation rule for primitive 'psum' not found"
        );
        let err = CompileError::from(BackendError::InconsistentReplicas {
            num_replicas: 2,
            assignment_len: 3,
        });
        assert!(err.to_string().contains("2 vs 3"));
    }
}
