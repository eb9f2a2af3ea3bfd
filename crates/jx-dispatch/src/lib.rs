#![forbid(unsafe_code)]

//! Execution of compiled primitives and jaxprs.
//!
//! [`XlaRuntime`] ties a backend, the translation and type-handler tables,
//! and a compilation cache together. Single primitives run through
//! [`XlaRuntime::apply_primitive`]; whole programs through
//! [`XlaRuntime::xla_call`], which falls back to op-by-op evaluation once
//! when a compiled run produces NaNs under `debug_nans`.

pub mod callable;
pub mod fallback;
pub mod runtime;

pub use callable::{JaxprCallable, PrimitiveCallable};
pub use fallback::OpByOpEvaluator;
pub use runtime::XlaRuntime;

use jx_cache::CompileError;
use jx_interpreters::{InterpreterError, XlaError};
use jx_runtime::{BackendError, DeviceBuffer};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid value (nan) encountered in {primitive}")]
    NumericInstability { primitive: String },
    #[error("expected {expected} arguments, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error("`{primitive}` returned a {type_name} where its outputs were expected")]
    UnexpectedResult {
        primitive: String,
        type_name: &'static str,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Xla(#[from] XlaError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
}

/// Fails with [`DispatchError::NumericInstability`] naming `primitive` if any
/// floating-point array in `buffer`, including tuple elements, holds a NaN.
pub fn check_nans(primitive: &str, buffer: &dyn DeviceBuffer) -> Result<(), DispatchError> {
    let shape = buffer.shape();
    if shape.is_tuple() {
        for part in buffer.destructure()? {
            check_nans(primitive, part.as_ref())?;
        }
        return Ok(());
    }
    if shape.element_type().is_some_and(|dtype| dtype.is_floating())
        && buffer.to_host()?.contains_nan()
    {
        return Err(DispatchError::NumericInstability {
            primitive: primitive.to_owned(),
        });
    }
    Ok(())
}
