use jx_dispatch::DispatchError;
use jx_interpreters::XlaError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("jitted program declares {expected} constants, {actual} were bound")]
    ConstCount { expected: usize, actual: usize },
    #[error("cannot fetch a {type_name} to the host")]
    NotAnArray { type_name: &'static str },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Xla(#[from] XlaError),
}
