#![forbid(unsafe_code)]

pub mod errors;
pub mod jit;

pub use errors::ApiError;
pub use jit::{JitWrapped, apply, apply_on, device_get, device_put, device_put_on, jit};
