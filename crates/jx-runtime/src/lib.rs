#![forbid(unsafe_code)]

//! Backend-facing half of the bridge: runtime configuration, dtype policy,
//! the computation builder, backend traits, and backend selection.

pub mod backend;
pub mod builder;
pub mod config;
pub mod device;
pub mod dtype;
pub mod selection;
pub mod shape;

pub use backend::{
    Backend, BackendError, BackendRef, CompileOptions, DeviceAssignment, DeviceBuffer,
    Executable, get_compile_options,
};
pub use builder::{BinaryOp, Node, UnaryOp, XlaBuilder, XlaComputation, XlaOp};
pub use config::RuntimeConfig;
pub use device::{DeviceId, DeviceInfo, Platform};
pub use dtype::{canonicalize_dtype, canonicalize_value};
pub use selection::{BackendHandle, BackendSelector, device_count, get_backend, select_backend};
pub use shape::XlaShape;
