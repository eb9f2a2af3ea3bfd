//! CPU backend for jx.
//!
//! Compiled computations are interpreted on the host, one node at a time.
//! CPU is the baseline backend: always available, no external dependencies.

#![forbid(unsafe_code)]

mod buffer;
mod executor;
mod kernels;

pub use buffer::{CpuBuffer, HostLiteral};
pub use executor::{CpuBackend, CpuExecutable};
