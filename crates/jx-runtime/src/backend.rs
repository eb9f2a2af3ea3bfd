//! Backend trait surface: compile, transfer, execute.
//!
//! Every backend (the host CPU backend, remote services, test doubles)
//! implements the same three traits. Buffers and executables are handed out
//! as `Arc<dyn ...>` so device values can own them independently of the
//! backend handle.

use crate::builder::XlaComputation;
use crate::device::{DeviceId, DeviceInfo, Platform};
use crate::shape::XlaShape;
use jx_core::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("Unknown jax_xla_backend value \"{name}\".")]
    UnknownBackend { name: String },
    #[error("No local XLA backends found.")]
    NoBackendFound,
    #[error("backend `{backend}` is unavailable: {detail}")]
    Unavailable { backend: String, detail: String },
    #[error("device_assignment does not match num_replicas: {assignment_len} vs {num_replicas}.")]
    InconsistentReplicas {
        num_replicas: usize,
        assignment_len: usize,
    },
    #[error("device buffer has been deleted")]
    BufferDeleted,
    #[error("shape check failed: {detail}")]
    ShapeCheck { detail: String },
    #[error("{device} is not available (backend has {available} devices)")]
    InvalidDevice { device: DeviceId, available: usize },
    #[error("compilation failed: {detail}")]
    CompileFailed { detail: String },
    #[error("execution failed: {detail}")]
    ExecutionFailed { detail: String },
}

/// Replica-to-device mapping; entry `i` is the device running replica `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAssignment(Vec<DeviceId>);

impl DeviceAssignment {
    #[must_use]
    pub fn new(devices: Vec<DeviceId>) -> Self {
        Self(devices)
    }

    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn devices(&self) -> &[DeviceId] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompileOptions {
    pub num_replicas: usize,
    pub device_assignment: Option<DeviceAssignment>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            num_replicas: 1,
            device_assignment: None,
        }
    }
}

/// Derives compile options from an optional replica count and device
/// assignment. Returns `None` when neither is given, meaning backend
/// defaults apply.
pub fn get_compile_options(
    num_replicas: Option<usize>,
    device_assignment: Option<&[DeviceId]>,
) -> Result<Option<CompileOptions>, BackendError> {
    let mut options: Option<CompileOptions> = None;
    if let Some(num_replicas) = num_replicas {
        options.get_or_insert_with(CompileOptions::default).num_replicas = num_replicas;
    }
    if let Some(assignment) = device_assignment {
        if let Some(num_replicas) = num_replicas
            && num_replicas != assignment.len()
        {
            return Err(BackendError::InconsistentReplicas {
                num_replicas,
                assignment_len: assignment.len(),
            });
        }
        let opts = options.get_or_insert_with(CompileOptions::default);
        opts.num_replicas = assignment.len();
        opts.device_assignment = Some(DeviceAssignment::new(assignment.to_vec()));
    }
    Ok(options)
}

/// A backend-owned buffer, possibly a tuple of buffers.
pub trait DeviceBuffer: Send + Sync + fmt::Debug {
    fn shape(&self) -> XlaShape;

    fn device(&self) -> DeviceId;

    /// Copies the buffer to the host. Empty tuples transfer as `Value::Unit`.
    fn to_host(&self) -> Result<Value, BackendError>;

    /// Starts a host transfer without waiting for it.
    fn copy_to_host_async(&self) -> Result<(), BackendError>;

    /// Waits until the computation producing this buffer has finished.
    fn block_until_ready(&self) -> Result<(), BackendError>;

    /// Releases device memory. A second call fails with `BufferDeleted`.
    fn delete(&self) -> Result<(), BackendError>;

    fn is_deleted(&self) -> bool;

    /// Splits a tuple buffer into one buffer per element.
    fn destructure(&self) -> Result<Vec<Arc<dyn DeviceBuffer>>, BackendError>;

    fn copy_to_device(&self, device: DeviceId) -> Result<Arc<dyn DeviceBuffer>, BackendError>;
}

pub trait Executable: Send + Sync + fmt::Debug {
    /// Devices this executable runs on, one per replica.
    fn device_ordinals(&self) -> &[DeviceId];

    fn num_replicas(&self) -> usize;

    /// Single-replica execution.
    fn execute(&self, args: &[Arc<dyn DeviceBuffer>]) -> Result<Arc<dyn DeviceBuffer>, BackendError>;

    /// One argument list per replica, in replica order; returns one output
    /// per replica.
    fn execute_per_replica(
        &self,
        args: Vec<Vec<Arc<dyn DeviceBuffer>>>,
    ) -> Result<Vec<Arc<dyn DeviceBuffer>>, BackendError>;
}

pub trait Backend: Send + Sync + fmt::Debug {
    fn platform(&self) -> Platform;

    fn device_count(&self) -> usize;

    fn devices(&self) -> Vec<DeviceInfo>;

    fn compile(
        &self,
        computation: &XlaComputation,
        options: &CompileOptions,
    ) -> Result<Arc<dyn Executable>, BackendError>;

    fn buffer_from_host(
        &self,
        value: &Value,
        device: DeviceId,
    ) -> Result<Arc<dyn DeviceBuffer>, BackendError>;
}

pub type BackendRef = Arc<dyn Backend>;
