//! Host-resident device buffers.

use jx_core::Value;
use jx_runtime::{BackendError, DeviceBuffer, DeviceId, XlaShape};
use parking_lot::Mutex;
use std::sync::Arc;

/// Buffer contents: an array or a (possibly nested) tuple of them.
#[derive(Debug, Clone, PartialEq)]
pub enum HostLiteral {
    Array(Value),
    Tuple(Vec<HostLiteral>),
}

impl HostLiteral {
    /// Unit becomes the empty tuple.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        if value.is_unit() {
            Self::Tuple(Vec::new())
        } else {
            Self::Array(value)
        }
    }

    #[must_use]
    pub fn shape(&self) -> XlaShape {
        match self {
            Self::Array(value) => XlaShape::of_value(value),
            Self::Tuple(elements) => XlaShape::Tuple(elements.iter().map(Self::shape).collect()),
        }
    }
}

#[derive(Debug)]
pub struct CpuBuffer {
    device: DeviceId,
    device_count: usize,
    shape: XlaShape,
    contents: Mutex<Option<HostLiteral>>,
}

impl CpuBuffer {
    pub(crate) fn new(literal: HostLiteral, device: DeviceId, device_count: usize) -> Arc<Self> {
        Arc::new(Self {
            device,
            device_count,
            shape: literal.shape(),
            contents: Mutex::new(Some(literal)),
        })
    }

    pub(crate) fn literal(&self) -> Result<HostLiteral, BackendError> {
        self.contents.lock().clone().ok_or(BackendError::BufferDeleted)
    }
}

impl DeviceBuffer for CpuBuffer {
    fn shape(&self) -> XlaShape {
        self.shape.clone()
    }

    fn device(&self) -> DeviceId {
        self.device
    }

    fn to_host(&self) -> Result<Value, BackendError> {
        match self.literal()? {
            HostLiteral::Array(value) => Ok(value),
            HostLiteral::Tuple(elements) if elements.is_empty() => Ok(Value::Unit),
            HostLiteral::Tuple(elements) => Err(BackendError::ExecutionFailed {
                detail: format!(
                    "cannot transfer a {}-element tuple to the host; destructure it first",
                    elements.len()
                ),
            }),
        }
    }

    fn copy_to_host_async(&self) -> Result<(), BackendError> {
        self.block_until_ready()
    }

    fn block_until_ready(&self) -> Result<(), BackendError> {
        if self.is_deleted() {
            return Err(BackendError::BufferDeleted);
        }
        Ok(())
    }

    fn delete(&self) -> Result<(), BackendError> {
        self.contents
            .lock()
            .take()
            .map(drop)
            .ok_or(BackendError::BufferDeleted)
    }

    fn is_deleted(&self) -> bool {
        self.contents.lock().is_none()
    }

    fn destructure(&self) -> Result<Vec<Arc<dyn DeviceBuffer>>, BackendError> {
        match self.literal()? {
            HostLiteral::Tuple(elements) => Ok(elements
                .into_iter()
                .map(|element| {
                    CpuBuffer::new(element, self.device, self.device_count) as Arc<dyn DeviceBuffer>
                })
                .collect()),
            HostLiteral::Array(_) => Err(BackendError::ExecutionFailed {
                detail: format!("cannot destructure non-tuple buffer of shape {}", self.shape),
            }),
        }
    }

    fn copy_to_device(&self, device: DeviceId) -> Result<Arc<dyn DeviceBuffer>, BackendError> {
        if device.index() >= self.device_count {
            return Err(BackendError::InvalidDevice {
                device,
                available: self.device_count,
            });
        }
        let literal = self.literal()?;
        tracing::trace!(from = %self.device, to = %device, shape = %self.shape, "copying buffer");
        Ok(CpuBuffer::new(literal, device, self.device_count))
    }
}
