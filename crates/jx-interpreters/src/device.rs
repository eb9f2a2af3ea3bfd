//! Device-resident values.
//!
//! A [`DeviceArray`] owns one backend buffer and caches its host copy after
//! the first read. A [`DeviceConstant`] describes a value that has not been
//! placed on any device yet; it is instantiated on first use, either by
//! running a small computation that builds it on device or by copying a
//! host-built array.

use crate::error::XlaError;
use jx_core::{AbstractValue, DType, JaxValue, Literal, Shape, ShapedArray, Value};
use jx_runtime::{
    Backend, DeviceBuffer, DeviceId, XlaBuilder, XlaOp, get_compile_options,
};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
enum ArrayState {
    Live {
        buffer: Arc<dyn DeviceBuffer>,
        host: Option<Value>,
    },
    Deleted,
}

/// A value living in a backend buffer.
#[derive(Debug)]
pub struct DeviceArray {
    aval: AbstractValue,
    state: Mutex<ArrayState>,
}

impl DeviceArray {
    #[must_use]
    pub fn new(aval: AbstractValue, buffer: Arc<dyn DeviceBuffer>) -> Self {
        Self {
            aval,
            state: Mutex::new(ArrayState::Live { buffer, host: None }),
        }
    }

    fn ensure_live(&self) -> Result<(), XlaError> {
        match &*self.state.lock() {
            ArrayState::Live { .. } => Ok(()),
            ArrayState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    pub fn aval(&self) -> Result<&AbstractValue, XlaError> {
        self.ensure_live()?;
        Ok(&self.aval)
    }

    pub fn shape(&self) -> Result<Shape, XlaError> {
        Ok(self.aval()?.shape().cloned().unwrap_or_else(Shape::scalar))
    }

    pub fn dtype(&self) -> Result<Option<DType>, XlaError> {
        Ok(self.aval()?.dtype())
    }

    /// Host copy of the buffer, transferred on first call and cached.
    pub fn value(&self) -> Result<Value, XlaError> {
        let mut state = self.state.lock();
        match &mut *state {
            ArrayState::Live { buffer, host } => {
                if let Some(value) = host {
                    return Ok(value.clone());
                }
                let value = buffer.to_host()?;
                *host = Some(value.clone());
                Ok(value)
            }
            ArrayState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    pub fn device_buffer(&self) -> Result<Arc<dyn DeviceBuffer>, XlaError> {
        match &*self.state.lock() {
            ArrayState::Live { buffer, .. } => Ok(Arc::clone(buffer)),
            ArrayState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    pub fn device(&self) -> Result<DeviceId, XlaError> {
        Ok(self.device_buffer()?.device())
    }

    /// Starts a host transfer unless the host copy is already cached.
    pub fn copy_to_host_async(&self) -> Result<(), XlaError> {
        match &*self.state.lock() {
            ArrayState::Live { buffer, host: None } => Ok(buffer.copy_to_host_async()?),
            ArrayState::Live { .. } => Ok(()),
            ArrayState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    pub fn block_until_ready(&self) -> Result<(), XlaError> {
        Ok(self.device_buffer()?.block_until_ready()?)
    }

    /// Releases the backend buffer. Deleting twice fails with
    /// [`XlaError::UseAfterDelete`].
    pub fn delete(&self) -> Result<(), XlaError> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ArrayState::Deleted) {
            ArrayState::Live { buffer, .. } => Ok(buffer.delete()?),
            ArrayState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(&*self.state.lock(), ArrayState::Deleted)
    }
}

impl JaxValue for DeviceArray {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "DeviceArray"
    }
}

// ── Lazy constants ─────────────────────────────────────────────────

/// A constant that can be built either as graph nodes or on the host.
pub trait LazyConstant: Send + Sync + fmt::Debug {
    fn aval(&self) -> ShapedArray;

    /// Emits nodes computing the constant into `c`.
    fn build(&self, c: &mut XlaBuilder) -> XlaOp;

    fn to_host(&self) -> Result<Value, XlaError>;
}

/// Every element equal to one scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledConstant {
    pub fill: Literal,
    pub shape: Shape,
}

impl LazyConstant for FilledConstant {
    fn aval(&self) -> ShapedArray {
        ShapedArray::new(self.fill.dtype(), self.shape.clone())
    }

    fn build(&self, c: &mut XlaBuilder) -> XlaOp {
        let scalar = c.constant(Value::Scalar(self.fill));
        if self.shape.rank() == 0 {
            scalar
        } else {
            c.broadcast(scalar, &self.shape.dims)
        }
    }

    fn to_host(&self) -> Result<Value, XlaError> {
        Ok(Value::filled(self.fill, self.shape.clone())?)
    }
}

#[derive(Debug)]
enum ConstantState {
    Unmaterialized,
    Live {
        buffer: Arc<dyn DeviceBuffer>,
        host: Option<Value>,
    },
    Deleted,
}

/// A device value whose buffer is created on first use.
#[derive(Debug)]
pub struct DeviceConstant {
    aval: AbstractValue,
    source: Arc<dyn LazyConstant>,
    state: Mutex<ConstantState>,
}

impl DeviceConstant {
    #[must_use]
    pub fn new(source: Arc<dyn LazyConstant>) -> Self {
        Self {
            aval: AbstractValue::Shaped(source.aval()),
            source,
            state: Mutex::new(ConstantState::Unmaterialized),
        }
    }

    #[must_use]
    pub fn filled(fill: Literal, shape: Shape) -> Self {
        Self::new(Arc::new(FilledConstant { fill, shape }))
    }

    pub fn aval(&self) -> Result<&AbstractValue, XlaError> {
        match &*self.state.lock() {
            ConstantState::Deleted => Err(XlaError::UseAfterDelete),
            _ => Ok(&self.aval),
        }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn LazyConstant> {
        &self.source
    }

    #[must_use]
    pub fn is_instantiated(&self) -> bool {
        matches!(&*self.state.lock(), ConstantState::Live { .. })
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        matches!(&*self.state.lock(), ConstantState::Deleted)
    }

    /// Places the constant on `device`, building it there when it has more
    /// than `cutoff` elements and `device` is the primary device. The first
    /// placement is kept; later requests for other devices copy it.
    pub fn instantiate(
        &self,
        backend: &dyn Backend,
        device: DeviceId,
        cutoff: u64,
    ) -> Result<Arc<dyn DeviceBuffer>, XlaError> {
        let mut state = self.state.lock();
        match &*state {
            ConstantState::Live { buffer, .. } => {
                return if buffer.device() == device {
                    Ok(Arc::clone(buffer))
                } else {
                    Ok(buffer.copy_to_device(device)?)
                };
            }
            ConstantState::Deleted => return Err(XlaError::UseAfterDelete),
            ConstantState::Unmaterialized => {}
        }

        let aval = self.source.aval();
        let elements = aval.shape.element_count().unwrap_or(u64::MAX);
        let buffer = if elements > cutoff && device == DeviceId(0) {
            tracing::debug!(shape = %aval, elements, %device, "building constant on device");
            let mut c = XlaBuilder::new("constant_instantiating_computation");
            let root = self.source.build(&mut c);
            let computation = c.build(root)?;
            let options = get_compile_options(None, Some(&[device]))?.unwrap_or_default();
            backend.compile(&computation, &options)?.execute(&[])?
        } else {
            tracing::trace!(shape = %aval, elements, %device, "transferring constant from host");
            backend.buffer_from_host(&self.source.to_host()?, device)?
        };
        *state = ConstantState::Live {
            buffer: Arc::clone(&buffer),
            host: None,
        };
        Ok(buffer)
    }

    pub fn value(&self) -> Result<Value, XlaError> {
        let mut state = self.state.lock();
        match &mut *state {
            ConstantState::Unmaterialized => self.source.to_host(),
            ConstantState::Live { buffer, host } => {
                if let Some(value) = host {
                    return Ok(value.clone());
                }
                let value = buffer.to_host()?;
                *host = Some(value.clone());
                Ok(value)
            }
            ConstantState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    /// No transfer is started; the host copy is cheap to rebuild.
    pub fn copy_to_host_async(&self) -> Result<(), XlaError> {
        self.aval().map(drop)
    }

    pub fn block_until_ready(&self) -> Result<(), XlaError> {
        match &*self.state.lock() {
            ConstantState::Unmaterialized => Ok(()),
            ConstantState::Live { buffer, .. } => Ok(buffer.block_until_ready()?),
            ConstantState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }

    pub fn delete(&self) -> Result<(), XlaError> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, ConstantState::Deleted) {
            ConstantState::Unmaterialized => Ok(()),
            ConstantState::Live { buffer, .. } => Ok(buffer.delete()?),
            ConstantState::Deleted => Err(XlaError::UseAfterDelete),
        }
    }
}

impl JaxValue for DeviceConstant {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "DeviceConstant"
    }
}
