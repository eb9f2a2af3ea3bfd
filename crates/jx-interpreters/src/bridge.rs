//! Shape/value bridge between host values and the backend.
//!
//! Host values are dispatched by their concrete Rust type through five
//! handler tables (canonicalize, abstractify, device transfer, constant
//! emission, plus per-aval shape and result-handler tables). Tables are
//! filled through `register_*` while a [`TypeHandlers`] is still uniquely
//! owned; once it is shared behind an `Arc` it is read-only.

use crate::device::{DeviceArray, DeviceConstant};
use crate::error::XlaError;
use jx_core::{AbstractValue, AvalKind, JaxRef, JaxValue, Value, host_ref};
use jx_runtime::dtype::{canonicalize_aval, canonicalize_value};
use jx_runtime::{Backend, DeviceBuffer, DeviceId, XlaBuilder, XlaOp, XlaShape};
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Converts an execution output buffer into a host-visible value.
pub type ResultHandler =
    Arc<dyn Fn(Arc<dyn DeviceBuffer>) -> Result<JaxRef, XlaError> + Send + Sync>;

/// Everything a transfer handler needs besides the value itself.
#[derive(Clone, Copy)]
pub struct PutContext<'a> {
    pub backend: &'a dyn Backend,
    pub device: DeviceId,
    pub enable_x64: bool,
    pub constant_cutoff: u64,
}

type CanonicalizeFn = Arc<dyn Fn(&dyn JaxValue, bool) -> Result<Option<JaxRef>, XlaError> + Send + Sync>;
type AbstractifyFn = Arc<dyn Fn(&dyn JaxValue, bool) -> Result<AbstractValue, XlaError> + Send + Sync>;
type DevicePutFn =
    Arc<dyn Fn(&dyn JaxValue, &PutContext<'_>) -> Result<Arc<dyn DeviceBuffer>, XlaError> + Send + Sync>;
type ConstantFn =
    Arc<dyn Fn(&mut XlaBuilder, &dyn JaxValue, bool) -> Result<XlaOp, XlaError> + Send + Sync>;
type ShapeFn = Arc<dyn Fn(&AbstractValue) -> Result<XlaShape, XlaError> + Send + Sync>;
type ResultHandlerFactory =
    Arc<dyn Fn(&AbstractValue) -> Result<ResultHandler, XlaError> + Send + Sync>;

fn type_key(value: &dyn JaxValue) -> TypeId {
    Any::type_id(value.as_any())
}

fn downcast<T: JaxValue>(value: &dyn JaxValue) -> Result<&T, XlaError> {
    value.downcast_ref::<T>().ok_or_else(|| XlaError::UnsupportedType {
        kind: "downcast",
        type_name: value.type_name().to_owned(),
    })
}

#[derive(Clone, Default)]
pub struct TypeHandlers {
    canonicalize: FxHashMap<TypeId, CanonicalizeFn>,
    abstractify: FxHashMap<TypeId, AbstractifyFn>,
    device_put: FxHashMap<TypeId, DevicePutFn>,
    constant: FxHashMap<TypeId, ConstantFn>,
    shape: FxHashMap<AvalKind, ShapeFn>,
    result: FxHashMap<AvalKind, ResultHandlerFactory>,
}

impl fmt::Debug for TypeHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHandlers")
            .field("canonicalize", &self.canonicalize.len())
            .field("abstractify", &self.abstractify.len())
            .field("device_put", &self.device_put.len())
            .field("constant", &self.constant.len())
            .field("shape", &self.shape.keys().collect::<Vec<_>>())
            .field("result", &self.result.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeHandlers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handlers for host [`Value`]s, [`DeviceArray`]s, [`DeviceConstant`]s
    /// and the three abstract value kinds.
    #[must_use]
    pub fn standard() -> Self {
        let mut handlers = Self::new();
        register_host_values(&mut handlers);
        register_device_values(&mut handlers);
        register_aval_kinds(&mut handlers);
        handlers
    }

    // ── Registration ───────────────────────────────────────────────

    /// Returning `None` keeps the value as is.
    pub fn register_canonicalize<T: JaxValue>(
        &mut self,
        handler: impl Fn(&T, bool) -> Result<Option<JaxRef>, XlaError> + Send + Sync + 'static,
    ) {
        self.canonicalize.insert(
            TypeId::of::<T>(),
            Arc::new(move |value: &dyn JaxValue, x64: bool| {
                handler(downcast::<T>(value)?, x64)
            }),
        );
    }

    pub fn register_abstractify<T: JaxValue>(
        &mut self,
        handler: impl Fn(&T, bool) -> Result<AbstractValue, XlaError> + Send + Sync + 'static,
    ) {
        self.abstractify.insert(
            TypeId::of::<T>(),
            Arc::new(move |value: &dyn JaxValue, x64: bool| {
                handler(downcast::<T>(value)?, x64)
            }),
        );
    }

    pub fn register_device_put<T: JaxValue>(
        &mut self,
        handler: impl Fn(&T, &PutContext<'_>) -> Result<Arc<dyn DeviceBuffer>, XlaError>
        + Send
        + Sync
        + 'static,
    ) {
        self.device_put.insert(
            TypeId::of::<T>(),
            Arc::new(move |value: &dyn JaxValue, ctx: &PutContext<'_>| {
                handler(downcast::<T>(value)?, ctx)
            }),
        );
    }

    pub fn register_constant<T: JaxValue>(
        &mut self,
        handler: impl Fn(&mut XlaBuilder, &T, bool) -> Result<XlaOp, XlaError> + Send + Sync + 'static,
    ) {
        self.constant.insert(
            TypeId::of::<T>(),
            Arc::new(move |c: &mut XlaBuilder, value: &dyn JaxValue, x64: bool| {
                handler(c, downcast::<T>(value)?, x64)
            }),
        );
    }

    pub fn register_shape(
        &mut self,
        kind: AvalKind,
        handler: impl Fn(&AbstractValue) -> Result<XlaShape, XlaError> + Send + Sync + 'static,
    ) {
        self.shape.insert(kind, Arc::new(handler));
    }

    pub fn register_result_handler(
        &mut self,
        kind: AvalKind,
        factory: impl Fn(&AbstractValue) -> Result<ResultHandler, XlaError> + Send + Sync + 'static,
    ) {
        self.result.insert(kind, Arc::new(factory));
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Applies the dtype policy, returning the original reference when the
    /// value is already canonical.
    pub fn canonicalize(&self, value: &JaxRef, enable_x64: bool) -> Result<JaxRef, XlaError> {
        let handler = self
            .canonicalize
            .get(&type_key(value.as_ref()))
            .ok_or_else(|| unsupported("canonicalize", value.as_ref()))?;
        Ok(handler(value.as_ref(), enable_x64)?.unwrap_or_else(|| Arc::clone(value)))
    }

    pub fn abstractify(&self, value: &dyn JaxValue, enable_x64: bool) -> Result<AbstractValue, XlaError> {
        let handler = self
            .abstractify
            .get(&type_key(value))
            .ok_or_else(|| unsupported("abstractify", value))?;
        handler(value, enable_x64)
    }

    /// Canonicalizes `value` and places it on `ctx.device`.
    pub fn device_put(
        &self,
        value: &JaxRef,
        ctx: &PutContext<'_>,
    ) -> Result<Arc<dyn DeviceBuffer>, XlaError> {
        let value = self.canonicalize(value, ctx.enable_x64)?;
        let handler = self
            .device_put
            .get(&type_key(value.as_ref()))
            .ok_or_else(|| unsupported("device_put", value.as_ref()))?;
        handler(value.as_ref(), ctx)
    }

    /// Emits `value` into `c` as a constant node.
    pub fn constant(
        &self,
        c: &mut XlaBuilder,
        value: &JaxRef,
        enable_x64: bool,
    ) -> Result<XlaOp, XlaError> {
        let value = self.canonicalize(value, enable_x64)?;
        let handler = self
            .constant
            .get(&type_key(value.as_ref()))
            .ok_or_else(|| unsupported("constant", value.as_ref()))?;
        handler(c, value.as_ref(), enable_x64)
    }

    pub fn aval_to_xla_shape(&self, aval: &AbstractValue) -> Result<XlaShape, XlaError> {
        let handler = self
            .shape
            .get(&aval.kind())
            .ok_or_else(|| XlaError::UnsupportedType {
                kind: "shape",
                type_name: aval.kind().as_str().to_owned(),
            })?;
        handler(aval)
    }

    pub fn result_handler(&self, aval: &AbstractValue) -> Result<ResultHandler, XlaError> {
        let factory = self
            .result
            .get(&aval.kind())
            .ok_or_else(|| XlaError::UnsupportedType {
                kind: "result",
                type_name: aval.kind().as_str().to_owned(),
            })?;
        factory(aval)
    }
}

fn unsupported(kind: &'static str, value: &dyn JaxValue) -> XlaError {
    XlaError::UnsupportedType {
        kind,
        type_name: value.type_name().to_owned(),
    }
}

/// Inverse of the shape table for the array and unit cases.
pub fn aval_from_xla_shape(shape: &XlaShape) -> Result<AbstractValue, XlaError> {
    match shape {
        XlaShape::Array { dtype, dims } => Ok(AbstractValue::shaped(
            *dtype,
            jx_core::Shape::new(dims.clone()),
        )),
        XlaShape::Tuple(elements) if elements.is_empty() => Ok(AbstractValue::Unit),
        tuple => Err(XlaError::UnsupportedType {
            kind: "aval",
            type_name: tuple.to_string(),
        }),
    }
}

/// One handler per output; multi-result primitives destructure their tuple
/// output first.
pub fn multi_result_handler(handlers: Vec<ResultHandler>) -> ResultHandler {
    Arc::new(move |buffer: Arc<dyn DeviceBuffer>| -> Result<JaxRef, XlaError> {
        let parts = buffer.destructure()?;
        if parts.len() != handlers.len() {
            return Err(XlaError::Arity {
                what: "tuple outputs",
                expected: handlers.len(),
                actual: parts.len(),
            });
        }
        let values = handlers
            .iter()
            .zip(parts)
            .map(|(handler, part)| handler(part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Arc::new(ResultTuple(values)))
    })
}

/// Outputs of a multi-result execution, in declaration order.
#[derive(Debug, Clone)]
pub struct ResultTuple(pub Vec<JaxRef>);

impl JaxValue for ResultTuple {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "ResultTuple"
    }
}

// ── Standard registrations ─────────────────────────────────────────

fn register_host_values(handlers: &mut TypeHandlers) {
    handlers.register_canonicalize::<Value>(|value, x64| {
        Ok(match canonicalize_value(value, x64) {
            Cow::Borrowed(_) => None,
            Cow::Owned(canonical) => Some(host_ref(canonical)),
        })
    });
    handlers.register_abstractify::<Value>(|value, x64| {
        Ok(canonicalize_aval(&AbstractValue::from_value(value), x64))
    });
    handlers.register_device_put::<Value>(|value, ctx| {
        let canonical = canonicalize_value(value, ctx.enable_x64);
        Ok(ctx.backend.buffer_from_host(&canonical, ctx.device)?)
    });
    handlers.register_constant::<Value>(|c, value, x64| {
        Ok(c.constant(canonicalize_value(value, x64).into_owned()))
    });
}

fn register_device_values(handlers: &mut TypeHandlers) {
    handlers.register_canonicalize::<DeviceArray>(|_, _| Ok(None));
    handlers.register_abstractify::<DeviceArray>(|array, _| Ok(array.aval()?.clone()));
    handlers.register_device_put::<DeviceArray>(|array, ctx| {
        let buffer = array.device_buffer()?;
        if buffer.device() == ctx.device {
            Ok(buffer)
        } else {
            Ok(buffer.copy_to_device(ctx.device)?)
        }
    });
    handlers.register_constant::<DeviceArray>(|c, array, _| Ok(c.constant(array.value()?)));

    handlers.register_canonicalize::<DeviceConstant>(|_, _| Ok(None));
    handlers.register_abstractify::<DeviceConstant>(|constant, _| Ok(constant.aval()?.clone()));
    handlers.register_device_put::<DeviceConstant>(|constant, ctx| {
        constant.instantiate(ctx.backend, ctx.device, ctx.constant_cutoff)
    });
    handlers.register_constant::<DeviceConstant>(|c, constant, _| {
        constant.aval()?;
        Ok(constant.source().build(c))
    });
}

fn register_aval_kinds(handlers: &mut TypeHandlers) {
    handlers.register_shape(AvalKind::Unit, |_| Ok(XlaShape::unit()));
    let array_shape = |aval: &AbstractValue| match aval.as_shaped() {
        Some(shaped) => Ok(XlaShape::array(shaped.dtype, shaped.shape.dims.clone())),
        None => Err(XlaError::UnsupportedType {
            kind: "shape",
            type_name: aval.kind().as_str().to_owned(),
        }),
    };
    handlers.register_shape(AvalKind::Shaped, array_shape);
    handlers.register_shape(AvalKind::Concrete, array_shape);

    handlers.register_result_handler(AvalKind::Unit, |_| {
        Ok(Arc::new(|_buffer: Arc<dyn DeviceBuffer>| Ok(host_ref(Value::Unit))) as ResultHandler)
    });
    let array_result = |aval: &AbstractValue| {
        let shaped = aval.to_shaped();
        Ok(Arc::new(move |buffer: Arc<dyn DeviceBuffer>| {
            Ok(Arc::new(DeviceArray::new(shaped.clone(), buffer)) as JaxRef)
        }) as ResultHandler)
    };
    handlers.register_result_handler(AvalKind::Shaped, array_result);
    handlers.register_result_handler(AvalKind::Concrete, array_result);
}
