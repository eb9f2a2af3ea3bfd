//! `jit`, explicit placement, and eager primitive application.
//!
//! Each entry point has a `*_on` form taking an explicit [`XlaRuntime`];
//! the plain forms use [`XlaRuntime::global`].

use crate::errors::ApiError;
use jx_core::{AbstractValue, JaxRef, Jaxpr, Params, Primitive, Value};
use jx_dispatch::{JaxprCallable, XlaRuntime};
use jx_interpreters::DeviceArray;
use jx_runtime::DeviceId;

#[derive(Debug, Clone)]
pub struct JitWrapped {
    jaxpr: Jaxpr,
    consts: Vec<JaxRef>,
    device_assignment: Option<Vec<DeviceId>>,
}

#[must_use]
pub fn jit(jaxpr: Jaxpr) -> JitWrapped {
    JitWrapped {
        jaxpr,
        consts: Vec::new(),
        device_assignment: None,
    }
}

impl JitWrapped {
    /// Binds the program's constvars, in order.
    #[must_use]
    pub fn with_consts(mut self, consts: Vec<JaxRef>) -> Self {
        self.consts = consts;
        self
    }

    /// Pins replica `i` to `devices[i]`.
    #[must_use]
    pub fn with_device_assignment(mut self, devices: Vec<DeviceId>) -> Self {
        self.device_assignment = Some(devices);
        self
    }

    #[must_use]
    pub fn jaxpr(&self) -> &Jaxpr {
        &self.jaxpr
    }

    pub fn call(&self, args: &[JaxRef]) -> Result<Vec<JaxRef>, ApiError> {
        self.call_on(XlaRuntime::global()?, args)
    }

    pub fn call_on(&self, runtime: &XlaRuntime, args: &[JaxRef]) -> Result<Vec<JaxRef>, ApiError> {
        self.check_consts()?;
        Ok(runtime.xla_call(
            &self.jaxpr,
            &self.consts,
            args,
            self.device_assignment.as_deref(),
        )?)
    }

    /// Compiles for `arg_avals` without running, returning the cached
    /// callable.
    pub fn lower<'rt>(
        &self,
        runtime: &'rt XlaRuntime,
        arg_avals: &[AbstractValue],
    ) -> Result<JaxprCallable<'rt>, ApiError> {
        self.check_consts()?;
        Ok(runtime.xla_callable(
            &self.jaxpr,
            &self.consts,
            arg_avals,
            self.device_assignment.as_deref(),
        )?)
    }

    fn check_consts(&self) -> Result<(), ApiError> {
        if self.consts.len() != self.jaxpr.constvars.len() {
            return Err(ApiError::ConstCount {
                expected: self.jaxpr.constvars.len(),
                actual: self.consts.len(),
            });
        }
        Ok(())
    }
}

pub fn device_put(value: &JaxRef, device: DeviceId) -> Result<JaxRef, ApiError> {
    device_put_on(XlaRuntime::global()?, value, device)
}

pub fn device_put_on(
    runtime: &XlaRuntime,
    value: &JaxRef,
    device: DeviceId,
) -> Result<JaxRef, ApiError> {
    Ok(runtime.device_put(value, device)?)
}

/// Copies a device array (or passes through a host value) to the host.
pub fn device_get(value: &JaxRef) -> Result<Value, ApiError> {
    if let Some(array) = value.downcast_ref::<DeviceArray>() {
        return Ok(array.value()?);
    }
    value
        .downcast_ref::<Value>()
        .cloned()
        .ok_or(ApiError::NotAnArray {
            type_name: value.type_name(),
        })
}

pub fn apply(
    primitive: &'static Primitive,
    args: &[JaxRef],
    params: &Params,
) -> Result<JaxRef, ApiError> {
    apply_on(XlaRuntime::global()?, primitive, args, params)
}

pub fn apply_on(
    runtime: &XlaRuntime,
    primitive: &'static Primitive,
    args: &[JaxRef],
    params: &Params,
) -> Result<JaxRef, ApiError> {
    Ok(runtime.apply_primitive(primitive, args, params)?)
}
