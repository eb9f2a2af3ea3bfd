//! Callable handles over compiled artifacts.

use crate::runtime::XlaRuntime;
use crate::{DispatchError, check_nans};
use jx_cache::{CompiledJaxpr, CompiledPrimitive};
use jx_core::JaxRef;
use jx_interpreters::XlaError;
use jx_runtime::{DeviceBuffer, DeviceId};
use std::sync::Arc;

/// A primitive compiled for one argument signature.
#[derive(Debug, Clone)]
pub struct PrimitiveCallable<'rt> {
    runtime: &'rt XlaRuntime,
    compiled: Arc<CompiledPrimitive>,
}

impl<'rt> PrimitiveCallable<'rt> {
    pub(crate) fn new(runtime: &'rt XlaRuntime, compiled: Arc<CompiledPrimitive>) -> Self {
        Self { runtime, compiled }
    }

    #[must_use]
    pub fn compiled(&self) -> &Arc<CompiledPrimitive> {
        &self.compiled
    }

    /// Places `args` on the executable's device, runs it once, and wraps
    /// the output with the primitive's result handler.
    pub fn call(&self, args: &[JaxRef]) -> Result<JaxRef, DispatchError> {
        let executable = &self.compiled.executable;
        let device = executable
            .device_ordinals()
            .first()
            .copied()
            .unwrap_or(DeviceId(0));
        let buffers = args
            .iter()
            .map(|arg| self.runtime.put_buffer(arg, device))
            .collect::<Result<Vec<_>, _>>()?;
        let out = executable.execute(&buffers)?;
        if self.runtime.config().debug_nans {
            check_nans(self.compiled.primitive.name(), out.as_ref())?;
        }
        Ok((self.compiled.result_handler)(out)?)
    }
}

/// A whole program compiled for one argument signature and replica
/// configuration.
#[derive(Debug, Clone)]
pub struct JaxprCallable<'rt> {
    runtime: &'rt XlaRuntime,
    compiled: Arc<CompiledJaxpr>,
}

impl<'rt> JaxprCallable<'rt> {
    pub(crate) fn new(runtime: &'rt XlaRuntime, compiled: Arc<CompiledJaxpr>) -> Self {
        Self { runtime, compiled }
    }

    #[must_use]
    pub fn compiled(&self) -> &Arc<CompiledJaxpr> {
        &self.compiled
    }

    /// Runs the program on `args`, returning one value per outvar.
    ///
    /// Replicated programs receive the same inputs on every replica; only
    /// replica 0's outputs are returned.
    pub fn call(&self, args: &[JaxRef]) -> Result<Vec<JaxRef>, DispatchError> {
        let out = if self.compiled.nreps == 1 {
            self.execute_single(args)?
        } else {
            self.execute_replicated(args)?
        };

        let parts = out.destructure()?;
        if parts.len() != self.compiled.result_handlers.len() {
            return Err(XlaError::Arity {
                what: "program outputs",
                expected: self.compiled.result_handlers.len(),
                actual: parts.len(),
            }
            .into());
        }
        if self.runtime.config().debug_nans {
            for (index, part) in parts.iter().enumerate() {
                let producer = self
                    .compiled
                    .output_producers
                    .get(index)
                    .copied()
                    .flatten()
                    .unwrap_or("xla_call");
                check_nans(producer, part.as_ref())?;
            }
        }
        self.compiled
            .result_handlers
            .iter()
            .zip(parts)
            .map(|(handler, part)| handler(part).map_err(DispatchError::from))
            .collect()
    }

    fn execute_single(&self, args: &[JaxRef]) -> Result<Arc<dyn DeviceBuffer>, DispatchError> {
        let executable = &self.compiled.executable;
        let device = executable
            .device_ordinals()
            .first()
            .copied()
            .unwrap_or(DeviceId(0));
        let buffers = args
            .iter()
            .map(|arg| self.runtime.put_buffer(arg, device))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(executable.execute(&buffers)?)
    }

    fn execute_replicated(&self, args: &[JaxRef]) -> Result<Arc<dyn DeviceBuffer>, DispatchError> {
        let executable = &self.compiled.executable;
        let per_replica = executable
            .device_ordinals()
            .iter()
            .map(|device| {
                args.iter()
                    .map(|arg| self.runtime.put_buffer(arg, *device))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;
        tracing::trace!(replicas = per_replica.len(), "executing replicated program");
        let mut outs = executable.execute_per_replica(per_replica)?;
        if outs.is_empty() {
            return Err(XlaError::Arity {
                what: "replica outputs",
                expected: self.compiled.nreps,
                actual: 0,
            }
            .into());
        }
        Ok(outs.swap_remove(0))
    }
}
