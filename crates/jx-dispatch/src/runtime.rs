//! The runtime context threaded through every dispatch call.

use crate::DispatchError;
use crate::callable::{JaxprCallable, PrimitiveCallable};
use crate::fallback::OpByOpEvaluator;
use jx_backend_cpu::CpuBackend;
use jx_cache::{CachePolicy, CacheStats, CompilationCache, CompileContext};
use jx_core::{AbstractValue, JaxRef, Jaxpr, Params, Primitive};
use jx_interpreters::{
    DeviceConstant, PutContext, ResultTuple, TranslationRegistry, TypeHandlers, eval_jaxpr,
};
use jx_lax::standard_translations;
use jx_runtime::{
    BackendRef, BackendSelector, DeviceBuffer, DeviceId, Platform, RuntimeConfig, get_backend,
};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Local backends this crate can build without external services.
#[must_use]
pub fn default_selector() -> BackendSelector {
    BackendSelector::new().with_local(Platform::Cpu, || {
        Ok(Some(Arc::new(CpuBackend::new()) as BackendRef))
    })
}

pub struct XlaRuntime {
    config: RuntimeConfig,
    backend: BackendRef,
    registry: Arc<TranslationRegistry>,
    handlers: Arc<TypeHandlers>,
    cache: CompilationCache,
}

impl fmt::Debug for XlaRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XlaRuntime")
            .field("config", &self.config)
            .field("backend", &self.backend.platform())
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}

static GLOBAL_RUNTIME: OnceLock<XlaRuntime> = OnceLock::new();

impl XlaRuntime {
    /// A runtime over `backend` with the standard translation rules and
    /// type handlers.
    #[must_use]
    pub fn new(config: RuntimeConfig, backend: BackendRef) -> Self {
        Self::with_tables(
            config,
            backend,
            standard_translations(),
            TypeHandlers::standard(),
        )
    }

    /// A runtime over explicitly populated tables. The tables are frozen
    /// from here on.
    #[must_use]
    pub fn with_tables(
        config: RuntimeConfig,
        backend: BackendRef,
        registry: TranslationRegistry,
        handlers: TypeHandlers,
    ) -> Self {
        Self {
            config,
            backend,
            registry: Arc::new(registry),
            handlers: Arc::new(handlers),
            cache: CompilationCache::new(),
        }
    }

    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache = CompilationCache::with_policy(policy);
        self
    }

    /// Selects a backend through the process-wide handle.
    pub fn from_config(
        config: RuntimeConfig,
        selector: &BackendSelector,
    ) -> Result<Self, DispatchError> {
        let backend = get_backend(&config, selector)?;
        Ok(Self::new(config, backend))
    }

    /// The process-wide runtime, configured from the environment on first
    /// use.
    pub fn global() -> Result<&'static Self, DispatchError> {
        if let Some(runtime) = GLOBAL_RUNTIME.get() {
            return Ok(runtime);
        }
        let runtime = Self::from_config(RuntimeConfig::from_env(), &default_selector())?;
        Ok(GLOBAL_RUNTIME.get_or_init(|| runtime))
    }

    // ── Accessors ──────────────────────────────────────────────────

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    #[must_use]
    pub fn registry(&self) -> &TranslationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn handlers(&self) -> &TypeHandlers {
        &self.handlers
    }

    #[must_use]
    pub fn cache(&self) -> &CompilationCache {
        &self.cache
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn compile_context(&self) -> CompileContext<'_> {
        CompileContext {
            backend: self.backend.as_ref(),
            registry: &self.registry,
            handlers: &self.handlers,
            enable_x64: self.config.enable_x64,
        }
    }

    pub(crate) fn put_context(&self, device: DeviceId) -> PutContext<'_> {
        PutContext {
            backend: self.backend.as_ref(),
            device,
            enable_x64: self.config.enable_x64,
            constant_cutoff: self.config.constant_cutoff,
        }
    }

    pub fn abstractify(&self, value: &JaxRef) -> Result<AbstractValue, DispatchError> {
        Ok(self
            .handlers
            .abstractify(value.as_ref(), self.config.enable_x64)?)
    }

    pub fn abstractify_all(&self, values: &[JaxRef]) -> Result<Vec<AbstractValue>, DispatchError> {
        values.iter().map(|value| self.abstractify(value)).collect()
    }

    // ── Single primitives ──────────────────────────────────────────

    /// Compiles (or reuses) `primitive` for the avals of `args` and runs it.
    ///
    /// Returns a device value, or a [`ResultTuple`] for multi-result
    /// primitives.
    pub fn apply_primitive(
        &self,
        primitive: &'static Primitive,
        args: &[JaxRef],
        params: &Params,
    ) -> Result<JaxRef, DispatchError> {
        self.apply_primitive_with(primitive, params, &[], args)
    }

    /// [`apply_primitive`](Self::apply_primitive) for primitives carrying
    /// nested programs.
    pub fn apply_primitive_with(
        &self,
        primitive: &'static Primitive,
        params: &Params,
        sub_jaxprs: &[Jaxpr],
        args: &[JaxRef],
    ) -> Result<JaxRef, DispatchError> {
        let avals = self.abstractify_all(args)?;
        self.primitive_callable(primitive, params, sub_jaxprs, &avals)?
            .call(args)
    }

    pub fn primitive_callable(
        &self,
        primitive: &'static Primitive,
        params: &Params,
        sub_jaxprs: &[Jaxpr],
        arg_avals: &[AbstractValue],
    ) -> Result<PrimitiveCallable<'_>, DispatchError> {
        let compiled = self.cache.primitive_callable(
            &self.compile_context(),
            primitive,
            params,
            sub_jaxprs,
            arg_avals,
        )?;
        Ok(PrimitiveCallable::new(self, compiled))
    }

    // ── Whole programs ─────────────────────────────────────────────

    /// Compiles (or reuses) `jaxpr` with `consts` embedded, for arguments
    /// with the given avals.
    pub fn xla_callable(
        &self,
        jaxpr: &Jaxpr,
        consts: &[JaxRef],
        arg_avals: &[AbstractValue],
        device_assignment: Option<&[DeviceId]>,
    ) -> Result<JaxprCallable<'_>, DispatchError> {
        let compiled = self.cache.compile_jaxpr(
            &self.compile_context(),
            jaxpr,
            consts,
            arg_avals,
            device_assignment,
        )?;
        Ok(JaxprCallable::new(self, compiled))
    }

    /// Compiles and runs `jaxpr` on `args`, returning one value per outvar.
    ///
    /// A NaN reported by the compiled run triggers exactly one re-run of
    /// the program op by op, whose result (or error) is returned instead.
    pub fn xla_call(
        &self,
        jaxpr: &Jaxpr,
        consts: &[JaxRef],
        args: &[JaxRef],
        device_assignment: Option<&[DeviceId]>,
    ) -> Result<Vec<JaxRef>, DispatchError> {
        if args.len() != jaxpr.invars.len() {
            return Err(DispatchError::ArgumentCount {
                expected: jaxpr.invars.len(),
                actual: args.len(),
            });
        }
        let avals = self.abstractify_all(args)?;
        let callable = self.xla_callable(jaxpr, consts, &avals, device_assignment)?;
        match callable.call(args) {
            Err(DispatchError::NumericInstability { primitive }) => {
                tracing::warn!(
                    primitive = %primitive,
                    "Invalid value encountered in the output of a jit function. \
                     Calling the de-optimized version."
                );
                self.eval_uncompiled(jaxpr, consts, args)
            }
            other => other,
        }
    }

    /// Evaluates `jaxpr` one equation at a time, compiling each primitive on
    /// its own.
    pub fn eval_uncompiled(
        &self,
        jaxpr: &Jaxpr,
        consts: &[JaxRef],
        args: &[JaxRef],
    ) -> Result<Vec<JaxRef>, DispatchError> {
        let mut evaluator = OpByOpEvaluator::new(self);
        eval_jaxpr(jaxpr, consts, &[], args, &mut evaluator)
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Places `value` on `device` and wraps the buffer as a device value.
    pub fn device_put(&self, value: &JaxRef, device: DeviceId) -> Result<JaxRef, DispatchError> {
        let aval = self.abstractify(value)?;
        let buffer = self.put_buffer(value, device)?;
        let handler = self.handlers.result_handler(&aval)?;
        Ok(handler(buffer)?)
    }

    pub(crate) fn put_buffer(
        &self,
        value: &JaxRef,
        device: DeviceId,
    ) -> Result<Arc<dyn DeviceBuffer>, DispatchError> {
        Ok(self.handlers.device_put(value, &self.put_context(device))?)
    }

    /// Materializes `constant` on `device` using the configured cutoff.
    pub fn instantiate_device_constant(
        &self,
        constant: &DeviceConstant,
        device: DeviceId,
    ) -> Result<Arc<dyn DeviceBuffer>, DispatchError> {
        Ok(constant.instantiate(
            self.backend.as_ref(),
            device,
            self.config.constant_cutoff,
        )?)
    }
}

/// Splits a multi-result primitive's output into its parts.
pub(crate) fn unpack_results(
    primitive: &Primitive,
    result: JaxRef,
) -> Result<Vec<JaxRef>, DispatchError> {
    if !primitive.multiple_results() {
        return Ok(vec![result]);
    }
    match result.downcast_ref::<ResultTuple>() {
        Some(ResultTuple(parts)) => Ok(parts.clone()),
        None => Err(DispatchError::UnexpectedResult {
            primitive: primitive.name().to_owned(),
            type_name: result.type_name(),
        }),
    }
}
