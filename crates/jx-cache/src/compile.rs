//! Memoized compilation of single primitives and whole jaxprs.
//!
//! Graph construction and executable compilation live in separate tables:
//! a graph depends only on shapes, params and program structure, while an
//! executable additionally depends on the replica count and device
//! assignment it was compiled for.

use crate::CompileError;
use crate::key::{CacheKey, JaxprKeyInput, PrimitiveKeyInput, jaxpr_key, primitive_key};
use crate::memo::{CachePolicy, MemoTable, TableStats};
use jx_core::{AbstractValue, JaxRef, Jaxpr, Params, Primitive};
use jx_interpreters::{
    AxisEnv, Lowerer, ResultHandler, TranslationRegistry, TypeHandlers, XlaError,
    aval_from_xla_shape, jaxpr_replicas, multi_result_handler, prefetch,
};
use jx_runtime::{
    Backend, CompileOptions, DeviceId, Executable, XlaComputation, get_compile_options,
};
use std::fmt;
use std::sync::Arc;

/// Borrowed collaborators for one compilation request.
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    pub backend: &'a dyn Backend,
    pub registry: &'a TranslationRegistry,
    pub handlers: &'a TypeHandlers,
    pub enable_x64: bool,
}

impl<'a> CompileContext<'a> {
    #[must_use]
    pub fn lowerer(&self) -> Lowerer<'a> {
        Lowerer::new(
            self.registry,
            self.handlers,
            self.backend.platform(),
            self.enable_x64,
        )
    }
}

/// A primitive compiled for one set of argument avals and params.
pub struct CompiledPrimitive {
    pub primitive: &'static Primitive,
    pub executable: Arc<dyn Executable>,
    pub out_avals: Vec<AbstractValue>,
    /// Turns the raw output buffer into a device value, or a
    /// [`ResultTuple`](jx_interpreters::ResultTuple) for multi-result
    /// primitives.
    pub result_handler: ResultHandler,
}

impl fmt::Debug for CompiledPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPrimitive")
            .field("primitive", &self.primitive.name())
            .field("executable", &self.executable)
            .field("out_avals", &self.out_avals)
            .finish_non_exhaustive()
    }
}

/// A whole jaxpr compiled for one replica configuration.
pub struct CompiledJaxpr {
    pub executable: Arc<dyn Executable>,
    pub nreps: usize,
    pub out_avals: Vec<AbstractValue>,
    /// One per output of the result tuple.
    pub result_handlers: Vec<ResultHandler>,
    /// Name of the primitive defining each output; `None` when an output is
    /// an input or constant passed through.
    pub output_producers: Vec<Option<&'static str>>,
    /// Constants embedded in the computation, kept alive with the entry.
    pub consts: Vec<JaxRef>,
}

impl fmt::Debug for CompiledJaxpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledJaxpr")
            .field("executable", &self.executable)
            .field("nreps", &self.nreps)
            .field("out_avals", &self.out_avals)
            .field("output_producers", &self.output_producers)
            .finish_non_exhaustive()
    }
}

/// A lowered whole-program graph and the constants its key names.
///
/// Keys identify constants by allocation address, so the entry holds them
/// for as long as it lives; an address is never reused under a live key.
struct JaxprGraph {
    computation: Arc<XlaComputation>,
    #[allow(dead_code)]
    consts: Vec<JaxRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub primitive_computations: TableStats,
    pub primitive_executables: TableStats,
    pub jaxpr_computations: TableStats,
    pub jaxpr_executables: TableStats,
}

#[derive(Debug)]
pub struct CompilationCache {
    primitive_computations: MemoTable<Arc<XlaComputation>>,
    primitive_executables: MemoTable<Arc<CompiledPrimitive>>,
    jaxpr_computations: MemoTable<Arc<JaxprGraph>>,
    jaxpr_executables: MemoTable<Arc<CompiledJaxpr>>,
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new()
    }
}

fn shaped_avals(avals: &[AbstractValue]) -> Vec<AbstractValue> {
    avals.iter().map(AbstractValue::to_shaped).collect()
}

impl CompilationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(CachePolicy::Unbounded)
    }

    #[must_use]
    pub fn with_policy(policy: CachePolicy) -> Self {
        Self {
            primitive_computations: MemoTable::new("primitive_computations", policy),
            primitive_executables: MemoTable::new("primitive_executables", policy),
            jaxpr_computations: MemoTable::new("jaxpr_computations", policy),
            jaxpr_executables: MemoTable::new("jaxpr_executables", policy),
        }
    }

    // ── Single primitives ──────────────────────────────────────────

    /// The lowered computation for `primitive` applied to `arg_avals`.
    pub fn primitive_computation(
        &self,
        ctx: &CompileContext<'_>,
        primitive: &'static Primitive,
        params: &Params,
        sub_jaxprs: &[Jaxpr],
        arg_avals: &[AbstractValue],
    ) -> Result<Arc<XlaComputation>, CompileError> {
        let avals = shaped_avals(arg_avals);
        let key = primitive_key(&PrimitiveKeyInput {
            primitive,
            params,
            sub_jaxprs,
            arg_avals: &avals,
            platform: ctx.backend.platform(),
            enable_x64: ctx.enable_x64,
        });
        self.primitive_computation_for_key(ctx, key, primitive, params, sub_jaxprs, &avals)
    }

    fn primitive_computation_for_key(
        &self,
        ctx: &CompileContext<'_>,
        key: CacheKey,
        primitive: &'static Primitive,
        params: &Params,
        sub_jaxprs: &[Jaxpr],
        avals: &[AbstractValue],
    ) -> Result<Arc<XlaComputation>, CompileError> {
        self.primitive_computations.get_or_try_insert_with(key, || {
            tracing::debug!(primitive = primitive.name(), args = avals.len(), "lowering primitive");
            let shapes = avals
                .iter()
                .map(|aval| ctx.handlers.aval_to_xla_shape(aval))
                .collect::<Result<Vec<_>, _>>()?;
            let computation =
                ctx.lowerer()
                    .primitive_computation(primitive, params, sub_jaxprs, &shapes)?;
            Ok(Arc::new(computation))
        })
    }

    /// A callable executable for `primitive` applied to `arg_avals`.
    ///
    /// Output avals and result handlers are derived before anything is
    /// lowered, so shape errors never reach the backend compiler.
    pub fn primitive_callable(
        &self,
        ctx: &CompileContext<'_>,
        primitive: &'static Primitive,
        params: &Params,
        sub_jaxprs: &[Jaxpr],
        arg_avals: &[AbstractValue],
    ) -> Result<Arc<CompiledPrimitive>, CompileError> {
        let avals = shaped_avals(arg_avals);
        let key = primitive_key(&PrimitiveKeyInput {
            primitive,
            params,
            sub_jaxprs,
            arg_avals: &avals,
            platform: ctx.backend.platform(),
            enable_x64: ctx.enable_x64,
        });
        self.primitive_executables.get_or_try_insert_with(key.clone(), || {
            let out_avals = primitive.abstract_eval(&avals, params)?;
            let mut handlers = out_avals
                .iter()
                .map(|aval| ctx.handlers.result_handler(aval))
                .collect::<Result<Vec<_>, _>>()?;
            let result_handler = if primitive.multiple_results() {
                multi_result_handler(handlers)
            } else {
                match (handlers.pop(), handlers.len()) {
                    (Some(handler), 0) => handler,
                    (_, rest) => {
                        return Err(XlaError::Arity {
                            what: "primitive outputs",
                            expected: 1,
                            actual: rest + 1,
                        }
                        .into());
                    }
                }
            };
            let computation =
                self.primitive_computation_for_key(ctx, key, primitive, params, sub_jaxprs, &avals)?;
            tracing::debug!(
                primitive = primitive.name(),
                computation = computation.name(),
                "compiling primitive"
            );
            let executable = ctx
                .backend
                .compile(&computation, &CompileOptions::default())?;
            Ok(Arc::new(CompiledPrimitive {
                primitive,
                executable,
                out_avals,
                result_handler,
            }))
        })
    }

    // ── Whole jaxprs ───────────────────────────────────────────────

    /// The lowered computation for `jaxpr` with `consts` embedded and one
    /// parameter per invar shaped by `arg_avals`.
    pub fn jaxpr_computation(
        &self,
        ctx: &CompileContext<'_>,
        jaxpr: &Jaxpr,
        consts: &[JaxRef],
        arg_avals: &[AbstractValue],
    ) -> Result<Arc<XlaComputation>, CompileError> {
        let nreps = check_replicas(ctx, jaxpr)?;
        let avals = shaped_avals(arg_avals);
        let axis_env = AxisEnv::new(nreps);
        let key = jaxpr_key(&JaxprKeyInput {
            jaxpr,
            axis_env: &axis_env,
            consts,
            arg_avals: &avals,
            platform: ctx.backend.platform(),
            enable_x64: ctx.enable_x64,
        });
        self.jaxpr_computation_for_key(ctx, key, jaxpr, &axis_env, consts, &avals)
    }

    fn jaxpr_computation_for_key(
        &self,
        ctx: &CompileContext<'_>,
        key: CacheKey,
        jaxpr: &Jaxpr,
        axis_env: &AxisEnv,
        consts: &[JaxRef],
        avals: &[AbstractValue],
    ) -> Result<Arc<XlaComputation>, CompileError> {
        let graph = self.jaxpr_computations.get_or_try_insert_with(key, || {
            jaxpr.validate_well_formed()?;
            let fingerprint = jaxpr.canonical_fingerprint();
            tracing::debug!(
                jaxpr = fingerprint.get(..48).unwrap_or(fingerprint.as_str()),
                nreps = axis_env.nreps(),
                "lowering jaxpr"
            );
            let shapes = avals
                .iter()
                .map(|aval| ctx.handlers.aval_to_xla_shape(aval))
                .collect::<Result<Vec<_>, _>>()?;
            let computation = ctx
                .lowerer()
                .jaxpr_computation(jaxpr, axis_env, consts, &[], &shapes)?;
            Ok::<_, CompileError>(Arc::new(JaxprGraph {
                computation: Arc::new(computation),
                consts: consts.to_vec(),
            }))
        })?;
        Ok(Arc::clone(&graph.computation))
    }

    /// Compiles `jaxpr` for its replica requirement, optionally pinned to
    /// `device_assignment` (one device per replica).
    ///
    /// Fails with [`CompileError::ReplicaOversubscription`] before any
    /// lowering or compilation when the backend has too few devices.
    pub fn compile_jaxpr(
        &self,
        ctx: &CompileContext<'_>,
        jaxpr: &Jaxpr,
        consts: &[JaxRef],
        arg_avals: &[AbstractValue],
        device_assignment: Option<&[DeviceId]>,
    ) -> Result<Arc<CompiledJaxpr>, CompileError> {
        let nreps = check_replicas(ctx, jaxpr)?;
        let options = get_compile_options(Some(nreps), device_assignment)?.unwrap_or_default();
        let avals = shaped_avals(arg_avals);
        let axis_env = AxisEnv::new(nreps);
        let graph_key = jaxpr_key(&JaxprKeyInput {
            jaxpr,
            axis_env: &axis_env,
            consts,
            arg_avals: &avals,
            platform: ctx.backend.platform(),
            enable_x64: ctx.enable_x64,
        });
        let key = graph_key.with_compile_options(nreps, device_assignment);
        self.jaxpr_executables.get_or_try_insert_with(key, || {
            prefetch(consts);
            let computation =
                self.jaxpr_computation_for_key(ctx, graph_key, jaxpr, &axis_env, consts, &avals)?;
            tracing::debug!(
                computation = computation.name(),
                nreps,
                pinned = device_assignment.is_some(),
                "compiling jaxpr"
            );
            let executable = ctx.backend.compile(&computation, &options)?;
            let out_avals = computation
                .result_shape()
                .tuple_shapes()
                .iter()
                .map(aval_from_xla_shape)
                .collect::<Result<Vec<_>, _>>()?;
            let result_handlers = out_avals
                .iter()
                .map(|aval| ctx.handlers.result_handler(aval))
                .collect::<Result<Vec<_>, _>>()?;
            let output_producers = jaxpr
                .outvars
                .iter()
                .map(|var| jaxpr.producer_of(*var).map(Primitive::name))
                .collect();
            Ok(Arc::new(CompiledJaxpr {
                executable,
                nreps,
                out_avals,
                result_handlers,
                output_producers,
                consts: consts.to_vec(),
            }))
        })
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            primitive_computations: self.primitive_computations.stats(),
            primitive_executables: self.primitive_executables.stats(),
            jaxpr_computations: self.jaxpr_computations.stats(),
            jaxpr_executables: self.jaxpr_executables.stats(),
        }
    }

    pub fn clear(&self) {
        self.primitive_computations.clear();
        self.primitive_executables.clear();
        self.jaxpr_computations.clear();
        self.jaxpr_executables.clear();
    }
}

fn check_replicas(ctx: &CompileContext<'_>, jaxpr: &Jaxpr) -> Result<usize, CompileError> {
    let required = jaxpr_replicas(jaxpr);
    let available = ctx.backend.device_count();
    if required > available {
        return Err(CompileError::ReplicaOversubscription {
            required,
            available,
        });
    }
    Ok(required)
}
