//! Lowering jaxprs and lone primitives into backend computations.

use crate::bridge::{TypeHandlers, aval_from_xla_shape};
use crate::device::DeviceArray;
use crate::error::XlaError;
use crate::registry::{AxisEnv, CallArgs, InitialStyleArgs, TranslationRegistry};
use jx_core::{Atom, Equation, Jaxpr, JaxRef, Literal, Param, Params, Primitive, Value, VarId};
use jx_runtime::{Platform, XlaBuilder, XlaComputation, XlaOp, XlaShape, canonicalize_dtype};
use rustc_hash::FxHashMap;

type Env = FxHashMap<VarId, XlaOp>;

/// Everything needed to lower equations for one backend platform.
#[derive(Debug, Clone, Copy)]
pub struct Lowerer<'a> {
    registry: &'a TranslationRegistry,
    handlers: &'a TypeHandlers,
    platform: Platform,
    enable_x64: bool,
}

impl<'a> Lowerer<'a> {
    #[must_use]
    pub fn new(
        registry: &'a TranslationRegistry,
        handlers: &'a TypeHandlers,
        platform: Platform,
        enable_x64: bool,
    ) -> Self {
        Self {
            registry,
            handlers,
            platform,
            enable_x64,
        }
    }

    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    #[must_use]
    pub fn handlers(&self) -> &'a TypeHandlers {
        self.handlers
    }

    /// Lowers `jaxpr` into a standalone computation returning a tuple of its
    /// outputs.
    ///
    /// With `const_vals`, constvars are embedded as constants and only the
    /// freevars become leading parameters. Without them, constvars and
    /// freevars together become the leading parameters, shaped by
    /// `freevar_shapes`. The invars follow, shaped by `arg_shapes`.
    pub fn jaxpr_computation(
        &self,
        jaxpr: &Jaxpr,
        axis_env: &AxisEnv,
        const_vals: &[JaxRef],
        freevar_shapes: &[XlaShape],
        arg_shapes: &[XlaShape],
    ) -> Result<XlaComputation, XlaError> {
        let mut c = XlaBuilder::new("jaxpr_computation");
        let mut env = Env::default();
        env.insert(VarId::UNIT, c.tuple(&[]));

        if const_vals.is_empty() {
            let env_vars: Vec<VarId> = jaxpr
                .constvars
                .iter()
                .chain(&jaxpr.freevars)
                .copied()
                .collect();
            check_arity("constvars and freevars", env_vars.len(), freevar_shapes.len())?;
            for (var, shape) in env_vars.iter().zip(freevar_shapes) {
                env.insert(*var, c.parameter_with_shape(shape));
            }
        } else {
            check_arity("constvars", jaxpr.constvars.len(), const_vals.len())?;
            check_arity("freevars", jaxpr.freevars.len(), freevar_shapes.len())?;
            for (var, value) in jaxpr.constvars.iter().zip(const_vals) {
                let node = self.handlers.constant(&mut c, value, self.enable_x64)?;
                env.insert(*var, node);
            }
            for (var, shape) in jaxpr.freevars.iter().zip(freevar_shapes) {
                env.insert(*var, c.parameter_with_shape(shape));
            }
        }

        check_arity("invars", jaxpr.invars.len(), arg_shapes.len())?;
        for (var, shape) in jaxpr.invars.iter().zip(arg_shapes) {
            env.insert(*var, c.parameter_with_shape(shape));
        }

        let outs = self.lower_equations(&mut c, jaxpr, axis_env, env)?;
        let root = c.tuple(&outs);
        Ok(c.build(root)?)
    }

    /// Lowers `jaxpr` into the caller's builder, binding its constvars,
    /// freevars and invars to existing nodes. Returns one node per outvar.
    pub fn lower_inline(
        &self,
        c: &mut XlaBuilder,
        jaxpr: &Jaxpr,
        axis_env: &AxisEnv,
        consts: &[XlaOp],
        freevars: &[XlaOp],
        args: &[XlaOp],
    ) -> Result<Vec<XlaOp>, XlaError> {
        check_arity("constvars", jaxpr.constvars.len(), consts.len())?;
        check_arity("freevars", jaxpr.freevars.len(), freevars.len())?;
        check_arity("invars", jaxpr.invars.len(), args.len())?;
        let mut env = Env::default();
        env.insert(VarId::UNIT, c.tuple(&[]));
        let bindings = jaxpr
            .constvars
            .iter()
            .zip(consts)
            .chain(jaxpr.freevars.iter().zip(freevars))
            .chain(jaxpr.invars.iter().zip(args));
        for (var, node) in bindings {
            env.insert(*var, *node);
        }
        self.lower_equations(c, jaxpr, axis_env, env)
    }

    fn lower_equations(
        &self,
        c: &mut XlaBuilder,
        jaxpr: &Jaxpr,
        axis_env: &AxisEnv,
        mut env: Env,
    ) -> Result<Vec<XlaOp>, XlaError> {
        for eqn in &jaxpr.equations {
            let in_nodes = eqn
                .inputs
                .iter()
                .map(|atom| self.read(c, &env, atom))
                .collect::<Result<Vec<_>, _>>()?;
            let ans = self.translate(c, eqn, axis_env, &env, &in_nodes)?;
            // Surface shape errors at the equation that caused them.
            c.get_shape(ans).map_err(|source| XlaError::Lowering {
                primitive: eqn.primitive.name().to_owned(),
                source,
            })?;
            let outs = if eqn.primitive.multiple_results() {
                xla_destructure(c, ans)?
            } else {
                vec![ans]
            };
            if outs.len() != eqn.outputs.len() {
                return Err(XlaError::MalformedEquation {
                    primitive: eqn.primitive.name().to_owned(),
                    detail: format!(
                        "rule produced {} outputs for {} output vars",
                        outs.len(),
                        eqn.outputs.len()
                    ),
                });
            }
            for (var, node) in eqn.outputs.iter().zip(outs) {
                env.insert(*var, node);
            }
        }
        jaxpr
            .outvars
            .iter()
            .map(|var| env.get(var).copied().ok_or(XlaError::UnboundVar(*var)))
            .collect()
    }

    fn read(&self, c: &mut XlaBuilder, env: &Env, atom: &Atom) -> Result<XlaOp, XlaError> {
        match atom {
            Atom::Var(var) => env.get(var).copied().ok_or(XlaError::UnboundVar(*var)),
            Atom::Lit(literal) => Ok(c.constant(Value::Scalar(self.canonical_literal(*literal)))),
        }
    }

    fn canonical_literal(&self, literal: Literal) -> Literal {
        literal.cast(canonicalize_dtype(literal.dtype(), self.enable_x64))
    }

    fn translate(
        &self,
        c: &mut XlaBuilder,
        eqn: &Equation,
        axis_env: &AxisEnv,
        env: &Env,
        in_nodes: &[XlaOp],
    ) -> Result<XlaOp, XlaError> {
        let primitive = eqn.primitive;
        if let Some(rule) = self.registry.platform_rule(self.platform, primitive) {
            return rule(c, in_nodes, &eqn.params);
        }
        if let Some(rule) = self.registry.generic_rule(primitive) {
            return rule(c, in_nodes, &eqn.params);
        }
        if let Some(rule) = self.registry.initial_style_rule(primitive) {
            let args = InitialStyleArgs {
                axis_env,
                sub_jaxprs: &eqn.sub_jaxprs,
                lowerer: self,
            };
            return rule(c, &args, in_nodes, &eqn.params);
        }
        if let Some(rule) = self.registry.collective_rule(primitive) {
            let names = axis_names(primitive, &eqn.params)?;
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let groups = axis_env.axis_groups(&names)?;
            let mut params = eqn.params.clone();
            params.remove("axis_name");
            return rule(c, in_nodes, &groups, &params);
        }
        if let Some(rule) = self.registry.call_rule(primitive) {
            let bound = eqn
                .bound_subjaxpr
                .as_ref()
                .ok_or_else(|| XlaError::MalformedEquation {
                    primitive: primitive.name().to_owned(),
                    detail: "call-style equation without a bound sub-program".to_owned(),
                })?;
            let env_nodes = bound
                .const_bindings
                .iter()
                .chain(&bound.freevar_bindings)
                .map(|atom| self.read(c, env, atom))
                .collect::<Result<Vec<_>, _>>()?;
            let args = CallArgs {
                subjaxpr: &bound.jaxpr,
                axis_env,
                lowerer: self,
            };
            return rule(c, &args, &env_nodes, in_nodes, &eqn.params);
        }
        Err(XlaError::NoTranslationRule {
            primitive: primitive.name().to_owned(),
        })
    }

    /// Lowers one primitive applied to parameters of the given shapes.
    ///
    /// When the backend rejects the result, abstract evaluation is rerun on
    /// the argument avals so a shape-rule failure is reported instead.
    pub fn primitive_computation(
        &self,
        primitive: &'static Primitive,
        params: &Params,
        sub_jaxprs: &[Jaxpr],
        arg_shapes: &[XlaShape],
    ) -> Result<XlaComputation, XlaError> {
        let mut c = XlaBuilder::new(format!("primitive_computation_{}", primitive.name()));
        let args: Vec<XlaOp> = arg_shapes
            .iter()
            .map(|shape| c.parameter_with_shape(shape))
            .collect();
        let root = if let Some(rule) = self.registry.platform_rule(self.platform, primitive) {
            rule(&mut c, &args, params)?
        } else if let Some(rule) = self.registry.generic_rule(primitive) {
            rule(&mut c, &args, params)?
        } else if let Some(rule) = self.registry.initial_style_rule(primitive) {
            let axis_env = AxisEnv::new(1);
            let style_args = InitialStyleArgs {
                axis_env: &axis_env,
                sub_jaxprs,
                lowerer: self,
            };
            rule(&mut c, &style_args, &args, params)?
        } else {
            return Err(XlaError::NoTranslationRule {
                primitive: primitive.name().to_owned(),
            });
        };

        match c.build(root) {
            Ok(computation) => Ok(computation),
            Err(source) => {
                let avals = arg_shapes
                    .iter()
                    .map(aval_from_xla_shape)
                    .collect::<Result<Vec<_>, _>>()?;
                primitive.abstract_eval(&avals, params)?;
                Err(XlaError::Lowering {
                    primitive: primitive.name().to_owned(),
                    source,
                })
            }
        }
    }
}

fn check_arity(what: &'static str, expected: usize, actual: usize) -> Result<(), XlaError> {
    if expected != actual {
        return Err(XlaError::Arity {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn axis_names(primitive: &Primitive, params: &Params) -> Result<Vec<String>, XlaError> {
    match params.get("axis_name") {
        Some(Param::Str(name)) => Ok(vec![name.clone()]),
        Some(Param::Strs(names)) => Ok(names.clone()),
        Some(other) => Err(XlaError::MalformedEquation {
            primitive: primitive.name().to_owned(),
            detail: format!("axis_name must be a string, got {other}"),
        }),
        None => Err(XlaError::MalformedEquation {
            primitive: primitive.name().to_owned(),
            detail: "collective equation without an axis_name".to_owned(),
        }),
    }
}

/// Splits a tuple-shaped node into one node per element.
pub fn xla_destructure(c: &mut XlaBuilder, tuple: XlaOp) -> Result<Vec<XlaOp>, XlaError> {
    let count = c.get_shape(tuple)?.tuple_shapes().len();
    Ok((0..count)
        .map(|index| c.get_tuple_element(tuple, index))
        .collect())
}

/// Replicas needed to run `jaxpr`: the largest requirement of any equation,
/// where a call-style equation needs its `axis_size` times its body's count
/// and a higher-order equation needs the most of any nested program.
#[must_use]
pub fn jaxpr_replicas(jaxpr: &Jaxpr) -> usize {
    jaxpr
        .equations
        .iter()
        .map(eqn_replicas)
        .max()
        .unwrap_or(1)
        .max(1)
}

fn eqn_replicas(eqn: &Equation) -> usize {
    if let Some(bound) = &eqn.bound_subjaxpr {
        let axis_size = match eqn.params.get("axis_size") {
            Some(Param::Int(size)) => usize::try_from(*size).unwrap_or(1),
            _ => 1,
        };
        return axis_size * jaxpr_replicas(&bound.jaxpr);
    }
    eqn.sub_jaxprs
        .iter()
        .map(jaxpr_replicas)
        .max()
        .unwrap_or(1)
}

/// Starts host transfers for every device-resident value among `consts`.
/// Literals are always host scalars, so constants are the only candidates.
/// Failures are ignored.
pub fn prefetch(consts: &[JaxRef]) {
    for value in consts {
        if let Some(array) = value.downcast_ref::<DeviceArray>()
            && let Err(err) = array.copy_to_host_async()
        {
            tracing::trace!(error = %err, "prefetch skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_rules::{ADD_JAXVALS_P, XLA_CALL_P, register_core_translations};
    use jx_backend_cpu::CpuBackend;
    use jx_core::{AbstractValue, BoundSubjaxpr, DType, ShapeError, host_ref};
    use jx_runtime::{Backend, BinaryOp, CompileOptions, DeviceId, UnaryOp};

    fn binary_same(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
        if args.len() != 2 || args[0] != args[1] {
            return Err(ShapeError::IncompatibleOperands {
                primitive: "mul".to_owned(),
                lhs: args.first().map(ToString::to_string).unwrap_or_default(),
                rhs: args.get(1).map(ToString::to_string).unwrap_or_default(),
            });
        }
        Ok(vec![args[0].clone()])
    }

    fn split_pair(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
        Ok(args.to_vec())
    }

    fn unknown(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
        Ok(args.to_vec())
    }

    static MUL_P: Primitive = Primitive::new("test_mul", binary_same);
    static NEG_P: Primitive = Primitive::new("test_neg", unknown);
    static PAIR_P: Primitive = Primitive::with_multiple_results("test_pair", split_pair);
    static PSUM_P: Primitive = Primitive::new("test_psum", unknown);
    static MISSING_P: Primitive = Primitive::new("test_missing", unknown);
    static BROKEN_P: Primitive = Primitive::new("test_broken", binary_same);

    fn registry() -> TranslationRegistry {
        let mut registry = TranslationRegistry::new();
        register_core_translations(&mut registry);
        registry.register_generic(&MUL_P, |c, args, _| {
            Ok(c.binary(BinaryOp::Mul, args[0], args[1]))
        });
        registry.register_generic(&NEG_P, |c, args, _| Ok(c.unary(UnaryOp::Neg, args[0])));
        registry.register_generic(&PAIR_P, |c, args, _| Ok(c.tuple(args)));
        registry.register_generic(&BROKEN_P, |c, args, _| Ok(c.add(args[0], args[1])));
        registry.register_collective(&PSUM_P, |c, args, groups, params| {
            assert!(!params.contains_key("axis_name"));
            Ok(c.cross_replica_sum(args[0], groups))
        });
        registry
    }

    fn f32_vec(len: u32) -> XlaShape {
        XlaShape::array(DType::F32, [len])
    }

    fn run(computation: &XlaComputation, args: &[Value]) -> Vec<Value> {
        let backend = CpuBackend::new();
        let exe = backend
            .compile(computation, &CompileOptions::default())
            .expect("compiles");
        let buffers: Vec<_> = args
            .iter()
            .map(|value| backend.buffer_from_host(value, DeviceId(0)).expect("arg"))
            .collect();
        exe.execute(&buffers)
            .expect("executes")
            .destructure()
            .expect("tuple result")
            .iter()
            .map(|part| part.to_host().expect("host"))
            .collect()
    }

    #[test]
    fn lowers_square_with_literal_input() {
        // out = x * x + 1.0 via add_jaxvals
        let jaxpr = Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(3)],
            vec![
                Equation::new(&MUL_P, [Atom::Var(VarId(1)), Atom::Var(VarId(1))], [VarId(2)]),
                Equation::new(
                    &ADD_JAXVALS_P,
                    [Atom::Var(VarId(2)), Atom::Lit(Literal::from_f64(1.0))],
                    [VarId(3)],
                ),
            ],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let computation = lowerer
            .jaxpr_computation(&jaxpr, &AxisEnv::new(1), &[], &[], &[XlaShape::scalar(DType::F32)])
            .expect("lowers");
        assert_eq!(
            run(&computation, &[Value::scalar_f32(3.0)]),
            vec![Value::scalar_f32(10.0)]
        );
    }

    #[test]
    fn constvars_become_constants_or_parameters() {
        let jaxpr = Jaxpr::new(
            vec![VarId(2)],
            vec![VarId(1)],
            vec![VarId(3)],
            vec![Equation::new(
                &MUL_P,
                [Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                [VarId(3)],
            )],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let scale = host_ref(Value::vector_f32(&[2.0, 3.0]).expect("consts"));

        let embedded = lowerer
            .jaxpr_computation(&jaxpr, &AxisEnv::new(1), &[scale], &[], &[f32_vec(2)])
            .expect("lowers");
        assert_eq!(embedded.parameter_shapes().len(), 1);
        let x = Value::vector_f32(&[1.0, 1.0]).expect("x");
        assert_eq!(run(&embedded, &[x.clone()])[0].to_f64_vec(), vec![2.0, 3.0]);

        let parameterized = lowerer
            .jaxpr_computation(&jaxpr, &AxisEnv::new(1), &[], &[f32_vec(2)], &[f32_vec(2)])
            .expect("lowers");
        assert_eq!(parameterized.parameter_shapes().len(), 2);
        let scale = Value::vector_f32(&[4.0, 5.0]).expect("scale");
        assert_eq!(run(&parameterized, &[scale, x])[0].to_f64_vec(), vec![4.0, 5.0]);
    }

    #[test]
    fn multiple_results_are_destructured_in_order() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(4), VarId(3)],
            vec![Equation::new(
                &PAIR_P,
                [Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                [VarId(3), VarId(4)],
            )],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let computation = lowerer
            .jaxpr_computation(
                &jaxpr,
                &AxisEnv::new(1),
                &[],
                &[],
                &[XlaShape::scalar(DType::F32), f32_vec(3)],
            )
            .expect("lowers");
        assert_eq!(
            computation.result_shape(),
            &XlaShape::Tuple(vec![f32_vec(3), XlaShape::scalar(DType::F32)])
        );
    }

    #[test]
    fn missing_rule_names_the_primitive() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![Equation::new(&MISSING_P, [Atom::Var(VarId(1))], [VarId(2)])],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let err = lowerer
            .jaxpr_computation(&jaxpr, &AxisEnv::new(1), &[], &[], &[f32_vec(1)])
            .expect_err("no rule");
        assert_eq!(
            err.to_string(),
            "XLA translation rule for primitive 'test_missing' not found"
        );
    }

    #[test]
    fn shape_errors_point_at_the_equation() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(4)],
            vec![
                Equation::new(&MUL_P, [Atom::Var(VarId(1)), Atom::Var(VarId(2))], [VarId(3)]),
                Equation::new(&NEG_P, [Atom::Var(VarId(3))], [VarId(4)]),
            ],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let err = lowerer
            .jaxpr_computation(&jaxpr, &AxisEnv::new(1), &[], &[], &[f32_vec(2), f32_vec(3)])
            .expect_err("mismatched operands");
        assert!(matches!(err, XlaError::Lowering { ref primitive, .. } if primitive == "test_mul"));
    }

    #[test]
    fn collective_rules_receive_replica_groups() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![
                Equation::new(&PSUM_P, [Atom::Var(VarId(1))], [VarId(2)])
                    .with_param("axis_name", Param::Str("i".to_owned())),
            ],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let env = AxisEnv::new(2).extend("i", 2);
        let computation = lowerer
            .jaxpr_computation(&jaxpr, &env, &[], &[], &[f32_vec(1)])
            .expect("lowers");
        assert!(computation
            .nodes()
            .iter()
            .any(|node| matches!(node, jx_runtime::Node::CrossReplicaSum { .. })));

        let err = lowerer
            .jaxpr_computation(&jaxpr, &AxisEnv::new(1), &[], &[], &[f32_vec(1)])
            .expect_err("axis not in scope");
        assert!(matches!(err, XlaError::UnboundAxisName { .. }));
    }

    #[test]
    fn call_bodies_lower_as_sub_computations() {
        let body = Jaxpr::new(
            vec![VarId(11)],
            vec![VarId(10)],
            vec![VarId(12)],
            vec![Equation::new(
                &MUL_P,
                [Atom::Var(VarId(10)), Atom::Var(VarId(11))],
                [VarId(12)],
            )],
        );
        let outer = Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(3)],
            vec![
                Equation::new(&XLA_CALL_P, [Atom::Var(VarId(2))], [VarId(3)]).with_bound_subjaxpr(
                    BoundSubjaxpr {
                        jaxpr: body,
                        const_bindings: vec![Atom::Var(VarId(1))],
                        freevar_bindings: vec![],
                    },
                ),
            ],
        );
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let computation = lowerer
            .jaxpr_computation(
                &outer,
                &AxisEnv::new(1),
                &[],
                &[],
                &[XlaShape::scalar(DType::F32), XlaShape::scalar(DType::F32)],
            )
            .expect("lowers");
        assert_eq!(
            run(&computation, &[Value::scalar_f32(3.0), Value::scalar_f32(4.0)]),
            vec![Value::scalar_f32(12.0)]
        );
    }

    #[test]
    fn primitive_computation_reports_shape_rule_errors() {
        let registry = registry();
        let handlers = TypeHandlers::standard();
        let lowerer = Lowerer::new(&registry, &handlers, Platform::Cpu, false);
        let ok = lowerer
            .primitive_computation(&NEG_P, &Params::new(), &[], &[f32_vec(2)])
            .expect("lowers");
        assert_eq!(ok.result_shape(), &f32_vec(2));

        let err = lowerer
            .primitive_computation(&BROKEN_P, &Params::new(), &[], &[f32_vec(2), f32_vec(3)])
            .expect_err("shape rule rejects");
        assert!(matches!(err, XlaError::Shape(ShapeError::IncompatibleOperands { .. })));

        let err = lowerer
            .primitive_computation(&MISSING_P, &Params::new(), &[], &[f32_vec(2)])
            .expect_err("no rule");
        assert!(matches!(err, XlaError::NoTranslationRule { .. }));
    }

    #[test]
    fn replica_counts_multiply_through_nested_calls() {
        let leaf = Jaxpr::new(vec![VarId(1)], vec![], vec![VarId(1)], vec![]);
        let mapped = |body: Jaxpr, size: i64| {
            Equation::new(&XLA_CALL_P, [Atom::Var(VarId(1))], [VarId(2)])
                .with_param("axis_size", Param::Int(size))
                .with_bound_subjaxpr(BoundSubjaxpr {
                    jaxpr: body,
                    const_bindings: vec![],
                    freevar_bindings: vec![],
                })
        };
        let inner = Jaxpr::new(vec![VarId(1)], vec![], vec![VarId(2)], vec![mapped(leaf, 2)]);
        let outer = Jaxpr::new(vec![VarId(1)], vec![], vec![VarId(2)], vec![mapped(inner, 4)]);
        assert_eq!(jaxpr_replicas(&outer), 8);
        assert_eq!(
            jaxpr_replicas(&Jaxpr::new(vec![VarId(1)], vec![], vec![VarId(1)], vec![])),
            1
        );
    }

    #[test]
    fn prefetch_leaves_live_constants_readable() {
        let backend = CpuBackend::new();
        let buffer = backend
            .buffer_from_host(&Value::scalar_f32(2.0), DeviceId(0))
            .expect("buffer");
        let array = DeviceArray::new(AbstractValue::scalar(DType::F32), buffer);
        let consts: Vec<JaxRef> = vec![
            std::sync::Arc::new(array),
            host_ref(Value::scalar_f32(1.0)),
        ];
        prefetch(&consts);
        let array = consts[0].downcast_ref::<DeviceArray>().expect("device array");
        assert_eq!(array.value().expect("live"), Value::scalar_f32(2.0));
    }

    fn array_is_deleted(value: &JaxRef) -> bool {
        value
            .downcast_ref::<DeviceArray>()
            .is_some_and(DeviceArray::is_deleted)
    }

    #[test]
    fn prefetch_ignores_deleted_arrays() {
        let backend = CpuBackend::new();
        let buffer = backend
            .buffer_from_host(&Value::scalar_f32(1.0), DeviceId(0))
            .expect("buffer");
        let array = DeviceArray::new(AbstractValue::scalar(DType::F32), buffer);
        array.delete().expect("delete");
        let consts: Vec<JaxRef> = vec![std::sync::Arc::new(array)];
        prefetch(&consts);
        assert!(array_is_deleted(&consts[0]));
    }
}
