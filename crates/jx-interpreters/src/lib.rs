#![forbid(unsafe_code)]

//! Jaxpr interpretation: op-by-op evaluation, lowering to backend
//! computations, the host/device value bridge, and device value lifecycles.

pub mod bridge;
pub mod core_rules;
pub mod device;
pub mod error;
pub mod lowering;
pub mod registry;

pub use bridge::{
    PutContext, ResultHandler, ResultTuple, TypeHandlers, aval_from_xla_shape,
    multi_result_handler,
};
pub use core_rules::{
    ADD_JAXVALS_P, DEVICE_PUT_P, IDENTITY_P, XLA_CALL_P, ZEROS_LIKE_P, register_core_translations,
};
pub use device::{DeviceArray, DeviceConstant, FilledConstant, LazyConstant};
pub use error::XlaError;
pub use lowering::{Lowerer, jaxpr_replicas, prefetch, xla_destructure};
pub use registry::{
    AxisEnv, CallArgs, CallRule, CollectiveRule, InitialStyleArgs, InitialStyleRule, RuleKind,
    TranslationRegistry, TranslationRule, replica_groups,
};

use jx_core::{Atom, BoundSubjaxpr, Equation, Jaxpr, Literal, VarId};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterpreterError {
    #[error("{what} arity mismatch: expected {expected}, got {actual}")]
    InputArity {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("missing variable {0}")]
    MissingVariable(VarId),
    #[error("`{primitive}` produced {actual} outputs for {expected} output vars")]
    OutputArity {
        primitive: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Per-equation semantics plugged into [`eval_jaxpr`].
pub trait EquationEvaluator {
    type Value: Clone;
    type Error: From<InterpreterError>;

    /// The value an inline literal reads as.
    fn literal(&mut self, literal: Literal) -> Result<Self::Value, Self::Error>;

    /// The value bound to [`VarId::UNIT`].
    fn unit(&mut self) -> Self::Value;

    /// Applies one equation without a bound sub-program. Returns one value
    /// per output var.
    fn apply(
        &mut self,
        eqn: &Equation,
        args: Vec<Self::Value>,
    ) -> Result<Vec<Self::Value>, Self::Error>;

    /// Applies a call-style equation. The default evaluates the body in
    /// place, treating `env_values` as its constants followed by its free
    /// variables.
    fn apply_call(
        &mut self,
        _eqn: &Equation,
        bound: &BoundSubjaxpr,
        env_values: Vec<Self::Value>,
        args: Vec<Self::Value>,
    ) -> Result<Vec<Self::Value>, Self::Error> {
        let split = bound.const_bindings.len().min(env_values.len());
        let (consts, freevars) = env_values.split_at(split);
        eval_jaxpr(&bound.jaxpr, consts, freevars, &args, self)
    }
}

/// Evaluates `jaxpr` one equation at a time.
pub fn eval_jaxpr<E: EquationEvaluator + ?Sized>(
    jaxpr: &Jaxpr,
    consts: &[E::Value],
    freevars: &[E::Value],
    args: &[E::Value],
    evaluator: &mut E,
) -> Result<Vec<E::Value>, E::Error> {
    let sections = [
        ("constvars", &jaxpr.constvars, consts),
        ("freevars", &jaxpr.freevars, freevars),
        ("invars", &jaxpr.invars, args),
    ];
    let mut env: FxHashMap<VarId, E::Value> = FxHashMap::default();
    env.insert(VarId::UNIT, evaluator.unit());
    for (what, vars, values) in sections {
        if vars.len() != values.len() {
            return Err(InterpreterError::InputArity {
                what,
                expected: vars.len(),
                actual: values.len(),
            }
            .into());
        }
        for (var, value) in vars.iter().zip(values) {
            env.insert(*var, value.clone());
        }
    }

    for eqn in &jaxpr.equations {
        let inputs = read_atoms(&env, &eqn.inputs, evaluator)?;
        let outputs = match &eqn.bound_subjaxpr {
            Some(bound) => {
                let env_atoms: Vec<Atom> = bound
                    .const_bindings
                    .iter()
                    .chain(&bound.freevar_bindings)
                    .cloned()
                    .collect();
                let env_values = read_atoms(&env, &env_atoms, evaluator)?;
                evaluator.apply_call(eqn, bound, env_values, inputs)?
            }
            None => evaluator.apply(eqn, inputs)?,
        };
        if outputs.len() != eqn.outputs.len() {
            return Err(InterpreterError::OutputArity {
                primitive: eqn.primitive.name(),
                expected: eqn.outputs.len(),
                actual: outputs.len(),
            }
            .into());
        }
        for (var, value) in eqn.outputs.iter().zip(outputs) {
            env.insert(*var, value);
        }
    }

    jaxpr
        .outvars
        .iter()
        .map(|var| {
            env.get(var)
                .cloned()
                .ok_or_else(|| InterpreterError::MissingVariable(*var).into())
        })
        .collect()
}

fn read_atoms<E: EquationEvaluator + ?Sized>(
    env: &FxHashMap<VarId, E::Value>,
    atoms: &[Atom],
    evaluator: &mut E,
) -> Result<Vec<E::Value>, E::Error> {
    atoms
        .iter()
        .map(|atom| match atom {
            Atom::Var(var) => env
                .get(var)
                .cloned()
                .ok_or_else(|| InterpreterError::MissingVariable(*var).into()),
            Atom::Lit(literal) => evaluator.literal(*literal),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_core::{AbstractValue, Params, Primitive, ShapeError};

    fn passthrough(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
        Ok(args.to_vec())
    }

    static SUM_P: Primitive = Primitive::new("test_sum", passthrough);
    static SWAP_P: Primitive = Primitive::with_multiple_results("test_swap", passthrough);
    static CALL_P: Primitive = Primitive::with_multiple_results("test_call", passthrough);

    /// Integer arithmetic over plain `i64`s, counting applied equations.
    #[derive(Default)]
    struct IntEvaluator {
        applied: Vec<&'static str>,
    }

    impl EquationEvaluator for IntEvaluator {
        type Value = i64;
        type Error = InterpreterError;

        fn literal(&mut self, literal: Literal) -> Result<i64, InterpreterError> {
            Ok(literal.as_i64())
        }

        fn unit(&mut self) -> i64 {
            0
        }

        fn apply(&mut self, eqn: &Equation, args: Vec<i64>) -> Result<Vec<i64>, InterpreterError> {
            self.applied.push(eqn.primitive.name());
            Ok(match eqn.primitive.name() {
                "test_sum" => vec![args.iter().sum()],
                _ => args.into_iter().rev().collect(),
            })
        }
    }

    #[test]
    fn evaluates_equations_in_order() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![VarId(0)],
            vec![VarId(5), VarId(4)],
            vec![
                Equation::new(
                    &SUM_P,
                    [Atom::Var(VarId(0)), Atom::Var(VarId(1)), Atom::Lit(Literal::I64(10))],
                    [VarId(3)],
                ),
                Equation::new(
                    &SWAP_P,
                    [Atom::Var(VarId(3)), Atom::Var(VarId(2))],
                    [VarId(4), VarId(5)],
                ),
            ],
        );
        let mut evaluator = IntEvaluator::default();
        let out = eval_jaxpr(&jaxpr, &[100], &[], &[1, 2], &mut evaluator).expect("evaluates");
        assert_eq!(out, vec![111, 2]);
        assert_eq!(evaluator.applied, vec!["test_sum", "test_swap"]);
    }

    #[test]
    fn call_bodies_recurse_with_bound_environment() {
        let body = Jaxpr::new(
            vec![VarId(11)],
            vec![VarId(10)],
            vec![VarId(12)],
            vec![Equation::new(
                &SUM_P,
                [Atom::Var(VarId(10)), Atom::Var(VarId(11))],
                [VarId(12)],
            )],
        );
        let outer = Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![
                Equation::new(&CALL_P, [Atom::Var(VarId(1))], [VarId(2)]).with_bound_subjaxpr(
                    BoundSubjaxpr {
                        jaxpr: body,
                        const_bindings: vec![Atom::Lit(Literal::I64(7))],
                        freevar_bindings: vec![],
                    },
                ),
            ],
        );
        let mut evaluator = IntEvaluator::default();
        let out = eval_jaxpr(&outer, &[], &[], &[5], &mut evaluator).expect("evaluates");
        assert_eq!(out, vec![12]);
        assert_eq!(evaluator.applied, vec!["test_sum"]);
    }

    #[test]
    fn arity_and_binding_errors_are_reported() {
        let jaxpr = Jaxpr::new(vec![VarId(1)], vec![], vec![VarId(9)], vec![]);
        let mut evaluator = IntEvaluator::default();
        assert_eq!(
            eval_jaxpr(&jaxpr, &[], &[], &[], &mut evaluator),
            Err(InterpreterError::InputArity {
                what: "invars",
                expected: 1,
                actual: 0,
            })
        );
        assert_eq!(
            eval_jaxpr(&jaxpr, &[], &[], &[1], &mut evaluator),
            Err(InterpreterError::MissingVariable(VarId(9)))
        );
    }

    #[test]
    fn output_count_must_match_output_vars() {
        let jaxpr = Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![Equation::new(&SWAP_P, [Atom::Var(VarId(1)), Atom::Var(VarId(1))], [VarId(2)])],
        );
        let err = eval_jaxpr(&jaxpr, &[], &[], &[3], &mut IntEvaluator::default())
            .expect_err("two results for one var");
        assert_eq!(
            err,
            InterpreterError::OutputArity {
                primitive: "test_swap",
                expected: 1,
                actual: 2,
            }
        );
    }
}
