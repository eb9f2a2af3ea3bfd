//! Op-by-op evaluation, used as the de-optimized path for whole programs.

use crate::DispatchError;
use crate::runtime::{XlaRuntime, unpack_results};
use jx_core::{Equation, JaxRef, Literal, Value, host_ref};
use jx_interpreters::EquationEvaluator;

/// Runs every equation through [`XlaRuntime::apply_primitive_with`];
/// call-style bodies are evaluated in place.
#[derive(Debug)]
pub struct OpByOpEvaluator<'rt> {
    runtime: &'rt XlaRuntime,
}

impl<'rt> OpByOpEvaluator<'rt> {
    #[must_use]
    pub fn new(runtime: &'rt XlaRuntime) -> Self {
        Self { runtime }
    }
}

impl EquationEvaluator for OpByOpEvaluator<'_> {
    type Value = JaxRef;
    type Error = DispatchError;

    fn literal(&mut self, literal: Literal) -> Result<JaxRef, DispatchError> {
        Ok(host_ref(Value::Scalar(literal)))
    }

    fn unit(&mut self) -> JaxRef {
        host_ref(Value::Unit)
    }

    fn apply(&mut self, eqn: &Equation, args: Vec<JaxRef>) -> Result<Vec<JaxRef>, DispatchError> {
        let result =
            self.runtime
                .apply_primitive_with(eqn.primitive, &eqn.params, &eqn.sub_jaxprs, &args)?;
        unpack_results(eqn.primitive, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_backend_cpu::CpuBackend;
    use jx_core::VarId;
    use jx_interpreters::{DeviceArray, eval_jaxpr};
    use jx_lax::{ProgramSpec, build_program};
    use jx_runtime::RuntimeConfig;
    use std::sync::Arc;

    fn host(value: &JaxRef) -> Value {
        match value.downcast_ref::<DeviceArray>() {
            Some(array) => array.value().expect("live"),
            None => value.downcast_ref::<Value>().expect("host value").clone(),
        }
    }

    #[test]
    fn evaluates_literals_and_nested_calls() {
        let rt = XlaRuntime::new(RuntimeConfig::default(), Arc::new(CpuBackend::new()));
        let mut evaluator = OpByOpEvaluator::new(&rt);

        let jaxpr = build_program(ProgramSpec::SquarePlusLinear);
        let out = eval_jaxpr(
            &jaxpr,
            &[],
            &[],
            &[host_ref(Value::scalar_f32(3.0))],
            &mut evaluator,
        )
        .expect("evaluates");
        assert_eq!(host(&out[0]), Value::scalar_f32(15.0));

        let jaxpr = build_program(ProgramSpec::CallScalarAndVector);
        let out = eval_jaxpr(
            &jaxpr,
            &[],
            &[],
            &[
                host_ref(Value::scalar_f32(2.0)),
                host_ref(Value::vector_f32(&[1.0, 2.0, 3.0]).expect("vector")),
            ],
            &mut evaluator,
        )
        .expect("evaluates");
        assert_eq!(host(&out[0]), Value::scalar_f32(4.0));
        assert_eq!(
            host(&out[1]),
            Value::vector_f32(&[2.0, 4.0, 6.0]).expect("vector")
        );
    }

    #[test]
    fn unit_reads_as_host_unit() {
        let rt = XlaRuntime::new(RuntimeConfig::default(), Arc::new(CpuBackend::new()));
        let mut evaluator = OpByOpEvaluator::new(&rt);
        let jaxpr = jx_core::Jaxpr::new(vec![], vec![], vec![VarId::UNIT], vec![]);
        let out = eval_jaxpr(&jaxpr, &[], &[], &[], &mut evaluator).expect("evaluates");
        assert_eq!(host(&out[0]), Value::Unit);
    }
}
