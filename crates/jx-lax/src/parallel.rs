//! Replication: a cross-replica sum and a call that maps its body over a
//! named replica axis.

use crate::{check_arity, shaped};
use jx_core::{AbstractValue, ParamLookup, Params, Primitive, ShapeError};
use jx_interpreters::{CallArgs, TranslationRegistry, XlaError};
use jx_runtime::{XlaBuilder, XlaOp};
use std::sync::Arc;

fn psum_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity("psum", args, 1)?;
    Ok(vec![AbstractValue::Shaped(shaped("psum", &args[0])?)])
}

fn replicated_call_eval(
    _: &[AbstractValue],
    _: &Params,
) -> Result<Vec<AbstractValue>, ShapeError> {
    Err(ShapeError::Invalid {
        primitive: "replicated_call".to_owned(),
        detail: "output avals come from tracing the mapped program".to_owned(),
    })
}

/// Sums its operand over the replicas named by the `axis_name` param.
pub static PSUM_P: Primitive = Primitive::new("psum", psum_eval);

/// Runs its body once per replica along a new axis. Params: `axis_name`
/// (string) and `axis_size` (int).
pub static REPLICATED_CALL_P: Primitive =
    Primitive::with_multiple_results("replicated_call", replicated_call_eval);

fn psum_rule(
    c: &mut XlaBuilder,
    args: &[XlaOp],
    groups: &[Vec<usize>],
    _: &Params,
) -> Result<XlaOp, XlaError> {
    let [x] = crate::operands::<1>("psum", args)?;
    Ok(c.cross_replica_sum(x, groups))
}

fn replicated_call_rule(
    c: &mut XlaBuilder,
    call: &CallArgs<'_>,
    env_nodes: &[XlaOp],
    in_nodes: &[XlaOp],
    params: &Params,
) -> Result<XlaOp, XlaError> {
    let malformed = |detail: &str| XlaError::MalformedEquation {
        primitive: "replicated_call".to_owned(),
        detail: detail.to_owned(),
    };
    let name = params
        .get_str("axis_name")
        .ok_or_else(|| malformed("missing string param `axis_name`"))?;
    let size = params
        .get_int("axis_size")
        .and_then(|size| usize::try_from(size).ok())
        .filter(|size| *size > 0)
        .ok_or_else(|| malformed("missing positive int param `axis_size`"))?;
    let env_shapes = env_nodes
        .iter()
        .map(|node| c.get_shape(*node))
        .collect::<Result<Vec<_>, _>>()?;
    let in_shapes = in_nodes
        .iter()
        .map(|node| c.get_shape(*node))
        .collect::<Result<Vec<_>, _>>()?;
    let axis_env = call.axis_env.extend(name, size);
    let body = call
        .lowerer
        .jaxpr_computation(call.subjaxpr, &axis_env, &[], &env_shapes, &in_shapes)?;
    let operands: Vec<XlaOp> = env_nodes.iter().chain(in_nodes).copied().collect();
    Ok(c.call(Arc::new(body), &operands))
}

pub(crate) fn register(registry: &mut TranslationRegistry) {
    registry.register_collective(&PSUM_P, psum_rule);
    registry.register_call(&REPLICATED_CALL_P, replicated_call_rule);
}
