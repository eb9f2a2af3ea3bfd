//! Primitives every lowering needs regardless of which op library is loaded.

use crate::error::XlaError;
use crate::registry::TranslationRegistry;
use jx_core::{AbstractValue, Literal, Params, Primitive, ShapeError, Value};
use jx_runtime::{XlaBuilder, XlaOp, XlaShape};
use std::sync::Arc;

fn expect_arity(
    primitive: &str,
    args: &[AbstractValue],
    expected: usize,
) -> Result<(), ShapeError> {
    if args.len() != expected {
        return Err(ShapeError::Arity {
            primitive: primitive.to_owned(),
            expected,
            actual: args.len(),
        });
    }
    Ok(())
}

fn unary_passthrough(
    primitive: &str,
    args: &[AbstractValue],
) -> Result<Vec<AbstractValue>, ShapeError> {
    expect_arity(primitive, args, 1)?;
    Ok(vec![args[0].to_shaped()])
}

fn identity_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_passthrough("id", args)
}

fn zeros_like_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_passthrough("zeros_like", args)
}

fn device_put_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_passthrough("device_put", args)
}

fn add_jaxvals_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    expect_arity("add_any", args, 2)?;
    let (lhs, rhs) = (args[0].to_shaped(), args[1].to_shaped());
    if lhs != rhs {
        return Err(ShapeError::IncompatibleOperands {
            primitive: "add_any".to_owned(),
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        });
    }
    Ok(vec![lhs])
}

fn xla_call_eval(_: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    Err(ShapeError::Invalid {
        primitive: "xla_call".to_owned(),
        detail: "output avals come from tracing the called program".to_owned(),
    })
}

pub static IDENTITY_P: Primitive = Primitive::new("id", identity_eval);
pub static ZEROS_LIKE_P: Primitive = Primitive::new("zeros_like", zeros_like_eval);
pub static ADD_JAXVALS_P: Primitive = Primitive::new("add_any", add_jaxvals_eval);
pub static DEVICE_PUT_P: Primitive = Primitive::new("device_put", device_put_eval);
/// Calls a traced program as one compiled unit.
pub static XLA_CALL_P: Primitive = Primitive::with_multiple_results("xla_call", xla_call_eval);

/// A zero of the same shape as `x`; the empty tuple for unit.
pub fn zeros_like(c: &mut XlaBuilder, x: XlaOp) -> Result<XlaOp, XlaError> {
    match c.get_shape(x)? {
        XlaShape::Array { dtype, dims } => {
            let zero = c.constant(Value::Scalar(Literal::zero(dtype)));
            Ok(c.broadcast(zero, &dims))
        }
        XlaShape::Tuple(_) => Ok(c.tuple(&[])),
    }
}

/// Adds two values of the same type; unit plus unit is unit.
pub fn add_jaxvals(c: &mut XlaBuilder, x: XlaOp, y: XlaOp) -> Result<XlaOp, XlaError> {
    if c.get_shape(x)?.is_unit() {
        return Ok(x);
    }
    Ok(c.add(x, y))
}

fn single_arg(args: &[XlaOp], what: &'static str) -> Result<XlaOp, XlaError> {
    match args {
        [x] => Ok(*x),
        _ => Err(XlaError::Arity {
            what,
            expected: 1,
            actual: args.len(),
        }),
    }
}

pub fn register_core_translations(registry: &mut TranslationRegistry) {
    registry.register_generic(&IDENTITY_P, |_, args, _| single_arg(args, "id operands"));
    registry.register_generic(&DEVICE_PUT_P, |_, args, _| single_arg(args, "device_put operands"));
    registry.register_generic(&ZEROS_LIKE_P, |c, args, _| match args {
        [x] => zeros_like(c, *x),
        _ => Err(XlaError::Arity {
            what: "zeros_like operands",
            expected: 1,
            actual: args.len(),
        }),
    });
    registry.register_generic(&ADD_JAXVALS_P, |c, args, _| match args {
        [x, y] => add_jaxvals(c, *x, *y),
        _ => Err(XlaError::Arity {
            what: "add_any operands",
            expected: 2,
            actual: args.len(),
        }),
    });
    registry.register_call(&XLA_CALL_P, |c, call, env_nodes, in_nodes, _| {
        let env_shapes = env_nodes
            .iter()
            .map(|node| c.get_shape(*node))
            .collect::<Result<Vec<_>, _>>()?;
        let in_shapes = in_nodes
            .iter()
            .map(|node| c.get_shape(*node))
            .collect::<Result<Vec<_>, _>>()?;
        let subc = call.lowerer.jaxpr_computation(
            call.subjaxpr,
            call.axis_env,
            &[],
            &env_shapes,
            &in_shapes,
        )?;
        let operands: Vec<XlaOp> = env_nodes.iter().chain(in_nodes).copied().collect();
        Ok(c.call(Arc::new(subc), &operands))
    });
}
