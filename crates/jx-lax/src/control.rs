use crate::shaped;
use jx_core::{AbstractValue, DType, Params, Primitive, ShapeError};
use jx_interpreters::{InitialStyleArgs, TranslationRegistry, XlaError};
use jx_runtime::{XlaBuilder, XlaOp};

fn cond_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    let Some((pred, operands)) = args.split_first() else {
        return Err(ShapeError::Arity {
            primitive: "cond".to_owned(),
            expected: 2,
            actual: 0,
        });
    };
    let pred = shaped("cond", pred)?;
    if pred.dtype != DType::Bool || pred.shape.rank() != 0 {
        return Err(ShapeError::UnsupportedOperand {
            primitive: "cond".to_owned(),
            operand: pred.to_string(),
        });
    }
    let first = operands.first().ok_or_else(|| ShapeError::Arity {
        primitive: "cond".to_owned(),
        expected: 2,
        actual: args.len(),
    })?;
    Ok(vec![AbstractValue::Shaped(shaped("cond", first)?)])
}

/// Picks between two branch programs on a scalar bool. Operands are
/// `[pred, args...]`; `sub_jaxprs` holds the true branch then the false
/// branch, each mapping `args` to one value with the aval of `args[0]`.
///
/// Both branches are lowered inline and evaluated; the result is a select.
pub static COND_P: Primitive = Primitive::new("cond", cond_eval);

fn malformed(detail: String) -> XlaError {
    XlaError::MalformedEquation {
        primitive: "cond".to_owned(),
        detail,
    }
}

fn lower_branch(
    c: &mut XlaBuilder,
    style: &InitialStyleArgs<'_>,
    branch: &jx_core::Jaxpr,
    operands: &[XlaOp],
) -> Result<XlaOp, XlaError> {
    let outs = style
        .lowerer
        .lower_inline(c, branch, style.axis_env, &[], &[], operands)?;
    match outs.as_slice() {
        [out] => Ok(*out),
        other => Err(malformed(format!(
            "branch produced {} outputs, expected 1",
            other.len()
        ))),
    }
}

fn cond_rule(
    c: &mut XlaBuilder,
    style: &InitialStyleArgs<'_>,
    args: &[XlaOp],
    _: &Params,
) -> Result<XlaOp, XlaError> {
    let Some((pred, operands)) = args.split_first() else {
        return Err(malformed("missing predicate".to_owned()));
    };
    let [on_true, on_false] = style.sub_jaxprs else {
        return Err(malformed(format!(
            "expected 2 branch programs, got {}",
            style.sub_jaxprs.len()
        )));
    };
    let true_out = lower_branch(c, style, on_true, operands)?;
    let false_out = lower_branch(c, style, on_false, operands)?;
    Ok(c.select(*pred, true_out, false_out))
}

pub(crate) fn register(registry: &mut TranslationRegistry) {
    registry.register_initial_style(&COND_P, cond_rule);
}
