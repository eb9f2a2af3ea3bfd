use crate::{check_arity, full_like, operands, shaped};
use jx_core::{AbstractValue, DType, Params, Primitive, Shape, ShapeError};
use jx_interpreters::{TranslationRegistry, XlaError};
use jx_runtime::{BinaryOp, Platform, UnaryOp, XlaBuilder, XlaOp};

// ── Shape rules ────────────────────────────────────────────────────

fn unary_shape(
    primitive: &str,
    args: &[AbstractValue],
    float_only: bool,
) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity(primitive, args, 1)?;
    let operand = shaped(primitive, &args[0])?;
    let accepted = if float_only {
        operand.dtype.is_floating()
    } else {
        operand.dtype != DType::Bool
    };
    if !accepted {
        return Err(ShapeError::UnsupportedOperand {
            primitive: primitive.to_owned(),
            operand: operand.to_string(),
        });
    }
    Ok(vec![AbstractValue::Shaped(operand)])
}

/// Operands must share a dtype; a rank-0 operand broadcasts against the
/// other.
fn binary_shape(
    primitive: &str,
    args: &[AbstractValue],
    comparison: bool,
) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity(primitive, args, 2)?;
    let lhs = shaped(primitive, &args[0])?;
    let rhs = shaped(primitive, &args[1])?;
    let incompatible = || ShapeError::IncompatibleOperands {
        primitive: primitive.to_owned(),
        lhs: lhs.to_string(),
        rhs: rhs.to_string(),
    };
    if lhs.dtype != rhs.dtype {
        return Err(incompatible());
    }
    if lhs.dtype == DType::Bool && !comparison {
        return Err(ShapeError::UnsupportedOperand {
            primitive: primitive.to_owned(),
            operand: lhs.to_string(),
        });
    }
    let shape: Shape = if lhs.shape == rhs.shape || rhs.shape.rank() == 0 {
        lhs.shape.clone()
    } else if lhs.shape.rank() == 0 {
        rhs.shape.clone()
    } else {
        return Err(incompatible());
    };
    let dtype = if comparison { DType::Bool } else { lhs.dtype };
    Ok(vec![AbstractValue::shaped(dtype, shape)])
}

fn neg_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("neg", args, false)
}

fn abs_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("abs", args, false)
}

fn sin_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("sin", args, true)
}

fn cos_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("cos", args, true)
}

fn exp_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("exp", args, true)
}

fn log_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("log", args, true)
}

fn log1p_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("log1p", args, true)
}

fn sqrt_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    unary_shape("sqrt", args, true)
}

fn add_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("add", args, false)
}

fn sub_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("sub", args, false)
}

fn mul_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("mul", args, false)
}

fn div_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("div", args, false)
}

fn max_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("max", args, false)
}

fn min_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("min", args, false)
}

fn eq_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("eq", args, true)
}

fn lt_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    binary_shape("lt", args, true)
}

pub static NEG_P: Primitive = Primitive::new("neg", neg_eval);
pub static ABS_P: Primitive = Primitive::new("abs", abs_eval);
pub static SIN_P: Primitive = Primitive::new("sin", sin_eval);
pub static COS_P: Primitive = Primitive::new("cos", cos_eval);
pub static EXP_P: Primitive = Primitive::new("exp", exp_eval);
pub static LOG_P: Primitive = Primitive::new("log", log_eval);
pub static LOG1P_P: Primitive = Primitive::new("log1p", log1p_eval);
pub static SQRT_P: Primitive = Primitive::new("sqrt", sqrt_eval);
pub static ADD_P: Primitive = Primitive::new("add", add_eval);
pub static SUB_P: Primitive = Primitive::new("sub", sub_eval);
pub static MUL_P: Primitive = Primitive::new("mul", mul_eval);
pub static DIV_P: Primitive = Primitive::new("div", div_eval);
pub static MAX_P: Primitive = Primitive::new("max", max_eval);
pub static MIN_P: Primitive = Primitive::new("min", min_eval);
pub static EQ_P: Primitive = Primitive::new("eq", eq_eval);
pub static LT_P: Primitive = Primitive::new("lt", lt_eval);

// ── Translation rules ──────────────────────────────────────────────

fn unary_rule(
    primitive: &'static Primitive,
    op: UnaryOp,
) -> impl Fn(&mut XlaBuilder, &[XlaOp], &Params) -> Result<XlaOp, XlaError> + Send + Sync + 'static
{
    move |c: &mut XlaBuilder, args: &[XlaOp], _: &Params| {
        let [x] = operands::<1>(primitive.name(), args)?;
        Ok(c.unary(op, x))
    }
}

fn binary_rule(
    primitive: &'static Primitive,
    op: BinaryOp,
) -> impl Fn(&mut XlaBuilder, &[XlaOp], &Params) -> Result<XlaOp, XlaError> + Send + Sync + 'static
{
    move |c: &mut XlaBuilder, args: &[XlaOp], _: &Params| {
        let [lhs, rhs] = operands::<2>(primitive.name(), args)?;
        let (lhs, rhs) = broadcast_scalar_operand(c, lhs, rhs)?;
        Ok(c.binary(op, lhs, rhs))
    }
}

/// Broadcasts a rank-0 operand up to the other operand's dims.
fn broadcast_scalar_operand(
    c: &mut XlaBuilder,
    lhs: XlaOp,
    rhs: XlaOp,
) -> Result<(XlaOp, XlaOp), XlaError> {
    let lhs_dims = c.get_shape(lhs)?.dimensions().to_vec();
    let rhs_dims = c.get_shape(rhs)?.dimensions().to_vec();
    Ok(match (lhs_dims.is_empty(), rhs_dims.is_empty()) {
        (true, false) => (c.broadcast(lhs, &rhs_dims), rhs),
        (false, true) => (lhs, c.broadcast(rhs, &lhs_dims)),
        _ => (lhs, rhs),
    })
}

/// `log(1 + x)` for backends without a fused kernel.
fn log1p_expanded(c: &mut XlaBuilder, args: &[XlaOp], _: &Params) -> Result<XlaOp, XlaError> {
    let [x] = operands::<1>("log1p", args)?;
    let one = full_like(c, x, 1.0)?;
    let shifted = c.add(x, one);
    Ok(c.unary(UnaryOp::Log, shifted))
}

pub(crate) fn register(registry: &mut TranslationRegistry) {
    let unaries: [(&'static Primitive, UnaryOp); 7] = [
        (&NEG_P, UnaryOp::Neg),
        (&ABS_P, UnaryOp::Abs),
        (&SIN_P, UnaryOp::Sin),
        (&COS_P, UnaryOp::Cos),
        (&EXP_P, UnaryOp::Exp),
        (&LOG_P, UnaryOp::Log),
        (&SQRT_P, UnaryOp::Sqrt),
    ];
    for (primitive, op) in unaries {
        registry.register_generic(primitive, unary_rule(primitive, op));
    }
    registry.register_generic(&LOG1P_P, log1p_expanded);
    registry.register_platform(Platform::Cpu, &LOG1P_P, unary_rule(&LOG1P_P, UnaryOp::Log1p));

    let binaries: [(&'static Primitive, BinaryOp); 8] = [
        (&ADD_P, BinaryOp::Add),
        (&SUB_P, BinaryOp::Sub),
        (&MUL_P, BinaryOp::Mul),
        (&DIV_P, BinaryOp::Div),
        (&MAX_P, BinaryOp::Max),
        (&MIN_P, BinaryOp::Min),
        (&EQ_P, BinaryOp::Eq),
        (&LT_P, BinaryOp::Lt),
    ];
    for (primitive, op) in binaries {
        registry.register_generic(primitive, binary_rule(primitive, op));
    }
}
