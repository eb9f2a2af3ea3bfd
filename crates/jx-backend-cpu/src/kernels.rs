//! Host kernels for the builder's node kinds.
//!
//! Floating-point math runs in `f64`, signed integers in wrapping `i64`, and
//! unsigned integers in wrapping `u64`; results are cast back to the operand
//! dtype, so narrow integer overflow wraps the way device arithmetic does.

use jx_core::{DType, Literal, Shape, Value};
use jx_runtime::{BackendError, BinaryOp, UnaryOp};

fn failed(detail: impl Into<String>) -> BackendError {
    BackendError::ExecutionFailed {
        detail: detail.into(),
    }
}

fn dims_of(value: &Value) -> Result<Vec<u32>, BackendError> {
    value
        .shape()
        .map(|shape| shape.dims)
        .ok_or_else(|| failed("expected an array value, got unit"))
}

fn dtype_of(value: &Value) -> Result<DType, BackendError> {
    value
        .dtype()
        .ok_or_else(|| failed("expected an array value, got unit"))
}

fn rebuild(dtype: DType, dims: Vec<u32>, elements: Vec<Literal>) -> Result<Value, BackendError> {
    Value::from_elements(dtype, Shape::new(dims), elements).map_err(|err| failed(err.to_string()))
}

fn strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1_usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1] as usize;
    }
    strides
}

fn element_total(dims: &[u32]) -> usize {
    dims.iter().map(|dim| *dim as usize).product()
}

// ── Elementwise ────────────────────────────────────────────────────

fn unary_literal(op: UnaryOp, literal: Literal) -> Literal {
    let dtype = literal.dtype();
    let float = |f: fn(f64) -> f64| Literal::from_f64(f(literal.as_f64())).cast(dtype);
    match op {
        UnaryOp::IsNan => Literal::Bool(literal.is_nan()),
        UnaryOp::Neg if dtype.is_floating() => float(|x| -x),
        UnaryOp::Neg if dtype.is_unsigned_integer() => {
            Literal::U64(literal.as_u64().wrapping_neg()).cast(dtype)
        }
        UnaryOp::Neg => Literal::I64(literal.as_i64().wrapping_neg()).cast(dtype),
        UnaryOp::Abs if dtype.is_floating() => float(f64::abs),
        UnaryOp::Abs if dtype.is_unsigned_integer() => literal,
        UnaryOp::Abs => Literal::I64(literal.as_i64().wrapping_abs()).cast(dtype),
        UnaryOp::Sin => float(f64::sin),
        UnaryOp::Cos => float(f64::cos),
        UnaryOp::Exp => float(f64::exp),
        UnaryOp::Log => float(f64::ln),
        UnaryOp::Log1p => float(f64::ln_1p),
        UnaryOp::Sqrt => float(f64::sqrt),
    }
}

fn nan_aware(x: f64, y: f64, pick: fn(f64, f64) -> f64) -> f64 {
    if x.is_nan() || y.is_nan() {
        f64::NAN
    } else {
        pick(x, y)
    }
}

fn binary_literal(op: BinaryOp, lhs: Literal, rhs: Literal) -> Result<Literal, BackendError> {
    let dtype = lhs.dtype();
    if dtype.is_floating() {
        let (x, y) = (lhs.as_f64(), rhs.as_f64());
        let value = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Max => nan_aware(x, y, f64::max),
            BinaryOp::Min => nan_aware(x, y, f64::min),
            BinaryOp::Eq => return Ok(Literal::Bool(x == y)),
            BinaryOp::Lt => return Ok(Literal::Bool(x < y)),
        };
        return Ok(Literal::from_f64(value).cast(dtype));
    }
    if dtype == DType::Bool {
        let (x, y) = (lhs.as_bool(), rhs.as_bool());
        return match op {
            BinaryOp::Max => Ok(Literal::Bool(x || y)),
            BinaryOp::Min => Ok(Literal::Bool(x && y)),
            BinaryOp::Eq => Ok(Literal::Bool(x == y)),
            BinaryOp::Lt => Ok(Literal::Bool(!x && y)),
            other => Err(failed(format!("{} is undefined for bool", other.as_str()))),
        };
    }
    if dtype.is_unsigned_integer() {
        let (x, y) = (lhs.as_u64(), rhs.as_u64());
        let value = match op {
            BinaryOp::Add => x.wrapping_add(y),
            BinaryOp::Sub => x.wrapping_sub(y),
            BinaryOp::Mul => x.wrapping_mul(y),
            BinaryOp::Div => x
                .checked_div(y)
                .ok_or_else(|| failed("integer division by zero"))?,
            BinaryOp::Max => x.max(y),
            BinaryOp::Min => x.min(y),
            BinaryOp::Eq => return Ok(Literal::Bool(x == y)),
            BinaryOp::Lt => return Ok(Literal::Bool(x < y)),
        };
        return Ok(Literal::U64(value).cast(dtype));
    }
    let (x, y) = (lhs.as_i64(), rhs.as_i64());
    let value = match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::Div => {
            if y == 0 {
                return Err(failed("integer division by zero"));
            }
            x.wrapping_div(y)
        }
        BinaryOp::Max => x.max(y),
        BinaryOp::Min => x.min(y),
        BinaryOp::Eq => return Ok(Literal::Bool(x == y)),
        BinaryOp::Lt => return Ok(Literal::Bool(x < y)),
    };
    Ok(Literal::I64(value).cast(dtype))
}

pub(crate) fn unary(op: UnaryOp, operand: &Value) -> Result<Value, BackendError> {
    let dtype = dtype_of(operand)?;
    let out_dtype = if op == UnaryOp::IsNan { DType::Bool } else { dtype };
    let elements = operand
        .elements()
        .iter()
        .map(|literal| unary_literal(op, *literal))
        .collect();
    rebuild(out_dtype, dims_of(operand)?, elements)
}

pub(crate) fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, BackendError> {
    let dtype = dtype_of(lhs)?;
    if lhs.elements().len() != rhs.elements().len() {
        return Err(failed(format!(
            "{} operands have {} and {} elements",
            op.as_str(),
            lhs.elements().len(),
            rhs.elements().len()
        )));
    }
    let elements = lhs
        .elements()
        .iter()
        .zip(rhs.elements())
        .map(|(x, y)| binary_literal(op, *x, *y))
        .collect::<Result<Vec<_>, _>>()?;
    let out_dtype = if op.is_comparison() { DType::Bool } else { dtype };
    rebuild(out_dtype, dims_of(lhs)?, elements)
}

// ── Shape manipulation ─────────────────────────────────────────────

pub(crate) fn broadcast(operand: &Value, sizes: &[u32]) -> Result<Value, BackendError> {
    let dtype = dtype_of(operand)?;
    let operand_dims = dims_of(operand)?;
    let mut dims = sizes.to_vec();
    dims.extend_from_slice(&operand_dims);
    let source = operand.elements();
    let total = element_total(&dims);
    let elements = if source.is_empty() {
        Vec::new()
    } else {
        (0..total).map(|idx| source[idx % source.len()]).collect()
    };
    rebuild(dtype, dims, elements)
}

pub(crate) fn broadcast_in_dim(
    operand: &Value,
    shape: &[u32],
    broadcast_dimensions: &[usize],
) -> Result<Value, BackendError> {
    let dtype = dtype_of(operand)?;
    let operand_dims = dims_of(operand)?;
    let operand_strides = strides(&operand_dims);
    let out_strides = strides(shape);
    let source = operand.elements();
    let elements = (0..element_total(shape))
        .map(|flat| {
            let mut source_index = 0;
            for (axis, target) in broadcast_dimensions.iter().enumerate() {
                if operand_dims[axis] != 1 {
                    let coordinate = (flat / out_strides[*target]) % shape[*target] as usize;
                    source_index += coordinate * operand_strides[axis];
                }
            }
            source[source_index]
        })
        .collect();
    rebuild(dtype, shape.to_vec(), elements)
}

pub(crate) fn reduce_sum(operand: &Value, axes: &[usize]) -> Result<Value, BackendError> {
    let dtype = dtype_of(operand)?;
    let dims = dims_of(operand)?;
    let in_strides = strides(&dims);
    let kept: Vec<usize> = (0..dims.len()).filter(|axis| !axes.contains(axis)).collect();
    let out_dims: Vec<u32> = kept.iter().map(|axis| dims[*axis]).collect();
    let out_strides = strides(&out_dims);
    let mut sums = vec![Literal::zero(dtype); element_total(&out_dims)];
    for (flat, literal) in operand.elements().iter().enumerate() {
        let out_index: usize = kept
            .iter()
            .zip(&out_strides)
            .map(|(axis, stride)| ((flat / in_strides[*axis]) % dims[*axis] as usize) * stride)
            .sum();
        sums[out_index] = binary_literal(BinaryOp::Add, sums[out_index], *literal)?;
    }
    rebuild(dtype, out_dims, sums)
}

pub(crate) fn select(pred: &Value, on_true: &Value, on_false: &Value) -> Result<Value, BackendError> {
    let dtype = dtype_of(on_true)?;
    let flags = pred.elements();
    let elements = on_true
        .elements()
        .iter()
        .zip(on_false.elements())
        .enumerate()
        .map(|(idx, (t, f))| {
            let flag = if flags.len() == 1 { flags[0] } else { flags[idx] };
            if flag.as_bool() { *t } else { *f }
        })
        .collect();
    rebuild(dtype, dims_of(on_true)?, elements)
}

/// Elementwise sum of same-shaped values, used for cross-replica reductions.
pub(crate) fn sum_all(values: &[&Value]) -> Result<Value, BackendError> {
    let (first, rest) = values
        .split_first()
        .ok_or_else(|| failed("cannot sum an empty replica group"))?;
    rest.iter()
        .try_fold((*first).clone(), |acc, value| binary(BinaryOp::Add, &acc, value))
}
