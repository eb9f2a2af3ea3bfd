use crate::{check_arity, missing_param, operands, shaped};
use jx_core::{AbstractValue, DType, ParamLookup, Params, Primitive, Shape, ShapeError};
use jx_interpreters::{TranslationRegistry, XlaError};
use jx_runtime::{XlaBuilder, XlaOp};
use std::collections::BTreeSet;

fn axes_param(primitive: &str, params: &Params, rank: usize) -> Result<Vec<usize>, ShapeError> {
    let raw = params
        .get_ints("axes")
        .ok_or_else(|| missing_param(primitive, "axes"))?;
    let mut seen = BTreeSet::new();
    raw.iter()
        .map(|axis| {
            let axis = usize::try_from(*axis)
                .ok()
                .filter(|axis| *axis < rank && seen.insert(*axis));
            axis.ok_or_else(|| ShapeError::Invalid {
                primitive: primitive.to_owned(),
                detail: format!("axes {raw:?} are not distinct axes of a rank-{rank} operand"),
            })
        })
        .collect()
}

fn sizes_param(primitive: &str, params: &Params) -> Result<Vec<u32>, ShapeError> {
    let raw = params
        .get_ints("sizes")
        .ok_or_else(|| missing_param(primitive, "sizes"))?;
    raw.iter()
        .map(|size| {
            u32::try_from(*size).map_err(|_| ShapeError::Invalid {
                primitive: primitive.to_owned(),
                detail: format!("broadcast size {size} is out of range"),
            })
        })
        .collect()
}

fn reduce_sum_eval(args: &[AbstractValue], params: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity("reduce_sum", args, 1)?;
    let operand = shaped("reduce_sum", &args[0])?;
    if operand.dtype == DType::Bool {
        return Err(ShapeError::UnsupportedOperand {
            primitive: "reduce_sum".to_owned(),
            operand: operand.to_string(),
        });
    }
    let axes = axes_param("reduce_sum", params, operand.shape.rank())?;
    let dims: Vec<u32> = operand
        .shape
        .dims
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, dim)| *dim)
        .collect();
    Ok(vec![AbstractValue::shaped(operand.dtype, Shape::new(dims))])
}

fn broadcast_eval(args: &[AbstractValue], params: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity("broadcast", args, 1)?;
    let operand = shaped("broadcast", &args[0])?;
    let mut dims = sizes_param("broadcast", params)?;
    dims.extend_from_slice(&operand.shape.dims);
    Ok(vec![AbstractValue::shaped(operand.dtype, Shape::new(dims))])
}

fn convert_element_type_eval(
    args: &[AbstractValue],
    params: &Params,
) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity("convert_element_type", args, 1)?;
    let operand = shaped("convert_element_type", &args[0])?;
    let dtype = params
        .get_dtype("new_dtype")
        .ok_or_else(|| missing_param("convert_element_type", "new_dtype"))?;
    Ok(vec![AbstractValue::shaped(dtype, operand.shape)])
}

fn select_eval(args: &[AbstractValue], _: &Params) -> Result<Vec<AbstractValue>, ShapeError> {
    check_arity("select", args, 3)?;
    let pred = shaped("select", &args[0])?;
    let on_true = shaped("select", &args[1])?;
    let on_false = shaped("select", &args[2])?;
    if pred.dtype != DType::Bool {
        return Err(ShapeError::UnsupportedOperand {
            primitive: "select".to_owned(),
            operand: pred.to_string(),
        });
    }
    if on_true != on_false || (pred.shape.rank() != 0 && pred.shape != on_true.shape) {
        return Err(ShapeError::IncompatibleOperands {
            primitive: "select".to_owned(),
            lhs: on_true.to_string(),
            rhs: on_false.to_string(),
        });
    }
    Ok(vec![AbstractValue::Shaped(on_true)])
}

/// Sums over the `axes` param.
pub static REDUCE_SUM_P: Primitive = Primitive::new("reduce_sum", reduce_sum_eval);
/// Prepends the `sizes` param to the operand's dims.
pub static BROADCAST_P: Primitive = Primitive::new("broadcast", broadcast_eval);
pub static CONVERT_ELEMENT_TYPE_P: Primitive =
    Primitive::new("convert_element_type", convert_element_type_eval);
pub static SELECT_P: Primitive = Primitive::new("select", select_eval);

fn malformed(primitive: &str, err: ShapeError) -> XlaError {
    XlaError::MalformedEquation {
        primitive: primitive.to_owned(),
        detail: err.to_string(),
    }
}

fn reduce_sum_rule(c: &mut XlaBuilder, args: &[XlaOp], params: &Params) -> Result<XlaOp, XlaError> {
    let [x] = operands::<1>("reduce_sum", args)?;
    let rank = c.get_shape(x)?.dimensions().len();
    let axes = axes_param("reduce_sum", params, rank).map_err(|err| malformed("reduce_sum", err))?;
    Ok(c.reduce_sum(x, &axes))
}

fn broadcast_rule(c: &mut XlaBuilder, args: &[XlaOp], params: &Params) -> Result<XlaOp, XlaError> {
    let [x] = operands::<1>("broadcast", args)?;
    let sizes = sizes_param("broadcast", params).map_err(|err| malformed("broadcast", err))?;
    Ok(c.broadcast(x, &sizes))
}

fn convert_element_type_rule(
    c: &mut XlaBuilder,
    args: &[XlaOp],
    params: &Params,
) -> Result<XlaOp, XlaError> {
    let [x] = operands::<1>("convert_element_type", args)?;
    let dtype = params.get_dtype("new_dtype").ok_or_else(|| {
        malformed(
            "convert_element_type",
            missing_param("convert_element_type", "new_dtype"),
        )
    })?;
    Ok(c.convert_element_type(x, dtype))
}

fn select_rule(c: &mut XlaBuilder, args: &[XlaOp], _: &Params) -> Result<XlaOp, XlaError> {
    let [pred, on_true, on_false] = operands::<3>("select", args)?;
    Ok(c.select(pred, on_true, on_false))
}

pub(crate) fn register(registry: &mut TranslationRegistry) {
    registry.register_generic(&REDUCE_SUM_P, reduce_sum_rule);
    registry.register_generic(&BROADCAST_P, broadcast_rule);
    registry.register_generic(&CONVERT_ELEMENT_TYPE_P, convert_element_type_rule);
    registry.register_generic(&SELECT_P, select_rule);
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_core::Param;

    fn params(key: &str, value: Param) -> Params {
        let mut params = Params::new();
        params.insert(key.to_owned(), value);
        params
    }

    #[test]
    fn reduce_sum_drops_reduced_axes() {
        let aval = AbstractValue::shaped(DType::F32, Shape::new([2, 3, 4]));
        let out = REDUCE_SUM_P
            .abstract_eval(&[aval.clone()], &params("axes", Param::Ints(vec![0, 2])))
            .expect("reduces");
        assert_eq!(out, vec![AbstractValue::shaped(DType::F32, Shape::vector(3))]);

        for bad in [vec![3], vec![1, 1], vec![-1]] {
            let err = REDUCE_SUM_P
                .abstract_eval(&[aval.clone()], &params("axes", Param::Ints(bad)))
                .expect_err("bad axes");
            assert!(matches!(err, ShapeError::Invalid { .. }));
        }
        let err = REDUCE_SUM_P
            .abstract_eval(&[aval], &Params::new())
            .expect_err("no axes");
        assert!(matches!(err, ShapeError::MissingParam { .. }));
    }

    #[test]
    fn broadcast_prepends_sizes() {
        let out = BROADCAST_P
            .abstract_eval(
                &[AbstractValue::shaped(DType::I32, Shape::vector(3))],
                &params("sizes", Param::Ints(vec![2])),
            )
            .expect("broadcasts");
        assert_eq!(
            out,
            vec![AbstractValue::shaped(DType::I32, Shape::new([2, 3]))]
        );
    }

    #[test]
    fn convert_element_type_keeps_shape() {
        let out = CONVERT_ELEMENT_TYPE_P
            .abstract_eval(
                &[AbstractValue::shaped(DType::I32, Shape::vector(2))],
                &params("new_dtype", Param::DType(DType::F32)),
            )
            .expect("converts");
        assert_eq!(out, vec![AbstractValue::shaped(DType::F32, Shape::vector(2))]);
    }

    #[test]
    fn select_requires_bool_predicate_and_matching_branches() {
        let branch = AbstractValue::shaped(DType::F32, Shape::vector(2));
        let pred = AbstractValue::scalar(DType::Bool);
        assert!(
            SELECT_P
                .abstract_eval(&[pred.clone(), branch.clone(), branch.clone()], &Params::new())
                .is_ok()
        );
        let err = SELECT_P
            .abstract_eval(
                &[AbstractValue::scalar(DType::F32), branch.clone(), branch.clone()],
                &Params::new(),
            )
            .expect_err("float predicate");
        assert!(matches!(err, ShapeError::UnsupportedOperand { .. }));
        let err = SELECT_P
            .abstract_eval(
                &[pred, branch, AbstractValue::scalar(DType::F32)],
                &Params::new(),
            )
            .expect_err("branch mismatch");
        assert!(matches!(err, ShapeError::IncompatibleOperands { .. }));
    }
}
