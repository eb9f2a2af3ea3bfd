#![forbid(unsafe_code)]

//! A small primitive library: element-wise arithmetic, reductions and shape
//! ops, a collective (`psum`), a replicated call, and a two-way `cond`.
//! Every primitive carries its shape rule and its translation rule.

mod arithmetic;
mod control;
mod parallel;
mod programs;
mod shape_ops;

pub use arithmetic::{
    ABS_P, ADD_P, COS_P, DIV_P, EQ_P, EXP_P, LOG_P, LOG1P_P, LT_P, MAX_P, MIN_P, MUL_P, NEG_P,
    SIN_P, SQRT_P, SUB_P,
};
pub use control::COND_P;
pub use parallel::{PSUM_P, REPLICATED_CALL_P};
pub use programs::{ProgramSpec, build_program};
pub use shape_ops::{BROADCAST_P, CONVERT_ELEMENT_TYPE_P, REDUCE_SUM_P, SELECT_P};

use jx_core::{AbstractValue, Literal, ShapeError, ShapedArray, Value};
use jx_interpreters::{TranslationRegistry, XlaError, register_core_translations};
use jx_runtime::{XlaBuilder, XlaOp, XlaShape};

/// Registers the translation rules of every primitive in this crate.
pub fn register_lax_translations(registry: &mut TranslationRegistry) {
    arithmetic::register(registry);
    shape_ops::register(registry);
    parallel::register(registry);
    control::register(registry);
}

/// Core translations plus this crate's primitives.
#[must_use]
pub fn standard_translations() -> TranslationRegistry {
    let mut registry = TranslationRegistry::new();
    register_core_translations(&mut registry);
    register_lax_translations(&mut registry);
    registry
}

// ── Shared shape-rule helpers ──────────────────────────────────────

pub(crate) fn check_arity(
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

pub(crate) fn shaped(primitive: &str, aval: &AbstractValue) -> Result<ShapedArray, ShapeError> {
    aval.as_shaped()
        .cloned()
        .ok_or_else(|| ShapeError::UnsupportedOperand {
            primitive: primitive.to_owned(),
            operand: aval.to_string(),
        })
}

pub(crate) fn missing_param(primitive: &str, param: &str) -> ShapeError {
    ShapeError::MissingParam {
        primitive: primitive.to_owned(),
        param: param.to_owned(),
    }
}

// ── Shared translation helpers ─────────────────────────────────────

pub(crate) fn operands<const N: usize>(
    primitive: &str,
    args: &[XlaOp],
) -> Result<[XlaOp; N], XlaError> {
    <[XlaOp; N]>::try_from(args).map_err(|_| XlaError::MalformedEquation {
        primitive: primitive.to_owned(),
        detail: format!("expected {N} operands, got {}", args.len()),
    })
}

/// A constant with `x`'s dtype and dims, every element `value`.
pub(crate) fn full_like(c: &mut XlaBuilder, x: XlaOp, value: f64) -> Result<XlaOp, XlaError> {
    match c.get_shape(x)? {
        XlaShape::Array { dtype, dims } => {
            let scalar = c.constant(Value::Scalar(Literal::from_f64(value).cast(dtype)));
            Ok(if dims.is_empty() {
                scalar
            } else {
                c.broadcast(scalar, &dims)
            })
        }
        tuple @ XlaShape::Tuple(_) => Err(XlaError::UnsupportedType {
            kind: "full_like",
            type_name: tuple.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_core::{DType, Shape};
    use jx_runtime::Platform;
    use jx_interpreters::RuleKind;

    #[test]
    fn standard_registry_covers_every_rule_kind() {
        let registry = standard_translations();
        assert_eq!(registry.rule_kind(Platform::Cpu, &ADD_P), Some(RuleKind::Generic));
        assert_eq!(registry.rule_kind(Platform::Cpu, &LOG1P_P), Some(RuleKind::Platform));
        assert_eq!(registry.rule_kind(Platform::Gpu, &LOG1P_P), Some(RuleKind::Generic));
        assert_eq!(registry.rule_kind(Platform::Cpu, &PSUM_P), Some(RuleKind::Collective));
        assert_eq!(
            registry.rule_kind(Platform::Cpu, &REPLICATED_CALL_P),
            Some(RuleKind::Call)
        );
        assert_eq!(registry.rule_kind(Platform::Cpu, &COND_P), Some(RuleKind::InitialStyle));
        assert_eq!(
            registry.rule_kind(Platform::Cpu, &jx_interpreters::XLA_CALL_P),
            Some(RuleKind::Call)
        );
    }

    #[test]
    fn full_like_matches_operand_shape() {
        let mut c = XlaBuilder::new("full");
        let x = c.parameter(0, XlaShape::array(DType::I32, [4]));
        let ones = full_like(&mut c, x, 1.0).expect("full");
        assert_eq!(
            c.get_shape(ones).expect("shape"),
            XlaShape::array(DType::I32, [4])
        );
        let unit = c.tuple(&[]);
        assert!(full_like(&mut c, unit, 1.0).is_err());
    }

    #[test]
    fn operands_checks_count() {
        let mut c = XlaBuilder::new("ops");
        let x = c.parameter(0, XlaShape::scalar(DType::F32));
        assert_eq!(operands::<1>("neg", &[x]).expect("one"), [x]);
        let err = operands::<2>("add", &[x]).expect_err("too few");
        assert_eq!(
            err.to_string(),
            "malformed `add` equation: expected 2 operands, got 1"
        );
    }

    #[test]
    fn shaped_rejects_unit() {
        assert!(shaped("neg", &AbstractValue::Unit).is_err());
        let aval = AbstractValue::shaped(DType::F32, Shape::vector(2));
        assert_eq!(
            shaped("neg", &aval).expect("shaped"),
            ShapedArray::new(DType::F32, Shape::vector(2))
        );
    }
}
