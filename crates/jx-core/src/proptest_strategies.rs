//! Shared proptest strategies for jaxpr-shaped inputs.

use crate::{Atom, DType, Equation, Jaxpr, Literal, Primitive, Shape, VarId};
use proptest::prelude::*;

pub fn arb_dtype() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::Bool),
        Just(DType::I32),
        Just(DType::I64),
        Just(DType::U32),
        Just(DType::U64),
        Just(DType::F32),
        Just(DType::F64),
    ]
}

pub fn arb_shape() -> impl Strategy<Value = Shape> {
    prop::collection::vec(0_u32..5, 0..4).prop_map(Shape::new)
}

pub fn arb_literal() -> impl Strategy<Value = Literal> {
    prop_oneof![
        any::<bool>().prop_map(Literal::Bool),
        any::<i32>().prop_map(Literal::I32),
        any::<i64>().prop_map(Literal::I64),
        any::<f32>().prop_map(Literal::from_f32),
        any::<f64>().prop_map(Literal::from_f64),
    ]
}

pub fn arb_chain_length() -> impl Strategy<Value = u32> {
    1_u32..12
}

/// `v0 -> prim(v0, v0) -> prim(v1, v0) -> ...`, `len` equations deep.
#[must_use]
pub fn chain_jaxpr(primitive: &'static Primitive, len: u32) -> Jaxpr {
    let equations = (1..=len)
        .map(|idx| {
            Equation::new(
                primitive,
                [Atom::Var(VarId(idx - 1)), Atom::Var(VarId(0))],
                [VarId(idx)],
            )
        })
        .collect();
    Jaxpr::new(vec![VarId(0)], vec![], vec![VarId(len)], equations)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cast_is_idempotent(lit in arb_literal(), dtype in arb_dtype()) {
        let once = lit.cast(dtype);
        prop_assert_eq!(once.dtype(), dtype);
        let twice = once.cast(dtype);
        // NaN payloads are preserved bit-for-bit, so plain equality holds.
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_shape_element_count_matches_product(shape in arb_shape()) {
        let expected: u64 = shape.dims.iter().map(|dim| u64::from(*dim)).product();
        prop_assert_eq!(shape.element_count(), Some(expected));
    }
}
