//! Canned jaxprs used by tests and benchmarks across the workspace.

use crate::{
    ADD_P, COND_P, COS_P, EXP_P, LOG_P, MUL_P, NEG_P, PSUM_P, REDUCE_SUM_P, REPLICATED_CALL_P, SIN_P,
};
use jx_core::{Atom, BoundSubjaxpr, Equation, Jaxpr, Literal, Param, Primitive, VarId};
use jx_interpreters::XLA_CALL_P;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramSpec {
    /// `x + y`
    Add2,
    /// `x * x`
    Square,
    /// `x * x + 2 * x`, with a float literal.
    SquarePlusLinear,
    /// `x + 1.0`
    AddOne,
    SinX,
    CosX,
    /// `log(x)`; negative inputs produce NaN.
    LogX,
    /// Sum of a vector over axis 0.
    ReduceSumVec,
    /// `x * c` with one constvar `c`.
    ScaleByConst,
    /// One `xla_call` returning `(s * s, v + v)` for a scalar `s` and vector
    /// `v`.
    CallScalarAndVector,
    /// `cond(p, x)` picking `neg(x)` or `exp(x)`.
    CondNegExp,
    /// A `replicated_call` over `n` replicas whose body returns
    /// `psum(x) + x`.
    ReplicatedPsum(u32),
}

fn unary_program(primitive: &'static Primitive) -> Jaxpr {
    Jaxpr::new(
        vec![VarId(1)],
        vec![],
        vec![VarId(2)],
        vec![Equation::new(primitive, [Atom::Var(VarId(1))], [VarId(2)])],
    )
}

#[must_use]
pub fn build_program(spec: ProgramSpec) -> Jaxpr {
    match spec {
        ProgramSpec::Add2 => Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(3)],
            vec![Equation::new(
                &ADD_P,
                [Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                [VarId(3)],
            )],
        ),
        ProgramSpec::Square => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![Equation::new(
                &MUL_P,
                [Atom::Var(VarId(1)), Atom::Var(VarId(1))],
                [VarId(2)],
            )],
        ),
        ProgramSpec::SquarePlusLinear => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(4)],
            vec![
                Equation::new(&MUL_P, [Atom::Var(VarId(1)), Atom::Var(VarId(1))], [VarId(2)]),
                Equation::new(
                    &MUL_P,
                    [Atom::Var(VarId(1)), Atom::Lit(Literal::from_f32(2.0))],
                    [VarId(3)],
                ),
                Equation::new(&ADD_P, [Atom::Var(VarId(2)), Atom::Var(VarId(3))], [VarId(4)]),
            ],
        ),
        ProgramSpec::AddOne => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![Equation::new(
                &ADD_P,
                [Atom::Var(VarId(1)), Atom::Lit(Literal::from_f32(1.0))],
                [VarId(2)],
            )],
        ),
        ProgramSpec::SinX => unary_program(&SIN_P),
        ProgramSpec::CosX => unary_program(&COS_P),
        ProgramSpec::LogX => unary_program(&LOG_P),
        ProgramSpec::ReduceSumVec => Jaxpr::new(
            vec![VarId(1)],
            vec![],
            vec![VarId(2)],
            vec![
                Equation::new(&REDUCE_SUM_P, [Atom::Var(VarId(1))], [VarId(2)])
                    .with_param("axes", Param::Ints(vec![0])),
            ],
        ),
        ProgramSpec::ScaleByConst => Jaxpr::new(
            vec![VarId(2)],
            vec![VarId(1)],
            vec![VarId(3)],
            vec![Equation::new(
                &MUL_P,
                [Atom::Var(VarId(2)), Atom::Var(VarId(1))],
                [VarId(3)],
            )],
        ),
        ProgramSpec::CallScalarAndVector => {
            let body = Jaxpr::new(
                vec![VarId(10), VarId(11)],
                vec![],
                vec![VarId(12), VarId(13)],
                vec![
                    Equation::new(
                        &MUL_P,
                        [Atom::Var(VarId(10)), Atom::Var(VarId(10))],
                        [VarId(12)],
                    ),
                    Equation::new(
                        &ADD_P,
                        [Atom::Var(VarId(11)), Atom::Var(VarId(11))],
                        [VarId(13)],
                    ),
                ],
            );
            Jaxpr::new(
                vec![VarId(1), VarId(2)],
                vec![],
                vec![VarId(3), VarId(4)],
                vec![
                    Equation::new(
                        &XLA_CALL_P,
                        [Atom::Var(VarId(1)), Atom::Var(VarId(2))],
                        [VarId(3), VarId(4)],
                    )
                    .with_bound_subjaxpr(BoundSubjaxpr {
                        jaxpr: body,
                        const_bindings: vec![],
                        freevar_bindings: vec![],
                    }),
                ],
            )
        }
        ProgramSpec::CondNegExp => Jaxpr::new(
            vec![VarId(1), VarId(2)],
            vec![],
            vec![VarId(3)],
            vec![
                Equation::new(&COND_P, [Atom::Var(VarId(1)), Atom::Var(VarId(2))], [VarId(3)])
                    .with_sub_jaxprs(vec![unary_program(&NEG_P), unary_program(&EXP_P)]),
            ],
        ),
        ProgramSpec::ReplicatedPsum(axis_size) => {
            let body = Jaxpr::new(
                vec![VarId(10)],
                vec![],
                vec![VarId(12)],
                vec![
                    Equation::new(&PSUM_P, [Atom::Var(VarId(10))], [VarId(11)])
                        .with_param("axis_name", Param::Str("i".to_owned())),
                    Equation::new(
                        &ADD_P,
                        [Atom::Var(VarId(11)), Atom::Var(VarId(10))],
                        [VarId(12)],
                    ),
                ],
            );
            Jaxpr::new(
                vec![VarId(1)],
                vec![],
                vec![VarId(2)],
                vec![
                    Equation::new(&REPLICATED_CALL_P, [Atom::Var(VarId(1))], [VarId(2)])
                        .with_param("axis_name", Param::Str("i".to_owned()))
                        .with_param("axis_size", Param::Int(i64::from(axis_size)))
                        .with_bound_subjaxpr(BoundSubjaxpr {
                            jaxpr: body,
                            const_bindings: vec![],
                            freevar_bindings: vec![],
                        }),
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_interpreters::jaxpr_replicas;

    #[test]
    fn every_program_is_well_formed() {
        let specs = [
            ProgramSpec::Add2,
            ProgramSpec::Square,
            ProgramSpec::SquarePlusLinear,
            ProgramSpec::AddOne,
            ProgramSpec::SinX,
            ProgramSpec::CosX,
            ProgramSpec::LogX,
            ProgramSpec::ReduceSumVec,
            ProgramSpec::ScaleByConst,
            ProgramSpec::CallScalarAndVector,
            ProgramSpec::CondNegExp,
            ProgramSpec::ReplicatedPsum(2),
        ];
        for spec in specs {
            build_program(spec)
                .validate_well_formed()
                .unwrap_or_else(|err| panic!("{spec:?}: {err}"));
        }
    }

    #[test]
    fn replica_requirements() {
        assert_eq!(jaxpr_replicas(&build_program(ProgramSpec::Square)), 1);
        assert_eq!(jaxpr_replicas(&build_program(ProgramSpec::CondNegExp)), 1);
        assert_eq!(
            jaxpr_replicas(&build_program(ProgramSpec::ReplicatedPsum(8))),
            8
        );
    }
}
