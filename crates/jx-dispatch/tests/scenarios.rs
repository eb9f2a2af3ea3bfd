#![forbid(unsafe_code)]

//! End-to-end dispatch scenarios on the CPU backend.
//!
//! Every runtime here sits on a [`CountingBackend`] so compile and transfer
//! traffic can be asserted alongside results.

use jx_backend_cpu::CpuBackend;
use jx_cache::CompileError;
use jx_core::{AbstractValue, DType, JaxRef, Params, Shape, Value, host_ref};
use jx_dispatch::{DispatchError, XlaRuntime};
use jx_interpreters::{DeviceArray, XlaError};
use jx_lax::{ADD_P, LOG_P, NEG_P, ProgramSpec, build_program};
use jx_runtime::{BackendRef, DeviceId, RuntimeConfig};
use jx_test_utils::CountingBackend;
use std::sync::Arc;

fn counting_runtime(config: RuntimeConfig, devices: u32) -> (XlaRuntime, Arc<CountingBackend>) {
    let cpu: BackendRef = Arc::new(CpuBackend::with_device_count(devices));
    let counting = CountingBackend::new(cpu);
    let runtime = XlaRuntime::new(config, counting.clone() as BackendRef);
    (runtime, counting)
}

fn host_value(value: &JaxRef) -> Value {
    value
        .downcast_ref::<DeviceArray>()
        .expect("device array")
        .value()
        .expect("live array")
}

fn f32_vec(values: &[f32]) -> JaxRef {
    host_ref(Value::vector_f32(values).expect("vector"))
}

// ── Single primitives ───────────────────────────────────────────────

#[test]
fn repeated_primitive_application_compiles_once() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 1);
    let avals = [
        AbstractValue::scalar(DType::F32),
        AbstractValue::scalar(DType::F32),
    ];
    let first = rt
        .primitive_callable(&ADD_P, &Params::new(), &[], &avals)
        .expect("compiles");
    let second = rt
        .primitive_callable(&ADD_P, &Params::new(), &[], &avals)
        .expect("cached");
    assert!(Arc::ptr_eq(first.compiled(), second.compiled()));
    assert_eq!(counting.compile_count(), 1);

    for step in 0..3 {
        let out = rt
            .apply_primitive(
                &ADD_P,
                &[
                    host_ref(Value::scalar_f32(step as f32)),
                    host_ref(Value::scalar_f32(1.0)),
                ],
                &Params::new(),
            )
            .expect("adds");
        assert_eq!(host_value(&out), Value::scalar_f32(step as f32 + 1.0));
    }
    assert_eq!(counting.compile_count(), 1);
    assert_eq!(rt.cache_stats().primitive_executables.misses, 1);
}

#[test]
fn new_argument_shapes_trigger_a_new_compile() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 1);
    rt.apply_primitive(
        &ADD_P,
        &[f32_vec(&[1.0, 2.0]), f32_vec(&[3.0, 4.0])],
        &Params::new(),
    )
    .expect("adds pairs");
    rt.apply_primitive(
        &ADD_P,
        &[f32_vec(&[1.0, 2.0, 3.0]), f32_vec(&[3.0, 4.0, 5.0])],
        &Params::new(),
    )
    .expect("adds triples");
    assert_eq!(counting.compile_count(), 2);
}

// ── Whole programs ──────────────────────────────────────────────────

#[test]
fn nested_call_returns_one_device_array_per_output() {
    let (rt, _) = counting_runtime(RuntimeConfig::default(), 1);
    let jaxpr = build_program(ProgramSpec::CallScalarAndVector);
    let outs = rt
        .xla_call(
            &jaxpr,
            &[],
            &[host_ref(Value::scalar_f32(3.0)), f32_vec(&[1.0, 2.0, 3.0])],
            None,
        )
        .expect("runs");
    assert_eq!(outs.len(), 2);

    let scalar = outs[0].downcast_ref::<DeviceArray>().expect("device array");
    let vector = outs[1].downcast_ref::<DeviceArray>().expect("device array");
    assert_eq!(scalar.shape().expect("live"), Shape::scalar());
    assert_eq!(vector.shape().expect("live"), Shape::vector(3));
    assert_eq!(scalar.value().expect("host"), Value::scalar_f32(9.0));
    assert_eq!(
        vector.value().expect("host"),
        Value::vector_f32(&[2.0, 4.0, 6.0]).expect("vector")
    );
}

#[test]
fn program_constants_are_embedded() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 1);
    let jaxpr = build_program(ProgramSpec::ScaleByConst);
    let scale = host_ref(Value::scalar_f32(4.0));
    for x in [1.0_f32, 2.5] {
        let outs = rt
            .xla_call(
                &jaxpr,
                std::slice::from_ref(&scale),
                &[host_ref(Value::scalar_f32(x))],
                None,
            )
            .expect("runs");
        assert_eq!(host_value(&outs[0]), Value::scalar_f32(x * 4.0));
    }
    assert_eq!(counting.compile_count(), 1);
}

#[test]
fn replacement_constants_never_hit_a_stale_graph() {
    let (rt, _) = counting_runtime(RuntimeConfig::default(), 1);
    let jaxpr = build_program(ProgramSpec::ScaleByConst);
    for i in 0..8_u8 {
        let offset = f32::from(i);
        let scale = host_ref(Value::scalar_f32(3.0 + offset));
        rt.cache()
            .jaxpr_computation(
                &rt.compile_context(),
                &jaxpr,
                &[scale],
                &[AbstractValue::scalar(DType::F32)],
            )
            .expect("lowers");

        let replacement = 1000.0 + offset;
        let outs = rt
            .xla_call(
                &jaxpr,
                &[host_ref(Value::scalar_f32(replacement))],
                &[host_ref(Value::scalar_f32(1.0))],
                None,
            )
            .expect("runs");
        assert_eq!(host_value(&outs[0]), Value::scalar_f32(replacement));
    }
}

#[test]
fn edited_programs_are_recompiled() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 1);
    let mut jaxpr = build_program(ProgramSpec::SinX);
    let x = [host_ref(Value::scalar_f32(1.0))];
    rt.xla_call(&jaxpr, &[], &x, None).expect("sin runs");

    jaxpr.equations[0].primitive = &NEG_P;
    let outs = rt.xla_call(&jaxpr, &[], &x, None).expect("neg runs");
    assert_eq!(host_value(&outs[0]), Value::scalar_f32(-1.0));
    assert_eq!(counting.compile_count(), 2);
}

#[test]
fn xla_call_checks_argument_count() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 1);
    let jaxpr = build_program(ProgramSpec::Add2);
    let err = rt
        .xla_call(&jaxpr, &[], &[host_ref(Value::scalar_f32(1.0))], None)
        .expect_err("missing argument");
    assert_eq!(
        err,
        DispatchError::ArgumentCount {
            expected: 2,
            actual: 1,
        }
    );
    assert_eq!(counting.compile_count(), 0);
}

// ── NaN checking ────────────────────────────────────────────────────

#[test]
fn debug_nans_names_the_producing_primitive() {
    let (rt, _) = counting_runtime(RuntimeConfig::default().with_debug_nans(true), 1);
    let jaxpr = build_program(ProgramSpec::LogX);
    let args = [f32_vec(&[1.0, -1.0, 2.0])];
    let avals = rt.abstractify_all(&args).expect("avals");
    let callable = rt.xla_callable(&jaxpr, &[], &avals, None).expect("compiles");
    assert_eq!(
        callable.call(&args).expect_err("nan"),
        DispatchError::NumericInstability {
            primitive: "log".to_owned(),
        }
    );
}

#[test]
fn debug_nans_falls_back_to_op_by_op_evaluation() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default().with_debug_nans(true), 1);
    let jaxpr = build_program(ProgramSpec::LogX);
    let err = rt
        .xla_call(&jaxpr, &[], &[f32_vec(&[1.0, -1.0, 2.0])], None)
        .expect_err("nan survives the fallback");
    assert_eq!(
        err,
        DispatchError::NumericInstability {
            primitive: "log".to_owned(),
        }
    );
    // The program, then `log` on its own.
    assert_eq!(counting.compile_count(), 2);
    assert_eq!(rt.cache_stats().jaxpr_executables.misses, 1);
    assert_eq!(rt.cache_stats().primitive_executables.misses, 1);
}

#[test]
fn nans_pass_through_when_checking_is_off() {
    let (rt, _) = counting_runtime(RuntimeConfig::default(), 1);
    let jaxpr = build_program(ProgramSpec::LogX);
    let outs = rt
        .xla_call(&jaxpr, &[], &[f32_vec(&[1.0, -1.0, 2.0])], None)
        .expect("runs");
    let value = host_value(&outs[0]);
    assert!(value.contains_nan());
    let elements = value.to_f64_vec();
    assert_eq!(elements[0], 0.0);
    assert!(elements[1].is_nan());

    let single = rt
        .apply_primitive(&LOG_P, &[host_ref(Value::scalar_f32(-1.0))], &Params::new())
        .expect("no check");
    assert!(host_value(&single).contains_nan());
}

// ── Replication ─────────────────────────────────────────────────────

#[test]
fn replicated_program_sums_across_replicas() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 4);
    let jaxpr = build_program(ProgramSpec::ReplicatedPsum(4));
    let outs = rt
        .xla_call(&jaxpr, &[], &[host_ref(Value::scalar_f32(1.5))], None)
        .expect("runs");
    assert_eq!(host_value(&outs[0]), Value::scalar_f32(7.5));
    assert_eq!(counting.compiled().last().map(|(_, reps)| *reps), Some(4));
}

#[test]
fn replica_oversubscription_fails_before_compiling() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 4);
    let jaxpr = build_program(ProgramSpec::ReplicatedPsum(8));
    let err = rt
        .xla_call(&jaxpr, &[], &[host_ref(Value::scalar_f32(1.0))], None)
        .expect_err("needs eight devices");
    assert_eq!(
        err,
        DispatchError::Compile(CompileError::ReplicaOversubscription {
            required: 8,
            available: 4,
        })
    );
    assert!(err.to_string().contains("requires 8 replicas"));
    assert_eq!(counting.compile_count(), 0);
}

#[test]
fn pinned_device_assignment_places_outputs() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 2);
    let jaxpr = build_program(ProgramSpec::AddOne);
    let outs = rt
        .xla_call(
            &jaxpr,
            &[],
            &[host_ref(Value::scalar_f32(1.0))],
            Some(&[DeviceId(1)]),
        )
        .expect("runs on device 1");
    let array = outs[0].downcast_ref::<DeviceArray>().expect("device array");
    assert_eq!(array.device().expect("live"), DeviceId(1));
    assert_eq!(array.value().expect("host"), Value::scalar_f32(2.0));

    rt.xla_call(
        &jaxpr,
        &[],
        &[host_ref(Value::scalar_f32(1.0))],
        Some(&[DeviceId(0)]),
    )
    .expect("runs on device 0");
    assert_eq!(counting.compile_count(), 2);
    assert_eq!(rt.cache_stats().jaxpr_computations.misses, 1);
}

// ── Device values ───────────────────────────────────────────────────

#[test]
fn device_put_preserves_the_abstract_value() {
    let (rt, counting) = counting_runtime(RuntimeConfig::default(), 1);
    for value in [
        host_ref(Value::scalar_f32(2.0)),
        host_ref(Value::scalar_i32(7)),
        f32_vec(&[1.0, 2.0, 3.0]),
    ] {
        let placed = rt.device_put(&value, DeviceId(0)).expect("placed");
        assert_eq!(
            rt.abstractify(&placed).expect("aval"),
            rt.abstractify(&value).expect("aval")
        );
    }
    assert_eq!(counting.transfer_count(), 3);
}

#[test]
fn deleting_a_device_array_twice_fails() {
    let (rt, _) = counting_runtime(RuntimeConfig::default(), 1);
    let placed = rt
        .device_put(&f32_vec(&[1.0, 2.0]), DeviceId(0))
        .expect("placed");
    let array = placed.downcast_ref::<DeviceArray>().expect("device array");
    array.delete().expect("first delete");
    assert!(array.is_deleted());
    assert_eq!(array.delete().expect_err("deleted"), XlaError::UseAfterDelete);
    assert_eq!(array.value().expect_err("deleted"), XlaError::UseAfterDelete);
}

#[test]
fn device_values_feed_back_into_programs() {
    let (rt, _) = counting_runtime(RuntimeConfig::default(), 1);
    let jaxpr = build_program(ProgramSpec::Square);
    let x = rt
        .device_put(&host_ref(Value::scalar_f32(3.0)), DeviceId(0))
        .expect("placed");
    let once = rt.xla_call(&jaxpr, &[], &[x], None).expect("runs");
    let twice = rt.xla_call(&jaxpr, &[], &once, None).expect("runs");
    assert_eq!(host_value(&twice[0]), Value::scalar_f32(81.0));
}

// ── Properties ──────────────────────────────────────────────────────

mod properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(
            jx_test_utils::property_test_case_count()
        ))]

        #[test]
        fn prop_compiled_and_op_by_op_runs_agree(x in -100.0_f32..100.0) {
            let (rt, _) = counting_runtime(RuntimeConfig::default(), 1);
            let jaxpr = build_program(ProgramSpec::SquarePlusLinear);
            let args = [host_ref(Value::scalar_f32(x))];
            let compiled = rt.xla_call(&jaxpr, &[], &args, None).expect("compiled");
            let eager = rt.eval_uncompiled(&jaxpr, &[], &args).expect("op by op");
            prop_assert_eq!(host_value(&compiled[0]), host_value(&eager[0]));
        }
    }
}
