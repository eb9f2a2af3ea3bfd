use criterion::{Criterion, criterion_group, criterion_main};
use jx_backend_cpu::CpuBackend;
use jx_core::{Params, Value, host_ref};
use jx_dispatch::XlaRuntime;
use jx_interpreters::DeviceArray;
use jx_lax::{ADD_P, ProgramSpec, build_program};
use jx_runtime::RuntimeConfig;
use std::sync::Arc;

fn runtime() -> XlaRuntime {
    XlaRuntime::new(RuntimeConfig::default(), Arc::new(CpuBackend::new()))
}

fn benchmark_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let args = [
        host_ref(Value::scalar_f32(2.0)),
        host_ref(Value::scalar_f32(5.0)),
    ];

    c.bench_function("dispatch/apply_primitive_add", |b| {
        b.iter(|| {
            let out = rt
                .apply_primitive(&ADD_P, &args, &Params::new())
                .expect("cached add should succeed");
            let array = out.downcast_ref::<DeviceArray>().expect("device array");
            assert_eq!(array.value().expect("host"), Value::scalar_f32(7.0));
        });
    });

    let jaxpr = build_program(ProgramSpec::Add2);
    c.bench_function("dispatch/xla_call_add", |b| {
        b.iter(|| {
            let outs = rt
                .xla_call(&jaxpr, &[], &args, None)
                .expect("cached program should succeed");
            assert_eq!(outs.len(), 1);
        });
    });

    c.bench_function("dispatch/compile_cold_add", |b| {
        b.iter(|| {
            let cold = runtime();
            cold.xla_call(&jaxpr, &[], &args, None)
                .expect("cold program should succeed");
        });
    });
}

criterion_group!(dispatch_benches, benchmark_dispatch);
criterion_main!(dispatch_benches);
