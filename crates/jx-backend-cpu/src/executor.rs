//! CPU backend: compiles computations into host-interpreted executables.
//!
//! Every logical device lives in host memory. Multi-replica executables
//! evaluate all replicas in lockstep, one node at a time, so cross-replica
//! reductions see every participant's value for the same node.

use crate::buffer::{CpuBuffer, HostLiteral};
use crate::kernels;
use jx_core::Value;
use jx_runtime::{
    Backend, BackendError, CompileOptions, DeviceBuffer, DeviceId, DeviceInfo, Executable, Node,
    Platform, XlaComputation, XlaOp,
};
use std::sync::Arc;

/// CPU backend exposing one or more logical host devices.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    device_count: u32,
}

impl CpuBackend {
    /// Create a CPU backend with a single device.
    #[must_use]
    pub fn new() -> Self {
        Self { device_count: 1 }
    }

    /// Create a CPU backend exposing multiple logical devices.
    /// Useful for testing replicated execution without accelerators.
    #[must_use]
    pub fn with_device_count(count: u32) -> Self {
        assert!(count > 0, "device count must be at least 1");
        Self {
            device_count: count,
        }
    }

    fn check_device(&self, device: DeviceId) -> Result<(), BackendError> {
        if device.0 >= self.device_count {
            return Err(BackendError::InvalidDevice {
                device,
                available: self.device_count as usize,
            });
        }
        Ok(())
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn platform(&self) -> Platform {
        Platform::Cpu
    }

    fn device_count(&self) -> usize {
        self.device_count as usize
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        (0..self.device_count)
            .map(|i| DeviceInfo {
                id: DeviceId(i),
                platform: Platform::Cpu,
                host_id: 0,
                process_index: 0,
            })
            .collect()
    }

    fn compile(
        &self,
        computation: &XlaComputation,
        options: &CompileOptions,
    ) -> Result<Arc<dyn Executable>, BackendError> {
        if options.num_replicas == 0 {
            return Err(BackendError::CompileFailed {
                detail: "computation must run on at least one replica".to_owned(),
            });
        }
        let ordinals = match &options.device_assignment {
            Some(assignment) => {
                if assignment.replica_count() != options.num_replicas {
                    return Err(BackendError::InconsistentReplicas {
                        num_replicas: options.num_replicas,
                        assignment_len: assignment.replica_count(),
                    });
                }
                for device in assignment.devices() {
                    self.check_device(*device)?;
                }
                assignment.devices().to_vec()
            }
            None => {
                if options.num_replicas > self.device_count() {
                    return Err(BackendError::CompileFailed {
                        detail: format!(
                            "computation requires {} replicas but only {} devices exist",
                            options.num_replicas, self.device_count
                        ),
                    });
                }
                (0..options.num_replicas as u32).map(DeviceId).collect()
            }
        };
        tracing::debug!(
            computation = %computation.name(),
            nodes = computation.nodes().len(),
            replicas = options.num_replicas,
            "compiled computation for cpu"
        );
        Ok(Arc::new(CpuExecutable {
            computation: Arc::new(computation.clone()),
            ordinals,
            device_count: self.device_count as usize,
        }))
    }

    fn buffer_from_host(
        &self,
        value: &Value,
        device: DeviceId,
    ) -> Result<Arc<dyn DeviceBuffer>, BackendError> {
        self.check_device(device)?;
        Ok(CpuBuffer::new(
            HostLiteral::from_value(value.clone()),
            device,
            self.device_count as usize,
        ))
    }
}

/// A compiled computation bound to one device per replica.
#[derive(Debug)]
pub struct CpuExecutable {
    computation: Arc<XlaComputation>,
    ordinals: Vec<DeviceId>,
    device_count: usize,
}

impl CpuExecutable {
    #[must_use]
    pub fn computation(&self) -> &XlaComputation {
        &self.computation
    }

    fn read_args(
        &self,
        replica: usize,
        args: &[Arc<dyn DeviceBuffer>],
    ) -> Result<Vec<HostLiteral>, BackendError> {
        let expected = self.computation.parameter_shapes();
        if args.len() != expected.len() {
            return Err(BackendError::ExecutionFailed {
                detail: format!(
                    "`{}` expects {} arguments, got {}",
                    self.computation.name(),
                    expected.len(),
                    args.len()
                ),
            });
        }
        let device = self.ordinals[replica];
        args.iter()
            .zip(expected)
            .enumerate()
            .map(|(position, (arg, shape))| {
                if arg.device() != device {
                    return Err(BackendError::ExecutionFailed {
                        detail: format!(
                            "argument {position} lives on {} but replica {replica} runs on {device}",
                            arg.device()
                        ),
                    });
                }
                if &arg.shape() != shape {
                    return Err(BackendError::ExecutionFailed {
                        detail: format!(
                            "argument {position} has shape {}, expected {shape}",
                            arg.shape()
                        ),
                    });
                }
                if shape.is_unit() {
                    arg.block_until_ready()?;
                    return Ok(HostLiteral::Tuple(Vec::new()));
                }
                arg.to_host().map(HostLiteral::Array)
            })
            .collect()
    }

    fn wrap(&self, outputs: Vec<HostLiteral>) -> Vec<Arc<dyn DeviceBuffer>> {
        outputs
            .into_iter()
            .zip(&self.ordinals)
            .map(|(literal, device)| {
                CpuBuffer::new(literal, *device, self.device_count) as Arc<dyn DeviceBuffer>
            })
            .collect()
    }
}

impl Executable for CpuExecutable {
    fn device_ordinals(&self) -> &[DeviceId] {
        &self.ordinals
    }

    fn num_replicas(&self) -> usize {
        self.ordinals.len()
    }

    fn execute(&self, args: &[Arc<dyn DeviceBuffer>]) -> Result<Arc<dyn DeviceBuffer>, BackendError> {
        if self.num_replicas() != 1 {
            return Err(BackendError::ExecutionFailed {
                detail: format!(
                    "`{}` is replicated {} ways; use execute_per_replica",
                    self.computation.name(),
                    self.num_replicas()
                ),
            });
        }
        let inputs = self.read_args(0, args)?;
        let outputs = evaluate(&self.computation, vec![inputs])?;
        self.wrap(outputs)
            .pop()
            .ok_or_else(|| BackendError::ExecutionFailed {
                detail: "execution produced no output".to_owned(),
            })
    }

    fn execute_per_replica(
        &self,
        args: Vec<Vec<Arc<dyn DeviceBuffer>>>,
    ) -> Result<Vec<Arc<dyn DeviceBuffer>>, BackendError> {
        if args.len() != self.num_replicas() {
            return Err(BackendError::ExecutionFailed {
                detail: format!(
                    "`{}` has {} replicas but received {} argument lists",
                    self.computation.name(),
                    self.num_replicas(),
                    args.len()
                ),
            });
        }
        let inputs = args
            .iter()
            .enumerate()
            .map(|(replica, replica_args)| self.read_args(replica, replica_args))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::trace!(
            computation = %self.computation.name(),
            replicas = inputs.len(),
            "executing per replica"
        );
        Ok(self.wrap(evaluate(&self.computation, inputs)?))
    }
}

// ── Evaluation ─────────────────────────────────────────────────────

fn failed(detail: impl Into<String>) -> BackendError {
    BackendError::ExecutionFailed {
        detail: detail.into(),
    }
}

/// Evaluates `computation` for every replica at once; `args[r]` holds
/// replica `r`'s parameters and the result holds one root value per replica.
fn evaluate(
    computation: &XlaComputation,
    args: Vec<Vec<HostLiteral>>,
) -> Result<Vec<HostLiteral>, BackendError> {
    let replicas = args.len();
    // env[node][replica]
    let mut env: Vec<Vec<HostLiteral>> = Vec::with_capacity(computation.nodes().len());
    for node in computation.nodes() {
        let values = match node {
            Node::CrossReplicaSum {
                operand,
                replica_groups,
            } => cross_replica_sum(&env[operand.index()], replica_groups)?,
            Node::Call {
                computation: callee,
                operands,
            } => {
                let call_args = (0..replicas)
                    .map(|replica| {
                        operands
                            .iter()
                            .map(|op| env[op.index()][replica].clone())
                            .collect()
                    })
                    .collect();
                evaluate(callee, call_args)?
            }
            local => (0..replicas)
                .map(|replica| eval_local(local, &env, replica, &args[replica]))
                .collect::<Result<Vec<_>, _>>()?,
        };
        env.push(values);
    }
    env.into_iter()
        .nth(computation.root().index())
        .ok_or_else(|| failed(format!("`{}` has no root value", computation.name())))
}

fn array<'a>(
    env: &'a [Vec<HostLiteral>],
    op: XlaOp,
    replica: usize,
) -> Result<&'a Value, BackendError> {
    match &env[op.index()][replica] {
        HostLiteral::Array(value) => Ok(value),
        HostLiteral::Tuple(_) => Err(failed(format!("op #{} is a tuple", op.index()))),
    }
}

fn eval_local(
    node: &Node,
    env: &[Vec<HostLiteral>],
    replica: usize,
    args: &[HostLiteral],
) -> Result<HostLiteral, BackendError> {
    let value = match node {
        Node::Parameter { number, .. } => {
            return args
                .get(*number)
                .cloned()
                .ok_or_else(|| failed(format!("missing parameter {number}")));
        }
        Node::Constant(value) => return Ok(HostLiteral::from_value(value.clone())),
        Node::Tuple(elements) => {
            return Ok(HostLiteral::Tuple(
                elements
                    .iter()
                    .map(|op| env[op.index()][replica].clone())
                    .collect(),
            ));
        }
        Node::GetTupleElement { operand, index } => {
            return match &env[operand.index()][replica] {
                HostLiteral::Tuple(elements) => elements
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| failed(format!("tuple index {index} out of range"))),
                HostLiteral::Array(_) => Err(failed("get-tuple-element of an array")),
            };
        }
        Node::Unary { op, operand } => kernels::unary(*op, array(env, *operand, replica)?)?,
        Node::Binary { op, lhs, rhs } => kernels::binary(
            *op,
            array(env, *lhs, replica)?,
            array(env, *rhs, replica)?,
        )?,
        Node::Broadcast { operand, sizes } => {
            kernels::broadcast(array(env, *operand, replica)?, sizes)?
        }
        Node::BroadcastInDim {
            operand,
            shape,
            broadcast_dimensions,
        } => kernels::broadcast_in_dim(array(env, *operand, replica)?, shape, broadcast_dimensions)?,
        Node::ConvertElementType { operand, dtype } => array(env, *operand, replica)?.cast(*dtype),
        Node::ReduceSum { operand, axes } => {
            kernels::reduce_sum(array(env, *operand, replica)?, axes)?
        }
        Node::Select {
            pred,
            on_true,
            on_false,
        } => {
            let pred = array(env, *pred, replica)?;
            match (&env[on_true.index()][replica], &env[on_false.index()][replica]) {
                (HostLiteral::Array(t), HostLiteral::Array(f)) => kernels::select(pred, t, f)?,
                (t, f) => {
                    let flag = pred.elements().first().is_some_and(|lit| lit.as_bool());
                    return Ok(if flag { t.clone() } else { f.clone() });
                }
            }
        }
        Node::Call { .. } | Node::CrossReplicaSum { .. } => {
            return Err(failed(format!("{} must be evaluated across replicas", node.kind())));
        }
    };
    Ok(HostLiteral::Array(value))
}

fn cross_replica_sum(
    operand: &[HostLiteral],
    replica_groups: &[Vec<usize>],
) -> Result<Vec<HostLiteral>, BackendError> {
    let mut out = operand.to_vec();
    for group in replica_groups {
        let members = group
            .iter()
            .map(|replica| match operand.get(*replica) {
                Some(HostLiteral::Array(value)) => Ok(value),
                Some(HostLiteral::Tuple(_)) => Err(failed("cross_replica_sum of a tuple")),
                None => Err(failed(format!(
                    "replica {replica} is outside the {} running replicas",
                    operand.len()
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let total = kernels::sum_all(&members)?;
        for replica in group {
            out[*replica] = HostLiteral::Array(total.clone());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jx_core::{DType, Literal, Shape};
    use jx_runtime::{DeviceAssignment, UnaryOp, XlaBuilder, XlaShape, get_compile_options};

    fn f32_vec(values: &[f32]) -> Value {
        Value::vector_f32(values).expect("vector")
    }

    fn add_computation() -> XlaComputation {
        let mut c = XlaBuilder::new("add");
        let shape = XlaShape::array(DType::F32, [3]);
        let x = c.parameter_with_shape(&shape);
        let y = c.parameter_with_shape(&shape);
        let sum = c.add(x, y);
        let root = c.tuple(&[sum]);
        c.build(root).expect("builds")
    }

    #[test]
    fn cpu_backend_reports_devices() {
        let backend = CpuBackend::with_device_count(4);
        assert_eq!(backend.platform(), Platform::Cpu);
        assert_eq!(backend.device_count(), 4);
        let devices = backend.devices();
        assert_eq!(devices.len(), 4);
        assert_eq!(devices[3].id, DeviceId(3));
    }

    #[test]
    #[should_panic(expected = "device count must be at least 1")]
    fn zero_devices_panics() {
        let _ = CpuBackend::with_device_count(0);
    }

    #[test]
    fn executes_single_replica_tuple_result() {
        let backend = CpuBackend::new();
        let exe = backend
            .compile(&add_computation(), &CompileOptions::default())
            .expect("compiles");
        let x = backend
            .buffer_from_host(&f32_vec(&[1.0, 2.0, 3.0]), DeviceId(0))
            .expect("x");
        let y = backend
            .buffer_from_host(&f32_vec(&[10.0, 20.0, 30.0]), DeviceId(0))
            .expect("y");
        let out = exe.execute(&[x, y]).expect("executes");
        let parts = out.destructure().expect("tuple output");
        assert_eq!(
            parts[0].to_host().expect("host").to_f64_vec(),
            vec![11.0, 22.0, 33.0]
        );
    }

    #[test]
    fn execute_rejects_wrong_shapes_and_devices() {
        let backend = CpuBackend::with_device_count(2);
        let exe = backend
            .compile(&add_computation(), &CompileOptions::default())
            .expect("compiles");
        let short = backend
            .buffer_from_host(&f32_vec(&[1.0]), DeviceId(0))
            .expect("short");
        assert!(exe.execute(&[short.clone(), short]).is_err());
        let remote = backend
            .buffer_from_host(&f32_vec(&[1.0, 2.0, 3.0]), DeviceId(1))
            .expect("remote");
        let err = exe.execute(&[remote.clone(), remote]).expect_err("wrong device");
        assert!(err.to_string().contains("device:1"));
    }

    #[test]
    fn deleted_arguments_are_rejected() {
        let backend = CpuBackend::new();
        let exe = backend
            .compile(&add_computation(), &CompileOptions::default())
            .expect("compiles");
        let x = backend
            .buffer_from_host(&f32_vec(&[1.0, 2.0, 3.0]), DeviceId(0))
            .expect("x");
        x.delete().expect("delete");
        assert_eq!(exe.execute(&[x.clone(), x]).expect_err("deleted"), BackendError::BufferDeleted);
    }

    #[test]
    fn compile_honors_device_assignment() {
        let backend = CpuBackend::with_device_count(4);
        let options = get_compile_options(None, Some(&[DeviceId(2)]))
            .expect("valid")
            .expect("present");
        let exe = backend.compile(&add_computation(), &options).expect("compiles");
        assert_eq!(exe.device_ordinals(), &[DeviceId(2)]);

        let bad = CompileOptions {
            num_replicas: 1,
            device_assignment: Some(DeviceAssignment::new(vec![DeviceId(9)])),
        };
        assert!(matches!(
            backend.compile(&add_computation(), &bad),
            Err(BackendError::InvalidDevice { .. })
        ));
        let too_many = CompileOptions {
            num_replicas: 5,
            device_assignment: None,
        };
        assert!(backend.compile(&add_computation(), &too_many).is_err());
    }

    #[test]
    fn cross_replica_sum_reduces_within_groups() {
        let backend = CpuBackend::with_device_count(4);
        let mut c = XlaBuilder::new("psum");
        let x = c.parameter_with_shape(&XlaShape::scalar(DType::F32));
        let summed = c.cross_replica_sum(x, &[vec![0, 2], vec![1, 3]]);
        let root = c.tuple(&[summed]);
        let computation = c.build(root).expect("builds");
        let options = get_compile_options(Some(4), None)
            .expect("valid")
            .expect("present");
        let exe = backend.compile(&computation, &options).expect("compiles");

        let args = (0..4_u32)
            .map(|replica| {
                vec![
                    backend
                        .buffer_from_host(&Value::scalar_f32(replica as f32 + 1.0), DeviceId(replica))
                        .expect("arg"),
                ]
            })
            .collect();
        let outputs = exe.execute_per_replica(args).expect("executes");
        let totals: Vec<f64> = outputs
            .iter()
            .map(|out| {
                out.destructure().expect("tuple")[0]
                    .to_host()
                    .expect("host")
                    .as_f64_scalar()
                    .expect("scalar")
            })
            .collect();
        assert_eq!(totals, vec![4.0, 6.0, 4.0, 6.0]);
        assert_eq!(outputs[3].device(), DeviceId(3));
    }

    #[test]
    fn nested_calls_evaluate_callee() {
        let mut inner = XlaBuilder::new("inner");
        let p = inner.parameter_with_shape(&XlaShape::scalar(DType::F32));
        let s = inner.unary(UnaryOp::Sin, p);
        let inner = Arc::new(inner.build(s).expect("inner"));

        let mut outer = XlaBuilder::new("outer");
        let x = outer.parameter_with_shape(&XlaShape::scalar(DType::F32));
        let called = outer.call(inner, &[x]);
        let computation = outer.build(called).expect("outer");

        let backend = CpuBackend::new();
        let exe = backend
            .compile(&computation, &CompileOptions::default())
            .expect("compiles");
        let arg = backend
            .buffer_from_host(&Value::scalar_f32(0.0), DeviceId(0))
            .expect("arg");
        let out = exe.execute(&[arg]).expect("executes");
        assert_eq!(out.to_host().expect("host"), Value::scalar_f32(0.0));
    }

    #[test]
    fn unit_parameters_round_trip() {
        let mut c = XlaBuilder::new("unit");
        let u = c.parameter_with_shape(&XlaShape::unit());
        let computation = c.build(u).expect("builds");
        let backend = CpuBackend::new();
        let exe = backend
            .compile(&computation, &CompileOptions::default())
            .expect("compiles");
        let arg = backend.buffer_from_host(&Value::Unit, DeviceId(0)).expect("unit");
        let out = exe.execute(&[arg]).expect("executes");
        assert!(out.shape().is_unit());
    }

    #[test]
    fn reduce_and_convert_nodes() {
        let mut c = XlaBuilder::new("sum");
        let x = c.parameter_with_shape(&XlaShape::array(DType::I32, [2, 2]));
        let total = c.reduce_sum(x, &[0, 1]);
        let widened = c.convert_element_type(total, DType::F32);
        let computation = c.build(widened).expect("builds");
        let backend = CpuBackend::new();
        let exe = backend
            .compile(&computation, &CompileOptions::default())
            .expect("compiles");
        let matrix = Value::from_elements(
            DType::I32,
            Shape::new([2, 2]),
            (1..=4).map(Literal::I32).collect(),
        )
        .expect("matrix");
        let arg = backend.buffer_from_host(&matrix, DeviceId(0)).expect("arg");
        let out = exe.execute(&[arg]).expect("executes");
        assert_eq!(out.to_host().expect("host"), Value::scalar_f32(10.0));
    }
}
