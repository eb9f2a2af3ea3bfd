//! Backend-independent computation builder.
//!
//! Nodes are appended in program order, so every operand precedes its users
//! and a computation can be evaluated by a single forward pass. Shape
//! inference runs as each node is added, but failures are deferred: they
//! surface from [`XlaBuilder::get_shape`] on the offending node (or any node
//! depending on it) and from [`XlaBuilder::build`].

use crate::backend::BackendError;
use crate::shape::XlaShape;
use jx_core::{DType, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Handle to a node inside one builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XlaOp(usize);

impl XlaOp {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sin,
    Cos,
    Exp,
    Log,
    Log1p,
    Sqrt,
    IsNan,
}

impl UnaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Log1p => "log1p",
            Self::Sqrt => "sqrt",
            Self::IsNan => "is_nan",
        }
    }

    fn requires_floating(self) -> bool {
        !matches!(self, Self::Neg | Self::Abs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Eq,
    Lt,
}

impl BinaryOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::Eq => "eq",
            Self::Lt => "lt",
        }
    }

    #[must_use]
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Lt)
    }

    fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Parameter {
        number: usize,
        shape: XlaShape,
    },
    Constant(Value),
    Tuple(Vec<XlaOp>),
    GetTupleElement {
        operand: XlaOp,
        index: usize,
    },
    Unary {
        op: UnaryOp,
        operand: XlaOp,
    },
    Binary {
        op: BinaryOp,
        lhs: XlaOp,
        rhs: XlaOp,
    },
    /// Prepends `sizes` to the operand's dimensions.
    Broadcast {
        operand: XlaOp,
        sizes: Vec<u32>,
    },
    BroadcastInDim {
        operand: XlaOp,
        shape: Vec<u32>,
        broadcast_dimensions: Vec<usize>,
    },
    ConvertElementType {
        operand: XlaOp,
        dtype: DType,
    },
    ReduceSum {
        operand: XlaOp,
        axes: Vec<usize>,
    },
    Select {
        pred: XlaOp,
        on_true: XlaOp,
        on_false: XlaOp,
    },
    Call {
        computation: Arc<XlaComputation>,
        operands: Vec<XlaOp>,
    },
    CrossReplicaSum {
        operand: XlaOp,
        replica_groups: Vec<Vec<usize>>,
    },
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parameter { .. } => "parameter",
            Self::Constant(_) => "constant",
            Self::Tuple(_) => "tuple",
            Self::GetTupleElement { .. } => "get-tuple-element",
            Self::Unary { op, .. } => op.as_str(),
            Self::Binary { op, .. } => op.as_str(),
            Self::Broadcast { .. } => "broadcast",
            Self::BroadcastInDim { .. } => "broadcast_in_dim",
            Self::ConvertElementType { .. } => "convert_element_type",
            Self::ReduceSum { .. } => "reduce_sum",
            Self::Select { .. } => "select",
            Self::Call { .. } => "call",
            Self::CrossReplicaSum { .. } => "cross_replica_sum",
        }
    }
}

#[derive(Debug)]
pub struct XlaBuilder {
    name: String,
    nodes: Vec<Node>,
    shapes: Vec<Result<XlaShape, String>>,
    next_parameter: usize,
    first_error: Option<String>,
}

impl XlaBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            shapes: Vec::new(),
            next_parameter: 0,
            first_error: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The shape of `op`, or the deferred error that made it ill-typed.
    pub fn get_shape(&self, op: XlaOp) -> Result<XlaShape, BackendError> {
        self.operand_shape(op)
            .cloned()
            .map_err(|detail| BackendError::ShapeCheck { detail })
    }

    /// Adds the next positional parameter.
    pub fn parameter_with_shape(&mut self, shape: &XlaShape) -> XlaOp {
        let number = self.next_parameter;
        self.parameter(number, shape.clone())
    }

    pub fn parameter(&mut self, number: usize, shape: XlaShape) -> XlaOp {
        self.next_parameter = self.next_parameter.max(number + 1);
        self.push(Node::Parameter { number, shape })
    }

    pub fn constant(&mut self, value: Value) -> XlaOp {
        self.push(Node::Constant(value))
    }

    pub fn tuple(&mut self, elements: &[XlaOp]) -> XlaOp {
        self.push(Node::Tuple(elements.to_vec()))
    }

    pub fn get_tuple_element(&mut self, operand: XlaOp, index: usize) -> XlaOp {
        self.push(Node::GetTupleElement { operand, index })
    }

    pub fn unary(&mut self, op: UnaryOp, operand: XlaOp) -> XlaOp {
        self.push(Node::Unary { op, operand })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: XlaOp, rhs: XlaOp) -> XlaOp {
        self.push(Node::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: XlaOp, rhs: XlaOp) -> XlaOp {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn broadcast(&mut self, operand: XlaOp, sizes: &[u32]) -> XlaOp {
        self.push(Node::Broadcast {
            operand,
            sizes: sizes.to_vec(),
        })
    }

    pub fn broadcast_in_dim(
        &mut self,
        operand: XlaOp,
        shape: &[u32],
        broadcast_dimensions: &[usize],
    ) -> XlaOp {
        self.push(Node::BroadcastInDim {
            operand,
            shape: shape.to_vec(),
            broadcast_dimensions: broadcast_dimensions.to_vec(),
        })
    }

    pub fn convert_element_type(&mut self, operand: XlaOp, dtype: DType) -> XlaOp {
        self.push(Node::ConvertElementType { operand, dtype })
    }

    pub fn reduce_sum(&mut self, operand: XlaOp, axes: &[usize]) -> XlaOp {
        self.push(Node::ReduceSum {
            operand,
            axes: axes.to_vec(),
        })
    }

    pub fn select(&mut self, pred: XlaOp, on_true: XlaOp, on_false: XlaOp) -> XlaOp {
        self.push(Node::Select {
            pred,
            on_true,
            on_false,
        })
    }

    pub fn call(&mut self, computation: Arc<XlaComputation>, operands: &[XlaOp]) -> XlaOp {
        self.push(Node::Call {
            computation,
            operands: operands.to_vec(),
        })
    }

    /// Sums `operand` across each replica group. Singleton groups make this
    /// the identity, so no node is added for them.
    pub fn cross_replica_sum(&mut self, operand: XlaOp, replica_groups: &[Vec<usize>]) -> XlaOp {
        match replica_groups.first() {
            None => operand,
            Some(group) if group.len() == 1 => operand,
            Some(_) => self.push(Node::CrossReplicaSum {
                operand,
                replica_groups: replica_groups.to_vec(),
            }),
        }
    }

    /// Finishes the computation with `root` as its result.
    pub fn build(self, root: XlaOp) -> Result<XlaComputation, BackendError> {
        if let Some(detail) = self.first_error {
            return Err(BackendError::ShapeCheck { detail });
        }
        if root.0 >= self.nodes.len() {
            return Err(BackendError::ShapeCheck {
                detail: format!("root op #{} is not part of `{}`", root.0, self.name),
            });
        }

        let mut parameters: Vec<(usize, XlaShape)> = self
            .nodes
            .iter()
            .filter_map(|node| match node {
                Node::Parameter { number, shape } => Some((*number, shape.clone())),
                _ => None,
            })
            .collect();
        parameters.sort_by_key(|(number, _)| *number);
        for (expected, (number, _)) in parameters.iter().enumerate() {
            if *number != expected {
                return Err(BackendError::ShapeCheck {
                    detail: format!(
                        "parameter numbers of `{}` are not dense: expected {expected}, found {number}",
                        self.name
                    ),
                });
            }
        }

        let shapes = self
            .shapes
            .into_iter()
            .collect::<Result<Vec<_>, String>>()
            .map_err(|detail| BackendError::ShapeCheck { detail })?;

        Ok(XlaComputation {
            name: self.name,
            nodes: self.nodes,
            shapes,
            root,
            parameter_shapes: parameters.into_iter().map(|(_, shape)| shape).collect(),
        })
    }

    fn push(&mut self, node: Node) -> XlaOp {
        let shape = self.infer(&node).map_err(|detail| {
            if detail.starts_with('#') {
                detail
            } else {
                format!("#{} {}: {detail}", self.nodes.len(), node.kind())
            }
        });
        if let Err(detail) = &shape
            && self.first_error.is_none()
        {
            self.first_error = Some(detail.clone());
        }
        self.nodes.push(node);
        self.shapes.push(shape);
        XlaOp(self.nodes.len() - 1)
    }

    fn operand_shape(&self, op: XlaOp) -> Result<&XlaShape, String> {
        match self.shapes.get(op.0) {
            Some(Ok(shape)) => Ok(shape),
            Some(Err(detail)) => Err(detail.clone()),
            None => Err(format!("op #{} does not belong to `{}`", op.0, self.name)),
        }
    }

    fn array_operand(&self, op: XlaOp) -> Result<(DType, &[u32]), String> {
        match self.operand_shape(op)? {
            XlaShape::Array { dtype, dims } => Ok((*dtype, dims)),
            tuple => Err(format!("expected an array operand, got {tuple}")),
        }
    }

    fn infer(&self, node: &Node) -> Result<XlaShape, String> {
        match node {
            Node::Parameter { shape, .. } => Ok(shape.clone()),
            Node::Constant(value) => Ok(XlaShape::of_value(value)),
            Node::Tuple(elements) => elements
                .iter()
                .map(|op| self.operand_shape(*op).cloned())
                .collect::<Result<Vec<_>, _>>()
                .map(XlaShape::Tuple),
            Node::GetTupleElement { operand, index } => match self.operand_shape(*operand)? {
                XlaShape::Tuple(elements) => elements.get(*index).cloned().ok_or_else(|| {
                    format!("tuple index {index} out of range for {} elements", elements.len())
                }),
                array => Err(format!("expected a tuple operand, got {array}")),
            },
            Node::Unary { op, operand } => {
                let (dtype, dims) = self.array_operand(*operand)?;
                if op.requires_floating() && !dtype.is_floating() {
                    return Err(format!("{} requires a floating operand, got {dtype}", op.as_str()));
                }
                if dtype == DType::Bool {
                    return Err(format!("{} does not accept bool operands", op.as_str()));
                }
                let out_dtype = if *op == UnaryOp::IsNan { DType::Bool } else { dtype };
                Ok(XlaShape::array(out_dtype, dims.to_vec()))
            }
            Node::Binary { op, lhs, rhs } => {
                let (lhs_dtype, lhs_dims) = self.array_operand(*lhs)?;
                let (rhs_dtype, rhs_dims) = self.array_operand(*rhs)?;
                if lhs_dtype != rhs_dtype || lhs_dims != rhs_dims {
                    return Err(format!(
                        "{} operands differ: {} vs {}",
                        op.as_str(),
                        XlaShape::array(lhs_dtype, lhs_dims.to_vec()),
                        XlaShape::array(rhs_dtype, rhs_dims.to_vec()),
                    ));
                }
                if op.is_arithmetic() && lhs_dtype == DType::Bool {
                    return Err(format!("{} does not accept bool operands", op.as_str()));
                }
                let out_dtype = if op.is_comparison() { DType::Bool } else { lhs_dtype };
                Ok(XlaShape::array(out_dtype, lhs_dims.to_vec()))
            }
            Node::Broadcast { operand, sizes } => {
                let (dtype, dims) = self.array_operand(*operand)?;
                let mut out = sizes.clone();
                out.extend_from_slice(dims);
                Ok(XlaShape::array(dtype, out))
            }
            Node::BroadcastInDim {
                operand,
                shape,
                broadcast_dimensions,
            } => {
                let (dtype, dims) = self.array_operand(*operand)?;
                if dims.len() != broadcast_dimensions.len() {
                    return Err(format!(
                        "operand rank {} does not match {} broadcast dimensions",
                        dims.len(),
                        broadcast_dimensions.len()
                    ));
                }
                let mut previous = None;
                for (dim, target) in dims.iter().zip(broadcast_dimensions) {
                    let Some(target_size) = shape.get(*target) else {
                        return Err(format!("broadcast dimension {target} out of range"));
                    };
                    if previous.is_some_and(|prev| prev >= *target) {
                        return Err("broadcast dimensions must be strictly increasing".to_owned());
                    }
                    if *dim != 1 && dim != target_size {
                        return Err(format!(
                            "operand dim {dim} cannot broadcast to {target_size}"
                        ));
                    }
                    previous = Some(*target);
                }
                Ok(XlaShape::array(dtype, shape.clone()))
            }
            Node::ConvertElementType { operand, dtype } => {
                let (_, dims) = self.array_operand(*operand)?;
                Ok(XlaShape::array(*dtype, dims.to_vec()))
            }
            Node::ReduceSum { operand, axes } => {
                let (dtype, dims) = self.array_operand(*operand)?;
                if dtype == DType::Bool {
                    return Err("reduce_sum does not accept bool operands".to_owned());
                }
                let unique: BTreeSet<usize> = axes.iter().copied().collect();
                if unique.len() != axes.len() || axes.iter().any(|axis| *axis >= dims.len()) {
                    return Err(format!("invalid reduction axes {axes:?} for rank {}", dims.len()));
                }
                let kept = dims
                    .iter()
                    .enumerate()
                    .filter(|(axis, _)| !unique.contains(axis))
                    .map(|(_, dim)| *dim)
                    .collect::<Vec<_>>();
                Ok(XlaShape::array(dtype, kept))
            }
            Node::Select {
                pred,
                on_true,
                on_false,
            } => {
                let (pred_dtype, pred_dims) = self.array_operand(*pred)?;
                let true_shape = self.operand_shape(*on_true)?;
                let false_shape = self.operand_shape(*on_false)?;
                if pred_dtype != DType::Bool {
                    return Err(format!("select predicate must be bool, got {pred_dtype}"));
                }
                if true_shape != false_shape {
                    return Err(format!("select branches differ: {true_shape} vs {false_shape}"));
                }
                if !pred_dims.is_empty() && pred_dims != true_shape.dimensions() {
                    return Err(format!(
                        "select predicate dims {pred_dims:?} do not match {true_shape}"
                    ));
                }
                Ok(true_shape.clone())
            }
            Node::Call {
                computation,
                operands,
            } => {
                let expected = computation.parameter_shapes();
                if expected.len() != operands.len() {
                    return Err(format!(
                        "`{}` takes {} operands, got {}",
                        computation.name(),
                        expected.len(),
                        operands.len()
                    ));
                }
                for (position, (op, want)) in operands.iter().zip(expected).enumerate() {
                    let got = self.operand_shape(*op)?;
                    if got != want {
                        return Err(format!(
                            "operand {position} of `{}` has shape {got}, expected {want}",
                            computation.name()
                        ));
                    }
                }
                Ok(computation.result_shape().clone())
            }
            Node::CrossReplicaSum {
                operand,
                replica_groups,
            } => {
                let (dtype, dims) = self.array_operand(*operand)?;
                if dtype == DType::Bool {
                    return Err("cross_replica_sum does not accept bool operands".to_owned());
                }
                let mut seen = BTreeSet::new();
                for group in replica_groups {
                    if group.is_empty() {
                        return Err("replica groups must be non-empty".to_owned());
                    }
                    for replica in group {
                        if !seen.insert(*replica) {
                            return Err(format!("replica {replica} appears in two groups"));
                        }
                    }
                }
                Ok(XlaShape::array(dtype, dims.to_vec()))
            }
        }
    }
}

/// A finished, immutable computation graph.
#[derive(Debug, Clone)]
pub struct XlaComputation {
    name: String,
    nodes: Vec<Node>,
    shapes: Vec<XlaShape>,
    root: XlaOp,
    parameter_shapes: Vec<XlaShape>,
}

impl XlaComputation {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn node_shape(&self, op: XlaOp) -> Option<&XlaShape> {
        self.shapes.get(op.0)
    }

    #[must_use]
    pub fn root(&self) -> XlaOp {
        self.root
    }

    #[must_use]
    pub fn parameter_shapes(&self) -> &[XlaShape] {
        &self.parameter_shapes
    }

    #[must_use]
    pub fn result_shape(&self) -> &XlaShape {
        &self.shapes[self.root.0]
    }
}
