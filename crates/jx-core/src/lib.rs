#![forbid(unsafe_code)]

//! Core data model: dtypes, host values, abstract values and the jaxpr IR.

mod aval;
mod host;
mod jaxpr;

#[cfg(test)]
pub mod proptest_strategies;

pub use aval::{AbstractValue, AvalKind, ConcreteArray, ShapeError, ShapedArray};
pub use host::{JaxRef, JaxValue, host_ref};
pub use jaxpr::{
    AbstractEvalFn, Atom, BoundSubjaxpr, Equation, Jaxpr, JaxprValidationError, Param, ParamLookup,
    Params, Primitive, VarId,
};

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DType {
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    #[must_use]
    pub fn is_floating(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub fn is_signed_integer(self) -> bool {
        matches!(self, Self::I32 | Self::I64)
    }

    #[must_use]
    pub fn is_unsigned_integer(self) -> bool {
        matches!(self, Self::U32 | Self::U64)
    }

    /// The 32-bit counterpart of a 64-bit dtype; other dtypes map to themselves.
    #[must_use]
    pub fn to_32bit(self) -> Self {
        match self {
            Self::I64 => Self::I32,
            Self::U64 => Self::U32,
            Self::F64 => Self::F32,
            other => other,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn new(dims: impl Into<Vec<u32>>) -> Self {
        Self { dims: dims.into() }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<u64> {
        self.dims
            .iter()
            .try_fold(1_u64, |acc, dim| acc.checked_mul(u64::from(*dim)))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

/// A single host scalar. Floats are stored as bit patterns so literals stay
/// `Eq + Hash` and NaN payloads survive round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32Bits(u32),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f32(value: f32) -> Self {
        Self::F32Bits(value.to_bits())
    }

    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn zero(dtype: DType) -> Self {
        Self::I64(0).cast(dtype)
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::I32(_) => DType::I32,
            Self::I64(_) => DType::I64,
            Self::U32(_) => DType::U32,
            Self::U64(_) => DType::U64,
            Self::F32Bits(_) => DType::F32,
            Self::F64Bits(_) => DType::F64,
        }
    }

    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bool(value) => f64::from(u8::from(value)),
            Self::I32(value) => f64::from(value),
            Self::I64(value) => value as f64,
            Self::U32(value) => f64::from(value),
            Self::U64(value) => value as f64,
            Self::F32Bits(bits) => f64::from(f32::from_bits(bits)),
            Self::F64Bits(bits) => f64::from_bits(bits),
        }
    }

    /// Integer view with `as`-cast semantics: floats truncate and saturate.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Bool(value) => i64::from(value),
            Self::I32(value) => i64::from(value),
            Self::I64(value) => value,
            Self::U32(value) => i64::from(value),
            Self::U64(value) => value as i64,
            Self::F32Bits(_) | Self::F64Bits(_) => self.as_f64() as i64,
        }
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        match self {
            Self::U64(value) => value,
            Self::F32Bits(_) | Self::F64Bits(_) => self.as_f64() as u64,
            other => other.as_i64() as u64,
        }
    }

    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bool(value) => value,
            Self::F32Bits(_) | Self::F64Bits(_) => self.as_f64() != 0.0,
            other => other.as_i64() != 0,
        }
    }

    #[must_use]
    pub fn is_nan(self) -> bool {
        match self {
            Self::F32Bits(bits) => f32::from_bits(bits).is_nan(),
            Self::F64Bits(bits) => f64::from_bits(bits).is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn cast(self, dtype: DType) -> Self {
        if self.dtype() == dtype {
            return self;
        }
        match dtype {
            DType::Bool => Self::Bool(self.as_bool()),
            DType::I32 => Self::I32(self.as_i64() as i32),
            DType::I64 => Self::I64(self.as_i64()),
            DType::U32 => Self::U32(self.as_u64() as u32),
            DType::U64 => Self::U64(self.as_u64()),
            DType::F32 => Self::from_f32(self.as_f64() as f32),
            DType::F64 => Self::from_f64(self.as_f64()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "bool:{value}"),
            Self::I32(value) => write!(f, "i32:{value}"),
            Self::I64(value) => write!(f, "i64:{value}"),
            Self::U32(value) => write!(f, "u32:{value}"),
            Self::U64(value) => write!(f, "u64:{value}"),
            Self::F32Bits(bits) => write!(f, "f32bits:{bits}"),
            Self::F64Bits(bits) => write!(f, "f64bits:{bits}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("shape element count overflowed: {shape}")]
    ShapeOverflow { shape: Shape },
    #[error("tensor element count mismatch for shape {shape}: expected {expected_count}, got {actual_count}")]
    ElementCountMismatch {
        shape: Shape,
        expected_count: u64,
        actual_count: usize,
    },
    #[error("element {index} has dtype {actual}, tensor dtype is {expected}")]
    MixedDTypes {
        index: usize,
        expected: DType,
        actual: DType,
    },
    #[error("vector length {len} does not fit a u32 dimension")]
    DimensionOverflow { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Shape,
    pub elements: Vec<Literal>,
}

impl TensorValue {
    pub fn new(dtype: DType, shape: Shape, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let expected_count = shape
            .element_count()
            .ok_or_else(|| ValueError::ShapeOverflow {
                shape: shape.clone(),
            })?;
        if expected_count != elements.len() as u64 {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: elements.len(),
            });
        }
        if let Some((index, literal)) = elements
            .iter()
            .enumerate()
            .find(|(_, literal)| literal.dtype() != dtype)
        {
            return Err(ValueError::MixedDTypes {
                index,
                expected: dtype,
                actual: literal.dtype(),
            });
        }
        Ok(Self {
            dtype,
            shape,
            elements,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }
}

/// A host-resident value. `Unit` is the zero-size value bound to the unit
/// variable of every jaxpr.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Scalar(Literal),
    Tensor(TensorValue),
}

impl Value {
    #[must_use]
    pub fn scalar_f32(value: f32) -> Self {
        Self::Scalar(Literal::from_f32(value))
    }

    #[must_use]
    pub fn scalar_f64(value: f64) -> Self {
        Self::Scalar(Literal::from_f64(value))
    }

    #[must_use]
    pub fn scalar_i32(value: i32) -> Self {
        Self::Scalar(Literal::I32(value))
    }

    #[must_use]
    pub fn scalar_i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn scalar_bool(value: bool) -> Self {
        Self::Scalar(Literal::Bool(value))
    }

    pub fn vector_f32(values: &[f32]) -> Result<Self, ValueError> {
        Self::vector(
            DType::F32,
            values.iter().copied().map(Literal::from_f32).collect(),
        )
    }

    pub fn vector_f64(values: &[f64]) -> Result<Self, ValueError> {
        Self::vector(
            DType::F64,
            values.iter().copied().map(Literal::from_f64).collect(),
        )
    }

    pub fn vector_i32(values: &[i32]) -> Result<Self, ValueError> {
        Self::vector(DType::I32, values.iter().copied().map(Literal::I32).collect())
    }

    fn vector(dtype: DType, elements: Vec<Literal>) -> Result<Self, ValueError> {
        let len = u32::try_from(elements.len())
            .map_err(|_| ValueError::DimensionOverflow {
                len: elements.len(),
            })?;
        TensorValue::new(dtype, Shape::vector(len), elements).map(Self::Tensor)
    }

    /// Builds a scalar for rank-0 shapes and a tensor otherwise.
    pub fn from_elements(
        dtype: DType,
        shape: Shape,
        mut elements: Vec<Literal>,
    ) -> Result<Self, ValueError> {
        if shape.rank() == 0 {
            if elements.len() != 1 {
                return Err(ValueError::ElementCountMismatch {
                    shape,
                    expected_count: 1,
                    actual_count: elements.len(),
                });
            }
            let literal = elements.remove(0);
            if literal.dtype() != dtype {
                return Err(ValueError::MixedDTypes {
                    index: 0,
                    expected: dtype,
                    actual: literal.dtype(),
                });
            }
            return Ok(Self::Scalar(literal));
        }
        TensorValue::new(dtype, shape, elements).map(Self::Tensor)
    }

    /// A value of the given shape with every element equal to `fill`.
    pub fn filled(fill: Literal, shape: Shape) -> Result<Self, ValueError> {
        let count = shape
            .element_count()
            .ok_or_else(|| ValueError::ShapeOverflow {
                shape: shape.clone(),
            })?;
        let count = usize::try_from(count).map_err(|_| ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        Self::from_elements(fill.dtype(), shape, vec![fill; count])
    }

    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }

    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Unit => None,
            Self::Scalar(literal) => Some(literal.dtype()),
            Self::Tensor(tensor) => Some(tensor.dtype),
        }
    }

    #[must_use]
    pub fn shape(&self) -> Option<Shape> {
        match self {
            Self::Unit => None,
            Self::Scalar(_) => Some(Shape::scalar()),
            Self::Tensor(tensor) => Some(tensor.shape.clone()),
        }
    }

    /// Elements in row-major order; empty for `Unit`.
    #[must_use]
    pub fn elements(&self) -> &[Literal] {
        match self {
            Self::Unit => &[],
            Self::Scalar(literal) => std::slice::from_ref(literal),
            Self::Tensor(tensor) => &tensor.elements,
        }
    }

    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.elements().len() as u64
    }

    #[must_use]
    pub fn as_scalar_literal(&self) -> Option<Literal> {
        match self {
            Self::Scalar(literal) => Some(*literal),
            Self::Unit | Self::Tensor(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_scalar_literal().map(Literal::as_f64)
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.elements().iter().copied().map(Literal::as_f64).collect()
    }

    #[must_use]
    pub fn contains_nan(&self) -> bool {
        self.elements().iter().any(|literal| literal.is_nan())
    }

    #[must_use]
    pub fn cast(&self, dtype: DType) -> Self {
        match self {
            Self::Unit => Self::Unit,
            Self::Scalar(literal) => Self::Scalar(literal.cast(dtype)),
            Self::Tensor(tensor) => Self::Tensor(TensorValue {
                dtype,
                shape: tensor.shape.clone(),
                elements: tensor
                    .elements
                    .iter()
                    .map(|literal| literal.cast(dtype))
                    .collect(),
            }),
        }
    }
}
