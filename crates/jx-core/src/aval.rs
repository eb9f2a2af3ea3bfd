use crate::{DType, Shape, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShapedArray {
    pub dtype: DType,
    pub shape: Shape,
}

impl ShapedArray {
    #[must_use]
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }
}

impl fmt::Display for ShapedArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// A shaped array whose value is known at trace time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteArray {
    pub aval: ShapedArray,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvalKind {
    Unit,
    Shaped,
    Concrete,
}

impl AvalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unit => "AbstractUnit",
            Self::Shaped => "ShapedArray",
            Self::Concrete => "ConcreteArray",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbstractValue {
    Unit,
    Shaped(ShapedArray),
    Concrete(ConcreteArray),
}

impl AbstractValue {
    #[must_use]
    pub fn shaped(dtype: DType, shape: Shape) -> Self {
        Self::Shaped(ShapedArray::new(dtype, shape))
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::shaped(dtype, Shape::scalar())
    }

    /// `None` for `Value::Unit`, which has no concrete array form.
    #[must_use]
    pub fn concrete(value: Value) -> Option<Self> {
        let dtype = value.dtype()?;
        let shape = value.shape()?;
        Some(Self::Concrete(ConcreteArray {
            aval: ShapedArray::new(dtype, shape),
            value,
        }))
    }

    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match (value.dtype(), value.shape()) {
            (Some(dtype), Some(shape)) => Self::shaped(dtype, shape),
            _ => Self::Unit,
        }
    }

    #[must_use]
    pub fn kind(&self) -> AvalKind {
        match self {
            Self::Unit => AvalKind::Unit,
            Self::Shaped(_) => AvalKind::Shaped,
            Self::Concrete(_) => AvalKind::Concrete,
        }
    }

    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }

    #[must_use]
    pub fn as_shaped(&self) -> Option<&ShapedArray> {
        match self {
            Self::Unit => None,
            Self::Shaped(shaped) => Some(shaped),
            Self::Concrete(concrete) => Some(&concrete.aval),
        }
    }

    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        self.as_shaped().map(|shaped| shaped.dtype)
    }

    #[must_use]
    pub fn shape(&self) -> Option<&Shape> {
        self.as_shaped().map(|shaped| &shaped.shape)
    }

    /// Drops any known value, keeping only shape and dtype.
    #[must_use]
    pub fn to_shaped(&self) -> Self {
        match self {
            Self::Concrete(concrete) => Self::Shaped(concrete.aval.clone()),
            other => other.clone(),
        }
    }

    #[must_use]
    pub fn with_dtype(&self, dtype: DType) -> Self {
        match self.as_shaped() {
            Some(shaped) => Self::shaped(dtype, shaped.shape.clone()),
            None => Self::Unit,
        }
    }
}

impl fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("unit"),
            Self::Shaped(shaped) => write!(f, "{shaped}"),
            Self::Concrete(concrete) => write!(f, "concrete {}", concrete.aval),
        }
    }
}

/// Abstract evaluation failures raised by a primitive's shape rule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("{primitive} expected {expected} operands, got {actual}")]
    Arity {
        primitive: String,
        expected: usize,
        actual: usize,
    },
    #[error("{primitive} got incompatible operands {lhs} and {rhs}")]
    IncompatibleOperands {
        primitive: String,
        lhs: String,
        rhs: String,
    },
    #[error("{primitive} does not accept operand {operand}")]
    UnsupportedOperand { primitive: String, operand: String },
    #[error("{primitive} is missing parameter `{param}`")]
    MissingParam { primitive: String, param: String },
    #[error("{primitive}: {detail}")]
    Invalid { primitive: String, detail: String },
    #[error("{primitive} declares a single result but abstract evaluation produced {count}")]
    ResultCount { primitive: String, count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Literal;

    #[test]
    fn from_value_maps_unit_and_arrays() {
        assert_eq!(AbstractValue::from_value(&Value::Unit), AbstractValue::Unit);
        let aval = AbstractValue::from_value(&Value::vector_f32(&[1.0, 2.0]).expect("vector"));
        assert_eq!(aval, AbstractValue::shaped(DType::F32, Shape::vector(2)));
    }

    #[test]
    fn concrete_strips_to_shaped() {
        let concrete = AbstractValue::concrete(Value::scalar_i32(4)).expect("concrete");
        assert_eq!(concrete.kind(), AvalKind::Concrete);
        assert_eq!(concrete.to_shaped(), AbstractValue::scalar(DType::I32));
        assert_eq!(concrete.dtype(), Some(DType::I32));
        assert!(AbstractValue::concrete(Value::Unit).is_none());
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(
            AbstractValue::shaped(DType::F32, Shape::new([2, 3])).to_string(),
            "f32[2,3]"
        );
        assert_eq!(AbstractValue::Unit.to_string(), "unit");
        let concrete =
            AbstractValue::concrete(Value::Scalar(Literal::Bool(true))).expect("concrete");
        assert_eq!(concrete.to_string(), "concrete bool[]");
    }
}
