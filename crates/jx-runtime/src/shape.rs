//! Backend shape descriptors.

use jx_core::{DType, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum XlaShape {
    Array { dtype: DType, dims: Vec<u32> },
    Tuple(Vec<XlaShape>),
}

impl XlaShape {
    #[must_use]
    pub fn array(dtype: DType, dims: impl Into<Vec<u32>>) -> Self {
        Self::Array {
            dtype,
            dims: dims.into(),
        }
    }

    #[must_use]
    pub fn scalar(dtype: DType) -> Self {
        Self::array(dtype, Vec::new())
    }

    /// The empty tuple, which is how unit values are represented on device.
    #[must_use]
    pub fn unit() -> Self {
        Self::Tuple(Vec::new())
    }

    #[must_use]
    pub fn of_value(value: &Value) -> Self {
        match (value.dtype(), value.shape()) {
            (Some(dtype), Some(shape)) => Self::array(dtype, shape.dims),
            _ => Self::unit(),
        }
    }

    #[must_use]
    pub fn is_tuple(&self) -> bool {
        matches!(self, Self::Tuple(_))
    }

    #[must_use]
    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Tuple(elements) if elements.is_empty())
    }

    #[must_use]
    pub fn tuple_shapes(&self) -> &[XlaShape] {
        match self {
            Self::Tuple(elements) => elements,
            Self::Array { .. } => &[],
        }
    }

    #[must_use]
    pub fn element_type(&self) -> Option<DType> {
        match self {
            Self::Array { dtype, .. } => Some(*dtype),
            Self::Tuple(_) => None,
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> &[u32] {
        match self {
            Self::Array { dims, .. } => dims,
            Self::Tuple(_) => &[],
        }
    }

    #[must_use]
    pub fn element_count(&self) -> u64 {
        self.dimensions().iter().map(|dim| u64::from(*dim)).product()
    }
}

impl fmt::Display for XlaShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Array { dtype, dims } => {
                write!(f, "{dtype}[")?;
                for (idx, dim) in dims.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{dim}")?;
                }
                f.write_str("]")
            }
            Self::Tuple(elements) => {
                f.write_str("(")?;
                for (idx, element) in elements.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_is_the_empty_tuple() {
        assert!(XlaShape::unit().is_unit());
        assert!(XlaShape::unit().is_tuple());
        assert_eq!(XlaShape::of_value(&Value::Unit), XlaShape::unit());
        assert!(!XlaShape::Tuple(vec![XlaShape::scalar(DType::F32)]).is_unit());
    }

    #[test]
    fn display_formats_nested_tuples() {
        let shape = XlaShape::Tuple(vec![
            XlaShape::scalar(DType::F32),
            XlaShape::array(DType::I32, [3]),
        ]);
        assert_eq!(shape.to_string(), "(f32[], i32[3])");
    }

    #[test]
    fn of_value_reads_dims() {
        let value = Value::vector_f32(&[1.0, 2.0, 3.0]).expect("vector");
        let shape = XlaShape::of_value(&value);
        assert_eq!(shape.element_type(), Some(DType::F32));
        assert_eq!(shape.dimensions(), &[3]);
        assert_eq!(shape.element_count(), 3);
    }
}
