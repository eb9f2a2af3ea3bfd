use crate::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value that can flow through dispatch: host values, device arrays, lazy
/// constants, or any type an extension registers handlers for.
///
/// Handler tables dispatch on the concrete type behind `as_any`, so each
/// implementation must return `self`.
pub trait JaxValue: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;
}

pub type JaxRef = Arc<dyn JaxValue>;

impl dyn JaxValue {
    #[must_use]
    pub fn downcast_ref<T: JaxValue>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    #[must_use]
    pub fn is<T: JaxValue>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl JaxValue for Value {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        "Value"
    }
}

#[must_use]
pub fn host_ref(value: Value) -> JaxRef {
    Arc::new(value)
}
