//! Precision policy: 64-bit dtypes are downcast unless x64 is enabled.

use jx_core::{AbstractValue, DType, Value};
use std::borrow::Cow;

#[must_use]
pub fn canonicalize_dtype(dtype: DType, enable_x64: bool) -> DType {
    if enable_x64 { dtype } else { dtype.to_32bit() }
}

/// Returns the value unchanged when its dtype is already canonical.
#[must_use]
pub fn canonicalize_value(value: &Value, enable_x64: bool) -> Cow<'_, Value> {
    match value.dtype() {
        Some(dtype) if canonicalize_dtype(dtype, enable_x64) != dtype => {
            Cow::Owned(value.cast(canonicalize_dtype(dtype, enable_x64)))
        }
        _ => Cow::Borrowed(value),
    }
}

#[must_use]
pub fn canonicalize_aval(aval: &AbstractValue, enable_x64: bool) -> AbstractValue {
    match aval.dtype() {
        Some(dtype) if canonicalize_dtype(dtype, enable_x64) != dtype => {
            aval.with_dtype(canonicalize_dtype(dtype, enable_x64))
        }
        _ => aval.clone(),
    }
}
