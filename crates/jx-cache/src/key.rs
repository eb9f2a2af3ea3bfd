//! Structural cache keys.
//!
//! A key is the SHA-256 digest of a canonical `field=value|...` payload built
//! from primitive names, params, abstract values and jaxpr fingerprints.
//! Array contents never enter a payload: constants handed to whole-program
//! compilation are identified by the address of their shared allocation,
//! which stays valid while the cache entry holding them is alive.

use jx_core::{AbstractValue, JaxRef, Jaxpr, Params, Primitive};
use jx_interpreters::AxisEnv;
use jx_runtime::{DeviceId, Platform};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;

pub const PRIMITIVE_NAMESPACE: &str = "jxp";
pub const JAXPR_NAMESPACE: &str = "jxj";
pub const EXECUTABLE_NAMESPACE: &str = "jxx";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: &'static str,
    pub digest_hex: String,
}

impl CacheKey {
    #[must_use]
    pub fn as_string(&self) -> String {
        format!("{}-{}", self.namespace, self.digest_hex)
    }

    fn digest(namespace: &'static str, payload: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(payload.as_bytes());
        Self {
            namespace,
            digest_hex: bytes_to_hex(&hasher.finalize()),
        }
    }

    /// Derives the key of the executable compiled from this key's graph with
    /// the given replica options.
    #[must_use]
    pub fn with_compile_options(&self, nreps: usize, device_assignment: Option<&[DeviceId]>) -> Self {
        let mut payload = format!("graph={}|nreps={nreps}|devices=", self.as_string());
        match device_assignment {
            Some(devices) => write_list(&mut payload, devices),
            None => payload.push_str("default"),
        }
        Self::digest(EXECUTABLE_NAMESPACE, &payload)
    }
}

/// Everything single-primitive compilation depends on.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveKeyInput<'a> {
    pub primitive: &'static Primitive,
    pub params: &'a Params,
    pub sub_jaxprs: &'a [Jaxpr],
    pub arg_avals: &'a [AbstractValue],
    pub platform: Platform,
    pub enable_x64: bool,
}

/// Everything whole-program graph construction depends on.
#[derive(Debug, Clone, Copy)]
pub struct JaxprKeyInput<'a> {
    pub jaxpr: &'a Jaxpr,
    pub axis_env: &'a AxisEnv,
    pub consts: &'a [JaxRef],
    pub arg_avals: &'a [AbstractValue],
    pub platform: Platform,
    pub enable_x64: bool,
}

#[must_use]
pub fn primitive_key(input: &PrimitiveKeyInput<'_>) -> CacheKey {
    CacheKey::digest(PRIMITIVE_NAMESPACE, &primitive_payload(input))
}

#[must_use]
pub fn jaxpr_key(input: &JaxprKeyInput<'_>) -> CacheKey {
    CacheKey::digest(JAXPR_NAMESPACE, &jaxpr_payload(input))
}

fn primitive_payload(input: &PrimitiveKeyInput<'_>) -> String {
    let mut out = format!(
        "prim={}|platform={}|x64={}|params=",
        input.primitive.name(),
        input.platform,
        input.enable_x64
    );
    write_params(&mut out, input.params);
    out.push_str("|args=");
    write_avals(&mut out, input.arg_avals);
    out.push_str("|subs=");
    for sub in input.sub_jaxprs {
        let _ = write!(out, "<{}>", sub.canonical_fingerprint());
    }
    out
}

fn jaxpr_payload(input: &JaxprKeyInput<'_>) -> String {
    let mut out = format!(
        "platform={}|x64={}|nreps={}|axes=",
        input.platform,
        input.enable_x64,
        input.axis_env.nreps()
    );
    for (name, size) in input.axis_env.names().iter().zip(input.axis_env.sizes()) {
        let _ = write!(out, "{name}:{size},");
    }
    out.push_str("|consts=");
    for value in input.consts {
        let _ = write!(out, "{}@{:x},", value.type_name(), const_identity(value));
    }
    out.push_str("|args=");
    write_avals(&mut out, input.arg_avals);
    let _ = write!(out, "|jaxpr={}", input.jaxpr.canonical_fingerprint());
    out
}

fn const_identity(value: &JaxRef) -> usize {
    Arc::as_ptr(value).cast::<()>() as usize
}

fn write_params(out: &mut String, params: &Params) {
    for (key, value) in params {
        let _ = write!(out, "{key}={value};");
    }
}

fn write_avals(out: &mut String, avals: &[AbstractValue]) {
    for aval in avals {
        let _ = write!(out, "{},", aval.to_shaped());
    }
}

fn write_list<T: std::fmt::Display>(out: &mut String, items: &[T]) {
    for item in items {
        let _ = write!(out, "{item},");
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
