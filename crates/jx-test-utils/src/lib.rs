#![forbid(unsafe_code)]

//! Shared test helpers: property-test case counts and a backend wrapper
//! that counts compiles and host transfers.

use jx_core::Value;
use jx_runtime::{
    Backend, BackendError, BackendRef, CompileOptions, DeviceBuffer, DeviceId, DeviceInfo,
    Executable, Platform, XlaComputation,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("JX_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

/// Wraps a backend and records every `compile` call, so tests can assert
/// how often (and whether) compilation happened.
#[derive(Debug)]
pub struct CountingBackend {
    inner: BackendRef,
    compiles: AtomicUsize,
    transfers: AtomicUsize,
    compiled: Mutex<Vec<(String, usize)>>,
}

impl CountingBackend {
    #[must_use]
    pub fn new(inner: BackendRef) -> Arc<Self> {
        Arc::new(Self {
            inner,
            compiles: AtomicUsize::new(0),
            transfers: AtomicUsize::new(0),
            compiled: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Computation names and replica counts, in compile order.
    #[must_use]
    pub fn compiled(&self) -> Vec<(String, usize)> {
        self.compiled.lock().clone()
    }
}

impl Backend for CountingBackend {
    fn platform(&self) -> Platform {
        self.inner.platform()
    }

    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.inner.devices()
    }

    fn compile(
        &self,
        computation: &XlaComputation,
        options: &CompileOptions,
    ) -> Result<Arc<dyn Executable>, BackendError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.compiled
            .lock()
            .push((computation.name().to_owned(), options.num_replicas));
        self.inner.compile(computation, options)
    }

    fn buffer_from_host(
        &self,
        value: &Value,
        device: DeviceId,
    ) -> Result<Arc<dyn DeviceBuffer>, BackendError> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        self.inner.buffer_from_host(value, device)
    }
}
