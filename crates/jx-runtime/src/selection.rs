//! Backend selection and the process-wide backend handle.
//!
//! `select_backend` resolves a [`RuntimeConfig`] against the factories a
//! [`BackendSelector`] knows about. [`get_backend`] memoizes the first
//! successful selection for the lifetime of the process; later calls return
//! the same backend regardless of their arguments.

use crate::backend::{BackendError, BackendRef};
use crate::config::RuntimeConfig;
use crate::device::Platform;
use parking_lot::Mutex;
use std::fmt;
use std::sync::OnceLock;

type LocalFactory = Box<dyn Fn() -> Result<Option<BackendRef>, BackendError> + Send + Sync>;
type RemoteConnector = Box<dyn Fn(&str) -> Result<BackendRef, BackendError> + Send + Sync>;

/// Factories for the backends a process can reach.
///
/// Local factories are tried in registration order; a factory returning
/// `Ok(None)` means its platform has no devices on this host.
#[derive(Default)]
pub struct BackendSelector {
    local: Vec<(Platform, LocalFactory)>,
    remote: Option<RemoteConnector>,
}

impl BackendSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_local(
        mut self,
        platform: Platform,
        factory: impl Fn() -> Result<Option<BackendRef>, BackendError> + Send + Sync + 'static,
    ) -> Self {
        self.local.push((platform, Box::new(factory)));
        self
    }

    #[must_use]
    pub fn with_remote(
        mut self,
        connector: impl Fn(&str) -> Result<BackendRef, BackendError> + Send + Sync + 'static,
    ) -> Self {
        self.remote = Some(Box::new(connector));
        self
    }

    #[must_use]
    pub fn local_platforms(&self) -> Vec<Platform> {
        self.local.iter().map(|(platform, _)| *platform).collect()
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSelector")
            .field("local", &self.local_platforms())
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

/// Resolves the configured backend without memoizing it.
pub fn select_backend(
    config: &RuntimeConfig,
    selector: &BackendSelector,
) -> Result<BackendRef, BackendError> {
    match config.xla_backend.as_str() {
        "xla" => select_local(config, selector),
        "xrt" => {
            let connector = selector.remote.as_ref().ok_or_else(|| BackendError::Unavailable {
                backend: "xrt".to_owned(),
                detail: format!("no remote connector for target `{}`", config.backend_target),
            })?;
            let backend = connector(&config.backend_target)?;
            tracing::debug!(
                target_address = %config.backend_target,
                platform = %backend.platform(),
                "connected to remote backend"
            );
            Ok(backend)
        }
        other => Err(BackendError::UnknownBackend {
            name: other.to_owned(),
        }),
    }
}

fn select_local(
    config: &RuntimeConfig,
    selector: &BackendSelector,
) -> Result<BackendRef, BackendError> {
    let requested = match config.platform_name.as_deref() {
        None => None,
        Some(name) => Some(Platform::from_name(name).ok_or_else(|| {
            BackendError::Unavailable {
                backend: name.to_owned(),
                detail: "unrecognized platform name".to_owned(),
            }
        })?),
    };

    let backend = match requested {
        Some(platform) => {
            let (_, factory) = selector
                .local
                .iter()
                .find(|(candidate, _)| *candidate == platform)
                .ok_or_else(|| BackendError::Unavailable {
                    backend: platform.as_str().to_owned(),
                    detail: "no factory registered for this platform".to_owned(),
                })?;
            factory()?.ok_or_else(|| BackendError::Unavailable {
                backend: platform.as_str().to_owned(),
                detail: "no devices found".to_owned(),
            })?
        }
        None => {
            let mut found = None;
            for (_, factory) in &selector.local {
                if let Some(backend) = factory()? {
                    found = Some(backend);
                    break;
                }
            }
            found.ok_or(BackendError::NoBackendFound)?
        }
    };

    if backend.platform() == Platform::Cpu && requested != Some(Platform::Cpu) {
        tracing::warn!("No GPU/TPU found, falling back to CPU.");
    }
    tracing::debug!(
        platform = %backend.platform(),
        devices = backend.device_count(),
        "selected local backend"
    );
    Ok(backend)
}

/// A lazily initialized backend slot. Initialization runs at most once
/// successfully; failed attempts leave the slot empty so a later call may
/// retry.
pub struct BackendHandle {
    cell: OnceLock<BackendRef>,
    init_lock: Mutex<()>,
}

impl BackendHandle {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Option<BackendRef> {
        self.cell.get().cloned()
    }

    pub fn get_or_init(
        &self,
        init: impl FnOnce() -> Result<BackendRef, BackendError>,
    ) -> Result<BackendRef, BackendError> {
        if let Some(backend) = self.cell.get() {
            return Ok(backend.clone());
        }
        let _guard = self.init_lock.lock();
        if let Some(backend) = self.cell.get() {
            return Ok(backend.clone());
        }
        let backend = init()?;
        tracing::debug!(platform = %backend.platform(), "initialized backend handle");
        Ok(self.cell.get_or_init(|| backend).clone())
    }
}

impl Default for BackendHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle")
            .field("initialized", &self.cell.get().is_some())
            .finish()
    }
}

static GLOBAL_BACKEND: BackendHandle = BackendHandle::new();

/// The process-wide backend, selected on first use.
pub fn get_backend(
    config: &RuntimeConfig,
    selector: &BackendSelector,
) -> Result<BackendRef, BackendError> {
    GLOBAL_BACKEND.get_or_init(|| select_backend(config, selector))
}

pub fn device_count(
    config: &RuntimeConfig,
    selector: &BackendSelector,
) -> Result<usize, BackendError> {
    Ok(get_backend(config, selector)?.device_count())
}
