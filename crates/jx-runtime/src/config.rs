//! Runtime toggles, read from the environment or set explicitly.

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONSTANT_CUTOFF: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Keep 64-bit dtypes instead of downcasting to their 32-bit forms.
    pub enable_x64: bool,
    /// Inspect floating-point outputs for NaNs after every execution.
    pub debug_nans: bool,
    /// `"xla"` for the local service, `"xrt"` for a remote one.
    pub xla_backend: String,
    /// `"local"` or the address of the remote service.
    pub backend_target: String,
    /// Platform override (`cpu`, `gpu`, `Host`, `CUDA`); `None` auto-detects.
    pub platform_name: Option<String>,
    /// Device constants larger than this many elements are built on device.
    pub constant_cutoff: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enable_x64: false,
            debug_nans: false,
            xla_backend: "xla".to_owned(),
            backend_target: "local".to_owned(),
            platform_name: None,
            constant_cutoff: DEFAULT_CONSTANT_CUTOFF,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source; unparseable values
    /// keep their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup("JX_ENABLE_X64") {
            config.enable_x64 = parse_flag("JX_ENABLE_X64", &raw, config.enable_x64);
        }
        if let Some(raw) = lookup("JX_DEBUG_NANS") {
            config.debug_nans = parse_flag("JX_DEBUG_NANS", &raw, config.debug_nans);
        }
        if let Some(raw) = lookup("JX_XLA_BACKEND")
            && !raw.trim().is_empty()
        {
            config.xla_backend = raw.trim().to_owned();
        }
        if let Some(raw) = lookup("JX_BACKEND_TARGET")
            && !raw.trim().is_empty()
        {
            config.backend_target = raw.trim().to_owned();
        }
        if let Some(raw) = lookup("JX_PLATFORM_NAME") {
            let trimmed = raw.trim();
            config.platform_name = (!trimmed.is_empty()).then(|| trimmed.to_owned());
        }
        if let Some(raw) = lookup("JX_CONSTANT_CUTOFF") {
            match raw.trim().parse::<u64>() {
                Ok(cutoff) => config.constant_cutoff = cutoff,
                Err(_) => tracing::warn!(
                    var = "JX_CONSTANT_CUTOFF",
                    value = %raw,
                    "ignoring unparseable constant cutoff"
                ),
            }
        }
        config
    }

    #[must_use]
    pub fn with_enable_x64(mut self, enable_x64: bool) -> Self {
        self.enable_x64 = enable_x64;
        self
    }

    #[must_use]
    pub fn with_debug_nans(mut self, debug_nans: bool) -> Self {
        self.debug_nans = debug_nans;
        self
    }

    #[must_use]
    pub fn with_xla_backend(mut self, name: impl Into<String>) -> Self {
        self.xla_backend = name.into();
        self
    }

    #[must_use]
    pub fn with_backend_target(mut self, target: impl Into<String>) -> Self {
        self.backend_target = target.into();
        self
    }

    #[must_use]
    pub fn with_platform_name(mut self, platform: Option<String>) -> Self {
        self.platform_name = platform;
        self
    }

    #[must_use]
    pub fn with_constant_cutoff(mut self, cutoff: u64) -> Self {
        self.constant_cutoff = cutoff;
        self
    }
}

#[must_use]
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" | "t" => Some(true),
        "0" | "false" | "no" | "off" | "n" | "f" => Some(false),
        _ => None,
    }
}

fn parse_flag(var: &str, raw: &str, default: bool) -> bool {
    parse_bool(raw).unwrap_or_else(|| {
        tracing::warn!(var, value = %raw, "ignoring unparseable boolean flag");
        default
    })
}
