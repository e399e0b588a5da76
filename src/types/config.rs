//! Configuration structures.
//!
//! Framework configuration is loaded from a TOML file with environment
//! overrides; per-module configuration keeps the properties format mandated
//! by the module package contract (see `properties`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::Result;

/// Name of the state file holding the shutdown listener's UDP port.
pub const PORT_FILE_NAME: &str = ".port-number";

/// Global framework configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FrameworkConfig {
    /// Directory layout.
    #[serde(default)]
    pub dirs: DirsConfig,

    /// Module startup supervision.
    #[serde(default)]
    pub startup: StartupConfig,

    /// Names of registered built-in modules that should be started.
    #[serde(default)]
    pub built_in_modules: Vec<String>,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Managed directory layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirsConfig {
    /// Scratch/state directory (shutdown port file, unpack scratch).
    pub tmp_dir: PathBuf,

    /// Deployed module trees (`<modules_dir>/<name>/libs/*`).
    pub modules_dirs: Vec<PathBuf>,

    /// Extra per-module configuration overrides (`<ext_conf_dir>/<module>.conf`).
    pub ext_conf_dir: PathBuf,

    /// Shared units loaded once and visible to every module scope.
    pub ext_services_dir: PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            tmp_dir: PathBuf::from("../tmp"),
            modules_dirs: vec![PathBuf::from("../modules")],
            ext_conf_dir: PathBuf::from("../conf.d"),
            ext_services_dir: PathBuf::from("../extServices"),
        }
    }
}

/// Startup supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Per-module start deadline. The supervisor grants a fixed 100ms grace
    /// on top of this before declaring a timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl FrameworkConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| crate::types::Error::internal(format!("bad config {}: {e}", path.display())))?;
        Ok(config)
    }
}
