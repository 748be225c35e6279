//! Engine configuration loaded from YAML.
//!
//! Every section is `#[serde(default)]`, so a file only has to name what it
//! overrides. The turn thresholds live in [`TurnPolicy`].
mod error;
mod policy;

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use error::ConfigError;
pub use policy::*;

use crate::devices::{CaptureEndpoint, PlaybackTarget};
use crate::kernel::audit::AuditLevel;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_PATH_ENV: &str = "PARLEY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: TurnPolicy,
    pub backend: BackendConfig,
    pub audit: AuditConfig,
    pub capture_endpoints: Vec<CaptureEndpoint>,
    pub playback_targets: Vec<PlaybackTarget>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: TurnPolicy::default(),
            backend: BackendConfig::default(),
            audit: AuditConfig::default(),
            capture_endpoints: vec![
                CaptureEndpoint::new("20", "incall_cap_0"),
                CaptureEndpoint::new("21", "incall_cap_1"),
                CaptureEndpoint::new("22", "incall_cap_2"),
                CaptureEndpoint::new("54", "incall_cap_3"),
            ],
            playback_targets: vec![
                PlaybackTarget::new("29", 48_000, 2, 1.5),
                PlaybackTarget::new("23", 48_000, 2, 1.5),
                PlaybackTarget::new("18", 48_000, 1, 1.0),
                PlaybackTarget::new("19", 48_000, 1, 1.0),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub turn_path: String,
    pub asr_path: String,
    pub bearer_token: Option<String>,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Outer bound on a whole turn request, on top of the client timeouts.
    pub turn_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            turn_path: "/api/turn".to_string(),
            asr_path: "/api/asr".to_string(),
            bearer_token: None,
            connect_timeout_ms: 20_000,
            read_timeout_ms: 45_000,
            turn_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub level: AuditLevel,
    pub capacity: usize,
    pub include_transcripts: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            level: AuditLevel::Normal,
            capacity: 200,
            include_transcripts: true,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_yaml(path.as_ref().to_path_buf())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the file named by `PARLEY_CONFIG`, or falls back to defaults when unset.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        if self.capture_endpoints.is_empty() {
            return Err(ConfigError::invalid("capture_endpoints", "at least one endpoint is required"));
        }
        if self.playback_targets.is_empty() {
            return Err(ConfigError::invalid("playback_targets", "at least one target is required"));
        }
        if let Some(target) = self.playback_targets.iter().find(|t| t.speed_compensation <= 0.0) {
            return Err(ConfigError::invalid(
                "playback_targets",
                format!("target {} has a non-positive speed compensation", target.id),
            ));
        }
        if self.audit.capacity == 0 {
            return Err(ConfigError::invalid("audit.capacity", "must be positive"));
        }
        Ok(())
    }
}

fn load_yaml<T>(path: PathBuf) -> Result<T, ConfigError>
where
    T: DeserializeOwned,
{
    if !path.is_file() {
        return Err(ConfigError::Missing(path));
    }
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}
