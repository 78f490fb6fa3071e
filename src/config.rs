/// Configuration module
///
/// Startup configuration for the trigger node, read once from a JSON file
/// and immutable afterwards, plus the access credential read from the local
/// secrets store. Every problem found here is fatal at startup.

use crate::controller::ControllerConfig;
use crate::spotter::{SpotterEngine, SpotterSettings};
use directories::BaseDirs;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Key holding the spotting engine credential in the secrets file
pub const ACCESS_KEY_NAME: &str = "PORCUPINE_ACCESS_KEY";

/// Secrets file location relative to the home directory
pub const DEFAULT_SECRETS_PATH: &str = "ws/api_keys/.secrets.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("At least one keyword is required")]
    NoKeywords,

    #[error("{paths} keyword path(s) but {sensitivities} sensitivity value(s)")]
    SensitivityCountMismatch { paths: usize, sensitivities: usize },

    #[error("{paths} keyword path(s) but {names} keyword name(s)")]
    NameCountMismatch { paths: usize, names: usize },

    #[error("Sensitivity {value} for keyword {index} must be between 0.0 and 1.0")]
    SensitivityOutOfRange { index: usize, value: f32 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Secrets file {0} does not exist. Please create it and add your access key.")]
    SecretsMissing(PathBuf),

    #[error("{key} is not set. Please add it to {path}.")]
    CredentialMissing { key: String, path: PathBuf },

    #[error("Could not determine the home directory for the secrets file")]
    NoHomeDirectory,
}

/// Trigger node configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TriggerConfig {
    /// Index of the capture device in the host's input device list
    pub audio_device_index: usize,

    /// Name published for each keyword, parallel to `keyword_paths`
    pub keyword_names: Vec<String>,

    /// Keyword model files (.ppn)
    pub keyword_paths: Vec<PathBuf>,

    /// Per-keyword sensitivity (0.0 - 1.0, higher = more false positives)
    pub sensitivities: Vec<f32>,

    /// Spotting engine parameter file (.pv)
    pub model_path: PathBuf,

    /// Base directory for relative model and keyword paths
    pub resource_dir: Option<PathBuf>,

    pub engine: SpotterEngine,

    /// Topic name trigger events are published under
    pub wakeword_topic: String,

    /// UDP destination for trigger events; in-process broadcast when unset
    pub event_address: Option<SocketAddr>,

    pub activation_service: String,

    /// host:port of the activation responder
    pub activation_address: String,

    pub activation_timeout_ms: u64,

    /// How long startup waits for the activation responder
    pub service_wait_timeout_ms: u64,

    /// Longest wait for a frame before a read counts as interrupted
    pub capture_timeout_ms: u64,

    /// Consecutive interrupted reads tolerated before capture is fatal
    pub capture_retry_limit: u32,

    pub capture_retry_delay_ms: u64,

    /// Capture ring capacity, in frames
    pub capture_buffer_frames: usize,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            audio_device_index: 0,
            keyword_names: vec!["Hey Alfred".to_string()],
            keyword_paths: vec![PathBuf::from(
                "resources/keywords/Hey-Alfred_en_linux_v2_1_0.ppn",
            )],
            sensitivities: vec![0.5],
            model_path: PathBuf::from("resources/models/porcupine_params.pv"),
            resource_dir: None,
            engine: SpotterEngine::default(),
            wakeword_topic: "/interface/wakeword_detector/wakeword".to_string(),
            event_address: None,
            activation_service: "wakeword_trigger".to_string(),
            activation_address: "127.0.0.1:7411".to_string(),
            activation_timeout_ms: 2000,
            service_wait_timeout_ms: 5000,
            capture_timeout_ms: 1000,
            capture_retry_limit: 3,
            capture_retry_delay_ms: 50,
            capture_buffer_frames: 32,
        }
    }
}

impl TriggerConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Self = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keyword_paths.is_empty() {
            return Err(ConfigError::NoKeywords);
        }

        if self.sensitivities.len() != self.keyword_paths.len() {
            return Err(ConfigError::SensitivityCountMismatch {
                paths: self.keyword_paths.len(),
                sensitivities: self.sensitivities.len(),
            });
        }

        if self.keyword_names.len() != self.keyword_paths.len() {
            return Err(ConfigError::NameCountMismatch {
                paths: self.keyword_paths.len(),
                names: self.keyword_names.len(),
            });
        }

        if let Some((index, &value)) = self
            .sensitivities
            .iter()
            .enumerate()
            .find(|(_, s)| !(0.0..=1.0).contains(*s))
        {
            return Err(ConfigError::SensitivityOutOfRange { index, value });
        }

        if self.keyword_names.iter().any(|n| n.trim().is_empty()) {
            return Err(ConfigError::Invalid("keyword names must not be empty".to_string()));
        }

        if self.activation_service.is_empty() || self.activation_address.is_empty() {
            return Err(ConfigError::Invalid(
                "activation service name and address are required".to_string(),
            ));
        }

        if self.activation_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "activation_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.capture_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.capture_buffer_frames < 2 {
            return Err(ConfigError::Invalid(
                "capture_buffer_frames must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve a model or keyword path against `resource_dir`
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.resource_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Engine construction parameters with resolved paths
    pub fn spotter_settings(&self, access_key: String) -> SpotterSettings {
        SpotterSettings {
            access_key,
            model_path: self.resolve(&self.model_path),
            keyword_paths: self.keyword_paths.iter().map(|p| self.resolve(p)).collect(),
            sensitivities: self.sensitivities.clone(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            keyword_names: self.keyword_names.clone(),
            activation_timeout: Duration::from_millis(self.activation_timeout_ms),
            capture_retry_limit: self.capture_retry_limit,
            capture_retry_delay: Duration::from_millis(self.capture_retry_delay_ms),
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn service_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.service_wait_timeout_ms)
    }
}

/// `~/ws/api_keys/.secrets.json`
pub fn default_secrets_path() -> Result<PathBuf, ConfigError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(DEFAULT_SECRETS_PATH))
        .ok_or(ConfigError::NoHomeDirectory)
}

/// Read the engine access key
///
/// A non-empty `override_key` (the `PORCUPINE_ACCESS_KEY` environment
/// variable) wins over the secrets file.
pub fn load_access_key(
    secrets_path: &Path,
    override_key: Option<&str>,
) -> Result<String, ConfigError> {
    if let Some(key) = override_key.map(str::trim).filter(|k| !k.is_empty()) {
        debug!("Using access key from environment");
        return Ok(key.to_string());
    }

    if !secrets_path.is_file() {
        return Err(ConfigError::SecretsMissing(secrets_path.to_path_buf()));
    }

    let contents = std::fs::read_to_string(secrets_path).map_err(|source| ConfigError::Io {
        path: secrets_path.to_path_buf(),
        source,
    })?;

    let secrets: HashMap<String, serde_json::Value> =
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: secrets_path.to_path_buf(),
            source,
        })?;

    let key = secrets
        .get(ACCESS_KEY_NAME)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ConfigError::CredentialMissing {
            key: ACCESS_KEY_NAME.to_string(),
            path: secrets_path.to_path_buf(),
        })?;

    info!("Loaded access key from {}", secrets_path.display());
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn write_temp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TriggerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.keyword_names, vec!["Hey Alfred"]);
        assert_eq!(config.activation_service, "wakeword_trigger");
        assert_eq!(config.wakeword_topic, "/interface/wakeword_detector/wakeword");
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let file = write_temp(r#"{ "audio_device_index": 2, "engine": "energy" }"#);
        let config = TriggerConfig::load(file.path()).unwrap();

        assert_eq!(config.audio_device_index, 2);
        assert_eq!(config.engine, SpotterEngine::Energy);
        assert_eq!(config.sensitivities, vec![0.5]);
        assert_eq!(config.capture_retry_limit, 3);
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let file = write_temp(r#"{ "sensitivity": 0.5 }"#);
        assert!(matches!(
            TriggerConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            TriggerConfig::load("/nonexistent/wakeword.json"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_keyword_sensitivity_mismatch() {
        let config = TriggerConfig {
            sensitivities: vec![0.5, 0.7],
            ..Default::default()
        };

        match config.validate() {
            Err(ConfigError::SensitivityCountMismatch { paths, sensitivities }) => {
                assert_eq!(paths, 1);
                assert_eq!(sensitivities, 2);
            }
            other => panic!("Expected SensitivityCountMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_keyword_name_mismatch() {
        let config = TriggerConfig {
            keyword_names: vec![],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NameCountMismatch { paths: 1, names: 0 })
        ));
    }

    #[test]
    fn test_sensitivity_range() {
        let config = TriggerConfig {
            sensitivities: vec![1.5],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SensitivityOutOfRange { index: 0, .. })
        ));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = TriggerConfig {
            activation_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = TriggerConfig {
            capture_timeout_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_resource_dir_resolution() {
        let config = TriggerConfig {
            resource_dir: Some(PathBuf::from("/opt/alfred/wakeword_detector")),
            keyword_paths: vec![
                PathBuf::from("resources/keywords/a.ppn"),
                PathBuf::from("/abs/b.ppn"),
            ],
            keyword_names: vec!["A".to_string(), "B".to_string()],
            sensitivities: vec![0.5, 0.6],
            ..Default::default()
        };

        let settings = config.spotter_settings("key".to_string());
        assert_eq!(
            settings.model_path,
            PathBuf::from("/opt/alfred/wakeword_detector/resources/models/porcupine_params.pv")
        );
        assert_eq!(
            settings.keyword_paths,
            vec![
                PathBuf::from("/opt/alfred/wakeword_detector/resources/keywords/a.ppn"),
                PathBuf::from("/abs/b.ppn"),
            ]
        );
        assert_eq!(settings.sensitivities, vec![0.5, 0.6]);
    }

    #[test]
    fn test_controller_config() {
        let config = TriggerConfig::default();
        let controller = config.controller_config();
        assert_eq!(controller.activation_timeout, Duration::from_secs(2));
        assert_eq!(controller.capture_retry_limit, 3);
        assert_eq!(controller.keyword_names, vec!["Hey Alfred"]);
    }

    #[test]
    fn test_access_key_from_secrets_file() {
        let file = write_temp(r#"{ "PORCUPINE_ACCESS_KEY": "abc123", "OTHER": 1 }"#);
        assert_eq!(load_access_key(file.path(), None).unwrap(), "abc123");
    }

    #[test]
    fn test_access_key_override() {
        let key = load_access_key(Path::new("/nonexistent/.secrets.json"), Some("env-key")).unwrap();
        assert_eq!(key, "env-key");
    }

    #[test]
    fn test_missing_secrets_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".secrets.json");

        let err = load_access_key(&path, Some("")).unwrap_err();
        assert!(matches!(err, ConfigError::SecretsMissing(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_missing_credential_key() {
        let file = write_temp(r#"{ "OPENAI_API_KEY": "x" }"#);
        let err = load_access_key(file.path(), None).unwrap_err();

        assert!(matches!(err, ConfigError::CredentialMissing { .. }));
        assert!(err.to_string().contains(ACCESS_KEY_NAME));
    }
}
