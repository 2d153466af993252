use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::code_reader::CodeReaderConfig;
use crate::pipeline::feature_cache::CacheConfig;
use crate::pipeline::noise_filter::FilterConfig;
use crate::pipeline::orchestrator::PipelineConfig;
use crate::pipeline::router::{EndpointSpec, RouterConfig};

/// Application-level constants
pub const APP_NAME: &str = "LogPilot";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Config file path override.
pub const CONFIG_ENV: &str = "LOGPILOT_CONFIG";
/// Audit dump directory override.
pub const DUMP_DIR_ENV: &str = "LOGPILOT_DUMP_DIR";

/// Get the application data directory (`~/.logpilot/`).
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".logpilot"))
}

/// `~/.logpilot/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|dir| dir.join("config.toml"))
}

/// Used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "logpilot=info"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse config {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Invalid config value for {field}: {message}")]
    ValidationFailed { field: String, message: String },
}

/// Full service configuration, one TOML document.
///
/// Resolution order (highest priority first):
/// 1. Environment variables (`LOGPILOT_DUMP_DIR`)
/// 2. Config file (explicit path, `LOGPILOT_CONFIG`, or `~/.logpilot/config.toml`)
/// 3. Compiled defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    pub filter: FilterConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub endpoints: Vec<EndpointSpec>,
    pub code: CodeReaderConfig,
    pub pipeline: PipelineConfig,
}

impl DiagnosisConfig {
    /// Load and validate. An explicit `path` (or `LOGPILOT_CONFIG`) must
    /// exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    tracing::debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(std::env::var_os(DUMP_DIR_ENV).map(PathBuf::from));
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document (no validation).
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            path: "<string>".to_string(),
            message: e.to_string(),
        })
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;
        let config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    fn apply_overrides(&mut self, dump_dir: Option<PathBuf>) {
        if let Some(dir) = dump_dir.filter(|d| !d.as_os_str().is_empty()) {
            self.pipeline.dump_dir = Some(dir);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.filter.max_total_lines == 0 {
            return Err(invalid("filter.max_total_lines", "must be greater than 0"));
        }
        if !(self.cache.ttl_secs.is_finite() && self.cache.ttl_secs > 0.0) {
            return Err(invalid("cache.ttl_secs", "must be a positive number of seconds"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache.max_entries", "must be greater than 0"));
        }
        if self.router.failure_threshold == 0 {
            return Err(invalid("router.failure_threshold", "must be greater than 0"));
        }
        if !(self.router.cooldown_secs.is_finite() && self.router.cooldown_secs >= 0.0) {
            return Err(invalid("router.cooldown_secs", "must be zero or more seconds"));
        }
        if self.code.max_file_bytes == 0 {
            return Err(invalid("code.max_file_bytes", "must be greater than 0"));
        }
        if self.code.max_refs == 0 {
            return Err(invalid("code.max_refs", "must be greater than 0"));
        }
        if self.pipeline.workers == 0 {
            return Err(invalid("pipeline.workers", "must be greater than 0"));
        }
        if self.pipeline.call_timeout_secs == 0 {
            return Err(invalid("pipeline.call_timeout_secs", "must be greater than 0"));
        }
        if self.pipeline.max_manual_chars == 0 {
            return Err(invalid("pipeline.max_manual_chars", "must be greater than 0"));
        }

        let mut names = HashSet::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if endpoint.name.trim().is_empty() {
                return Err(invalid(&format!("endpoints[{i}].name"), "must not be empty"));
            }
            if endpoint.base_url.trim().is_empty() {
                return Err(invalid(&format!("endpoints[{i}].base_url"), "must not be empty"));
            }
            if !names.insert(endpoint.name.as_str()) {
                return Err(invalid(
                    &format!("endpoints[{i}].name"),
                    &format!("duplicate endpoint '{}'", endpoint.name),
                ));
            }
        }
        for (stage, preferred) in &self.router.preferences {
            if let Some(unknown) = preferred.iter().find(|n| !names.contains(n.as_str())) {
                return Err(invalid(
                    &format!("router.preferences.{stage}"),
                    &format!("unknown endpoint '{unknown}'"),
                ));
            }
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationFailed {
        field: field.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::Stage;

    const SAMPLE: &str = r#"
[filter]
context_radius = 3
max_total_lines = 200

[cache]
ttl_secs = 3600

[router]
failure_threshold = 5
cooldown_secs = 30

[router.preferences]
BOSS = ["big"]
LOG = ["small", "big"]

[[endpoints]]
name = "small"
base_url = "http://10.0.0.5:8000/v1"
task_affinity = ["MANUAL", "LOG"]
speed_tier = 1
cost_per_1k = 0.0005

[[endpoints]]
name = "big"
base_url = "https://llm.example.net/v1"
model = "qwen2.5-72b-instruct"
api_key_env = "BIG_API_KEY"
capability_tier = 3
max_context = 128000

[code]
strip_prefix = "/home/build/src"

[pipeline]
max_retries = 1
workers = 8
"#;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir().unwrap();
        assert!(dir.starts_with(dirs::home_dir().unwrap()));
        assert!(dir.ends_with(".logpilot"));
        assert!(default_config_path().unwrap().starts_with(dir));
    }

    #[test]
    fn app_name_is_logpilot() {
        assert_eq!(APP_NAME, "LogPilot");
        assert_eq!(APP_VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn defaults_are_valid() {
        let config = DiagnosisConfig::default();
        config.validate().unwrap();
        assert_eq!(config.filter.context_radius, 5);
        assert_eq!(config.filter.max_total_lines, 400);
        assert_eq!(config.cache.ttl_secs, 86_400.0);
        assert_eq!(config.router.failure_threshold, 3);
        assert_eq!(config.router.cooldown_secs, 300.0);
        assert_eq!(config.code.snippet_radius, 15);
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.max_manual_chars, 15_000);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn parses_full_document() {
        let config = DiagnosisConfig::from_toml_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.filter.context_radius, 3);
        assert_eq!(config.cache.ttl_secs, 3600.0);
        assert_eq!(config.cache.max_entries, 1024);
        assert_eq!(config.router.failure_threshold, 5);
        assert_eq!(config.router.preferences[&Stage::Log], vec!["small", "big"]);
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].task_affinity, vec![Stage::Manual, Stage::Log]);
        assert_eq!(config.endpoints[1].model_name(), "qwen2.5-72b-instruct");
        assert_eq!(config.endpoints[1].speed_tier, 2);
        assert_eq!(config.code.strip_prefix.as_deref(), Some("/home/build/src"));
        assert_eq!(config.code.max_refs, 4);
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.call_timeout_secs, 300);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = DiagnosisConfig::from_toml_str("[router\nfailure_threshold = 3").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn zero_threshold_rejected() {
        let config = DiagnosisConfig::from_toml_str("[router]\nfailure_threshold = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("router.failure_threshold"));
    }

    #[test]
    fn unknown_preference_rejected() {
        let config = DiagnosisConfig::from_toml_str(
            "[router.preferences]\nBOSS = [\"ghost\"]\n\n[[endpoints]]\nname = \"a\"\nbase_url = \"http://a/v1\"\n",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown endpoint 'ghost'"));
    }

    #[test]
    fn duplicate_endpoint_rejected() {
        let config = DiagnosisConfig::from_toml_str(
            "[[endpoints]]\nname = \"a\"\nbase_url = \"http://a/v1\"\n\n[[endpoints]]\nname = \"a\"\nbase_url = \"http://b/v1\"\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logpilot.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = DiagnosisConfig::load(Some(&path)).unwrap();
        assert_eq!(config.endpoints.len(), 2);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let err = DiagnosisConfig::load(Some(&tmp.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn dump_dir_override_applies() {
        let mut config = DiagnosisConfig::default();
        config.apply_overrides(Some(PathBuf::from("/tmp/logpilot-dumps")));
        assert_eq!(
            config.pipeline.dump_dir.as_deref(),
            Some(Path::new("/tmp/logpilot-dumps"))
        );

        config.apply_overrides(Some(PathBuf::new()));
        assert!(config.pipeline.dump_dir.is_some());
    }
}
