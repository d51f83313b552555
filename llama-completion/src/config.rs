//! Layered configuration loading using figment.
//!
//! Sources, later ones overriding earlier ones:
//! 1. built-in defaults;
//! 2. an optional TOML, YAML or JSON file (format chosen by extension);
//! 3. environment variables prefixed `LLAMA_COMPLETE_`, with nested keys
//!    separated by `__` (for example `LLAMA_COMPLETE_SAMPLING__TEMPERATURE`).

use crate::generation::ContextConfig;
use crate::types::SamplingParameters;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use llama_common::{ErrorCategory, LlamaError, ValidatedConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "LLAMA_COMPLETE_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Unsupported configuration file format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Failed to parse configuration: {source}")]
    Parse {
        #[source]
        source: Box<figment::Error>,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        ConfigError::Parse {
            source: Box::new(error),
        }
    }
}

impl LlamaError for ConfigError {
    fn category(&self) -> ErrorCategory {
        match self {
            ConfigError::FileNotFound { .. } => ErrorCategory::System,
            _ => ErrorCategory::User,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ConfigError::FileNotFound { .. } => "CONFIG_NOT_FOUND",
            ConfigError::UnsupportedFormat { .. } => "CONFIG_FORMAT",
            ConfigError::Parse { .. } => "CONFIG_PARSE",
            ConfigError::Validation { .. } => "CONFIG_INVALID",
        }
    }
}

/// Context and default sampling settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub context: ContextConfig,
    pub sampling: SamplingParameters,
}

impl CompletionConfig {
    /// Load from defaults, the optional file, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let config: CompletionConfig = Self::figment(file)?.extract()?;
        config.validate_all()?;
        debug!(
            n_ctx = config.context.n_ctx,
            n_batch = config.context.n_batch,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Build the layered figment without extracting it.
    pub fn figment(file: Option<&Path>) -> Result<Figment, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CompletionConfig::default()));

        if let Some(path) = file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            trace!("Loading config file: {}", path.display());
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                other => {
                    return Err(ConfigError::UnsupportedFormat {
                        format: other.unwrap_or("<none>").to_string(),
                    })
                }
            };
        }

        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn validate_all(&self) -> Result<(), ConfigError> {
        self.context
            .validate()
            .map_err(|e| ConfigError::Validation {
                message: e.to_string(),
            })?;
        self.sampling
            .validate()
            .map_err(|e| ConfigError::Validation {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_defaults_without_sources() {
        let config = CompletionConfig::load(None).unwrap();
        assert_eq!(config, CompletionConfig::default());
    }

    #[test]
    #[serial]
    fn test_toml_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("complete.toml");
        fs::write(
            &path,
            r#"
[context]
n_ctx = 1024

[sampling]
temperature = 0.2
stop = ["\n\n", "END"]
"#,
        )
        .unwrap();

        let config = CompletionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.context.n_ctx, 1024);
        assert_eq!(config.context.n_batch, 512);
        assert_eq!(config.sampling.temperature, 0.2);
        assert_eq!(config.sampling.stop, vec!["\n\n".to_string(), "END".to_string()]);
        assert_eq!(config.sampling.top_k, 40);
    }

    #[test]
    #[serial]
    fn test_yaml_and_json_files() {
        let dir = TempDir::new().unwrap();
        let yaml = dir.path().join("complete.yaml");
        fs::write(&yaml, "sampling:\n  n_predict: 32\n").unwrap();
        assert_eq!(CompletionConfig::load(Some(&yaml)).unwrap().sampling.n_predict, 32);

        let json = dir.path().join("complete.json");
        fs::write(&json, r#"{"context": {"n_keep": 4}}"#).unwrap();
        assert_eq!(CompletionConfig::load(Some(&json)).unwrap().context.n_keep, 4);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("complete.toml");
        fs::write(&path, "[sampling]\ntop_k = 10\n").unwrap();

        std::env::set_var("LLAMA_COMPLETE_SAMPLING__TOP_K", "5");
        std::env::set_var("LLAMA_COMPLETE_CONTEXT__N_CTX", "256");
        let config = CompletionConfig::load(Some(&path));
        std::env::remove_var("LLAMA_COMPLETE_SAMPLING__TOP_K");
        std::env::remove_var("LLAMA_COMPLETE_CONTEXT__N_CTX");

        let config = config.unwrap();
        assert_eq!(config.sampling.top_k, 5);
        assert_eq!(config.context.n_ctx, 256);
    }

    #[test]
    #[serial]
    fn test_invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[sampling]\ntop_p = 2.0\n").unwrap();
        let err = CompletionConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert!(err.to_string().contains("top_p"));
    }

    #[test]
    #[serial]
    fn test_missing_and_unsupported_files() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            CompletionConfig::load(Some(&dir.path().join("absent.toml"))),
            Err(ConfigError::FileNotFound { .. })
        ));

        let ini = dir.path().join("complete.ini");
        fs::write(&ini, "n_ctx=1").unwrap();
        assert!(matches!(
            CompletionConfig::load(Some(&ini)),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[context]\nn_ctx = \"many\"\n").unwrap();
        let err = CompletionConfig::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.error_code(), "CONFIG_PARSE");
    }
}
