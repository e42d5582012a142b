//! Run configuration: bounded resources and provider selection, all
//! overridable from the environment following the same `from_env()` /
//! preset-constructor pattern the rest of this codebase uses for limits
//! and telemetry.

use std::env;
use std::time::Duration;

use crate::errors::{ErrorCode, StructuredError};

pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_MAX_STEP_ATTEMPTS: u32 = 10;
pub const DEFAULT_MAX_ORACLE_RETRIES: u32 = 3;
pub const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FORCE_NEGATIVE_STATUS: u16 = 400;
pub const DEFAULT_ARRAY_TRUNCATE_LEN: usize = 10;

/// The LLM provider credentials resolved from the environment. Exactly one
/// of the two vendor variable groups described in the external-interfaces
/// contract must be present.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    AzureOpenAi {
        api_key: String,
        endpoint: String,
        api_version: String,
        deployment: String,
    },
    OpenAi {
        api_key: String,
        model_name: String,
    },
}

impl ProviderConfig {
    /// Reads `AZURE_OPENAI_*` first, falling back to `OPENAI_*`.
    pub fn from_env() -> Result<Self, StructuredError> {
        if let (Ok(api_key), Ok(endpoint), Ok(api_version), Ok(deployment)) = (
            env::var("AZURE_OPENAI_API_KEY"),
            env::var("AZURE_OPENAI_ENDPOINT"),
            env::var("AZURE_OPENAI_API_VERSION"),
            env::var("AZURE_OPENAI_DEPLOYMENT"),
        ) {
            return Ok(Self::AzureOpenAi {
                api_key,
                endpoint,
                api_version,
                deployment,
            });
        }

        if let (Ok(api_key), Ok(model_name)) =
            (env::var("OPENAI_API_KEY"), env::var("OPENAI_MODEL_NAME"))
        {
            return Ok(Self::OpenAi {
                api_key,
                model_name,
            });
        }

        Err(StructuredError::new(
            ErrorCode::MISSING_PROVIDER_CONFIG,
            "neither AZURE_OPENAI_* nor OPENAI_* environment variables are fully set",
        ))
    }
}

/// Bounded resources for a single run, plus the two configurable overrides
/// called out as open questions in the design notes: the forced negative
/// status code and the response-array truncation length.
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub max_workers: usize,
    pub max_step_attempts: u32,
    pub max_oracle_retries: u32,
    pub oracle_timeout: Duration,
    pub force_negative_status: u16,
    pub array_truncate_len: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_step_attempts: DEFAULT_MAX_STEP_ATTEMPTS,
            max_oracle_retries: DEFAULT_MAX_ORACLE_RETRIES,
            oracle_timeout: Duration::from_secs(DEFAULT_ORACLE_TIMEOUT_SECS),
            force_negative_status: DEFAULT_FORCE_NEGATIVE_STATUS,
            array_truncate_len: DEFAULT_ARRAY_TRUNCATE_LEN,
        }
    }
}

impl RunLimits {
    pub fn from_env() -> Self {
        let mut limits = Self::default();

        if let Ok(v) = env::var("APISYNTH_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                limits.max_workers = n;
            }
        }
        if let Ok(v) = env::var("APISYNTH_MAX_STEP_ATTEMPTS") {
            if let Ok(n) = v.parse() {
                limits.max_step_attempts = n;
            }
        }
        if let Ok(v) = env::var("APISYNTH_MAX_ORACLE_RETRIES") {
            if let Ok(n) = v.parse() {
                limits.max_oracle_retries = n;
            }
        }
        if let Ok(v) = env::var("APISYNTH_ORACLE_TIMEOUT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                limits.oracle_timeout = Duration::from_secs(n);
            }
        }
        if let Ok(v) = env::var("APISYNTH_FORCE_NEGATIVE_STATUS") {
            if let Ok(n) = v.parse() {
                limits.force_negative_status = n;
            }
        }
        if let Ok(v) = env::var("APISYNTH_ARRAY_TRUNCATE_LEN") {
            if let Ok(n) = v.parse() {
                limits.array_truncate_len = n;
            }
        }

        limits
    }

    /// Rejects configurations that would defeat the point of having a limit.
    pub fn validate(&self) -> Result<(), StructuredError> {
        if self.max_workers == 0 {
            return Err(StructuredError::new(
                ErrorCode::INVALID_RUN_LIMITS,
                "max_workers must be at least 1",
            ));
        }
        if self.max_step_attempts == 0 {
            return Err(StructuredError::new(
                ErrorCode::INVALID_RUN_LIMITS,
                "max_step_attempts must be at least 1",
            ));
        }
        if !(400..500).contains(&(self.force_negative_status as u32)) {
            return Err(StructuredError::new(
                ErrorCode::INVALID_RUN_LIMITS,
                "force_negative_status must be a 4xx status code",
            ));
        }
        Ok(())
    }
}

/// Full configuration for one `generate` invocation, assembled from CLI
/// flags plus the environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub spec_path: std::path::PathBuf,
    pub structural: bool,
    pub functional: bool,
    pub env_init_script: Option<std::path::PathBuf>,
    pub user_input: Option<String>,
    pub limits: RunLimits,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), StructuredError> {
        if !self.spec_path.exists() {
            return Err(StructuredError::new(
                ErrorCode::SPEC_PATH_NOT_FOUND,
                format!("{} does not exist", self.spec_path.display()),
            ));
        }
        if let Some(script) = &self.env_init_script {
            let ext = script.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "py" | "ps1" | "sh" | "bat" | "cmd") {
                return Err(StructuredError::new(
                    ErrorCode::INVALID_ENV_INIT_SCRIPT,
                    format!("unsupported env-init script extension: .{}", ext),
                ));
            }
        }
        self.limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_match_documented_defaults() {
        let limits = RunLimits::default();
        assert_eq!(limits.max_workers, 10);
        assert_eq!(limits.force_negative_status, 400);
        assert_eq!(limits.array_truncate_len, 10);
    }

    #[test]
    fn rejects_non_4xx_force_status() {
        let mut limits = RunLimits::default();
        limits.force_negative_status = 200;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut limits = RunLimits::default();
        limits.max_workers = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn run_config_rejects_missing_spec_path() {
        let config = RunConfig {
            base_url: "http://localhost".into(),
            spec_path: "/nonexistent/path/to/spec.yaml".into(),
            structural: true,
            functional: true,
            env_init_script: None,
            user_input: None,
            limits: RunLimits::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn run_config_rejects_unsupported_env_init_extension() {
        let config = RunConfig {
            base_url: "http://localhost".into(),
            spec_path: std::env::current_dir().unwrap(),
            structural: true,
            functional: true,
            env_init_script: Some("setup.exe".into()),
            user_input: None,
            limits: RunLimits::default(),
        };
        assert!(config.validate().is_err());
    }
}
