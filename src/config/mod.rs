//! Configuration module for the plan accounting core.
//!
//! Configuration is loaded from a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [accounting]
//! subject_hash_secret = "${SUBJECT_HASH_SECRET}"
//! credit_plan_code = "voucher-credit"
//!
//! [database]
//! path = "planmeter.db"
//! ```

mod accounting;
mod cache;
mod database;

use std::path::Path;

pub use accounting::*;
pub use cache::*;
pub use database::*;
use serde::{Deserialize, Serialize};

/// Root configuration for the accounting core.
///
/// All sections are optional with sensible defaults, except for the
/// accounting secret which must be provided.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PlanmeterConfig {
    /// Accounting behavior: hashing secret, carry-over defaults, retention.
    #[serde(default)]
    pub accounting: AccountingConfig,

    /// SQLite database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Resolver cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl PlanmeterConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: PlanmeterConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.accounting.validate()?;
        self.database.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (variables after `#` are left untouched).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    static VAR_RE: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\$\{([^}]+)\}").unwrap());

    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in VAR_RE.captures_iter(line) {
            let match_start = cap.get(0).unwrap().start();
            if let Some(pos) = comment_pos {
                if match_start >= pos {
                    continue;
                }
            }

            line_result.push_str(&line[last_end..match_start]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = cap.get(0).unwrap().end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
