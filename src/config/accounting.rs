use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Accounting behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountingConfig {
    /// Secret key for the keyed subject digest. Raw subject ids never
    /// reach the request log tables; only this HMAC does.
    /// Must be at least 16 bytes.
    #[serde(default)]
    pub subject_hash_secret: String,

    /// Whether assignment resolutions are cached.
    #[serde(default = "default_true")]
    pub assignments_cache_enabled: bool,

    /// Whether quota checks bypass the resolver cache by default. A
    /// request can still opt out per call.
    #[serde(default = "default_true")]
    pub strict_quota_default: bool,

    /// Code of the plan used for inline fallback assignments when a
    /// subject exhausts its regular plans. None disables fallback.
    #[serde(default)]
    pub fallback_plan_code: Option<String>,

    /// Code of the system plan that voucher credit grants attach to.
    #[serde(default = "default_credit_plan_code")]
    pub credit_plan_code: String,

    /// Default carry-over cap, as a percent of the plan quota, applied
    /// when a capped plan does not set its own.
    #[serde(default = "default_carry_cap_percent")]
    pub carry_over_cap_default_percent: i64,

    /// Days request logs are kept before retention deletes them.
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,

    /// Width of an aggregate window in seconds.
    #[serde(default = "default_aggregate_window_seconds")]
    pub aggregate_window_seconds: u32,

    /// Capacity of the bounded aggregate contribution queue. Contributions
    /// beyond capacity are dropped and counted.
    #[serde(default = "default_aggregate_buffer_capacity")]
    pub aggregate_buffer_capacity: usize,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            subject_hash_secret: String::new(),
            assignments_cache_enabled: true,
            strict_quota_default: true,
            fallback_plan_code: None,
            credit_plan_code: default_credit_plan_code(),
            carry_over_cap_default_percent: default_carry_cap_percent(),
            log_retention_days: default_log_retention_days(),
            aggregate_window_seconds: default_aggregate_window_seconds(),
            aggregate_buffer_capacity: default_aggregate_buffer_capacity(),
        }
    }
}

impl AccountingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subject_hash_secret.len() < 16 {
            return Err(ConfigError::Validation(
                "accounting.subject_hash_secret must be at least 16 bytes".into(),
            ));
        }
        if !(0..=100).contains(&self.carry_over_cap_default_percent) {
            return Err(ConfigError::Validation(
                "accounting.carry_over_cap_default_percent must be between 0 and 100".into(),
            ));
        }
        if self.aggregate_window_seconds == 0 {
            return Err(ConfigError::Validation(
                "accounting.aggregate_window_seconds must be greater than zero".into(),
            ));
        }
        if self.log_retention_days == 0 {
            return Err(ConfigError::Validation(
                "accounting.log_retention_days must be at least 1".into(),
            ));
        }
        if self.credit_plan_code.is_empty() {
            return Err(ConfigError::Validation(
                "accounting.credit_plan_code cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_credit_plan_code() -> String {
    "voucher-credit".to_string()
}

fn default_carry_cap_percent() -> i64 {
    100
}

fn default_log_retention_days() -> u32 {
    90
}

fn default_aggregate_window_seconds() -> u32 {
    3600
}

fn default_aggregate_buffer_capacity() -> usize {
    4096
}
