use crate::{
    db::error::{DbError, DbResult},
    models::{
        BillingMode, CarryPolicy, CycleType, FlagReason, GrantType, QuotaMetric, Subject,
        SubjectType, VoucherCodeStatus,
    },
};

/// Parse a stored enum column, returning a DbError on an unknown value.
fn parse_enum<T>(what: &str, value: &str, parse: impl Fn(&str) -> Option<T>) -> DbResult<T> {
    parse(value).ok_or_else(|| DbError::Internal(format!("Invalid {} in database: {}", what, value)))
}

pub fn parse_cycle_type(s: &str) -> DbResult<CycleType> {
    parse_enum("cycle type", s, CycleType::parse)
}

pub fn parse_quota_metric(s: &str) -> DbResult<QuotaMetric> {
    parse_enum("quota metric", s, QuotaMetric::parse)
}

pub fn parse_carry_policy(s: &str) -> DbResult<CarryPolicy> {
    parse_enum("carry policy", s, CarryPolicy::parse)
}

pub fn parse_billing_mode(s: &str) -> DbResult<BillingMode> {
    parse_enum("billing mode", s, BillingMode::parse)
}

pub fn parse_subject_type(s: &str) -> DbResult<SubjectType> {
    parse_enum("subject type", s, SubjectType::parse)
}

pub fn parse_grant_type(s: &str) -> DbResult<GrantType> {
    parse_enum("grant type", s, GrantType::parse)
}

pub fn parse_code_status(s: &str) -> DbResult<VoucherCodeStatus> {
    parse_enum("voucher code status", s, VoucherCodeStatus::parse)
}

pub fn parse_flag_reason(s: &str) -> DbResult<FlagReason> {
    parse_enum("flag reason", s, FlagReason::parse)
}

pub fn parse_subject(type_str: &str, id: i64) -> DbResult<Subject> {
    Subject::from_parts(type_str, id)
        .ok_or_else(|| DbError::Internal(format!("Invalid subject type in database: {}", type_str)))
}

/// Encode an optional string list as a JSON column value.
pub fn encode_string_list(list: &Option<Vec<String>>) -> DbResult<Option<String>> {
    list.as_ref()
        .map(|v| serde_json::to_string(v).map_err(DbError::from))
        .transpose()
}

/// Decode a JSON column value into an optional string list.
pub fn decode_string_list(raw: Option<String>) -> DbResult<Option<Vec<String>>> {
    raw.map(|s| serde_json::from_str(&s).map_err(DbError::from))
        .transpose()
}

/// Encode optional JSON metadata for storage.
pub fn encode_json(value: &Option<serde_json::Value>) -> DbResult<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(DbError::from))
        .transpose()
}

/// Decode optional stored JSON metadata.
pub fn decode_json(raw: Option<String>) -> DbResult<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s).map_err(DbError::from))
        .transpose()
}

/// Map a unique violation to a Conflict with the given message.
pub fn map_unique_violation(e: sqlx::Error, message: impl Into<String>) -> DbError {
    match e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            DbError::Conflict(message.into())
        }
        _ => DbError::from(e),
    }
}
