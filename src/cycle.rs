//! Cycle calculator.
//!
//! Pure arithmetic mapping a plan's cycle descriptor and a timestamp to the
//! half-open replenishment window `[start, end)`. Custom cycles step from the
//! plan's creation time as the epoch.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use thiserror::Error;

use crate::models::{CycleType, Plan};

/// Half-open cycle window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    /// Whether the instant falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error("Cycle arithmetic overflowed the representable date range")]
    Overflow,
}

impl From<CycleError> for crate::error::CoreError {
    fn from(err: CycleError) -> Self {
        crate::error::CoreError::InvalidArgument(err.to_string())
    }
}

/// Compute the cycle window containing `at` for the given plan.
///
/// Deterministic and total: every `(plan, at)` pair maps to exactly one
/// window, except extreme dates that overflow chrono's range.
pub fn cycle_for(plan: &Plan, at: DateTime<Utc>) -> Result<CycleWindow, CycleError> {
    match plan.cycle_type {
        CycleType::Daily => {
            let start = midnight_utc(at)?;
            let end = start.checked_add_signed(Duration::hours(24)).ok_or(CycleError::Overflow)?;
            Ok(CycleWindow { start, end })
        }
        CycleType::Monthly => {
            let start = first_of_month(at.year(), at.month())?;
            let (next_y, next_m) = if at.month() == 12 {
                (at.year().checked_add(1).ok_or(CycleError::Overflow)?, 1)
            } else {
                (at.year(), at.month() + 1)
            };
            let end = first_of_month(next_y, next_m)?;
            Ok(CycleWindow { start, end })
        }
        CycleType::Custom => {
            let length = Duration::days(i64::from(plan.cycle_length_days.max(1)));
            let epoch = midnight_utc(plan.created_at)?;
            let elapsed = at.signed_duration_since(epoch);
            let steps = elapsed.num_days().div_euclid(length.num_days());
            let offset = length
                .checked_mul(i32::try_from(steps).map_err(|_| CycleError::Overflow)?)
                .ok_or(CycleError::Overflow)?;
            let start = epoch.checked_add_signed(offset).ok_or(CycleError::Overflow)?;
            let end = start.checked_add_signed(length).ok_or(CycleError::Overflow)?;
            Ok(CycleWindow { start, end })
        }
    }
}

fn midnight_utc(at: DateTime<Utc>) -> Result<DateTime<Utc>, CycleError> {
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
        .single()
        .ok_or(CycleError::Overflow)
}

fn first_of_month(year: i32, month: u32) -> Result<DateTime<Utc>, CycleError> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or(CycleError::Overflow)
}
