//! Shared database repository test infrastructure.
//!
//! Each repository has a test module containing shared fixtures and tests
//! that run against in-memory SQLite with the real migrations applied.

pub mod fixtures;
pub mod harness;
mod plans;
mod request_logs;
mod usage_counters;
mod vouchers;
