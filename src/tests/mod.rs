//! End-to-end accounting scenarios.
//!
//! These exercise the full service layer against in-memory SQLite with the
//! real migrations and a fixed clock.
