//! Plan accounting core for a multi-tenant AI gateway.
//!
//! The crate answers two questions the gateway's request path asks:
//! "may this subject spend these units now?" (the [`services::QuotaGate`])
//! and "what happened?" (the [`services::TelemetryRecorder`]). Around them
//! sit plan and assignment management, carry-over accounting across billing
//! cycles, voucher campaigns, and windowed telemetry rollups.
//!
//! State lives in SQLite behind repository traits; every admit decision is
//! a single conditional update, so concurrent requests can never overspend
//! a cycle's quota. Nothing here touches the network: the embedding
//! gateway wires [`services::Services`] into its own request handling.

pub mod aggregate_buffer;
pub mod cache;
pub mod clock;
pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod identity;
pub mod models;
pub mod normalize;
pub mod services;

#[cfg(test)]
mod tests;

pub use config::PlanmeterConfig;
pub use error::{CoreError, CoreResult};
pub use services::Services;
