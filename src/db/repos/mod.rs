mod assignments;
mod plans;
mod request_aggregates;
mod request_logs;
mod usage_counters;
mod vouchers;

pub use assignments::*;
pub use plans::*;
pub use request_aggregates::*;
pub use request_logs::*;
pub use usage_counters::*;
pub use vouchers::*;
