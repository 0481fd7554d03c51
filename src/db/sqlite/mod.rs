mod assignments;
mod common;
mod plans;
mod request_aggregates;
mod request_logs;
mod usage_counters;
mod vouchers;

pub use assignments::SqliteAssignmentRepo;
pub use plans::SqlitePlanRepo;
pub use request_aggregates::SqliteRequestAggregateRepo;
pub use request_logs::SqliteRequestLogRepo;
pub use usage_counters::SqliteUsageCounterRepo;
pub use vouchers::SqliteVoucherRepo;
