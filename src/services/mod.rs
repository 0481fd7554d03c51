pub mod aggregates;
pub mod plans;
pub mod quota_gate;
pub mod resolver;
pub mod telemetry;
pub mod vouchers;

pub use aggregates::AggregateMerger;
pub use plans::PlanService;
pub use quota_gate::{Decision, DenyReason, QuotaCheckRequest, QuotaGate};
pub use resolver::{AssignmentResolver, ResolvedAssignments};
pub use telemetry::TelemetryRecorder;
pub use vouchers::VoucherService;

use std::sync::Arc;

use crate::{
    aggregate_buffer::{AggregateBuffer, AggregateBufferConfig},
    cache::Cache,
    clock::SharedClock,
    config::AccountingConfig,
    db::DbPool,
};

/// The assembled service layer, one instance per process.
///
/// Everything inside shares the pool, the clock, and one assignment
/// resolver, so a write through any service invalidates what the others
/// would read.
#[derive(Clone)]
pub struct Services {
    pub plans: PlanService,
    pub resolver: AssignmentResolver,
    pub quota_gate: QuotaGate,
    pub telemetry: TelemetryRecorder,
    pub aggregates: AggregateMerger,
    pub vouchers: VoucherService,
}

impl Services {
    pub fn new(
        db: Arc<DbPool>,
        cache: Option<Arc<dyn Cache>>,
        clock: SharedClock,
        config: &AccountingConfig,
    ) -> Self {
        let cache = if config.assignments_cache_enabled {
            cache
        } else {
            None
        };
        let resolver = AssignmentResolver::new(db.clone(), cache);

        let buffer = Arc::new(AggregateBuffer::new(AggregateBufferConfig {
            capacity: config.aggregate_buffer_capacity,
            ..AggregateBufferConfig::default()
        }));

        Self {
            plans: PlanService::new(db.clone(), resolver.clone()),
            quota_gate: QuotaGate::new(db.clone(), resolver.clone(), clock.clone(), config),
            telemetry: TelemetryRecorder::new(db.clone(), buffer.clone(), clock.clone(), config),
            aggregates: AggregateMerger::new(db.clone(), buffer),
            vouchers: VoucherService::new(db, resolver.clone(), clock, config),
            resolver,
        }
    }
}
