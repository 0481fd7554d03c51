mod assignment;
mod plan;
mod request_aggregate;
mod request_log;
mod subject;
mod usage_counter;
mod voucher;

pub use assignment::*;
pub use plan::*;
pub use request_aggregate::*;
pub use request_log::*;
pub use subject::*;
pub use usage_counter::*;
pub use voucher::*;
