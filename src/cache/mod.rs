mod error;
mod keys;
mod memory;
mod traits;

pub use error::{CacheError, CacheResult};
pub use keys::CacheKeys;
pub use memory::MemoryCache;
pub use traits::{Cache, CacheExt};
