//! Persistence layer: binary record codec and the write-through cache.

pub mod cache;
pub mod codec;
pub mod registry;

pub use cache::{Cache, WarmState, WarmStats};
pub use registry::CacheRegistry;
