//! Infrastructure adapters for the shared store and input probing.

pub mod probe;
pub mod store;

pub use probe::FsInputProbe;
pub use store::{InMemoryStore, SharedStore};
#[cfg(feature = "redis-store")]
pub use store::RedisStore;
