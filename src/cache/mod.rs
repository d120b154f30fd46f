//! Local store: durable persistence for cached server state.
//!
//! This module provides:
//! - A `Cacheable` trait keyed by collection + key, with singleton records
//!   for stats and the user profile
//! - A blocking `CacheStorage` backend (SQLite, or a no-op when storage is
//!   unavailable) that also physically holds the sync queue
//! - An async `LocalStore` facade with network-first reads that fall back to
//!   cached data when offline

mod layer;
mod storage;
mod traits;

pub(crate) use layer::blocking;
pub use layer::LocalStore;
pub use storage::{CacheStorage, CachedEntity, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, Cacheable, Singleton};
