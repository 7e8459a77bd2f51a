//! Typed adapter over the shared key-value / pub-sub store.
//!
//! The same surface is served by two backends: a Redis connection for
//! production and an in-process memory store for tests. Which one a
//! [`Store`] uses is decided by [`StoreConfig::enable_redis_store`], so
//! everything above this crate is backend-agnostic.

mod config;
mod conn;
mod memory;
mod store;

pub use config::StoreConfig;
pub use conn::StoreConn;
pub use memory::{memory_store_config, MemoryConn};
pub use store::{Store, Subscription};

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
