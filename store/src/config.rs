use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// The configuration for the shared store backing the task queue.
pub struct StoreConfig {
    /// The URL of the store, e.g. "redis://localhost:6379". For the memory
    /// backend the URL is only a namespace key: two handles opened with the
    /// same URL share state, different URLs are fully isolated.
    pub url: String,

    /// Whether to use the Redis backend, otherwise the in-process memory
    /// backend.
    pub enable_redis_store: bool,
}

impl StoreConfig {
    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enable_redis_store: true,
        }
    }
}
