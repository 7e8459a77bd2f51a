use crate::{StoreConfig, StoreResult};
use lazy_static::lazy_static;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

type GlobalStorage = Mutex<HashMap<String, Arc<MemoryShared>>>;

lazy_static! {
    // #{url => shared storage}
    //
    // Storages are keyed by the store URL so that concurrently running tests
    // each get their own isolated universe.
    static ref GLOBAL_STORAGE: GlobalStorage = Mutex::new(HashMap::new());
}

#[derive(Debug)]
pub(crate) struct MemoryShared {
    data: Mutex<MemoryData>,
    events: broadcast::Sender<(String, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct MemoryData {
    strings: HashMap<String, StringEntry>,
    lists: HashMap<String, Vec<String>>,
    sets: HashMap<String, HashSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// One handle into the shared in-process storage. Cloning is cheap and all
/// clones for the same URL observe the same data, mirroring how independent
/// Redis connections observe one server.
#[derive(Debug, Clone)]
pub struct MemoryConn {
    shared: Arc<MemoryShared>,
}

impl MemoryConn {
    pub fn new(url: String) -> Self {
        let mut global = GLOBAL_STORAGE.lock().unwrap();
        let shared = global
            .entry(url)
            .or_insert_with(|| {
                Arc::new(MemoryShared {
                    data: Mutex::new(MemoryData::default()),
                    events: broadcast::channel(EVENT_BUFFER).0,
                })
            })
            .clone();
        Self { shared }
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut data = self.shared.data.lock().unwrap();
        match data.strings.get(key) {
            Some(entry) if entry.expired() => {
                data.strings.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    pub fn set_ex(&self, key: &str, value: &str, ttl: u64) -> StoreResult<()> {
        let mut data = self.shared.data.lock().unwrap();
        data.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl)),
            },
        );
        Ok(())
    }

    pub fn del(&self, key: &str) -> StoreResult<bool> {
        let mut data = self.shared.data.lock().unwrap();
        let existed = data.strings.remove(key).is_some()
            | data.lists.remove(key).is_some()
            | data.sets.remove(key).is_some()
            | data.hashes.remove(key).is_some();
        Ok(existed)
    }

    pub fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let mut data = self.shared.data.lock().unwrap();
        match data.strings.get(key) {
            Some(entry) if entry.expired() => {
                data.strings.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()).as_secs())),
            None => Ok(None),
        }
    }

    pub fn rpush(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut data = self.shared.data.lock().unwrap();
        data.lists
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
        Ok(())
    }

    pub fn lrange(&self, key: &str) -> StoreResult<Vec<String>> {
        let data = self.shared.data.lock().unwrap();
        Ok(data.lists.get(key).cloned().unwrap_or_default())
    }

    pub fn lrem(&self, key: &str, value: &str) -> StoreResult<usize> {
        let mut data = self.shared.data.lock().unwrap();
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok(before - list.len())
    }

    pub fn llen(&self, key: &str) -> StoreResult<usize> {
        let data = self.shared.data.lock().unwrap();
        Ok(data.lists.get(key).map(Vec::len).unwrap_or(0))
    }

    /// Remove every occurrence of `value` from `from` and, if anything was
    /// removed, append it once to the tail of `to`. Runs under one lock, so
    /// observers never see the value in both lists.
    pub fn move_list_entry(&self, from: &str, to: &str, value: &str) -> StoreResult<usize> {
        let mut data = self.shared.data.lock().unwrap();
        let removed = match data.lists.get_mut(from) {
            Some(list) => {
                let before = list.len();
                list.retain(|v| v != value);
                before - list.len()
            }
            None => 0,
        };
        if removed > 0 {
            data.lists
                .entry(to.to_string())
                .or_default()
                .push(value.to_string());
        }
        Ok(removed)
    }

    pub fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut data = self.shared.data.lock().unwrap();
        data.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    pub fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut data = self.shared.data.lock().unwrap();
        if let Some(set) = data.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    pub fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let data = self.shared.data.lock().unwrap();
        Ok(data
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut data = self.shared.data.lock().unwrap();
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    pub fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let data = self.shared.data.lock().unwrap();
        Ok(data
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    pub fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let data = self.shared.data.lock().unwrap();
        Ok(data.hashes.get(key).cloned().unwrap_or_default())
    }

    pub fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut data = self.shared.data.lock().unwrap();
        Ok(data
            .hashes
            .get_mut(key)
            .map(|hash| hash.remove(field).is_some())
            .unwrap_or(false))
    }

    pub fn publish(&self, topic: &str, payload: &[u8]) -> StoreResult<usize> {
        // A send error only means nobody is subscribed.
        Ok(self
            .shared
            .events
            .send((topic.to_string(), payload.to_vec()))
            .unwrap_or(0))
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<(String, Vec<u8>)> {
        self.shared.events.subscribe()
    }
}

/// Return a memory-backed store config with the given id.
///
/// This is used for testing. Please use the test case name as the id to
/// prevent data races between concurrently running tests.
pub fn memory_store_config<S: ToString>(id: S) -> StoreConfig {
    StoreConfig {
        url: format!("memory://{}", id.to_string()),
        enable_redis_store: false,
    }
}
