use crate::{MemoryConn, StoreResult};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;

/// Lua move keeps remove-and-append one round trip: observers may briefly see
/// the value in neither list, never in both, and a lost race never duplicates
/// the value at the destination.
const MOVE_LIST_ENTRY: &str = r"
local removed = redis.call('LREM', KEYS[1], 0, ARGV[1])
if removed > 0 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
return removed
";

/// A connection wrapper that integrates both the Redis and the memory
/// backend behind one set of operations.
pub enum StoreConn {
    Redis(ConnectionManager),
    Memory(MemoryConn),
}

impl StoreConn {
    pub async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        match self {
            StoreConn::Redis(conn) => Ok(conn.get(key).await?),
            StoreConn::Memory(conn) => conn.get(key),
        }
    }

    pub async fn set_ex(&mut self, key: &str, value: &str, ttl: u64) -> StoreResult<()> {
        match self {
            StoreConn::Redis(conn) => {
                let _: () = conn.set_ex(key, value, ttl).await?;
                Ok(())
            }
            StoreConn::Memory(conn) => conn.set_ex(key, value, ttl),
        }
    }

    pub async fn del(&mut self, key: &str) -> StoreResult<bool> {
        match self {
            StoreConn::Redis(conn) => {
                let removed: i64 = conn.del(key).await?;
                Ok(removed > 0)
            }
            StoreConn::Memory(conn) => conn.del(key),
        }
    }

    /// Remaining TTL in seconds; `None` when the key is absent or carries no
    /// expiry.
    pub async fn ttl(&mut self, key: &str) -> StoreResult<Option<u64>> {
        match self {
            StoreConn::Redis(conn) => {
                let ttl: i64 = conn.ttl(key).await?;
                Ok((ttl >= 0).then_some(ttl as u64))
            }
            StoreConn::Memory(conn) => conn.ttl(key),
        }
    }

    pub async fn rpush(&mut self, key: &str, value: &str) -> StoreResult<()> {
        match self {
            StoreConn::Redis(conn) => {
                let _: i64 = conn.rpush(key, value).await?;
                Ok(())
            }
            StoreConn::Memory(conn) => conn.rpush(key, value),
        }
    }

    /// Full list contents, head first. Lists are appended at the tail, so
    /// this is publication order.
    pub async fn lrange(&mut self, key: &str) -> StoreResult<Vec<String>> {
        match self {
            StoreConn::Redis(conn) => Ok(conn.lrange(key, 0, -1).await?),
            StoreConn::Memory(conn) => conn.lrange(key),
        }
    }

    /// Remove every occurrence of `value`; returns how many were removed.
    pub async fn lrem(&mut self, key: &str, value: &str) -> StoreResult<usize> {
        match self {
            StoreConn::Redis(conn) => {
                let removed: i64 = conn.lrem(key, 0, value).await?;
                Ok(removed as usize)
            }
            StoreConn::Memory(conn) => conn.lrem(key, value),
        }
    }

    pub async fn llen(&mut self, key: &str) -> StoreResult<usize> {
        match self {
            StoreConn::Redis(conn) => {
                let len: i64 = conn.llen(key).await?;
                Ok(len as usize)
            }
            StoreConn::Memory(conn) => conn.llen(key),
        }
    }

    /// Atomically take `value` out of list `from` and append it to list `to`.
    /// Returns the number of occurrences removed; zero means another mover
    /// won the race and nothing was appended.
    pub async fn move_list_entry(&mut self, from: &str, to: &str, value: &str) -> StoreResult<usize> {
        match self {
            StoreConn::Redis(conn) => {
                let removed: i64 = redis::Script::new(MOVE_LIST_ENTRY)
                    .key(from)
                    .key(to)
                    .arg(value)
                    .invoke_async(conn)
                    .await?;
                Ok(removed as usize)
            }
            StoreConn::Memory(conn) => conn.move_list_entry(from, to, value),
        }
    }

    pub async fn sadd(&mut self, key: &str, member: &str) -> StoreResult<()> {
        match self {
            StoreConn::Redis(conn) => {
                let _: i64 = conn.sadd(key, member).await?;
                Ok(())
            }
            StoreConn::Memory(conn) => conn.sadd(key, member),
        }
    }

    pub async fn srem(&mut self, key: &str, member: &str) -> StoreResult<()> {
        match self {
            StoreConn::Redis(conn) => {
                let _: i64 = conn.srem(key, member).await?;
                Ok(())
            }
            StoreConn::Memory(conn) => conn.srem(key, member),
        }
    }

    pub async fn smembers(&mut self, key: &str) -> StoreResult<Vec<String>> {
        match self {
            StoreConn::Redis(conn) => Ok(conn.smembers(key).await?),
            StoreConn::Memory(conn) => conn.smembers(key),
        }
    }

    pub async fn hset(&mut self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        match self {
            StoreConn::Redis(conn) => {
                let _: i64 = conn.hset(key, field, value).await?;
                Ok(())
            }
            StoreConn::Memory(conn) => conn.hset(key, field, value),
        }
    }

    pub async fn hget(&mut self, key: &str, field: &str) -> StoreResult<Option<String>> {
        match self {
            StoreConn::Redis(conn) => Ok(conn.hget(key, field).await?),
            StoreConn::Memory(conn) => conn.hget(key, field),
        }
    }

    pub async fn hgetall(&mut self, key: &str) -> StoreResult<HashMap<String, String>> {
        match self {
            StoreConn::Redis(conn) => Ok(conn.hgetall(key).await?),
            StoreConn::Memory(conn) => conn.hgetall(key),
        }
    }

    pub async fn hdel(&mut self, key: &str, field: &str) -> StoreResult<bool> {
        match self {
            StoreConn::Redis(conn) => {
                let removed: i64 = conn.hdel(key, field).await?;
                Ok(removed > 0)
            }
            StoreConn::Memory(conn) => conn.hdel(key, field),
        }
    }

    /// Publish a payload on a pub/sub topic; returns the subscriber count.
    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> StoreResult<usize> {
        match self {
            StoreConn::Redis(conn) => {
                let receivers: i64 = conn.publish(topic, payload).await?;
                Ok(receivers as usize)
            }
            StoreConn::Memory(conn) => conn.publish(topic, payload),
        }
    }
}
