//! Redis-backed store.
//!
//! Compare-and-act operations are Lua scripts so they execute atomically on the
//! server. The ordered index is a sorted set (member = job id, score = due
//! time) plus two companion keys that record insertion order:
//!
//! - `{key}:seq`: hash of member to insertion sequence
//! - `{key}:counter`: monotonically increasing sequence counter
//!
//! Redis breaks score ties lexicographically, so range results are re-sorted
//! by sequence on the client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{sort_by_score_then_sequence, CasOutcome, FieldGuard, KeyExpiry, Store};
use crate::error::StoreError;

const EXPIRE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

// ARGV: field, expiry ms (-1 keeps), expected count n, n expected values, field/value pairs
const HASH_COMPARE_AND_SET: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if not current then
  return {0, ''}
end
local n = tonumber(ARGV[3])
for i = 4, 3 + n do
  if ARGV[i] == current then
    local j = 4 + n
    while j < #ARGV do
      redis.call('HSET', KEYS[1], ARGV[j], ARGV[j + 1])
      j = j + 2
    end
    local ttl = tonumber(ARGV[2])
    if ttl == 0 then
      redis.call('DEL', KEYS[1])
    elseif ttl > 0 then
      redis.call('PEXPIRE', KEYS[1], ttl)
    end
    return {1, current}
  end
end
return {2, current}
"#;

const HASH_CREATE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

// KEYS: index, seq hash, counter, guarded hash. ARGV: score, member, field, value
const ORDERED_INSERT_GUARDED: &str = r#"
if redis.call('HGET', KEYS[4], ARGV[3]) ~= ARGV[4] then
  return 0
end
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], seq)
return 1
"#;

const ORDERED_INSERT: &str = r#"
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], seq)
return seq
"#;

const ORDERED_RANGE: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES')
local out = {}
for i = 1, #items, 2 do
  local seq = redis.call('HGET', KEYS[2], items[i]) or '0'
  table.insert(out, items[i])
  table.insert(out, items[i + 1])
  table.insert(out, seq)
end
return out
"#;

const ORDERED_REMOVE: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
return removed
"#;

/// Store backed by a Redis server.
///
/// The connection manager reconnects on its own; it is cloned per call, which
/// only clones a handle to the shared multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    expire_if_equals: Script,
    delete_if_equals: Script,
    hash_compare_and_set: Script,
    hash_create: Script,
    ordered_insert: Script,
    ordered_insert_guarded: Script,
    ordered_range: Script,
    ordered_remove: Script,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` if the URL is invalid or the server
    /// cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self::from_connection(redis))
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            hash_compare_and_set: Script::new(HASH_COMPARE_AND_SET),
            hash_create: Script::new(HASH_CREATE),
            ordered_insert: Script::new(ORDERED_INSERT),
            ordered_insert_guarded: Script::new(ORDERED_INSERT_GUARDED),
            ordered_range: Script::new(ORDERED_RANGE),
            ordered_remove: Script::new(ORDERED_REMOVE),
        }
    }

    async fn range_with_sequence(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut conn = self.redis.clone();
        let flat: Vec<String> = self
            .ordered_range
            .key(key)
            .key(seq_key(key))
            .arg(score_arg(max_score))
            .invoke_async(&mut conn)
            .await?;

        if flat.len() % 3 != 0 {
            return Err(StoreError::Protocol {
                operation: "ordered_range".to_string(),
                reason: format!("expected triples, got {} items", flat.len()),
            });
        }

        let mut entries = Vec::with_capacity(flat.len() / 3);
        for chunk in flat.chunks(3) {
            let score: f64 = chunk[1].parse().map_err(|_| StoreError::Protocol {
                operation: "ordered_range".to_string(),
                reason: format!("bad score '{}'", chunk[1]),
            })?;
            let seq: u64 = chunk[2].parse().unwrap_or(0);
            entries.push((chunk[0].clone(), score, seq));
        }

        sort_by_score_then_sequence(&mut entries);
        Ok(entries
            .into_iter()
            .map(|(member, score, _)| (member, score))
            .collect())
    }
}

fn seq_key(key: &str) -> String {
    format!("{}:seq", key)
}

fn counter_key(key: &str) -> String {
    format!("{}:counter", key)
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let applied: i64 = self
            .expire_if_equals
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .delete_if_equals
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<bool, StoreError> {
        if fields.is_empty() {
            return Ok(false);
        }
        let mut invocation = self.hash_create.key(key);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.redis.clone();
        let created: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(created == 1)
    }

    async fn hash_get_all(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StoreError> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fields))
        }
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: &[String],
        updates: &[(String, String)],
        expiry: KeyExpiry,
    ) -> Result<CasOutcome, StoreError> {
        let ttl_ms: i64 = match expiry {
            KeyExpiry::Keep => -1,
            KeyExpiry::After(ttl) => i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        };

        let mut invocation = self.hash_compare_and_set.key(key);
        invocation.arg(field).arg(ttl_ms).arg(expected.len());
        for value in expected {
            invocation.arg(value);
        }
        for (name, value) in updates {
            invocation.arg(name).arg(value);
        }

        let mut conn = self.redis.clone();
        let (code, value): (i64, String) = invocation.invoke_async(&mut conn).await?;

        match code {
            0 => Ok(CasOutcome::Missing),
            1 => Ok(CasOutcome::Applied { previous: value }),
            2 => Ok(CasOutcome::Mismatch { current: value }),
            other => Err(StoreError::Protocol {
                operation: "hash_compare_and_set".to_string(),
                reason: format!("unknown result code {}", other),
            }),
        }
    }

    async fn ordered_insert(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _seq: i64 = self
            .ordered_insert
            .key(key)
            .key(seq_key(key))
            .key(counter_key(key))
            .arg(score_arg(score))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn ordered_insert_guarded(
        &self,
        key: &str,
        member: &str,
        score: f64,
        guard: FieldGuard<'_>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let written: i64 = self
            .ordered_insert_guarded
            .key(key)
            .key(seq_key(key))
            .key(counter_key(key))
            .key(guard.key)
            .arg(score_arg(score))
            .arg(member)
            .arg(guard.field)
            .arg(guard.value)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn ordered_range(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.range_with_sequence(key, max_score).await
    }

    async fn ordered_all(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        self.range_with_sequence(key, f64::INFINITY).await
    }

    async fn ordered_score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.zscore(key, member).await?)
    }

    async fn ordered_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.redis.clone();
        let removed: i64 = self
            .ordered_remove
            .key(key)
            .key(seq_key(key))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ordered_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.zcard(key).await?)
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lrem(key, 0, value).await?)
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.lrange(key, 0, -1).await?)
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.llen(key).await?)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.smembers(key).await?)
    }
}
