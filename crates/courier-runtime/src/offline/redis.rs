//! Redis offline store
//!
//! Keys:
//! - `msg/u:{uid}/p:{platform}/oms`: sorted set, member = seq, score = send time (s)
//! - `msg/om:{seq}/m`: encoded message blob
//! - `msg/om:{seq}/n`: reference counter
//!
//! Every mutation touching the index, counter and blob runs as one Lua
//! script, so it is atomic per seq. Multi-seq and multi-platform calls invoke
//! the script once per item and report every failure.

use super::{OfflineRead, OfflineStore};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult, Message, Platform, TimeSource, Timestamp, Uid};
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const WRITE_SCRIPT: &str = r#"
local added = redis.call("ZADD", KEYS[1], "NX", ARGV[3], ARGV[1])
redis.call("EXPIRE", KEYS[1], ARGV[4])
if added == 0 then
    return nil
end
if redis.call("INCR", KEYS[3]) == 1 then
    redis.call("EXPIREAT", KEYS[3], ARGV[5])
    redis.call("SET", KEYS[2], ARGV[2], "NX")
    redis.call("EXPIREAT", KEYS[2], ARGV[5])
end
return nil
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[1]) ~= 1 then
    return nil
end
if redis.call("DECR", KEYS[3]) > 0 then
    return nil
end
redis.call("DEL", KEYS[2], KEYS[3])
return nil
"#;

const CLEAN_SCRIPT: &str = r#"
redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
local max_count = tonumber(ARGV[2])
if max_count < 0 then
    return nil
end
local stop = "-" .. tostring(max_count + 1)
local trimmed = redis.call("ZRANGE", KEYS[1], "0", stop)
if #trimmed == 0 then
    return nil
end
redis.call("ZREMRANGEBYRANK", KEYS[1], "0", stop)
for _, seq in ipairs(trimmed) do
    local counter = "msg/om:" .. seq .. "/n"
    if redis.call("DECR", counter) <= 0 then
        redis.call("DEL", "msg/om:" .. seq .. "/m", counter)
    end
end
return nil
"#;

fn index_key(uid: &Uid, platform: &Platform) -> String {
    format!("msg/u:{}/p:{}/oms", uid, platform)
}

fn blob_key(seq: &str) -> String {
    format!("msg/om:{}/m", seq)
}

fn counter_key(seq: &str) -> String {
    format!("msg/om:{}/n", seq)
}

fn storage_error(err: redis::RedisError) -> CourierError {
    CourierError::storage(format!("redis: {}", err))
}

/// Fold per-item failures into one error after every item was attempted
fn collect_failures(operation: &str, failures: Vec<CourierError>) -> CourierResult<()> {
    match failures.len() {
        0 => Ok(()),
        count => {
            for err in &failures {
                warn!(operation, error = %err, "offline script failed");
            }
            Err(CourierError::storage(format!(
                "{}: {} of the scripted updates failed, first: {}",
                operation, count, failures[0]
            )))
        }
    }
}

#[derive(Clone)]
pub struct RedisOfflineStore {
    conn: MultiplexedConnection,
    clock: Arc<dyn TimeSource>,
    write: Arc<Script>,
    delete: Arc<Script>,
    clean: Arc<Script>,
}

impl RedisOfflineStore {
    pub fn new(conn: MultiplexedConnection, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            conn,
            clock,
            write: Arc::new(Script::new(WRITE_SCRIPT)),
            delete: Arc::new(Script::new(DELETE_SCRIPT)),
            clean: Arc::new(Script::new(CLEAN_SCRIPT)),
        }
    }

    pub async fn connect(url: &str, clock: Arc<dyn TimeSource>) -> CourierResult<Self> {
        let client = redis::Client::open(url).map_err(storage_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(storage_error)?;
        Ok(Self::new(conn, clock))
    }

    fn min_score(&self, expire: Duration) -> u64 {
        self.clock.now().as_secs().saturating_sub(expire.as_secs())
    }
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn write(
        &self,
        uid: &Uid,
        platform: &Platform,
        message: &Message,
        send_time: Timestamp,
        expire: Duration,
    ) -> CourierResult<()> {
        if message.seq.is_empty() {
            return Err(CourierError::invalid("offline message without seq"));
        }
        let bytes = message.to_bytes()?;
        let score = send_time.as_secs();
        let expire_secs = expire.as_secs();

        let mut conn = self.conn.clone();
        self.write
            .key(index_key(uid, platform))
            .key(blob_key(&message.seq))
            .key(counter_key(&message.seq))
            .arg(message.seq.as_str())
            .arg(bytes.as_slice())
            .arg(score)
            .arg(expire_secs)
            .arg(score + expire_secs)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .map_err(storage_error)
    }

    async fn read(
        &self,
        uid: &Uid,
        platform: &Platform,
        expire: Duration,
        limit: usize,
    ) -> CourierResult<OfflineRead> {
        let mut conn = self.conn.clone();
        let seqs: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(index_key(uid, platform))
            .arg(self.min_score(expire))
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(storage_error)?;
        if seqs.is_empty() {
            return Ok(OfflineRead::default());
        }

        let keys: Vec<String> = seqs.iter().map(|seq| blob_key(seq)).collect();
        let blobs: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async::<_, Vec<Option<Vec<u8>>>>(&mut conn)
            .await
            .map_err(storage_error)?;

        let messages = blobs
            .into_iter()
            .flatten()
            .map(|bytes| Message::from_bytes(&bytes))
            .collect::<CourierResult<Vec<_>>>()?;
        Ok(OfflineRead { seqs, messages })
    }

    async fn delete(&self, uid: &Uid, platform: &Platform, seqs: &[String]) -> CourierResult<()> {
        if seqs.is_empty() {
            return Err(CourierError::invalid("delete without seqs"));
        }
        let index = index_key(uid, platform);
        let mut conn = self.conn.clone();
        let mut failures = Vec::new();

        for seq in seqs {
            let result = self
                .delete
                .key(&index)
                .key(blob_key(seq))
                .key(counter_key(seq))
                .arg(seq.as_str())
                .invoke_async::<_, ()>(&mut conn)
                .await;
            if let Err(err) = result {
                failures.push(storage_error(err));
            }
        }
        collect_failures("delete", failures)
    }

    async fn clean(
        &self,
        uid: &Uid,
        expire: Duration,
        platform_to_max: &HashMap<Platform, i64>,
    ) -> CourierResult<()> {
        if platform_to_max.is_empty() {
            return Err(CourierError::invalid("clean without platforms"));
        }
        let min_score = self.min_score(expire);
        let mut conn = self.conn.clone();
        let mut failures = Vec::new();

        for (platform, max_count) in platform_to_max {
            let result = self
                .clean
                .key(index_key(uid, platform))
                .arg(min_score)
                .arg(*max_count)
                .invoke_async::<_, ()>(&mut conn)
                .await;
            if let Err(err) = result {
                failures.push(storage_error(err));
            }
        }
        collect_failures("clean", failures)
    }
}
