//! Redis directory backend
//!
//! Layout: one hash per user at `msg/u:{uid}/ss`, field = sid, value =
//! `platform+gateway`. `HSETNX` gives write-once inserts.

use super::{encode_detail, SessionDirectory};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult, Session, Sid, Uid};
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;

fn sessions_key(uid: &Uid) -> String {
    format!("msg/u:{}/ss", uid)
}

fn storage_error(err: redis::RedisError) -> CourierError {
    CourierError::storage(format!("redis: {}", err))
}

#[derive(Clone)]
pub struct RedisDirectory {
    conn: MultiplexedConnection,
}

impl RedisDirectory {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Connect to `url` (e.g. `redis://127.0.0.1/`)
    pub async fn connect(url: &str) -> CourierResult<Self> {
        let client = redis::Client::open(url).map_err(storage_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(storage_error)?;
        Ok(Self::new(conn))
    }
}

#[async_trait]
impl SessionDirectory for RedisDirectory {
    async fn add(&self, session: &Session) -> CourierResult<bool> {
        let mut conn = self.conn.clone();
        let inserted: i64 = redis::cmd("HSETNX")
            .arg(sessions_key(&session.uid))
            .arg(session.sid.as_str())
            .arg(encode_detail(&session.platform, &session.gateway_id))
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(inserted == 1)
    }

    async fn remove(&self, uid: &Uid, sids: &[Sid]) -> CourierResult<()> {
        if sids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let fields: Vec<&str> = sids.iter().map(Sid::as_str).collect();
        redis::cmd("HDEL")
            .arg(sessions_key(uid))
            .arg(fields)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(storage_error)
    }

    async fn entries(&self, uid: &Uid, only: Option<&[Sid]>) -> CourierResult<Vec<(Sid, String)>> {
        let mut conn = self.conn.clone();
        let key = sessions_key(uid);
        match only {
            None => {
                let all: HashMap<String, String> = redis::cmd("HGETALL")
                    .arg(key)
                    .query_async::<_, HashMap<String, String>>(&mut conn)
                    .await
                    .map_err(storage_error)?;
                Ok(all
                    .into_iter()
                    .map(|(sid, detail)| (Sid::from(sid), detail))
                    .collect())
            }
            Some([]) => Ok(Vec::new()),
            Some(sids) => {
                let fields: Vec<&str> = sids.iter().map(Sid::as_str).collect();
                let values: Vec<Option<String>> = redis::cmd("HMGET")
                    .arg(key)
                    .arg(fields)
                    .query_async::<_, Vec<Option<String>>>(&mut conn)
                    .await
                    .map_err(storage_error)?;
                Ok(sids
                    .iter()
                    .zip(values)
                    .filter_map(|(sid, detail)| detail.map(|detail| (sid.clone(), detail)))
                    .collect())
            }
        }
    }
}
