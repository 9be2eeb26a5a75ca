//! Offline Store
//!
//! Per (uid, platform) a time-scored index of message seqs; per seq one
//! shared blob and a reference counter, both expiring at `send_time + expire`.
//! The same message written for several platforms of a user is stored once
//! and deleted only when the last index referencing it lets go.
//!
//! All expiry arithmetic is in whole seconds.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryOfflineStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisOfflineStore;

use async_trait::async_trait;
use courier_core::{CourierResult, Message, Platform, Timestamp, Uid};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of ranging one index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineRead {
    /// Every seq in range, including those whose blob already expired
    pub seqs: Vec<String>,
    pub messages: Vec<Message>,
}

#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Record `message` for (uid, platform); a seq already indexed there is a no-op
    async fn write(
        &self,
        uid: &Uid,
        platform: &Platform,
        message: &Message,
        send_time: Timestamp,
        expire: Duration,
    ) -> CourierResult<()>;

    /// Oldest entries not older than `now - expire`, at most `limit`
    async fn read(
        &self,
        uid: &Uid,
        platform: &Platform,
        expire: Duration,
        limit: usize,
    ) -> CourierResult<OfflineRead>;

    /// Unindex seqs and release their blobs; an empty list is invalid
    async fn delete(&self, uid: &Uid, platform: &Platform, seqs: &[String]) -> CourierResult<()>;

    /// Purge expired entries, then trim each platform to its max count
    ///
    /// A negative max count only purges expired entries. An empty map is
    /// invalid.
    async fn clean(
        &self,
        uid: &Uid,
        expire: Duration,
        platform_to_max: &HashMap<Platform, i64>,
    ) -> CourierResult<()>;
}

// ----------------------------------------------------------------------------
// Offline Batch
// ----------------------------------------------------------------------------

/// A read batch bound to the store it came from
pub struct OfflineBatch {
    store: Arc<dyn OfflineStore>,
    uid: Uid,
    platform: Platform,
    seqs: Vec<String>,
    messages: Vec<Message>,
}

impl OfflineBatch {
    pub async fn read(
        store: &Arc<dyn OfflineStore>,
        uid: &Uid,
        platform: &Platform,
        expire: Duration,
        limit: usize,
    ) -> CourierResult<Self> {
        let OfflineRead { seqs, messages } = store.read(uid, platform, expire, limit).await?;
        Ok(Self {
            store: store.clone(),
            uid: uid.clone(),
            platform: platform.clone(),
            seqs,
            messages,
        })
    }

    /// Nothing left in range
    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn seqs(&self) -> &[String] {
        &self.seqs
    }

    /// Remove every seq of this batch from the store
    pub async fn delete(self) -> CourierResult<()> {
        if self.seqs.is_empty() {
            return Ok(());
        }
        self.store
            .delete(&self.uid, &self.platform, &self.seqs)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ManualTimeSource, MessageOptions, TimeSource};

    #[tokio::test]
    async fn test_batch_delete_is_bound_to_its_read() {
        let clock = ManualTimeSource::new(Timestamp::from_secs(1_000));
        let store: Arc<dyn OfflineStore> = Arc::new(MemoryOfflineStore::new(Arc::new(clock.clone())));
        let (uid, platform) = (Uid::from("u1"), Platform::from("ios"));
        let expire = Duration::from_secs(60);

        for seq in ["a", "b", "c"] {
            let message = Message::new(seq, MessageOptions::NEED_OFFLINE, seq.as_bytes().to_vec());
            store
                .write(&uid, &platform, &message, clock.now(), expire)
                .await
                .unwrap();
        }

        let batch = OfflineBatch::read(&store, &uid, &platform, expire, 2).await.unwrap();
        assert_eq!(batch.seqs(), &["a".to_string(), "b".to_string()]);
        assert_eq!(batch.messages().len(), 2);

        // A write landing after the read is not covered by the batch.
        let late = Message::new("d", MessageOptions::NEED_OFFLINE, vec![]);
        store.write(&uid, &platform, &late, clock.now(), expire).await.unwrap();
        batch.delete().await.unwrap();

        let rest = OfflineBatch::read(&store, &uid, &platform, expire, 10).await.unwrap();
        assert_eq!(rest.seqs(), &["c".to_string(), "d".to_string()]);
    }
}
