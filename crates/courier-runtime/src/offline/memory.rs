//! In-process offline store
//!
//! Index, counters and blobs live behind one async mutex, so each operation
//! is atomic across all three. Key expiry is evaluated lazily against the
//! injected [`TimeSource`].

use super::{OfflineRead, OfflineStore};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult, Message, Platform, TimeSource, Timestamp, Uid};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Debug, Default)]
struct Index {
    scores: HashMap<String, u64>,
    ordered: BTreeSet<(u64, String)>,
    expires_at: u64,
}

impl Index {
    fn insert(&mut self, seq: &str, score: u64) -> bool {
        if self.scores.contains_key(seq) {
            return false;
        }
        self.scores.insert(seq.to_string(), score);
        self.ordered.insert((score, seq.to_string()));
        true
    }

    fn remove(&mut self, seq: &str) -> bool {
        match self.scores.remove(seq) {
            Some(score) => {
                self.ordered.remove(&(score, seq.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

/// Shared blob and its reference count; one expiry covers both
#[derive(Debug)]
struct Blob {
    refcount: i64,
    bytes: Vec<u8>,
    expires_at: u64,
}

#[derive(Debug, Default)]
struct State {
    indexes: HashMap<(Uid, Platform), Index>,
    blobs: HashMap<String, Blob>,
}

impl State {
    fn index(&mut self, key: &(Uid, Platform), now: u64) -> Option<&mut Index> {
        if self
            .indexes
            .get(key)
            .is_some_and(|index| now >= index.expires_at)
        {
            self.indexes.remove(key);
        }
        self.indexes.get_mut(key)
    }

    fn blob(&mut self, seq: &str, now: u64) -> Option<&mut Blob> {
        if self.blobs.get(seq).is_some_and(|blob| now >= blob.expires_at) {
            self.blobs.remove(seq);
        }
        self.blobs.get_mut(seq)
    }

    /// Drop one reference; the blob goes away when none remain
    fn release(&mut self, seq: &str, now: u64) {
        let remaining = match self.blob(seq, now) {
            Some(blob) => {
                blob.refcount -= 1;
                blob.refcount
            }
            None => 0,
        };
        if remaining <= 0 {
            self.blobs.remove(seq);
        }
    }

    fn drop_empty(&mut self, key: &(Uid, Platform)) {
        if self.indexes.get(key).is_some_and(|index| index.len() == 0) {
            self.indexes.remove(key);
        }
    }
}

pub struct MemoryOfflineStore {
    state: Mutex<State>,
    clock: Arc<dyn TimeSource>,
}

impl MemoryOfflineStore {
    pub fn new(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn now_secs(&self) -> u64 {
        self.clock.now().as_secs()
    }

    /// Live reference count of a blob, `None` when absent or expired
    pub async fn refcount(&self, seq: &str) -> Option<i64> {
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        state.blob(seq, now).map(|blob| blob.refcount)
    }

    /// Live entries in one index
    pub async fn index_len(&self, uid: &Uid, platform: &Platform) -> usize {
        let now = self.now_secs();
        let mut state = self.state.lock().await;
        state
            .index(&(uid.clone(), platform.clone()), now)
            .map_or(0, |index| index.len())
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
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
        let now = self.now_secs();
        let score = send_time.as_secs();
        let expires_at = score + expire.as_secs();
        let key = (uid.clone(), platform.clone());

        let mut state = self.state.lock().await;
        state.index(&key, now);
        let index = state.indexes.entry(key).or_default();
        index.expires_at = now + expire.as_secs();
        if !index.insert(&message.seq, score) {
            trace!(uid = %uid, platform = %platform, seq = %message.seq, "offline duplicate");
            return Ok(());
        }

        match state.blob(&message.seq, now) {
            Some(blob) => blob.refcount += 1,
            None => {
                state.blobs.insert(
                    message.seq.clone(),
                    Blob {
                        refcount: 1,
                        bytes,
                        expires_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn read(
        &self,
        uid: &Uid,
        platform: &Platform,
        expire: Duration,
        limit: usize,
    ) -> CourierResult<OfflineRead> {
        let now = self.now_secs();
        let min_score = now.saturating_sub(expire.as_secs());

        let mut state = self.state.lock().await;
        let seqs: Vec<String> = match state.index(&(uid.clone(), platform.clone()), now) {
            Some(index) => index
                .ordered
                .range((min_score, String::new())..)
                .take(limit)
                .map(|(_, seq)| seq.clone())
                .collect(),
            None => Vec::new(),
        };

        let mut messages = Vec::with_capacity(seqs.len());
        for seq in &seqs {
            if let Some(blob) = state.blob(seq, now) {
                messages.push(Message::from_bytes(&blob.bytes)?);
            }
        }
        Ok(OfflineRead { seqs, messages })
    }

    async fn delete(&self, uid: &Uid, platform: &Platform, seqs: &[String]) -> CourierResult<()> {
        if seqs.is_empty() {
            return Err(CourierError::invalid("delete without seqs"));
        }
        let now = self.now_secs();
        let key = (uid.clone(), platform.clone());

        let mut state = self.state.lock().await;
        for seq in seqs {
            let removed = state
                .index(&key, now)
                .is_some_and(|index| index.remove(seq));
            if removed {
                state.release(seq, now);
            }
        }
        state.drop_empty(&key);
        Ok(())
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
        let now = self.now_secs();
        let min_score = now.saturating_sub(expire.as_secs());

        let mut state = self.state.lock().await;
        for (platform, max_count) in platform_to_max {
            let key = (uid.clone(), platform.clone());
            let trimmed: Vec<String> = match state.index(&key, now) {
                Some(index) => {
                    let expired: Vec<(u64, String)> = index
                        .ordered
                        .range(..(min_score, String::new()))
                        .cloned()
                        .collect();
                    for (_, seq) in &expired {
                        index.remove(seq);
                    }

                    let keep = usize::try_from(*max_count).ok();
                    match keep {
                        Some(keep) if index.len() > keep => {
                            let excess = index.len() - keep;
                            let oldest: Vec<String> = index
                                .ordered
                                .iter()
                                .take(excess)
                                .map(|(_, seq)| seq.clone())
                                .collect();
                            for seq in &oldest {
                                index.remove(seq);
                            }
                            oldest
                        }
                        _ => Vec::new(),
                    }
                }
                None => continue,
            };

            for seq in &trimmed {
                state.release(seq, now);
            }
            state.drop_empty(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ManualTimeSource, MessageOptions};

    const EXPIRE: Duration = Duration::from_secs(100);

    fn create_test_store() -> (MemoryOfflineStore, ManualTimeSource) {
        let clock = ManualTimeSource::new(Timestamp::from_secs(10_000));
        (MemoryOfflineStore::new(Arc::new(clock.clone())), clock)
    }

    fn message(seq: &str) -> Message {
        Message::new(seq, MessageOptions::NEED_OFFLINE, seq.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_duplicate_write_is_noop() {
        let (store, clock) = create_test_store();
        let (uid, ios) = (Uid::from("u1"), Platform::from("ios"));

        for _ in 0..3 {
            store.write(&uid, &ios, &message("m1"), clock.now(), EXPIRE).await.unwrap();
        }
        assert_eq!(store.index_len(&uid, &ios).await, 1);
        assert_eq!(store.refcount("m1").await, Some(1));
    }

    #[tokio::test]
    async fn test_blob_shared_across_platforms() {
        let (store, clock) = create_test_store();
        let uid = Uid::from("u1");
        let (ios, web) = (Platform::from("ios"), Platform::from("web"));

        store.write(&uid, &ios, &message("m1"), clock.now(), EXPIRE).await.unwrap();
        store.write(&uid, &web, &message("m1"), clock.now(), EXPIRE).await.unwrap();
        assert_eq!(store.refcount("m1").await, Some(2));

        store.delete(&uid, &ios, &["m1".to_string()]).await.unwrap();
        assert_eq!(store.refcount("m1").await, Some(1));
        // Deleting again from the same platform does not decrement twice.
        store.delete(&uid, &ios, &["m1".to_string()]).await.unwrap();
        assert_eq!(store.refcount("m1").await, Some(1));

        let read = store.read(&uid, &web, EXPIRE, 10).await.unwrap();
        assert_eq!(read.messages, vec![message("m1")]);

        store.delete(&uid, &web, &["m1".to_string()]).await.unwrap();
        assert_eq!(store.refcount("m1").await, None);
    }

    #[tokio::test]
    async fn test_read_skips_expired_entries() {
        let (store, clock) = create_test_store();
        let (uid, ios) = (Uid::from("u1"), Platform::from("ios"));

        let old = Timestamp::from_secs(clock.now().as_secs() - 150);
        store.write(&uid, &ios, &message("old"), old, EXPIRE).await.unwrap();
        store.write(&uid, &ios, &message("new"), clock.now(), EXPIRE).await.unwrap();

        let read = store.read(&uid, &ios, EXPIRE, 10).await.unwrap();
        assert_eq!(read.seqs, vec!["new".to_string()]);

        clock.advance(Duration::from_secs(101));
        let read = store.read(&uid, &ios, EXPIRE, 10).await.unwrap();
        assert!(read.seqs.is_empty());
    }

    #[tokio::test]
    async fn test_clean_trims_oldest_and_releases() {
        let (store, clock) = create_test_store();
        let uid = Uid::from("u1");
        let (ios, web) = (Platform::from("ios"), Platform::from("web"));

        for (offset, seq) in ["m1", "m2", "m3", "m4"].iter().enumerate() {
            let at = Timestamp::from_secs(clock.now().as_secs() + offset as u64);
            store.write(&uid, &ios, &message(seq), at, EXPIRE).await.unwrap();
        }
        store.write(&uid, &web, &message("m1"), clock.now(), EXPIRE).await.unwrap();

        let limits = HashMap::from([(ios.clone(), 2), (web.clone(), -1)]);
        store.clean(&uid, EXPIRE, &limits).await.unwrap();

        let read = store.read(&uid, &ios, EXPIRE, 10).await.unwrap();
        assert_eq!(read.seqs, vec!["m3".to_string(), "m4".to_string()]);
        assert_eq!(store.refcount("m1").await, Some(1));
        assert_eq!(store.refcount("m2").await, None);
        assert_eq!(store.index_len(&uid, &web).await, 1);
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let (store, _clock) = create_test_store();
        let uid = Uid::from("u1");
        assert!(matches!(
            store.delete(&uid, &"ios".into(), &[]).await,
            Err(CourierError::Invalid { .. })
        ));
        assert!(matches!(
            store.clean(&uid, EXPIRE, &HashMap::new()).await,
            Err(CourierError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_index_ttl_refreshes_on_write() {
        let (store, clock) = create_test_store();
        let (uid, ios) = (Uid::from("u1"), Platform::from("ios"));

        store.write(&uid, &ios, &message("m1"), clock.now(), EXPIRE).await.unwrap();
        clock.advance(Duration::from_secs(60));
        store.write(&uid, &ios, &message("m2"), clock.now(), EXPIRE).await.unwrap();
        clock.advance(Duration::from_secs(60));

        // The first message expired, the index itself did not.
        let read = store.read(&uid, &ios, EXPIRE, 10).await.unwrap();
        assert_eq!(read.seqs, vec!["m2".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_write_refreshes_index_ttl() {
        let (store, clock) = create_test_store();
        let (uid, ios) = (Uid::from("u1"), Platform::from("ios"));
        let sent = clock.now();

        store.write(&uid, &ios, &message("m1"), sent, EXPIRE).await.unwrap();
        clock.advance(Duration::from_secs(60));
        store.write(&uid, &ios, &message("m1"), sent, EXPIRE).await.unwrap();
        clock.advance(Duration::from_secs(50));

        // Past the first write's expiry, inside the refreshed one.
        assert_eq!(store.index_len(&uid, &ios).await, 1);
        assert_eq!(store.refcount("m1").await, None);
    }
}
