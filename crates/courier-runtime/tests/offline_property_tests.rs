//! Property-based tests for the offline store
//!
//! These tests verify the bookkeeping that keeps one blob per message across
//! platforms: idempotent writes, reference counts, trimming bounds and read
//! expiry.

use courier_runtime::{MemoryOfflineStore, OfflineStore};
use courier_core::{ManualTimeSource, Message, MessageOptions, Platform, TimeSource, Timestamp, Uid};
use proptest::prelude::*;
use tokio_test::block_on;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

const START_SECS: u64 = 1_000_000;
const EXPIRE: Duration = Duration::from_secs(3_600);

fn create_test_store() -> (MemoryOfflineStore, ManualTimeSource) {
    let clock = ManualTimeSource::new(Timestamp::from_secs(START_SECS));
    (MemoryOfflineStore::new(Arc::new(clock.clone())), clock)
}

fn message(seq: &str) -> Message {
    Message::new(seq, MessageOptions::NEED_OFFLINE, seq.as_bytes().to_vec())
}

fn arb_platforms() -> impl Strategy<Value = Vec<Platform>> {
    prop::collection::btree_set("[a-z]{1,4}", 1..6)
        .prop_map(|names| names.into_iter().map(Platform::from).collect())
}

proptest! {
    /// Property: Rewriting a seq to one index never adds entries or references
    #[test]
    fn repeated_write_is_idempotent(repeats in 1usize..8, offset in 0u64..100) {
        block_on(async {
            let (store, _clock) = create_test_store();
            let (uid, platform) = (Uid::from("u1"), Platform::from("ios"));
            for attempt in 0..repeats {
                let sent = Timestamp::from_secs(START_SECS - offset + attempt as u64);
                store.write(&uid, &platform, &message("m1"), sent, EXPIRE).await.unwrap();
            }
            assert_eq!(store.index_len(&uid, &platform).await, 1);
            assert_eq!(store.refcount("m1").await, Some(1));
            let read = store.read(&uid, &platform, EXPIRE, 10).await.unwrap();
            assert_eq!(read.seqs, vec!["m1".to_string()]);
        });
    }

    /// Property: One blob per seq, referenced once per platform holding it
    #[test]
    fn refcount_tracks_platforms(platforms in arb_platforms(), keep in 0usize..6) {
        block_on(async {
            let (store, clock) = create_test_store();
            let uid = Uid::from("u1");
            for platform in &platforms {
                store.write(&uid, platform, &message("m1"), clock.now(), EXPIRE).await.unwrap();
            }
            assert_eq!(store.refcount("m1").await, Some(platforms.len() as i64));

            let keep = keep.min(platforms.len());
            let seqs = vec!["m1".to_string()];
            for platform in &platforms[keep..] {
                store.delete(&uid, platform, &seqs).await.unwrap();
                // Deleting again must not release the blob a second time.
                store.delete(&uid, platform, &seqs).await.unwrap();
            }

            if keep == 0 {
                assert_eq!(store.refcount("m1").await, None);
            } else {
                assert_eq!(store.refcount("m1").await, Some(keep as i64));
                for platform in &platforms[..keep] {
                    let read = store.read(&uid, platform, EXPIRE, 10).await.unwrap();
                    assert_eq!(read.messages, vec![message("m1")]);
                }
            }
        });
    }

    /// Property: Clean leaves at most max entries and releases each trimmed seq once
    #[test]
    fn clean_bounds_index(count in 0usize..20, max in 0i64..10, shared in prop::collection::btree_set(0usize..20, 0..20)) {
        block_on(async {
            let (store, clock) = create_test_store();
            let (uid, ios, web) = (Uid::from("u1"), Platform::from("ios"), Platform::from("web"));
            let seqs: Vec<String> = (0..count).map(|i| format!("m{:02}", i)).collect();

            for (index, seq) in seqs.iter().enumerate() {
                let sent = Timestamp::from_secs(START_SECS + index as u64);
                store.write(&uid, &ios, &message(seq), sent, EXPIRE).await.unwrap();
                if shared.contains(&index) {
                    store.write(&uid, &web, &message(seq), sent, EXPIRE).await.unwrap();
                }
            }
            clock.advance(Duration::from_secs(count as u64));

            let limits = HashMap::from([(ios.clone(), max), (web.clone(), -1)]);
            store.clean(&uid, EXPIRE, &limits).await.unwrap();

            let kept = count.min(max as usize);
            assert_eq!(store.index_len(&uid, &ios).await, kept);
            for (index, seq) in seqs.iter().enumerate() {
                let trimmed = index < count - kept;
                let expected = match (trimmed, shared.contains(&index)) {
                    (true, true) => Some(1),
                    (true, false) => None,
                    (false, true) => Some(2),
                    (false, false) => Some(1),
                };
                assert_eq!(store.refcount(seq).await, expected, "seq {}", seq);
            }
        });
    }

    /// Property: Reads never return entries older than now - expire
    #[test]
    fn read_respects_expiry(ages in prop::collection::btree_set(0u64..7_200, 0..30)) {
        block_on(async {
            let (store, _clock) = create_test_store();
            let (uid, platform) = (Uid::from("u1"), Platform::from("ios"));
            for age in &ages {
                let sent = Timestamp::from_secs(START_SECS - age);
                store.write(&uid, &platform, &message(&format!("a{:05}", age)), sent, EXPIRE).await.unwrap();
            }

            let read = store.read(&uid, &platform, EXPIRE, 100).await.unwrap();
            let fresh: BTreeSet<String> = ages
                .iter()
                .filter(|age| **age <= EXPIRE.as_secs())
                .map(|age| format!("a{:05}", age))
                .collect();
            let returned: BTreeSet<String> = read.seqs.iter().cloned().collect();
            assert_eq!(returned, fresh);
            assert!(read.seqs.len() <= 100);
        });
    }
}

// ----------------------------------------------------------------------------
// Concurrent writers
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Action {
    Keep,
    Delete,
    Trim,
    Rewrite,
}

impl Action {
    fn survives(self) -> bool {
        matches!(self, Action::Keep | Action::Rewrite)
    }
}

fn arb_action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Keep),
        Just(Action::Delete),
        Just(Action::Trim),
        Just(Action::Rewrite),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: Uncoordinated writers on many platforms leave refcount equal
    /// to the number of indexes still holding the seq, and the blob exists
    /// exactly while that number is positive
    #[test]
    fn concurrent_mutations_keep_refcount_consistent(actions in prop::collection::vec(arb_action(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let (store, clock) = create_test_store();
            let store = Arc::new(store);
            let uid = Uid::from("u1");
            let sent = clock.now();

            let tasks: Vec<_> = actions
                .iter()
                .enumerate()
                .map(|(index, action)| {
                    let (store, uid, action) = (store.clone(), uid.clone(), *action);
                    let platform = Platform::from(format!("p{}", index));
                    tokio::spawn(async move {
                        store.write(&uid, &platform, &message("m1"), sent, EXPIRE).await.unwrap();
                        tokio::task::yield_now().await;
                        match action {
                            Action::Keep => {}
                            Action::Delete => {
                                store.delete(&uid, &platform, &["m1".to_string()]).await.unwrap();
                            }
                            Action::Trim => {
                                let limits = HashMap::from([(platform.clone(), 0)]);
                                store.clean(&uid, EXPIRE, &limits).await.unwrap();
                            }
                            Action::Rewrite => {
                                store.write(&uid, &platform, &message("m1"), sent, EXPIRE).await.unwrap();
                            }
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }

            let surviving = actions.iter().filter(|action| action.survives()).count();
            match store.refcount("m1").await {
                Some(count) => assert_eq!(count, surviving as i64),
                None => assert_eq!(surviving, 0),
            }
            for (index, action) in actions.iter().enumerate() {
                let platform = Platform::from(format!("p{}", index));
                let expected = usize::from(action.survives());
                assert_eq!(store.index_len(&uid, &platform).await, expected);
                if action.survives() {
                    let read = store.read(&uid, &platform, EXPIRE, 10).await.unwrap();
                    assert_eq!(read.messages, vec![message("m1")]);
                }
            }
        });
    }
}
