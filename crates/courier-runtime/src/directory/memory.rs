//! In-process directory backend

use super::{encode_detail, SessionDirectory};
use async_trait::async_trait;
use courier_core::{CourierResult, Session, Sid, Uid};
use dashmap::DashMap;
use std::collections::HashMap;

/// Directory held in a concurrent map; per-uid updates are atomic
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<Uid, HashMap<Sid, String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw entry, bypassing encoding (used to seed corrupt data)
    pub fn insert_raw(&self, uid: &Uid, sid: &Sid, detail: &str) {
        self.users
            .entry(uid.clone())
            .or_default()
            .insert(sid.clone(), detail.to_string());
    }

    /// Total number of entries across all users
    pub fn len(&self) -> usize {
        self.users.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn add(&self, session: &Session) -> CourierResult<bool> {
        let mut entries = self.users.entry(session.uid.clone()).or_default();
        if entries.contains_key(&session.sid) {
            return Ok(false);
        }
        entries.insert(
            session.sid.clone(),
            encode_detail(&session.platform, &session.gateway_id),
        );
        Ok(true)
    }

    async fn remove(&self, uid: &Uid, sids: &[Sid]) -> CourierResult<()> {
        if let Some(mut entries) = self.users.get_mut(uid) {
            for sid in sids {
                entries.remove(sid);
            }
        }
        self.users.remove_if(uid, |_, entries| entries.is_empty());
        Ok(())
    }

    async fn entries(&self, uid: &Uid, only: Option<&[Sid]>) -> CourierResult<Vec<(Sid, String)>> {
        let Some(entries) = self.users.get(uid) else {
            return Ok(Vec::new());
        };
        let selected = match only {
            None => entries
                .iter()
                .map(|(sid, detail)| (sid.clone(), detail.clone()))
                .collect(),
            Some(sids) => sids
                .iter()
                .filter_map(|sid| entries.get(sid).map(|detail| (sid.clone(), detail.clone())))
                .collect(),
        };
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{CourierError, Platform};

    fn create_test_session(sid: &str, platform: &str) -> Session {
        Session::new(sid.into(), "u1".into(), platform.into(), "gw-1".into())
    }

    #[tokio::test]
    async fn test_add_is_write_once() {
        let directory = MemoryDirectory::new();
        let session = create_test_session("s1", "ios");
        assert!(directory.add(&session).await.unwrap());

        let mut moved = session.clone();
        moved.gateway_id = "gw-2".into();
        assert!(!directory.add(&moved).await.unwrap());

        let stored = directory
            .session(&"u1".into(), &"s1".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.gateway_id.as_str(), "gw-1");
    }

    #[tokio::test]
    async fn test_platform_grouping_most_recent_first() {
        let directory = MemoryDirectory::new();
        for (sid, platform) in [("s1", "ios"), ("s3", "ios"), ("s2", "ios"), ("s4", "web")] {
            directory.add(&create_test_session(sid, platform)).await.unwrap();
        }

        let grouped = directory.platform_sessions(&"u1".into()).await.unwrap();
        let ios: Vec<&str> = grouped[&Platform::from("ios")]
            .iter()
            .map(|s| s.sid.as_str())
            .collect();
        assert_eq!(ios, vec!["s3", "s2", "s1"]);
        assert_eq!(grouped[&Platform::from("web")].len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_lookup() {
        let directory = MemoryDirectory::new();
        directory.add(&create_test_session("s1", "ios")).await.unwrap();
        directory.add(&create_test_session("s2", "web")).await.unwrap();

        let only: [Sid; 2] = ["s2".into(), "missing".into()];
        let found = directory.sessions(&"u1".into(), Some(&only[..])).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&Sid::from("s2")));
    }

    #[tokio::test]
    async fn test_malformed_entries_removed_on_read() {
        let directory = MemoryDirectory::new();
        let uid = Uid::from("u1");
        directory.add(&create_test_session("s1", "ios")).await.unwrap();
        directory.insert_raw(&uid, &"bad-1".into(), "no-separator");
        directory.insert_raw(&uid, &"bad-2".into(), "+gw-1");

        let sessions = directory.sessions(&uid, None).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_sessions() {
        let directory = MemoryDirectory::new();
        let uid = Uid::from("u1");
        directory.add(&create_test_session("s1", "ios")).await.unwrap();

        assert!(matches!(
            directory.delete_sessions(&Uid::default(), &["s1".into()]).await,
            Err(CourierError::Invalid { .. })
        ));
        directory.delete_sessions(&uid, &[]).await.unwrap();
        assert_eq!(directory.len(), 1);

        directory.delete_sessions(&uid, &["s1".into()]).await.unwrap();
        directory.delete_sessions(&uid, &["s1".into()]).await.unwrap();
        assert!(directory.is_empty());
    }
}
