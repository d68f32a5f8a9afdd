//! Follower relationships
//!
//! One record per accepted Follow activity, keyed by the Follow's id.
//! The follower list seen by callers collapses records that share a
//! follower URI.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use super::kv::{KvKey, KvStore};
use crate::error::AppError;

const FOLLOWERS_PREFIX: &str = "followers";

/// Follower store
///
/// Owns the `["followers", followActivityId]` key space.
#[derive(Clone)]
pub struct FollowerStore {
    kv: Arc<dyn KvStore>,
}

impl FollowerStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(activity_id: &str) -> KvKey {
        KvKey::new([FOLLOWERS_PREFIX, activity_id])
    }

    /// Record that `follower_uri` follows us through Follow `activity_id`.
    ///
    /// Re-recording the same pair is a no-op in effect.
    pub async fn put(&self, activity_id: &str, follower_uri: &str) -> Result<(), AppError> {
        self.kv
            .set(&Self::key(activity_id), Value::String(follower_uri.to_string()))
            .await?;
        tracing::debug!(follow_id = %activity_id, follower = %follower_uri, "Follower stored");
        Ok(())
    }

    /// Follower URI recorded for Follow `activity_id`, if any
    pub async fn get(&self, activity_id: &str) -> Result<Option<String>, AppError> {
        let value = self.kv.get(&Self::key(activity_id)).await?;
        Ok(value.and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Remove the relationship created by Follow `activity_id`.
    ///
    /// Removing an unknown id succeeds.
    pub async fn delete(&self, activity_id: &str) -> Result<(), AppError> {
        self.kv.delete(&Self::key(activity_id)).await?;
        tracing::debug!(follow_id = %activity_id, "Follower removed");
        Ok(())
    }

    /// Distinct follower URIs, in first-seen order
    pub async fn list_all(&self) -> Result<Vec<String>, AppError> {
        let entries = self.kv.list(&KvKey::new([FOLLOWERS_PREFIX])).await?;

        let mut seen = HashSet::new();
        let mut followers = Vec::new();
        for entry in entries {
            let Some(uri) = entry.value.as_str() else {
                tracing::warn!(key = %entry.key, "Skipping follower entry with non-string value");
                continue;
            };
            if seen.insert(uri.to_string()) {
                followers.push(uri.to_string());
            }
        }

        crate::metrics::FOLLOWERS_TOTAL.set(followers.len() as i64);
        Ok(followers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryKvStore;

    fn store() -> FollowerStore {
        FollowerStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn two_follows_from_same_actor_collapse() {
        let followers = store();
        followers
            .put("https://a.example/follows/1", "https://a.example/users/alice")
            .await
            .unwrap();
        followers
            .put("https://a.example/follows/2", "https://a.example/users/alice")
            .await
            .unwrap();
        followers
            .put("https://b.example/follows/9", "https://b.example/users/bob")
            .await
            .unwrap();

        let list = followers.list_all().await.unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.contains(&"https://a.example/users/alice".to_string()));
        assert!(list.contains(&"https://b.example/users/bob".to_string()));
    }

    #[tokio::test]
    async fn delete_only_removes_named_relationship() {
        let followers = store();
        followers
            .put("https://a.example/follows/1", "https://a.example/users/alice")
            .await
            .unwrap();
        followers
            .put("https://a.example/follows/2", "https://a.example/users/alice")
            .await
            .unwrap();

        followers.delete("https://a.example/follows/1").await.unwrap();
        assert_eq!(
            followers.list_all().await.unwrap(),
            vec!["https://a.example/users/alice".to_string()]
        );

        followers.delete("https://a.example/follows/2").await.unwrap();
        assert!(followers.list_all().await.unwrap().is_empty());

        followers.delete("https://a.example/follows/2").await.unwrap();
    }

    #[tokio::test]
    async fn get_returns_recorded_follower() {
        let followers = store();
        followers
            .put("https://a.example/follows/1", "https://a.example/users/alice")
            .await
            .unwrap();

        assert_eq!(
            followers.get("https://a.example/follows/1").await.unwrap(),
            Some("https://a.example/users/alice".to_string())
        );
        assert!(followers.get("https://a.example/follows/x").await.unwrap().is_none());
    }
}
