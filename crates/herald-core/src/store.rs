//! Storage of per-channel member lists.
//!
//! A store only keeps lists; every policy decision lives in
//! [`PresenceDirectory`](crate::presence::PresenceDirectory).

use crate::member::Member;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A stored list could not be encoded or decoded.
    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable storage of member lists, keyed by channel name.
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Fetch the stored list, or an empty list if there is none.
    async fn get(&self, channel: &str) -> Result<Vec<Member>, StoreError>;

    /// Replace the stored list.
    async fn set(&self, channel: &str, members: &[Member]) -> Result<(), StoreError>;
}

/// In-process member store.
#[derive(Debug, Default)]
pub struct MemoryMemberStore {
    lists: DashMap<String, Vec<Member>>,
}

impl MemoryMemberStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels with a non-empty list.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.lists.len()
    }
}

#[async_trait]
impl MemberStore for MemoryMemberStore {
    async fn get(&self, channel: &str) -> Result<Vec<Member>, StoreError> {
        Ok(self
            .lists
            .get(channel)
            .map(|list| list.clone())
            .unwrap_or_default())
    }

    async fn set(&self, channel: &str, members: &[Member]) -> Result<(), StoreError> {
        if members.is_empty() {
            self.lists.remove(channel);
        } else {
            self.lists.insert(channel.to_string(), members.to_vec());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryMemberStore::new();
        assert!(store.get("presence-a").await.unwrap().is_empty());

        let members = vec![Member::new(json!(1), json!({}), "c1")];
        store.set("presence-a", &members).await.unwrap();

        assert_eq!(store.get("presence-a").await.unwrap(), members);
        assert_eq!(store.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_list_removes_channel() {
        let store = MemoryMemberStore::new();
        store
            .set("presence-a", &[Member::new(json!(1), json!({}), "c1")])
            .await
            .unwrap();
        store.set("presence-a", &[]).await.unwrap();

        assert_eq!(store.channel_count(), 0);
    }
}
