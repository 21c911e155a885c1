//! Redis-backed member store.
//!
//! Each presence channel's list lives as a JSON array under
//! `<key_prefix><channel>:members`. The lists back a single server instance:
//! they survive a restart, but members are always reconciled against this
//! process's own connections.

use async_trait::async_trait;
use herald_core::{Member, MemberStore, StoreError};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, RedisError};
use std::time::Duration;
use tracing::info;

/// Limit on establishing a connection and on each command.
const REDIS_TIMEOUT: Duration = Duration::from_secs(2);

/// Reconnect attempts before a command fails with a backend error.
const RECONNECT_RETRIES: usize = 2;

/// Longest wait between reconnect attempts, in milliseconds.
const RECONNECT_MAX_DELAY_MS: u64 = 500;

fn backend(e: RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Member store kept in Redis.
#[derive(Clone)]
pub struct RedisMemberStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisMemberStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    /// An unreachable server is reported after one attempt, not retried.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(backend)?;

        tokio::time::timeout(REDIS_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Backend(format!("Timed out connecting to {url}")))?
            .map_err(backend)?;

        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(RECONNECT_RETRIES)
            .set_max_delay(RECONNECT_MAX_DELAY_MS)
            .set_connection_timeout(REDIS_TIMEOUT)
            .set_response_timeout(REDIS_TIMEOUT);
        let conn = ConnectionManager::new_with_config(client, config)
            .await
            .map_err(backend)?;
        info!("Connected to redis member store");

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, channel: &str) -> String {
        members_key(&self.key_prefix, channel)
    }
}

fn members_key(key_prefix: &str, channel: &str) -> String {
    format!("{key_prefix}{channel}:members")
}

#[async_trait]
impl MemberStore for RedisMemberStore {
    async fn get(&self, channel: &str) -> Result<Vec<Member>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key(channel)).await.map_err(backend)?;

        match raw {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn set(&self, channel: &str, members: &[Member]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(channel);

        if members.is_empty() {
            conn.del::<_, ()>(key).await.map_err(backend)?;
        } else {
            let raw = serde_json::to_string(members)?;
            conn.set::<_, _, ()>(key, raw).await.map_err(backend)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_members_key() {
        assert_eq!(members_key("", "presence-room"), "presence-room:members");
        assert_eq!(
            members_key("laravel_database_", "presence-room"),
            "laravel_database_presence-room:members"
        );
    }

    #[test]
    fn test_stored_format() {
        let members = vec![Member::new(json!(7), json!({ "name": "Ada" }), "c_1")];
        let raw = serde_json::to_string(&members).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&raw).unwrap(),
            json!([{ "user_id": 7, "user_info": { "name": "Ada" }, "socket_id": "c_1" }])
        );
    }

    #[tokio::test]
    async fn test_unreachable_redis_fails_fast() {
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            RedisMemberStore::connect("redis://127.0.0.1:1", ""),
        )
        .await
        .expect("connect should give up within a second");
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = RedisMemberStore::connect("not a url", "").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
