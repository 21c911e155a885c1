//! Presence tracking for Herald.
//!
//! The directory keeps one member list per presence channel in a
//! [`MemberStore`] and reconciles it against the connections the transport
//! reports alive. Every operation on a channel runs under that channel's
//! lock, so read-modify-write cycles never interleave. Different channels
//! proceed in parallel.
//!
//! Notification policy:
//!
//! - the joining connection always receives `presence:subscribed` with the
//!   deduplicated member list;
//! - the rest of the channel receives `presence:joining` only for a user's
//!   first live connection;
//! - the rest of the channel receives `presence:leaving` only when a user's
//!   last live connection leaves.

use crate::member::{presence_view, Member};
use crate::store::{MemberStore, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

/// Sent to the joining connection with the member list.
pub const SUBSCRIBED_EVENT: &str = "presence:subscribed";
/// Sent to the other members when a user comes online.
pub const JOINING_EVENT: &str = "presence:joining";
/// Sent to the other members when a user goes away.
pub const LEAVING_EVENT: &str = "presence:leaving";

/// The transport could not report which connections are live.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Connection introspection failed: {0}")]
    Unavailable(String),
}

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The caller did not supply `user_id` and `user_info`.
    #[error("Member data for presence channel missing")]
    MissingMemberData,

    /// The member list could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A notification payload could not be built.
    #[error("Presence payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Reports which connections are currently attached to a channel.
///
/// A failed query is an error, never an empty set.
#[async_trait]
pub trait ConnectionOracle: Send + Sync {
    async fn connected_ids(&self, channel: &str) -> Result<HashSet<String>, OracleError>;
}

/// Outbound side of presence: where notifications go.
pub trait PresenceNotifier: Send + Sync {
    /// Send to one connection.
    fn emit_to_connection(&self, connection_id: &str, channel: &str, event: &str, data: Value);

    /// Send to everyone on `channel` except `except`.
    fn emit_to_channel_except(&self, channel: &str, except: &str, event: &str, data: Value);
}

/// Holds a channel's lock and drops the lock entry once nobody else wants it.
struct ChannelGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    channel: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(self.channel, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Presence directory over a member store.
pub struct PresenceDirectory {
    store: Arc<dyn MemberStore>,
    oracle: Arc<dyn ConnectionOracle>,
    notifier: Arc<dyn PresenceNotifier>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PresenceDirectory {
    /// Create a new presence directory.
    #[must_use]
    pub fn new(
        store: Arc<dyn MemberStore>,
        oracle: Arc<dyn ConnectionOracle>,
        notifier: Arc<dyn PresenceNotifier>,
    ) -> Self {
        Self {
            store,
            oracle,
            notifier,
            locks: DashMap::new(),
        }
    }

    async fn lock<'a>(&'a self, channel: &'a str) -> ChannelGuard<'a> {
        let lock = self
            .locks
            .entry(channel.to_string())
            .or_default()
            .value()
            .clone();
        ChannelGuard {
            locks: &self.locks,
            channel,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of channels with an operation in progress.
    #[must_use]
    pub fn busy_channels(&self) -> usize {
        self.locks.len()
    }

    /// Prune members whose connection is gone and return the surviving list.
    ///
    /// If the live connections cannot be determined, the stored list is
    /// returned as is and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored list cannot be read.
    pub async fn reconcile(&self, channel: &str) -> Result<Vec<Member>, PresenceError> {
        let _guard = self.lock(channel).await;
        self.reconcile_locked(channel).await
    }

    /// Check whether a user has a live connection on the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored list cannot be read.
    pub async fn is_present(&self, channel: &str, user_id: &Value) -> Result<bool, PresenceError> {
        let _guard = self.lock(channel).await;
        let members = self.reconcile_locked(channel).await?;
        Ok(members.iter().any(|m| &m.user_id == user_id))
    }

    /// The deduplicated member list of a channel, most recent join first.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored list cannot be read.
    pub async fn members(&self, channel: &str) -> Result<Vec<Member>, PresenceError> {
        let _guard = self.lock(channel).await;
        let members = self.reconcile_locked(channel).await?;
        Ok(presence_view(&members))
    }

    /// Add a connection to a presence channel.
    ///
    /// Returns the member list sent to the joining connection.
    ///
    /// # Errors
    ///
    /// Returns [`PresenceError::MissingMemberData`] without touching any state
    /// if the user id or info is missing, and a store error if the new
    /// member could not be saved.
    pub async fn join(
        &self,
        channel: &str,
        connection_id: &str,
        user_id: Option<Value>,
        user_info: Option<Value>,
    ) -> Result<Vec<Member>, PresenceError> {
        let (Some(user_id), Some(user_info)) = (
            user_id.filter(|v| !v.is_null()),
            user_info.filter(|v| !v.is_null()),
        ) else {
            warn!(channel = %channel, connection = %connection_id, "Unable to join channel. Member data for presence channel missing");
            return Err(PresenceError::MissingMemberData);
        };

        let _guard = self.lock(channel).await;

        let mut members = self.reconcile_locked(channel).await?;
        let was_present = members.iter().any(|m| m.user_id == user_id);

        let member = Member::new(user_id, user_info, connection_id);
        members.push(member.clone());
        self.store.set(channel, &members).await?;

        let view = presence_view(&members);
        self.notifier.emit_to_connection(
            connection_id,
            channel,
            SUBSCRIBED_EVENT,
            serde_json::to_value(&view)?,
        );

        if !was_present {
            self.notifier.emit_to_channel_except(
                channel,
                connection_id,
                JOINING_EVENT,
                serde_json::to_value(&member)?,
            );
        }

        debug!(
            channel = %channel,
            connection = %connection_id,
            first_connection = !was_present,
            members = view.len(),
            "Presence: member joined"
        );

        Ok(view)
    }

    /// Remove a connection from a presence channel.
    ///
    /// Returns the removed member, or `None` if the connection was not on
    /// the channel.
    ///
    /// # Errors
    ///
    /// Returns a store error if the list could not be read or written.
    pub async fn leave(
        &self,
        channel: &str,
        connection_id: &str,
    ) -> Result<Option<Member>, PresenceError> {
        let _guard = self.lock(channel).await;

        let mut members = self.store.get(channel).await?;
        let Some(position) = members
            .iter()
            .position(|m| m.connection_id == connection_id)
        else {
            debug!(channel = %channel, connection = %connection_id, "Presence: leave for unknown connection");
            return Ok(None);
        };

        let member = members.remove(position);
        self.store.set(channel, &members).await?;

        let remaining = self.prune(channel, members).await;
        let still_present = remaining.iter().any(|m| m.user_id == member.user_id);

        if !still_present {
            self.notifier.emit_to_channel_except(
                channel,
                connection_id,
                LEAVING_EVENT,
                serde_json::to_value(member.clone().into_public())?,
            );
        }

        debug!(
            channel = %channel,
            connection = %connection_id,
            last_connection = !still_present,
            "Presence: member left"
        );

        Ok(Some(member))
    }

    async fn reconcile_locked(&self, channel: &str) -> Result<Vec<Member>, PresenceError> {
        let members = self.store.get(channel).await?;
        Ok(self.prune(channel, members).await)
    }

    /// Drop members whose connection is not live and persist the result.
    async fn prune(&self, channel: &str, members: Vec<Member>) -> Vec<Member> {
        let live = match self.oracle.connected_ids(channel).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Skipping presence reconciliation");
                return members;
            }
        };

        let before = members.len();
        let members: Vec<Member> = members
            .into_iter()
            .filter(|m| live.contains(&m.connection_id))
            .collect();

        if members.len() != before {
            debug!(channel = %channel, pruned = before - members.len(), "Presence: pruned stale members");
            if let Err(e) = self.store.set(channel, &members).await {
                warn!(channel = %channel, error = %e, "Failed to persist reconciled members");
            }
        }

        members
    }
}
