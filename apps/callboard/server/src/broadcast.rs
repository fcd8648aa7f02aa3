//! Broadcast groups: named fan-out channels between the poller and every
//! connected session.
//!
//! [`GroupHub`] is the in-process layer. Sessions join through it and get a
//! [`Membership`] guard that leaves the group when dropped. Publishers sit in
//! front of the hub: [`LocalPublisher`] writes straight into it, while
//! [`RedisPublisher`] publishes on a Redis channel that a [`GroupRelay`] in
//! every server process copies back into its own hub.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use callboard_core::BroadcastEvent;
use futures_util::StreamExt;
use metrics::counter;
use parking_lot::RwLock;
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_GROUP_CAPACITY: usize = 16;
pub const DEFAULT_CHANNEL_PREFIX: &str = "callboard:group";

const RELAY_BACKOFF_MIN: Duration = Duration::from_millis(500);
const RELAY_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("broadcast layer unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("failed to encode broadcast event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An event with its wire encoding. Sessions forward `text` untouched.
#[derive(Debug)]
pub struct GroupMessage {
    pub event: BroadcastEvent,
    pub text: String,
}

impl GroupMessage {
    pub fn encode(event: BroadcastEvent) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string(&event)?;
        Ok(Self { event, text })
    }

    pub fn decode(text: String) -> Result<Self, serde_json::Error> {
        let event = serde_json::from_str(&text)?;
        Ok(Self { event, text })
    }
}

struct Group {
    sender: broadcast::Sender<Arc<GroupMessage>>,
    members: HashSet<Uuid>,
}

#[derive(Clone)]
pub struct GroupHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    groups: RwLock<HashMap<String, Group>>,
    capacity: usize,
}

impl GroupHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                groups: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Adds `session_id` to `group`. Only events published after this call
    /// returns are delivered.
    pub fn join(&self, group: &str, session_id: Uuid) -> Membership {
        let mut groups = self.inner.groups.write();
        let entry = groups.entry(group.to_string()).or_insert_with(|| Group {
            sender: broadcast::channel(self.inner.capacity).0,
            members: HashSet::new(),
        });
        entry.members.insert(session_id);
        let receiver = entry.sender.subscribe();
        debug!(group, session_id = %session_id, members = entry.members.len(), "session joined group");

        Membership {
            hub: self.clone(),
            group: group.to_string(),
            session_id,
            receiver,
        }
    }

    fn leave(&self, group: &str, session_id: Uuid) {
        let mut groups = self.inner.groups.write();
        let now_empty = match groups.get_mut(group) {
            Some(entry) => {
                entry.members.remove(&session_id);
                entry.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            groups.remove(group);
        }
        debug!(group, session_id = %session_id, "session left group");
    }

    /// Delivers `message` to the current members of `group` and returns how
    /// many were reached.
    pub fn publish(&self, group: &str, message: Arc<GroupMessage>) -> usize {
        let groups = self.inner.groups.read();
        let Some(entry) = groups.get(group) else {
            return 0;
        };
        entry.sender.send(message).unwrap_or(0)
    }

    pub fn members(&self, group: &str) -> Vec<Uuid> {
        let groups = self.inner.groups.read();
        let mut members: Vec<Uuid> = groups
            .get(group)
            .map(|entry| entry.members.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub fn member_count(&self, group: &str) -> usize {
        self.inner
            .groups
            .read()
            .get(group)
            .map(|entry| entry.members.len())
            .unwrap_or(0)
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.groups.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A session's seat in a group. Dropping it removes the session from the
/// group, so membership cannot outlive the connection handler.
pub struct Membership {
    hub: GroupHub,
    group: String,
    session_id: Uuid,
    receiver: broadcast::Receiver<Arc<GroupMessage>>,
}

impl Membership {
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next event for this member. A member that fell behind skips to the
    /// oldest event still buffered.
    pub async fn recv(&mut self) -> Option<Arc<GroupMessage>> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    counter!("callboard_group_lagged_events_total").increment(skipped);
                    warn!(
                        group = %self.group,
                        session_id = %self.session_id,
                        skipped,
                        "session fell behind; skipping stale updates"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.hub.leave(&self.group, self.session_id);
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes `event` to `group`. The returned count is the number of
    /// receivers reached as far as this layer can tell: sessions for the
    /// local hub, subscribed server processes for Redis.
    async fn publish(&self, group: &str, event: BroadcastEvent) -> Result<usize, BroadcastError>;

    fn backend(&self) -> &'static str;
}

/// Single-process fan-out straight into the hub.
#[derive(Clone)]
pub struct LocalPublisher {
    hub: GroupHub,
}

impl LocalPublisher {
    pub fn new(hub: GroupHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventPublisher for LocalPublisher {
    async fn publish(&self, group: &str, event: BroadcastEvent) -> Result<usize, BroadcastError> {
        let message = Arc::new(GroupMessage::encode(event)?);
        Ok(self.hub.publish(group, message))
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

pub fn channel_name(prefix: &str, group: &str) -> String {
    format!("{prefix}:{group}")
}

/// Cross-process fan-out through Redis pub/sub.
#[derive(Clone)]
pub struct RedisPublisher {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisPublisher {
    pub fn new(redis: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl EventPublisher for RedisPublisher {
    async fn publish(&self, group: &str, event: BroadcastEvent) -> Result<usize, BroadcastError> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.redis.clone();
        let subscribers: i64 = conn
            .publish(channel_name(&self.prefix, group), payload)
            .await?;
        Ok(subscribers.max(0) as usize)
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Copies events from the Redis channels of `groups` into the local hub.
pub struct GroupRelay {
    client: redis::Client,
    hub: GroupHub,
    prefix: String,
    groups: Vec<String>,
}

impl GroupRelay {
    pub fn new(
        client: redis::Client,
        hub: GroupHub,
        prefix: impl Into<String>,
        groups: Vec<String>,
    ) -> Self {
        Self {
            client,
            hub,
            prefix: prefix.into(),
            groups,
        }
    }

    /// Runs until `cancel` fires, resubscribing with backoff whenever the
    /// pub/sub connection drops.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = RELAY_BACKOFF_MIN;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.pump(&mut backoff) => result,
            };
            match result {
                Ok(()) => warn!("group relay subscription ended; resubscribing"),
                Err(err) => warn!(error = %err, "group relay lost redis; resubscribing"),
            }
            counter!("callboard_group_relay_reconnects_total").increment(1);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RELAY_BACKOFF_MAX);
        }
        info!("group relay stopped");
    }

    async fn pump(&self, backoff: &mut Duration) -> Result<(), BroadcastError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for group in &self.groups {
            pubsub.subscribe(channel_name(&self.prefix, group)).await?;
        }
        *backoff = RELAY_BACKOFF_MIN;
        info!(groups = ?self.groups, prefix = %self.prefix, "group relay subscribed");

        let channel_prefix = format!("{}:", self.prefix);
        let mut messages = pubsub.on_message();
        while let Some(msg) = messages.next().await {
            let channel = msg.get_channel_name().to_string();
            let Some(group) = channel.strip_prefix(&channel_prefix) else {
                continue;
            };
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%channel, error = %err, "dropping non-text group payload");
                    continue;
                }
            };
            match GroupMessage::decode(payload) {
                Ok(message) => {
                    let delivered = self.hub.publish(group, Arc::new(message));
                    debug!(group, delivered, "relayed group event");
                }
                Err(err) => warn!(%channel, error = %err, "dropping undecodable group event"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callboard_core::{normalize_dataset, Dataset, Snapshot};
    use serde_json::json;

    fn event(id: i64) -> BroadcastEvent {
        let calls = normalize_dataset(Dataset::CallsOnHold, json!([{ "id": id }])).unwrap();
        BroadcastEvent::data_update(Snapshot::new(calls, Vec::new()))
    }

    #[test_timeout::tokio_timeout_test]
    async fn members_receive_in_publish_order() {
        let hub = GroupHub::new(DEFAULT_GROUP_CAPACITY);
        let publisher = LocalPublisher::new(hub.clone());
        let mut a = hub.join("calls", Uuid::new_v4());
        let mut b = hub.join("calls", Uuid::new_v4());

        for id in 1..=3 {
            assert_eq!(publisher.publish("calls", event(id)).await.unwrap(), 2);
        }

        for member in [&mut a, &mut b] {
            for id in 1..=3 {
                let message = member.recv().await.unwrap();
                assert_eq!(message.event, event(id));
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn late_joiners_get_no_replay() {
        let hub = GroupHub::new(DEFAULT_GROUP_CAPACITY);
        let publisher = LocalPublisher::new(hub.clone());
        let _early = hub.join("calls", Uuid::new_v4());
        publisher.publish("calls", event(1)).await.unwrap();

        let mut late = hub.join("calls", Uuid::new_v4());
        publisher.publish("calls", event(2)).await.unwrap();
        assert_eq!(late.recv().await.unwrap().event, event(2));
    }

    #[test_timeout::tokio_timeout_test]
    async fn publishing_to_an_empty_group_reaches_nobody() {
        let hub = GroupHub::new(DEFAULT_GROUP_CAPACITY);
        let publisher = LocalPublisher::new(hub.clone());
        assert_eq!(publisher.publish("calls", event(1)).await.unwrap(), 0);
    }

    #[test_timeout::timeout]
    fn dropping_the_membership_leaves_the_group() {
        let hub = GroupHub::new(DEFAULT_GROUP_CAPACITY);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let a = hub.join("calls", first);
        let b = hub.join("calls", second);
        assert_eq!(hub.member_count("calls"), 2);

        drop(a);
        assert_eq!(hub.members("calls"), vec![second]);
        drop(b);
        assert_eq!(hub.member_count("calls"), 0);
        assert!(hub.groups().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn lagging_member_skips_ahead() {
        let hub = GroupHub::new(2);
        let publisher = LocalPublisher::new(hub.clone());
        let mut slow = hub.join("calls", Uuid::new_v4());
        for id in 1..=5 {
            publisher.publish("calls", event(id)).await.unwrap();
        }
        assert_eq!(slow.recv().await.unwrap().event, event(4));
        assert_eq!(slow.recv().await.unwrap().event, event(5));
    }

    #[test_timeout::timeout]
    fn group_messages_keep_the_wire_text() {
        let message = GroupMessage::encode(event(7)).unwrap();
        let decoded = GroupMessage::decode(message.text.clone()).unwrap();
        assert_eq!(decoded.event, event(7));
        assert!(GroupMessage::decode("{\"type\":\"heartbeat\"}".into()).is_err());
        assert_eq!(channel_name("callboard:group", "calls"), "callboard:group:calls");
    }
}
