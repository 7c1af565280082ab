//! The shared bus: topic fanout plus the ephemeral presence/typing state.
//!
//! Topics (`user:{id}`, `tenant:{id}`, `conversation:{id}`) carry
//! [`ServerEvent`]s to every locally subscribed session over per-session
//! unbounded channels, preserving publisher order per topic. The same
//! struct holds the bus's key-value side: per-scope online sets, last-seen
//! timestamps, and typing hashes with field timestamps and coarse key
//! expiry.
//!
//! Cross-node delivery is an overlay: every locally published frame is
//! forwarded to connected mesh peers (see [`crate::mesh`]) and frames
//! arriving from peers are re-published locally only, so nothing loops.
//! With no peers connected the bus degrades to single-node mode with
//! identical local semantics.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use causerie_shared::constants::{GLOBAL_SCOPE, TYPING_KEY_TTL_MS, TYPING_STALE_MS};
use causerie_shared::events::ServerEvent;

use crate::mesh::BusFrame;

/// Sender half of one connected session's event queue.
pub type SessionSender = mpsc::UnboundedSender<ServerEvent>;

struct TypingKey {
    fields: HashMap<String, i64>,
    touched_ms: i64,
}

pub struct Bus {
    pub node_id: String,

    /// topic → (connection id → session sender).
    topics: DashMap<String, HashMap<u64, SessionSender>>,

    /// Presence scope (`tenant id` or `global`) → locally online users.
    online: DashMap<String, HashSet<String>>,

    /// user id → last-seen millisecond timestamp.
    last_seen: DashMap<String, i64>,

    /// `typing:{conversation}` state: user → last keystroke ms.
    typing: DashMap<Uuid, TypingKey>,

    /// Outbound mesh links, keyed by peer URL.
    peer_senders: DashMap<String, mpsc::UnboundedSender<BusFrame>>,

    /// Presence reported by mesh peers: node id → scope → users.
    remote_online: DashMap<String, HashMap<String, HashSet<String>>>,
}

impl Bus {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            topics: DashMap::new(),
            online: DashMap::new(),
            last_seen: DashMap::new(),
            typing: DashMap::new(),
            peer_senders: DashMap::new(),
            remote_online: DashMap::new(),
        }
    }

    // -- topics --------------------------------------------------------

    pub fn subscribe(&self, topic: &str, conn_id: u64, sender: SessionSender) {
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(conn_id, sender);
    }

    pub fn unsubscribe(&self, topic: &str, conn_id: u64) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.topics.remove_if(topic, |_, subs| subs.is_empty());
            }
        }
    }

    /// Deliver an event to every local subscriber of a topic (optionally
    /// excluding the originating connection) and forward it to mesh peers.
    pub fn publish(&self, topic: &str, event: &ServerEvent, exclude_conn: Option<u64>) {
        self.deliver_local(topic, event, exclude_conn);
        if !self.peer_senders.is_empty() {
            self.forward(BusFrame::Publish {
                topic: topic.to_string(),
                event: event.clone(),
            });
        }
    }

    fn deliver_local(&self, topic: &str, event: &ServerEvent, exclude_conn: Option<u64>) {
        let Some(subscribers) = self.topics.get(topic) else {
            return;
        };
        for (conn_id, sender) in subscribers.iter() {
            if Some(*conn_id) == exclude_conn {
                continue;
            }
            // A dead receiver just means the session is tearing down.
            let _ = sender.send(event.clone());
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    // -- sets (presence) -----------------------------------------------

    pub fn scope_of(tenant_id: Option<&str>) -> String {
        tenant_id.unwrap_or(GLOBAL_SCOPE).to_string()
    }

    pub fn set_add(&self, scope: &str, user_id: &str) {
        self.online
            .entry(scope.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    pub fn set_remove(&self, scope: &str, user_id: &str) {
        if let Some(mut members) = self.online.get_mut(scope) {
            members.remove(user_id);
        }
    }

    pub fn set_contains(&self, scope: &str, user_id: &str) -> bool {
        if self
            .online
            .get(scope)
            .map(|m| m.contains(user_id))
            .unwrap_or(false)
        {
            return true;
        }
        self.remote_online.iter().any(|peer| {
            peer.value()
                .get(scope)
                .map(|m| m.contains(user_id))
                .unwrap_or(false)
        })
    }

    pub fn set_members(&self, scope: &str) -> Vec<String> {
        let mut members: HashSet<String> = self
            .online
            .get(scope)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        for peer in self.remote_online.iter() {
            if let Some(remote) = peer.value().get(scope) {
                members.extend(remote.iter().cloned());
            }
        }
        let mut members: Vec<String> = members.into_iter().collect();
        members.sort();
        members
    }

    /// Snapshot of the local online sets, for mesh presence sync.
    pub fn local_online_snapshot(&self) -> HashMap<String, Vec<String>> {
        self.online
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    // -- last-seen ------------------------------------------------------

    pub fn touch_last_seen(&self, user_id: &str, at_ms: i64) {
        self.last_seen.insert(user_id.to_string(), at_ms);
    }

    pub fn last_seen(&self, user_id: &str) -> Option<i64> {
        self.last_seen.get(user_id).map(|v| *v)
    }

    // -- typing hashes --------------------------------------------------

    pub fn typing_put(&self, conversation_id: Uuid, user_id: &str, at_ms: i64) {
        let mut key = self.typing.entry(conversation_id).or_insert(TypingKey {
            fields: HashMap::new(),
            touched_ms: at_ms,
        });
        key.touched_ms = at_ms;
        key.fields.insert(user_id.to_string(), at_ms);
    }

    pub fn typing_remove(&self, conversation_id: Uuid, user_id: &str) {
        if let Some(mut key) = self.typing.get_mut(&conversation_id) {
            key.fields.remove(user_id);
        }
    }

    /// Users whose last keystroke is fresher than the 5 s staleness bound.
    pub fn typing_members(&self, conversation_id: Uuid, now_ms: i64) -> Vec<String> {
        let Some(key) = self.typing.get(&conversation_id) else {
            return Vec::new();
        };
        let mut users: Vec<String> = key
            .fields
            .iter()
            .filter(|(_, at)| now_ms - **at < TYPING_STALE_MS)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Drop typing keys that have not been touched inside the key TTL.
    pub fn purge_typing(&self, now_ms: i64) -> usize {
        let before = self.typing.len();
        self.typing
            .retain(|_, key| now_ms - key.touched_ms < TYPING_KEY_TTL_MS);
        before - self.typing.len()
    }

    // -- mesh -----------------------------------------------------------

    pub fn register_peer(&self, peer_url: &str, sender: mpsc::UnboundedSender<BusFrame>) {
        self.peer_senders.insert(peer_url.to_string(), sender);
    }

    pub fn unregister_peer(&self, peer_url: &str) {
        self.peer_senders.remove(peer_url);
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peer_senders.len()
    }

    pub fn single_node(&self) -> bool {
        self.peer_senders.is_empty()
    }

    /// Push a frame to every connected peer. Best effort: a dropped link
    /// is cleaned up by its connection loop.
    pub fn forward(&self, frame: BusFrame) {
        if self.peer_senders.is_empty() {
            return;
        }
        for sender in self.peer_senders.iter() {
            let _ = sender.send(frame.clone());
        }
    }

    /// Apply a frame received from a mesh peer. Events are re-published to
    /// local subscribers only -- never forwarded again.
    pub fn apply_remote(&self, node_id: &str, frame: BusFrame) {
        match frame {
            BusFrame::Hello { .. } => {}
            BusFrame::Publish { topic, event } => {
                // Typing flows through published events; mirror it into the
                // local hash so typing queries agree across nodes.
                if let ServerEvent::TypingUpdate {
                    ref user_id,
                    conversation_id,
                    is_typing,
                } = event
                {
                    if is_typing {
                        self.typing_put(conversation_id, user_id, Utc::now().timestamp_millis());
                    } else {
                        self.typing_remove(conversation_id, user_id);
                    }
                }
                self.deliver_local(&topic, &event, None);
            }
            BusFrame::PresenceOnline {
                scope,
                user_id,
                at_ms,
            } => {
                self.remote_online
                    .entry(node_id.to_string())
                    .or_default()
                    .entry(scope)
                    .or_default()
                    .insert(user_id.clone());
                self.touch_last_seen(&user_id, at_ms);
            }
            BusFrame::PresenceOffline {
                scope,
                user_id,
                at_ms,
            } => {
                if let Some(mut scopes) = self.remote_online.get_mut(node_id) {
                    if let Some(members) = scopes.get_mut(&scope) {
                        members.remove(&user_id);
                    }
                }
                self.touch_last_seen(&user_id, at_ms);
            }
            BusFrame::PresenceSync { online, .. } => {
                let replacement: HashMap<String, HashSet<String>> = online
                    .into_iter()
                    .map(|(scope, users)| (scope, users.into_iter().collect()))
                    .collect();
                self.remote_online.insert(node_id.to_string(), replacement);
            }
        }
    }

    /// Forget everything a departed peer reported.
    pub fn drop_remote(&self, node_id: &str) {
        self.remote_online.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(user: &str) -> ServerEvent {
        ServerEvent::PresenceOnline {
            user_id: user.to_string(),
            tenant_id: None,
        }
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_in_order() {
        let bus = Bus::new("n1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("tenant:t1", 1, tx);

        bus.publish("tenant:t1", &event("a"), None);
        bus.publish("tenant:t1", &event("b"), None);
        bus.publish("tenant:t1", &event("c"), None);

        for expected in ["a", "b", "c"] {
            match rx.recv().await.unwrap() {
                ServerEvent::PresenceOnline { user_id, .. } => assert_eq!(user_id, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn exclusion_skips_the_origin_connection() {
        let bus = Bus::new("n1");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        bus.subscribe("conversation:x", 1, tx1);
        bus.subscribe("conversation:x", 2, tx2);

        bus.publish("conversation:x", &event("a"), Some(1));

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_cleans_topic() {
        let bus = Bus::new("n1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("user:u1", 7, tx);
        assert_eq!(bus.subscriber_count("user:u1"), 1);

        bus.unsubscribe("user:u1", 7);
        assert_eq!(bus.subscriber_count("user:u1"), 0);

        bus.publish("user:u1", &event("a"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sets_union_local_and_remote() {
        let bus = Bus::new("n1");
        bus.set_add("t1", "u1");
        bus.apply_remote(
            "n2",
            BusFrame::PresenceOnline {
                scope: "t1".into(),
                user_id: "u2".into(),
                at_ms: 123,
            },
        );

        assert!(bus.set_contains("t1", "u1"));
        assert!(bus.set_contains("t1", "u2"));
        assert_eq!(bus.set_members("t1"), vec!["u1", "u2"]);
        assert_eq!(bus.last_seen("u2"), Some(123));

        bus.drop_remote("n2");
        assert!(!bus.set_contains("t1", "u2"));
    }

    #[test]
    fn presence_sync_replaces_peer_view() {
        let bus = Bus::new("n1");
        bus.apply_remote(
            "n2",
            BusFrame::PresenceOnline {
                scope: "t1".into(),
                user_id: "old".into(),
                at_ms: 1,
            },
        );

        let mut online = HashMap::new();
        online.insert("t1".to_string(), vec!["fresh".to_string()]);
        bus.apply_remote(
            "n2",
            BusFrame::PresenceSync {
                node_id: "n2".into(),
                online,
            },
        );

        assert!(!bus.set_contains("t1", "old"));
        assert!(bus.set_contains("t1", "fresh"));
    }

    #[test]
    fn typing_staleness_and_key_ttl() {
        let bus = Bus::new("n1");
        let conv = Uuid::new_v4();
        let now = Utc::now().timestamp_millis();

        bus.typing_put(conv, "u1", now);
        bus.typing_put(conv, "u2", now - TYPING_STALE_MS - 1);

        assert_eq!(bus.typing_members(conv, now), vec!["u1"]);

        bus.typing_remove(conv, "u1");
        assert!(bus.typing_members(conv, now).is_empty());

        // Key-level TTL.
        bus.typing_put(conv, "u1", now);
        assert_eq!(bus.purge_typing(now + TYPING_KEY_TTL_MS + 1), 1);
        assert!(bus.typing_members(conv, now + TYPING_KEY_TTL_MS + 1).is_empty());
    }

    #[test]
    fn remote_typing_update_mirrors_into_hash() {
        let bus = Bus::new("n1");
        let conv = Uuid::new_v4();

        bus.apply_remote(
            "n2",
            BusFrame::Publish {
                topic: format!("conversation:{conv}"),
                event: ServerEvent::TypingUpdate {
                    user_id: "u9".into(),
                    conversation_id: conv,
                    is_typing: true,
                },
            },
        );

        let now = Utc::now().timestamp_millis();
        assert_eq!(bus.typing_members(conv, now), vec!["u9"]);
    }
}
