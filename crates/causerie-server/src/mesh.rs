//! Cross-instance bus links.
//!
//! Horizontally scaled instances form a mesh: every instance dials the
//! `BUS_PEERS` URLs (each peer's `/bus` endpoint) and forwards its locally
//! published frames over those links; the accepting side re-publishes them
//! to its own sessions. Presence gossips the same way, with a periodic
//! full sync as the safety net.
//!
//! A dropped link reconnects with exponential backoff capped at two
//! seconds. Peers being down never aborts startup; the instance simply
//! runs in single-node mode until links come up, and the bus re-syncs
//! presence on reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsInbound, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsOutbound};

use causerie_shared::events::ServerEvent;

use crate::bus::Bus;

const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(2);

/// Frames exchanged between instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusFrame {
    /// First frame on every link; names the dialing node.
    Hello { node_id: String },

    /// Full presence snapshot (scope → online users). Sent on connect and
    /// on a heartbeat; replaces the receiver's view of the sender.
    PresenceSync {
        node_id: String,
        online: HashMap<String, Vec<String>>,
    },

    /// Incremental presence change.
    PresenceOnline {
        scope: String,
        user_id: String,
        at_ms: i64,
    },
    PresenceOffline {
        scope: String,
        user_id: String,
        at_ms: i64,
    },

    /// A topic event published on the sending node.
    Publish { topic: String, event: ServerEvent },
}

/// Dial every configured peer; each link runs its own reconnect loop.
pub fn start(bus: Arc<Bus>, peer_urls: Vec<String>, heartbeat_secs: u64) {
    if peer_urls.is_empty() {
        tracing::info!("no bus peers configured; running in single-node mode");
        return;
    }

    for peer_url in &peer_urls {
        let bus = bus.clone();
        let url = peer_url.clone();
        tokio::spawn(async move {
            peer_connection_loop(bus, url).await;
        });
    }

    // Periodic full presence sync over every live link.
    let heartbeat_bus = bus.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(heartbeat_secs));
        loop {
            interval.tick().await;
            heartbeat_bus.forward(BusFrame::PresenceSync {
                node_id: heartbeat_bus.node_id.clone(),
                online: heartbeat_bus.local_online_snapshot(),
            });
        }
    });

    tracing::info!(peer_count = peer_urls.len(), "bus mesh started");
}

/// Persistent connection loop for a single peer. Reconnects with
/// exponential backoff, capped at two seconds.
async fn peer_connection_loop(bus: Arc<Bus>, peer_url: String) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        tracing::debug!(peer = peer_url.as_str(), "connecting to bus peer");

        match connect_to_peer(&bus, &peer_url).await {
            Ok(()) => {
                tracing::info!(peer = peer_url.as_str(), "bus peer link closed");
                backoff = BACKOFF_INITIAL;
            }
            Err(e) => {
                tracing::warn!(peer = peer_url.as_str(), error = %e, "bus peer link failed");
            }
        }

        bus.unregister_peer(&peer_url);
        if bus.single_node() {
            tracing::warn!("all bus peers down; degraded to single-node mode");
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

async fn connect_to_peer(
    bus: &Arc<Bus>,
    peer_url: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _) = connect_async(peer_url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<BusFrame>();

    // Announce ourselves and hand the peer our current presence.
    let hello = serde_json::to_string(&BusFrame::Hello {
        node_id: bus.node_id.clone(),
    })?;
    ws_sender.send(WsOutbound::Text(hello.into())).await?;
    let sync = serde_json::to_string(&BusFrame::PresenceSync {
        node_id: bus.node_id.clone(),
        online: bus.local_online_snapshot(),
    })?;
    ws_sender.send(WsOutbound::Text(sync.into())).await?;

    bus.register_peer(peer_url, tx);
    tracing::info!(peer = peer_url, "bus peer link established");

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if ws_sender.send(WsOutbound::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize bus frame");
                }
            }
        }
    });

    // The dialed direction only carries our frames out; anything the peer
    // says back (beyond protocol-level pings) is unexpected.
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsOutbound::Close(_)) => break,
            Ok(WsOutbound::Ping(_)) | Ok(WsOutbound::Pong(_)) => {}
            Ok(other) => {
                tracing::debug!(peer = peer_url, frame = ?other, "ignoring frame on outbound bus link");
            }
            Err(e) => {
                tracing::warn!(peer = peer_url, error = %e, "bus link error");
                break;
            }
        }
    }

    sender_task.abort();
    Ok(())
}

/// Accept side of a mesh link: consume frames from a dialing peer and
/// apply them to the local bus.
pub async fn handle_peer(socket: WebSocket, bus: Arc<Bus>) {
    let (_sender, mut receiver) = socket.split();
    let mut node_id: Option<String> = None;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(WsInbound::Text(text)) => match serde_json::from_str::<BusFrame>(&text) {
                Ok(BusFrame::Hello { node_id: id }) => {
                    tracing::info!(node = id.as_str(), "bus peer identified");
                    node_id = Some(id);
                }
                Ok(frame) => {
                    let Some(ref id) = node_id else {
                        tracing::warn!("bus frame before hello; dropping link");
                        break;
                    };
                    bus.apply_remote(id, frame);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable bus frame");
                }
            },
            Ok(WsInbound::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "bus peer socket error");
                break;
            }
        }
    }

    if let Some(id) = node_id {
        bus.drop_remote(&id);
        tracing::info!(node = id.as_str(), "bus peer disconnected; presence dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_as_tagged_json() {
        let frames = vec![
            BusFrame::Hello {
                node_id: "n1".into(),
            },
            BusFrame::PresenceSync {
                node_id: "n1".into(),
                online: HashMap::from([("t1".to_string(), vec!["u1".to_string()])]),
            },
            BusFrame::PresenceOnline {
                scope: "t1".into(),
                user_id: "u1".into(),
                at_ms: 42,
            },
            BusFrame::PresenceOffline {
                scope: "global".into(),
                user_id: "u2".into(),
                at_ms: 43,
            },
            BusFrame::Publish {
                topic: "user:u1".into(),
                event: ServerEvent::PresenceList {
                    tenant_id: Some("t1".into()),
                    online_users: vec!["u1".into()],
                },
            },
        ];

        for frame in frames {
            let json = serde_json::to_string(&frame).unwrap();
            let parsed: BusFrame = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2, "round-trip failed for {json}");
        }
    }

    #[test]
    fn hello_uses_snake_case_tag() {
        let json = serde_json::to_string(&BusFrame::Hello {
            node_id: "n1".into(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"hello\""));

        let publish = serde_json::to_string(&BusFrame::Publish {
            topic: "tenant:t1".into(),
            event: ServerEvent::PresenceOnline {
                user_id: "u1".into(),
                tenant_id: Some("t1".into()),
            },
        })
        .unwrap();
        assert!(publish.contains("\"type\":\"publish\""));
        // The inner event keeps its own wire name.
        assert!(publish.contains("\"type\":\"presence:online\""));
    }
}
