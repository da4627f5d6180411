//! Real-time fan-out over WebSocket.
//!
//! Clients connect at `/ws?token=...`, manage a per-connection subscription
//! set (`all`, `workspace:<id>`, `session:<id>`), and receive every event
//! and session.update that matches at least one subscription. Fan-out is
//! best-effort: a dead or slow connection never stalls the others.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use dashmap::DashMap;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use super::http::AppState;
use crate::core::event::Event;
use crate::core::lifecycle::Lifecycle;

/// Close code for a failed token check.
const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Close code sent to every connection on shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;

/// Keepalive tunables.
#[derive(Debug, Clone, Copy)]
pub struct WsConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// One subscription scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subscription {
    All,
    Workspace(String),
    Session(String),
}

impl Subscription {
    /// Canonical string form, used in ack messages.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::All => "all".to_owned(),
            Self::Workspace(id) => format!("workspace:{id}"),
            Self::Session(id) => format!("session:{id}"),
        }
    }

    /// Whether a broadcast with these ids matches this subscription.
    #[must_use]
    pub fn matches(&self, workspace_id: Option<&str>, session_id: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Workspace(id) => workspace_id == Some(id.as_str()),
            Self::Session(id) => session_id == Some(id.as_str()),
        }
    }
}

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        workspace_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Unsubscribe {
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        workspace_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Pong,
}

/// Per-session statistics attached to session.update broadcasts.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_messages: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_estimate_usd: Option<f64>,
}

/// Messages the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "event")]
    Event { event: Event },
    #[serde(rename = "session.update")]
    SessionUpdate {
        session_id: String,
        workspace_id: String,
        lifecycle: Lifecycle,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<SessionStats>,
    },
    #[serde(rename = "subscribed")]
    Subscribed { subscription: String },
    #[serde(rename = "unsubscribed")]
    Unsubscribed { subscription: String },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    fn to_ws_message(&self) -> Message {
        // Serializing our own enum cannot fail.
        let text = serde_json::to_string(self).unwrap_or_default();
        Message::Text(text.into())
    }
}

struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Message>,
    subscriptions: Mutex<HashSet<Subscription>>,
}

/// Connection registry and fan-out hub. Mutated from the accept path and
/// every per-connection task; sends go through per-connection channels so
/// no socket I/O happens under a map lock.
pub struct Broadcaster {
    connections: DashMap<Uuid, ConnectionHandle>,
    config: WsConfig,
}

impl Broadcaster {
    /// Empty registry.
    #[must_use]
    pub fn new(config: WsConfig) -> Self {
        Self {
            connections: DashMap::new(),
            config,
        }
    }

    /// Number of live connections, for health reporting.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(
            id,
            ConnectionHandle {
                sender,
                subscriptions: Mutex::new(HashSet::new()),
            },
        );
        (id, receiver)
    }

    fn unregister(&self, id: Uuid) {
        self.connections.remove(&id);
    }

    fn send_to(&self, id: Uuid, message: &ServerMessage) {
        if let Some(conn) = self.connections.get(&id) {
            let _ = conn.sender.send(message.to_ws_message());
        }
    }

    fn subscribe(&self, id: Uuid, subscription: Subscription) {
        if let Some(conn) = self.connections.get(&id) {
            if let Ok(mut subs) = conn.subscriptions.lock() {
                subs.insert(subscription);
            }
        }
    }

    /// Remove one subscription, or all of them when `subscription` is None.
    fn unsubscribe(&self, id: Uuid, subscription: Option<&Subscription>) {
        if let Some(conn) = self.connections.get(&id) {
            if let Ok(mut subs) = conn.subscriptions.lock() {
                match subscription {
                    Some(sub) => {
                        subs.remove(sub);
                    }
                    None => subs.clear(),
                }
            }
        }
    }

    /// Fan an event out to every matching connection.
    pub fn broadcast_event(&self, event: &Event) {
        let message = ServerMessage::Event {
            event: event.clone(),
        };
        self.fan_out(
            &message,
            Some(event.workspace_id.as_str()),
            event.session_id.as_deref(),
        );
    }

    /// Fan a session.update out to every matching connection.
    pub fn broadcast_session_update(
        &self,
        session_id: &str,
        workspace_id: &str,
        lifecycle: Lifecycle,
        summary: Option<String>,
        stats: Option<SessionStats>,
    ) {
        let message = ServerMessage::SessionUpdate {
            session_id: session_id.to_owned(),
            workspace_id: workspace_id.to_owned(),
            lifecycle,
            summary,
            stats,
        };
        self.fan_out(&message, Some(workspace_id), Some(session_id));
    }

    fn fan_out(&self, message: &ServerMessage, workspace_id: Option<&str>, session_id: Option<&str>) {
        let ws_message = message.to_ws_message();
        let mut dead = Vec::new();

        for entry in self.connections.iter() {
            let matched = entry
                .value()
                .subscriptions
                .lock()
                .map(|subs| subs.iter().any(|sub| sub.matches(workspace_id, session_id)))
                .unwrap_or(false);
            if !matched {
                continue;
            }
            if entry.value().sender.send(ws_message.clone()).is_err() {
                dead.push(*entry.key());
            }
        }

        // Connections that disappeared mid-broadcast are quietly dropped.
        for id in dead {
            self.connections.remove(&id);
        }
    }

    /// Close every connection with 1001 and clear the registry.
    pub fn shutdown(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().sender.send(Message::Close(Some(CloseFrame {
                code: CLOSE_GOING_AWAY,
                reason: "Server shutting down".into(),
            })));
        }
        self.connections.clear();
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket handler for the `/ws` endpoint.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsAuthParams>,
    State(state): State<AppState>,
) -> Response {
    let authorized = params.token.as_deref() == Some(state.config.api_key.as_str());
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

async fn handle_socket(socket: WebSocket, state: AppState, authorized: bool) {
    let broadcaster = state.broadcaster;
    let config = broadcaster.config;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    if !authorized {
        let _ = ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "Unauthorized".into(),
            })))
            .await;
        return;
    }

    let (client_id, mut outbound) = broadcaster.register();
    tracing::info!(%client_id, "WebSocket client connected");

    let mut ping_timer = tokio::time::interval(config.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_timer.tick().await; // the first tick fires immediately
    let mut awaiting_pong_since: Option<Instant> = None;

    loop {
        let pong_deadline = async move {
            match awaiting_pong_since {
                Some(since) => tokio::time::sleep_until(since + config.pong_timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outgoing = outbound.recv() => {
                let Some(message) = outgoing else { break };
                let closing = matches!(message, Message::Close(_));
                if ws_sender.send(message).await.is_err() {
                    break;
                }
                if closing {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if ws_sender.send(ServerMessage::Ping.to_ws_message()).await.is_err() {
                    break;
                }
                if awaiting_pong_since.is_none() {
                    awaiting_pong_since = Some(Instant::now());
                }
            }
            () = pong_deadline => {
                // Abnormal termination: no close frame for a dead peer.
                tracing::info!(%client_id, "No pong within timeout, terminating connection");
                break;
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_pong_since = None;
                        handle_client_message(&broadcaster, client_id, &text);
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        awaiting_pong_since = None;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    broadcaster.unregister(client_id);
    tracing::info!(%client_id, "WebSocket client disconnected");
}

fn handle_client_message(
    broadcaster: &std::sync::Arc<Broadcaster>,
    client_id: Uuid,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            broadcaster.send_to(
                client_id,
                &ServerMessage::Error {
                    message: format!("unrecognized message: {e}"),
                },
            );
            return;
        }
    };

    match message {
        ClientMessage::Subscribe {
            scope,
            workspace_id,
            session_id,
        } => match resolve_scope(scope.as_deref(), workspace_id, session_id) {
            Ok(Some(subscription)) => {
                broadcaster.subscribe(client_id, subscription.clone());
                broadcaster.send_to(
                    client_id,
                    &ServerMessage::Subscribed {
                        subscription: subscription.canonical(),
                    },
                );
            }
            Ok(None) => {
                // Bare subscribe defaults to everything.
                broadcaster.subscribe(client_id, Subscription::All);
                broadcaster.send_to(
                    client_id,
                    &ServerMessage::Subscribed {
                        subscription: Subscription::All.canonical(),
                    },
                );
            }
            Err(message) => {
                broadcaster.send_to(client_id, &ServerMessage::Error { message });
            }
        },
        ClientMessage::Unsubscribe {
            scope,
            workspace_id,
            session_id,
        } => match resolve_scope(scope.as_deref(), workspace_id, session_id) {
            Ok(Some(subscription)) => {
                broadcaster.unsubscribe(client_id, Some(&subscription));
                broadcaster.send_to(
                    client_id,
                    &ServerMessage::Unsubscribed {
                        subscription: subscription.canonical(),
                    },
                );
            }
            Ok(None) => {
                broadcaster.unsubscribe(client_id, None);
                broadcaster.send_to(
                    client_id,
                    &ServerMessage::Unsubscribed {
                        subscription: "all".to_owned(),
                    },
                );
            }
            Err(message) => {
                broadcaster.send_to(client_id, &ServerMessage::Error { message });
            }
        },
        ClientMessage::Pong => {}
    }
}

/// Resolve the wire scope arguments to a subscription. `Ok(None)` means no
/// scope was given at all.
fn resolve_scope(
    scope: Option<&str>,
    workspace_id: Option<String>,
    session_id: Option<String>,
) -> Result<Option<Subscription>, String> {
    if let Some(id) = workspace_id {
        return Ok(Some(Subscription::Workspace(id)));
    }
    if let Some(id) = session_id {
        return Ok(Some(Subscription::Session(id)));
    }
    match scope {
        None => Ok(None),
        Some("all") => Ok(Some(Subscription::All)),
        Some(s) => {
            if let Some(id) = s.strip_prefix("workspace:") {
                Ok(Some(Subscription::Workspace(id.to_owned())))
            } else if let Some(id) = s.strip_prefix("session:") {
                Ok(Some(Subscription::Session(id.to_owned())))
            } else {
                Err(format!("unknown scope: {s}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_canonical_forms() {
        assert_eq!(Subscription::All.canonical(), "all");
        assert_eq!(
            Subscription::Workspace("w1".to_owned()).canonical(),
            "workspace:w1"
        );
        assert_eq!(
            Subscription::Session("s1".to_owned()).canonical(),
            "session:s1"
        );
    }

    #[test]
    fn test_subscription_matching() {
        let all = Subscription::All;
        let workspace = Subscription::Workspace("w1".to_owned());
        let session = Subscription::Session("s1".to_owned());

        assert!(all.matches(None, None));
        assert!(all.matches(Some("w2"), Some("s2")));

        assert!(workspace.matches(Some("w1"), Some("s1")));
        assert!(workspace.matches(Some("w1"), None));
        assert!(!workspace.matches(Some("w2"), None));
        assert!(!workspace.matches(None, None));

        assert!(session.matches(Some("w1"), Some("s1")));
        assert!(session.matches(None, Some("s1")));
        assert!(!session.matches(Some("w1"), None));
        assert!(!session.matches(Some("w1"), Some("s2")));
    }

    #[test]
    fn test_resolve_scope_accepts_all_forms() {
        assert_eq!(resolve_scope(Some("all"), None, None), Ok(Some(Subscription::All)));
        assert_eq!(
            resolve_scope(Some("workspace:w1"), None, None),
            Ok(Some(Subscription::Workspace("w1".to_owned())))
        );
        assert_eq!(
            resolve_scope(None, None, Some("s1".to_owned())),
            Ok(Some(Subscription::Session("s1".to_owned())))
        );
        assert_eq!(resolve_scope(None, None, None), Ok(None));
        assert!(resolve_scope(Some("bogus"), None, None).is_err());
    }

    #[test]
    fn test_client_message_decoding() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","workspace_id":"w1"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Subscribe { workspace_id: Some(ref id), .. } if id == "w1"
        ));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Pong));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn test_server_message_wire_tags() {
        let json = serde_json::to_string(&ServerMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let json = serde_json::to_string(&ServerMessage::SessionUpdate {
            session_id: "s1".to_owned(),
            workspace_id: "w1".to_owned(),
            lifecycle: Lifecycle::Parsed,
            summary: None,
            stats: Some(SessionStats {
                total_messages: 3,
                cost_estimate_usd: None,
            }),
        })
        .unwrap();
        assert!(json.contains(r#""type":"session.update""#));
        assert!(json.contains(r#""lifecycle":"parsed""#));
        assert!(!json.contains("summary"));
    }

    #[tokio::test]
    async fn test_fan_out_matches_subscriptions_and_drops_dead_connections() {
        let broadcaster = Broadcaster::new(WsConfig::default());
        let (c1, mut rx1) = broadcaster.register();
        let (c2, mut rx2) = broadcaster.register();
        broadcaster.subscribe(c1, Subscription::Workspace("W1".to_owned()));
        broadcaster.subscribe(c2, Subscription::Session("S1".to_owned()));

        let event = Event {
            id: "e1".to_owned(),
            event_type: crate::core::event::EventType::SystemHeartbeat,
            timestamp: chrono::Utc::now(),
            device_id: "d1".to_owned(),
            workspace_id: "W1".to_owned(),
            session_id: Some("S1".to_owned()),
            data: serde_json::json!({}),
            ingested_at: None,
            blob_refs: vec![],
        };
        broadcaster.broadcast_event(&event);
        assert!(rx1.try_recv().is_ok(), "workspace subscriber receives");
        assert!(rx2.try_recv().is_ok(), "session subscriber receives");

        // A non-matching event reaches neither.
        let other = Event {
            workspace_id: "W2".to_owned(),
            session_id: None,
            ..event
        };
        broadcaster.broadcast_event(&other);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        // Dropping a receiver gets the connection reaped on next broadcast.
        drop(rx2);
        broadcaster.broadcast_session_update("S1", "W2", Lifecycle::Parsed, None, None);
        assert_eq!(broadcaster.client_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_clears() {
        let broadcaster = Broadcaster::new(WsConfig::default());
        let (_c1, mut rx1) = broadcaster.register();
        broadcaster.shutdown();
        assert_eq!(broadcaster.client_count(), 0);
        match rx1.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, CLOSE_GOING_AWAY),
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}
