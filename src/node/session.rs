//! The persistent websocket session to one worker node.
//!
//! Mirrors `voice::ws::Connection`'s shape: a single stream owned by one
//! loop, `tokio::select!`'d against a timer, with a `recv` that classifies
//! and swallows protocol noise rather than tearing the connection down.
//! Generalized here from Discord's numeric opcode framing to the worker's
//! string-tagged `op` frames, and from a one-shot connection to one that
//! reconnects itself with backoff.

use super::payload::{self, NodeEvent, NodePayload, PlayerUpdatePayload};
use super::{Node, NodeId};
use crate::events::{Event, EventBus};

use async_tungstenite::tokio::connect_async;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tungstenite::client::IntoClientRequest;
use tungstenite::http::header::{HeaderName, HeaderValue};
use tungstenite::Message;

use tracing::{debug, instrument, warn};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_WARN_THRESHOLD: Duration = Duration::from_millis(500);
const UNHEALTHY_AFTER: Duration = Duration::from_secs(60);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// A payload routed to the per-guild player that owns `guild_id`.
#[derive(Debug)]
pub struct GuildFrame {
    pub node_id: NodeId,
    pub guild_id: String,
    pub payload: GuildPayload,
}

#[derive(Debug)]
pub enum GuildPayload {
    Update(PlayerUpdatePayload),
    Event(NodeEvent),
}

/// Runs the reconnect-forever loop for one node. Intended to be spawned as
/// its own task and to run for the lifetime of the node.
#[instrument(skip(node, events, dispatch), fields(node = %node.id))]
pub async fn run(
    node: Arc<Node>,
    user_id: String,
    events: EventBus,
    dispatch: mpsc::Sender<GuildFrame>,
) {
    loop {
        match connect_once(&node, &user_id, &events, &dispatch).await {
            Ok(()) => debug!("session closed normally"),
            Err(err) => warn!(%err, "session ended with error"),
        }

        {
            let mut state = node.state.write().await;
            state.connected = false;
            state.healthy = false;
            state.reconnect_attempts += 1;
        }
        events.emit(Event::NodeDisconnect(node.id.clone()));

        let attempts = node.state.read().await.reconnect_attempts;
        if attempts > node.config.reconnect_attempts {
            warn!("exceeded reconnect attempt budget, giving up");
            return;
        }

        let delay = std::cmp::min(node.config.reconnect_delay * attempts, MAX_RECONNECT_DELAY);
        tokio::time::sleep(delay).await;
    }
}

async fn connect_once(
    node: &Arc<Node>,
    user_id: &str,
    events: &EventBus,
    dispatch: &mpsc::Sender<GuildFrame>,
) -> Result<(), super::Error> {
    let mut request = node.config.ws_url().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        HeaderName::from_static("authorization"),
        HeaderValue::from_str(&node.config.password)
            .map_err(|_| super::Error::NoNodeAvailable)?,
    );
    headers.insert(
        HeaderName::from_static("user-id"),
        HeaderValue::from_str(user_id).map_err(|_| super::Error::NoNodeAvailable)?,
    );
    headers.insert(
        HeaderName::from_static("client-name"),
        HeaderValue::from_static("flotilla/1"),
    );

    let (mut stream, _response) = connect_async(request).await?;

    {
        let mut state = node.state.write().await;
        state.connected = true;
        state.reconnect_attempts = 0;
        state.healthy = true;
    }
    events.emit(Event::NodeConnect(node.id.clone()));

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            biased;

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(node, &text, events, dispatch).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => (), // ping/pong/binary: ignore
                    Some(Err(err)) => return Err(err.into()),
                }
            }

            _ = ping_timer.tick() => {
                ping(node, events).await;
            }
        }
    }
}

async fn handle_frame(
    node: &Arc<Node>,
    text: &str,
    events: &EventBus,
    dispatch: &mpsc::Sender<GuildFrame>,
) {
    let parsed = match payload::parse(text) {
        Ok(p) => p,
        Err(err) => {
            warn!(%err, "ignoring malformed node frame");
            return;
        }
    };

    match parsed {
        NodePayload::Ready(ready) => {
            node.state.write().await.session_id = Some(ready.session_id);
            events.emit(Event::NodeReady(node.id.clone()));
        }
        NodePayload::Stats(stats) => {
            node.state.write().await.stats = Some(stats);
            events.emit(Event::NodeStats(node.id.clone()));
        }
        NodePayload::PlayerUpdate(update) => {
            let frame = GuildFrame {
                node_id: node.id.clone(),
                guild_id: update.guild_id.clone(),
                payload: GuildPayload::Update(update),
            };
            let _ = dispatch.send(frame).await;
        }
        NodePayload::Event(event) => {
            let guild_id = match &event {
                NodeEvent::TrackStart { guild_id, .. }
                | NodeEvent::TrackEnd { guild_id, .. }
                | NodeEvent::TrackException { guild_id, .. }
                | NodeEvent::TrackStuck { guild_id, .. }
                | NodeEvent::WebSocketClosed { guild_id, .. } => guild_id.clone(),
            };
            let frame = GuildFrame {
                node_id: node.id.clone(),
                guild_id,
                payload: GuildPayload::Event(event),
            };
            let _ = dispatch.send(frame).await;
        }
        NodePayload::Unknown(tag) => {
            warn!(tag, "unrecognized node frame op, dropping");
        }
    }
}

async fn ping(node: &Arc<Node>, events: &EventBus) {
    let start = Instant::now();

    match node.rest.get_info().await {
        Ok(_) => {
            let rtt = start.elapsed();
            if rtt > PING_WARN_THRESHOLD {
                warn!(ms = rtt.as_millis() as u64, "node ping is slow");
            }

            let mut state = node.state.write().await;
            state.ping_ms = Some(rtt.as_millis() as u64);
            state.last_ping_success = Some(start);
            state.healthy = true;
        }
        Err(err) => {
            warn!(%err, "node health ping failed");

            let mut state = node.state.write().await;
            let stale = state
                .last_ping_success
                .map(|last| last.elapsed() > UNHEALTHY_AFTER)
                .unwrap_or(true);
            if stale {
                state.healthy = false;
            }
            events.emit(Event::NodeError(node.id.clone(), err.to_string()));
        }
    }
}
