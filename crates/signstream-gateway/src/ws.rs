//! WebSocket ingress — the read half of a client connection
//!
//! Parses the tagged JSON protocol, enqueues frames and control messages on
//! the session's ingress queue, and answers pings and stats requests
//! directly. The write half belongs to the pool's egress worker.

use crate::pool::MessageSink;
use crate::server::AppState;
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use signstream_core::{ClientMessage, MessagePriority, ServerMessage};
use signstream_session::PipelineCommand;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Inbound text frames above this are rejected, connection preserved.
const MAX_INBOUND_BYTES: usize = 2 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Cumulative inactivity before the connection is closed.
const INACTIVITY_LIMIT: Duration = Duration::from_secs(300);
/// Consecutive inbound errors before disconnecting the client.
const MAX_INBOUND_ERRORS: u32 = 10;

struct WsSink(SplitSink<WebSocket, WsMessage>);

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.0.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = socket.split();

    let session = match state.pool.connect(Box::new(WsSink(ws_tx)), "default") {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "connection rejected");
            return;
        }
    };
    let client_id = session.id.clone();

    let established = ServerMessage::connection_established(
        client_id.as_str(),
        vec![
            "frame_processing".to_string(),
            "practice_sessions".to_string(),
            "adaptive_quality".to_string(),
            "signing_analysis".to_string(),
        ],
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "max_frame_bytes": MAX_INBOUND_BYTES,
            "default_profile": state.config.video.default_profile,
        }),
    );
    state.pool.send(&client_id, established, true, false);

    let mut error_count: u32 = 0;
    let mut last_activity = Instant::now();

    while !state.pool.is_shutting_down() {
        let frame = match tokio::time::timeout(READ_TIMEOUT, ws_rx.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                if last_activity.elapsed() > INACTIVITY_LIMIT {
                    info!(client = %client_id, "client inactive, disconnecting");
                    break;
                }
                state
                    .pool
                    .send(&client_id, ServerMessage::keepalive(), true, false);
                continue;
            }
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) => {
                info!(client = %client_id, "client closed connection");
                break;
            }
            Some(Ok(_)) => continue, // binary, ping, pong
            Some(Err(e)) => {
                error_count += 1;
                debug!(client = %client_id, error = %e, "websocket read error");
                if error_count >= MAX_INBOUND_ERRORS {
                    break;
                }
                continue;
            }
            None => break,
        };

        last_activity = Instant::now();
        session.record_received(text.len());

        if text.len() > MAX_INBOUND_BYTES {
            warn!(client = %client_id, bytes = text.len(), "inbound message too large");
            state.pool.send(
                &client_id,
                ServerMessage::error(
                    "Message too large (max 2MB for low latency)",
                    "MESSAGE_TOO_LARGE",
                ),
                true,
                false,
            );
            continue;
        }

        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => {
                error_count = 0;
                message
            }
            Err(e) => {
                error_count += 1;
                debug!(client = %client_id, error = %e, "invalid message");
                if error_count >= MAX_INBOUND_ERRORS {
                    state.pool.send(
                        &client_id,
                        ServerMessage::error(
                            "Too many malformed messages, disconnecting",
                            "TOO_MANY_ERRORS",
                        ),
                        true,
                        false,
                    );
                    break;
                }
                state.pool.send(
                    &client_id,
                    ServerMessage::error(format!("Invalid JSON: {e}"), "INVALID_JSON"),
                    true,
                    false,
                );
                continue;
            }
        };

        match message {
            ClientMessage::Ping { timestamp } => {
                state
                    .pool
                    .send(&client_id, ServerMessage::Pong { timestamp }, true, false);
            }
            ClientMessage::StatsRequest => {
                let enqueued = session.ingress.enqueue(
                    PipelineCommand::StatsRequest,
                    MessagePriority::High,
                    None,
                );
                if enqueued.is_err() {
                    state.pool.send(
                        &client_id,
                        ServerMessage::retryable_error("Server busy, retry shortly", "QUEUE_FULL"),
                        true,
                        false,
                    );
                }
            }
            ClientMessage::Control { action, data } => {
                let enqueued = session.ingress.enqueue(
                    PipelineCommand::Control { action, data },
                    MessagePriority::High,
                    None,
                );
                if enqueued.is_err() {
                    warn!(client = %client_id, "ingress full, control message dropped");
                    state.pool.send(
                        &client_id,
                        ServerMessage::retryable_error("Server busy, retry shortly", "QUEUE_FULL"),
                        true,
                        false,
                    );
                }
            }
            ClientMessage::RawFrame {
                frame_data,
                metadata,
            } => {
                // Backpressure: a full ingress queue drops the frame and
                // ticks the drop counter; the connection stays up.
                let enqueued = session.ingress.enqueue(
                    PipelineCommand::Frame {
                        frame_data,
                        metadata,
                    },
                    MessagePriority::Normal,
                    None,
                );
                if enqueued.is_err() {
                    session.stats.record_queue_overflow();
                }
            }
        }
    }

    state.pool.disconnect(&client_id).await;
}
