// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The broker's HTTP/WebSocket listener.
//!
//! One listener carries three surfaces:
//! - `GET /ws` upgrades to the envelope transport (newline-framed JSON in
//!   text frames, one envelope per frame);
//! - `GET /health` answers a small JSON status;
//! - `* /bridge/*` reverse-proxies to the decision-tracking daemon;
//! - everything else is 404.
//!
//! CORS is permissive: the broker binds loopback by default and exists
//! for local development tooling.
//!
//! # Connection protocol
//!
//! A new WebSocket is accepted but not yet registered.  The first frame's
//! `sender` binds the connection in the registry; the frame itself is
//! then routed like any other.  After binding, a frame whose sender
//! differs from the bound participant is refused — one connection speaks
//! for exactly one participant.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use huddle_config::BridgeConfig;
use huddle_protocol::{
    Envelope, ErrorCode, ErrorPayload, ParticipantId, Payload, ProtocolError, SessionId,
};

use crate::broker::BrokerHandle;
use crate::transport::ConnectionHandle;

#[derive(Clone)]
pub struct AppState {
    pub broker: BrokerHandle,
    pub bridge: Option<BridgeConfig>,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(broker: BrokerHandle, bridge: Option<BridgeConfig>) -> Self {
        Self {
            broker,
            bridge,
            client: reqwest::Client::new(),
        }
    }
}

/// Build the axum application.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/bridge/*path", any(crate::bridge::proxy))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the listener fails or the process is shut down.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "bridge_proxy": state.bridge.is_some(),
    }))
}

async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broker))
}

/// Bridge one WebSocket to the broker loop.
async fn handle_socket(mut socket: WebSocket, broker: BrokerHandle) {
    let (connection, mut outbound_rx) = ConnectionHandle::pair();
    let mut participant: Option<ParticipantId> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match Envelope::from_frame(&text) {
                            Ok(envelope) => {
                                let sender = envelope.sender.clone();
                                match &participant {
                                    None => {
                                        info!(%sender, "connection bound");
                                        broker.attach(sender.clone(), connection.clone());
                                        participant = Some(sender.clone());
                                        broker.inbound(sender, envelope);
                                    }
                                    Some(bound) if bound == &sender => {
                                        broker.inbound(sender, envelope);
                                    }
                                    Some(bound) => {
                                        warn!(%bound, claimed = %sender, "sender mismatch on bound connection");
                                        send_protocol_error(
                                            &mut socket,
                                            &envelope.session,
                                            format!("connection is bound to {bound}"),
                                        )
                                        .await;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("undecodable frame: {e}");
                                let message = match &e {
                                    ProtocolError::UnknownType(t) => {
                                        format!("unknown message type `{t}`")
                                    }
                                    other => format!("malformed envelope: {other}"),
                                };
                                let session = session_of_raw(&text);
                                send_protocol_error(&mut socket, &session, message).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(envelope) => {
                        let Ok(frame) = envelope.to_frame() else { continue };
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let Some(participant) = participant {
        info!(%participant, "connection closed");
        broker.connection_closed(participant);
    }
}

/// Best-effort recovery of the session id from an undecodable frame, so
/// the error envelope at least lands in the right conversation.
fn session_of_raw(text: &str) -> SessionId {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("session").and_then(|s| s.as_str()).map(SessionId::from))
        .unwrap_or_else(|| SessionId::from("unknown"))
}

async fn send_protocol_error(socket: &mut WebSocket, session: &SessionId, message: String) {
    let envelope = Envelope::from_system(
        session.clone(),
        Payload::Error(ErrorPayload::new(ErrorCode::InvalidMessage, message)),
    );
    if let Ok(frame) = envelope.to_frame() {
        let _ = socket.send(Message::Text(frame)).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_recovered_from_raw_json() {
        let raw = r#"{"session":"s42","type":"bogus"}"#;
        assert_eq!(session_of_raw(raw), SessionId::from("s42"));
    }

    #[test]
    fn unparseable_raw_falls_back_to_unknown() {
        assert_eq!(session_of_raw("garbage"), SessionId::from("unknown"));
    }
}
