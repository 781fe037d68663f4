// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! WebSocket client for the broker with exponential-backoff reconnect.
//!
//! The client owns the socket in a background task.  Callers get two
//! channel ends: an outbound sender (`send`) and an inbound receiver of
//! decoded envelopes.  On connection loss the task reconnects with
//! exponential backoff — 1 s base, doubling, at most ten attempts —
//! unless [`BrokerClient::close`] already inhibited reconnection.
//!
//! Frames queued while offline are delivered after reconnecting; the
//! unbounded queue rides out the gap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use huddle_protocol::Envelope;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct BrokerClient {
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl BrokerClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:9170/ws`).
    ///
    /// The initial connection is made eagerly so a bad address fails
    /// fast; reconnects afterwards happen in the background.
    pub async fn connect(
        url: &str,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let (ws, _) = connect_async(url).await?;
        info!(%url, "connected to broker");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(client_task(
            url.to_string(),
            ws,
            outbound_rx,
            inbound_tx,
            Arc::clone(&closed),
        ));

        Ok((
            Self {
                outbound_tx,
                closed,
            },
            inbound_rx,
        ))
    }

    /// Queue an envelope for delivery.  Fails only after [`close`].
    pub fn send(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.outbound_tx
            .send(envelope)
            .map_err(|_| anyhow::anyhow!("client is closed"))
    }

    /// Stop the client and inhibit any further reconnects.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

async fn client_task(
    url: String,
    mut ws: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    closed: Arc<AtomicBool>,
) {
    loop {
        run_connection(&mut ws, &mut outbound_rx, &inbound_tx, &closed).await;
        if closed.load(Ordering::Relaxed) {
            let _ = ws.close(None).await;
            break;
        }

        match reconnect(&url, &closed).await {
            Some(next) => ws = next,
            None => break,
        }
    }
    debug!("broker client task finished");
}

/// Pump one live connection until it drops or the client closes.
async fn run_connection(
    ws: &mut WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    inbound_tx: &mpsc::UnboundedSender<Envelope>,
    closed: &AtomicBool,
) {
    loop {
        if closed.load(Ordering::Relaxed) {
            return;
        }
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else { return };
                let Ok(frame) = envelope.to_frame() else { continue };
                if ws.send(Message::Text(frame.into())).await.is_err() {
                    warn!("send failed; connection lost");
                    return;
                }
            }
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match Envelope::from_frame(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).is_err() {
                                // Receiver gone: the owner is done with us.
                                closed.store(true, Ordering::Relaxed);
                                return;
                            }
                        }
                        Err(e) => warn!("undecodable frame from broker: {e}"),
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("broker closed the connection");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {e}");
                        return;
                    }
                }
            }
        }
    }
}

/// Exponential backoff: 1 s, 2 s, 4 s ... capped at ten attempts.
async fn reconnect(url: &str, closed: &AtomicBool) -> Option<WsStream> {
    let mut delay = BACKOFF_BASE;
    for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
        if closed.load(Ordering::Relaxed) {
            return None;
        }
        info!(attempt, ?delay, "reconnecting to broker");
        tokio::time::sleep(delay).await;
        match connect_async(url).await {
            Ok((ws, _)) => {
                info!(attempt, "reconnected");
                return Some(ws);
            }
            Err(e) => {
                warn!(attempt, "reconnect failed: {e}");
                delay = delay.saturating_mul(2);
            }
        }
    }
    warn!("giving up after {MAX_RECONNECT_ATTEMPTS} reconnect attempts");
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
