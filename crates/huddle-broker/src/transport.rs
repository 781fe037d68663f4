// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Connection registry and the per-connection send path.
//!
//! Every accepted connection is one entry in a concurrent map keyed by
//! participant id.  The broker never writes to a socket directly: it
//! enqueues envelopes onto the connection's unbounded queue, and exactly
//! one writer task per connection drains that queue onto the wire.  This
//! keeps fan-out non-blocking (the router never awaits a slow client) and
//! gives every recipient the same delivery order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use huddle_protocol::{Envelope, ParticipantId};

/// Sending half of one accepted connection.
///
/// `send` never blocks; a connection whose writer task has gone away
/// reports `false` and the caller moves on to the next recipient.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end its writer task drains.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Enqueue an envelope for delivery.  Returns `false` when the
    /// connection is closed or its writer task has dropped the receiver.
    pub fn send(&self, envelope: Envelope) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.tx.send(envelope).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    /// Mark closed.  The writer task observes the dropped queue and exits.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// Concurrent map participant-id → connection.
///
/// Registration happens when the first frame of a new connection names its
/// sender; removal happens on close.  A participant reconnecting replaces
/// the stale entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ParticipantId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, participant: ParticipantId, handle: ConnectionHandle) {
        if self.connections.insert(participant.clone(), handle).is_some() {
            debug!(%participant, "replaced existing connection");
        }
    }

    pub fn remove(&self, participant: &ParticipantId) -> Option<ConnectionHandle> {
        self.connections.remove(participant).map(|(_, h)| h)
    }

    pub fn contains(&self, participant: &ParticipantId) -> bool {
        self.connections.contains_key(participant)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Deliver one envelope to one participant.  A failed send is logged
    /// and reported, never propagated: one dead recipient must not abort
    /// delivery to the others.
    pub fn send_to(&self, participant: &ParticipantId, envelope: Envelope) -> bool {
        match self.connections.get(participant) {
            Some(conn) => {
                let ok = conn.send(envelope);
                if !ok {
                    warn!(%participant, "send failed: connection closed");
                }
                ok
            }
            None => false,
        }
    }

    /// Deliver an envelope to every listed recipient.
    /// Returns how many deliveries were enqueued.
    pub fn send_to_all(&self, recipients: &[ParticipantId], envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for participant in recipients {
            if self.send_to(participant, envelope.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Close every connection (broker shutdown).
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
