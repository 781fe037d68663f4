// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Broker wiring — the single event loop behind every session.
//!
//! ```text
//!   WS handler ──┐
//!                ├──► mpsc::UnboundedSender<BrokerEvent> ──► Broker::run
//!   loopback  ───┘                                             │
//!   gate timers ─┘        owns Router + SessionRegistry        │
//!   heartbeats ──┘        computes outbound under dispatch     │
//!                                                              ▼
//!                     ConnectionRegistry (per-connection send queues)
//! ```
//!
//! Transports enqueue inbound envelopes; timer tasks enqueue expiries and
//! sweeps.  The loop processes them **one at a time**, which is the
//! serialized-writer guarantee the protocol's ordering rules rest on:
//! within a session every recipient observes the same delivery order
//! because fan-out enqueues onto the per-connection queues before the
//! next event is dispatched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_config::BrokerConfig;
use huddle_protocol::{Envelope, MessageId, ParticipantId, SessionId};

use crate::heartbeat::HeartbeatScheduler;
use crate::router::{Router, RouterOutput};
use crate::transport::{ConnectionHandle, ConnectionRegistry};

/// Everything that can wake the broker loop.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A frame arrived on a registered connection.
    Inbound {
        sender: ParticipantId,
        envelope: Envelope,
    },
    /// A transport closed without a `session.leave`.
    ConnectionClosed { participant: ParticipantId },
    /// A gate-expiry timer fired.
    GateTimeout {
        session: SessionId,
        proposal: MessageId,
    },
    /// A session's heartbeat interval elapsed.
    HeartbeatSweep { session: SessionId },
    /// Stop the broker: end sessions, close connections.
    Shutdown,
}

/// Cheap-to-clone handle to a running broker.
///
/// Transport handlers (WebSocket, in-process loopback, tests) hold one of
/// these: they attach connections and enqueue events, nothing more.
#[derive(Clone)]
pub struct BrokerHandle {
    event_tx: mpsc::UnboundedSender<BrokerEvent>,
    connections: Arc<ConnectionRegistry>,
}

impl BrokerHandle {
    /// Register a connection for a participant.  The first inbound frame
    /// of a new transport names its sender; the transport calls this
    /// before forwarding that frame.
    pub fn attach(&self, participant: ParticipantId, connection: ConnectionHandle) {
        self.connections.register(participant, connection);
    }

    pub fn inbound(&self, sender: ParticipantId, envelope: Envelope) {
        let _ = self.event_tx.send(BrokerEvent::Inbound { sender, envelope });
    }

    pub fn connection_closed(&self, participant: ParticipantId) {
        self.connections.remove(&participant);
        let _ = self
            .event_tx
            .send(BrokerEvent::ConnectionClosed { participant });
    }

    pub fn shutdown(&self) {
        let _ = self.event_tx.send(BrokerEvent::Shutdown);
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }
}

/// The broker: router + connection registry + timers, driven by one loop.
pub struct Broker {
    router: Router,
    event_rx: mpsc::UnboundedReceiver<BrokerEvent>,
    event_tx: mpsc::UnboundedSender<BrokerEvent>,
    connections: Arc<ConnectionRegistry>,
    heartbeats: HeartbeatScheduler,
    gate_timers: HashMap<(SessionId, MessageId), JoinHandle<()>>,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> (Self, BrokerHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(ConnectionRegistry::new());
        let handle = BrokerHandle {
            event_tx: event_tx.clone(),
            connections: Arc::clone(&connections),
        };
        let broker = Self {
            router: Router::new(config.session.clone()),
            event_rx,
            event_tx: event_tx.clone(),
            connections,
            heartbeats: HeartbeatScheduler::new(event_tx),
            gate_timers: HashMap::new(),
        };
        (broker, handle)
    }

    /// Run the event loop.  Returns after a [`BrokerEvent::Shutdown`] has
    /// been processed or every handle has been dropped.
    pub async fn run(mut self) {
        info!("broker started");
        while let Some(event) = self.event_rx.recv().await {
            match event {
                BrokerEvent::Inbound { sender, envelope } => {
                    let output = self.router.handle(&sender, envelope);
                    self.apply(output);
                }
                BrokerEvent::ConnectionClosed { participant } => {
                    debug!(%participant, "connection closed");
                    let output = self.router.handle_disconnect(&participant);
                    self.apply(output);
                }
                BrokerEvent::GateTimeout { session, proposal } => {
                    self.gate_timers.remove(&(session.clone(), proposal.clone()));
                    let output = self.router.handle_gate_timeout(&session, &proposal);
                    self.apply(output);
                }
                BrokerEvent::HeartbeatSweep { session } => {
                    let output = self.router.handle_heartbeat_sweep(&session);
                    self.apply(output);
                }
                BrokerEvent::Shutdown => {
                    info!("broker shutting down");
                    let output = self.router.shutdown();
                    self.apply(output);
                    self.heartbeats.stop_all();
                    for (_, timer) in self.gate_timers.drain() {
                        timer.abort();
                    }
                    self.connections.close_all();
                    break;
                }
            }
        }
        info!("broker stopped");
    }

    /// Fan out a dispatch result and act on its side requests.
    fn apply(&mut self, output: RouterOutput) {
        for outbound in output.outbound {
            let delivered = self
                .connections
                .send_to_all(&outbound.to, &outbound.envelope);
            if delivered < outbound.to.len() {
                debug!(
                    ty = outbound.envelope.type_name(),
                    delivered,
                    wanted = outbound.to.len(),
                    "partial delivery"
                );
            }
        }

        for timer in output.gate_timers {
            let tx = self.event_tx.clone();
            let key = (timer.session.clone(), timer.proposal.clone());
            let task = tokio::spawn(async move {
                tokio::time::sleep(timer.after).await;
                let _ = tx.send(BrokerEvent::GateTimeout {
                    session: timer.session,
                    proposal: timer.proposal,
                });
            });
            if let Some(old) = self.gate_timers.insert(key, task) {
                old.abort();
            }
        }

        if let Some(session) = output.session_created {
            let interval = self
                .router
                .sessions
                .get(&session)
                .map(|s| s.config.heartbeat_interval_seconds)
                .unwrap_or(30);
            self.heartbeats
                .start(session, Duration::from_secs(interval.max(1)));
        }

        if let Some(session) = output.session_ended {
            self.heartbeats.stop(&session);
            if self.router.sessions.remove(&session).is_some() {
                info!(%session, "session ended");
            } else {
                warn!(%session, "session ended but was not registered");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{
        Capability, ParticipantInfo, ParticipantType, Payload, Role, SessionConfig,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    async fn recv_until(
        rx: &mut UnboundedReceiver<Envelope>,
        ty: &str,
    ) -> Option<Envelope> {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(env)) if env.type_name() == ty => return Some(env),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    fn start_broker() -> BrokerHandle {
        let (broker, handle) = Broker::new(&BrokerConfig::default());
        tokio::spawn(broker.run());
        handle
    }

    /// Attach a loopback participant and send its join.
    fn join(
        handle: &BrokerHandle,
        id: &str,
        roles: Vec<Role>,
        caps: Vec<Capability>,
    ) -> UnboundedReceiver<Envelope> {
        let participant = ParticipantId::from(id);
        let (conn, rx) = ConnectionHandle::pair();
        handle.attach(participant.clone(), conn);
        let env = Envelope::new(
            sid(),
            participant.clone(),
            Payload::SessionJoin {
                participant: ParticipantInfo {
                    id: participant.clone(),
                    name: id.to_string(),
                    participant_type: ParticipantType::Human,
                    roles,
                    capabilities: caps,
                    transport: Some("loopback".into()),
                    metadata: None,
                },
                supported_versions: vec![1],
            },
        );
        handle.inbound(participant, env);
        rx
    }

    #[tokio::test]
    async fn join_is_announced_to_the_joiner() {
        let handle = start_broker();
        let mut rx = join(&handle, "alice", vec![], vec![]);
        let announce = recv_until(&mut rx, "participant.announce").await;
        assert!(announce.is_some());
    }

    #[tokio::test]
    async fn prompt_is_broadcast_to_both_participants() {
        let handle = start_broker();
        let mut alice_rx = join(&handle, "alice", vec![], vec![Capability::Prompt]);
        let mut bob_rx = join(&handle, "bob", vec![], vec![]);

        let alice = ParticipantId::from("alice");
        handle.inbound(
            alice.clone(),
            Envelope::new(
                sid(),
                alice,
                Payload::PromptSubmit {
                    content: "hello room".into(),
                    target: None,
                },
            ),
        );

        for rx in [&mut alice_rx, &mut bob_rx] {
            let env = recv_until(rx, "prompt.submit").await.expect("prompt");
            match env.payload {
                Payload::PromptSubmit { ref content, .. } => assert_eq!(content, "hello room"),
                _ => unreachable!(),
            }
        }
    }

    #[tokio::test]
    async fn identical_delivery_order_for_all_recipients() {
        let handle = start_broker();
        let mut alice_rx = join(&handle, "alice", vec![], vec![Capability::Prompt]);
        let mut bob_rx = join(&handle, "bob", vec![], vec![Capability::Prompt]);

        // Interleave prompts from both participants.
        for i in 0..10 {
            let who = if i % 2 == 0 { "alice" } else { "bob" };
            let p = ParticipantId::from(who);
            handle.inbound(
                p.clone(),
                Envelope::new(
                    sid(),
                    p,
                    Payload::PromptSubmit {
                        content: format!("m{i}"),
                        target: None,
                    },
                ),
            );
        }

        let collect = |rx: &mut UnboundedReceiver<Envelope>| {
            let mut order = Vec::new();
            while let Ok(env) = rx.try_recv() {
                if let Payload::PromptSubmit { content, .. } = env.payload {
                    order.push(content);
                }
            }
            order
        };
        // Give the loop a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let alice_order = collect(&mut alice_rx);
        let bob_order = collect(&mut bob_rx);
        assert_eq!(alice_order.len(), 10);
        assert_eq!(alice_order, bob_order);
    }

    #[tokio::test]
    async fn disconnect_produces_leave_and_presence_for_the_rest() {
        let handle = start_broker();
        let _alice_rx = join(&handle, "alice", vec![], vec![]);
        let mut bob_rx = join(&handle, "bob", vec![], vec![]);

        handle.connection_closed(ParticipantId::from("alice"));

        let leave = recv_until(&mut bob_rx, "session.leave").await.expect("leave");
        assert_eq!(leave.sender, ParticipantId::from("alice"));
        let presence = recv_until(&mut bob_rx, "presence.update")
            .await
            .expect("presence");
        match presence.payload {
            Payload::PresenceUpdate { presence, .. } => {
                assert_eq!(presence, huddle_protocol::Presence::Disconnected);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn shutdown_broadcasts_session_end() {
        let handle = start_broker();
        let mut rx = join(&handle, "alice", vec![], vec![]);
        handle.shutdown();
        let end = recv_until(&mut rx, "session.end").await.expect("end");
        match end.payload {
            Payload::SessionEnd { reason, .. } => assert_eq!(reason, "server shutdown"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn expired_gate_times_out_on_schedule() {
        let mut config = BrokerConfig::default();
        config.session = SessionConfig {
            gate_timeout_seconds: 1,
            ..SessionConfig::default()
        };
        let (broker, handle) = Broker::new(&config);
        tokio::spawn(broker.run());

        let mut alice_rx = join(&handle, "alice", vec![Role::Approver], vec![]);
        let _bot_rx = join(&handle, "bot", vec![], vec![]);

        let bot = ParticipantId::from("bot");
        handle.inbound(
            bot.clone(),
            Envelope::new(
                sid(),
                bot.clone(),
                Payload::ToolPropose {
                    proposal: huddle_protocol::ToolProposal {
                        tool_name: "shell".into(),
                        arguments: serde_json::json!({"command": "npm install left-pad"}),
                        proposing_agent: bot.clone(),
                        category: huddle_protocol::ToolCategory::ShellExecute,
                        risk_level: huddle_protocol::RiskLevel::Medium,
                        requires_approval: true,
                        description: "install left-pad".into(),
                        suggested_approvers: vec![],
                    },
                },
            ),
        );

        let timeout = recv_until(&mut alice_rx, "gate.timeout")
            .await
            .expect("gate.timeout after the configured second");
        match timeout.payload {
            Payload::GateTimeout { resolution, .. } => {
                assert_eq!(resolution, huddle_protocol::GateResolution::Rejected);
            }
            _ => unreachable!(),
        }
    }
}
