// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The message router: one synchronous dispatch per inbound envelope.
//!
//! Per-type handlers mutate session state and produce zero or more
//! outbound deliveries.  The router never touches a socket — it returns
//! fully resolved `(envelope, recipients)` pairs and lets the broker fan
//! them out — and it never awaits: everything here is synchronous
//! computation under the broker's single event loop, which is what makes
//! the per-session delivery order identical for every recipient.
//!
//! Errors follow the protocol taxonomy: protocol violations, failed
//! authorization, and dangling references answer the sender with an
//! `error` envelope and are NOT appended to the log.  Gate outcomes and
//! tool failures are first-class events, never errors.

use std::time::Duration;

use tracing::{debug, info, warn};

use huddle_protocol::{
    versions_compatible, Capability, ContextItem, Envelope, ErrorCode, ErrorPayload,
    GateResolution, LeaveReason, MessageId, ParticipantId, Payload, Presence, QuorumRule, Role,
    SessionConfig, SessionEndState, SessionId, ToolProposal,
};

use crate::gate::{Gate, GateVerdict};
use crate::session::{ForkInfo, SessionRegistry};

/// One delivery: an envelope and the participants it goes to.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub envelope: Envelope,
    pub to: Vec<ParticipantId>,
}

/// Request to arm a gate-expiry timer.
#[derive(Debug, Clone)]
pub struct GateTimer {
    pub session: SessionId,
    pub proposal: MessageId,
    pub after: Duration,
}

/// Everything one dispatch produced.  The broker fans out `outbound`,
/// arms `gate_timers`, and starts/stops heartbeat monitoring for
/// created/ended sessions.
#[derive(Debug, Default)]
pub struct RouterOutput {
    pub outbound: Vec<Outbound>,
    pub gate_timers: Vec<GateTimer>,
    pub session_created: Option<SessionId>,
    pub session_ended: Option<SessionId>,
}

impl RouterOutput {
    fn deliver(&mut self, envelope: Envelope, to: Vec<ParticipantId>) {
        self.outbound.push(Outbound { envelope, to });
    }

    fn error_to(
        &mut self,
        sender: &ParticipantId,
        session: &SessionId,
        code: ErrorCode,
        message: impl Into<String>,
        related_to: Option<MessageId>,
    ) {
        let mut payload = ErrorPayload::new(code, message);
        payload.related_to = related_to;
        self.deliver(
            Envelope::from_system(session.clone(), Payload::Error(payload)),
            vec![sender.clone()],
        );
    }
}

/// The broker-side router.  Owns the session registry; the single mutator
/// of session state.
pub struct Router {
    pub sessions: SessionRegistry,
    default_config: SessionConfig,
}

impl Router {
    pub fn new(default_config: SessionConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            default_config,
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────────

    pub fn handle(&mut self, sender: &ParticipantId, envelope: Envelope) -> RouterOutput {
        let mut out = RouterOutput::default();
        let session_id = envelope.session.clone();

        match &envelope.payload {
            Payload::SessionCreate { .. } => {
                self.on_session_create(sender, envelope, &mut out);
                return out;
            }
            Payload::SessionJoin { .. } => {
                self.on_session_join(sender, envelope, &mut out);
                return out;
            }
            _ => {}
        }

        if self.sessions.get(&session_id).is_none() {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::SessionNotFound,
                format!("unknown session {session_id}"),
                Some(envelope.id.clone()),
            );
            return out;
        }

        // Membership check: everything past join requires the sender to be
        // a participant of the session.
        let session = self.sessions.get_mut(&session_id).expect("checked above");
        if !session.participants.contains(sender) {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::ParticipantNotFound,
                format!("{sender} is not a participant of {session_id}"),
                Some(envelope.id.clone()),
            );
            return out;
        }

        // Any received envelope proves the sender is alive; an idle or
        // away participant snaps back to active, visibly.
        let mut became_active = false;
        if let Some(entry) = session.participants.get_mut(sender) {
            entry.touch_active();
            if matches!(entry.presence, Presence::Idle | Presence::Away) {
                entry.presence = Presence::Active;
                became_active = true;
            }
        }
        if became_active {
            let update = session.append(Envelope::from_system(
                session_id.clone(),
                Payload::PresenceUpdate {
                    participant: sender.clone(),
                    presence: Presence::Active,
                },
            ));
            let everyone = session.participants.ids();
            out.deliver(update, everyone);
        }

        match envelope.payload.clone() {
            Payload::SessionCreate { .. } | Payload::SessionJoin { .. } => unreachable!(),

            Payload::SessionLeave { .. } => self.on_leave(sender, envelope, &mut out),
            Payload::SessionEnd { .. } => self.on_session_end(sender, envelope, &mut out),
            Payload::SessionConfigUpdate { config } => {
                self.on_config_update(sender, envelope, config, &mut out)
            }

            Payload::ParticipantAnnounce { .. } => self.append_and_broadcast(envelope, &mut out),
            Payload::ParticipantRoleChange { participant, roles } => {
                self.on_role_change(sender, envelope, participant, roles, &mut out)
            }

            Payload::HeartbeatPing {} => {
                let session = self.sessions.get_mut(&session_id).expect("session exists");
                if let Some(entry) = session.participants.get_mut(sender) {
                    entry.touch_heartbeat();
                }
                // Answer the ping; neither direction is logged or broadcast.
                out.deliver(
                    Envelope::from_system(session_id, Payload::HeartbeatPong {})
                        .with_ref(envelope.id),
                    vec![sender.clone()],
                );
            }
            Payload::HeartbeatPong {} => {
                let session = self.sessions.get_mut(&session_id).expect("session exists");
                if let Some(entry) = session.participants.get_mut(sender) {
                    entry.touch_heartbeat();
                }
            }
            Payload::PresenceUpdate { participant, presence } => {
                // Client-declared presence (e.g. an explicit "away").
                let session = self.sessions.get_mut(&session_id).expect("session exists");
                if let Some(entry) = session.participants.get_mut(&participant) {
                    entry.presence = presence;
                }
                self.append_and_broadcast(envelope, &mut out);
            }

            Payload::ContextAdd { item } => self.on_context_add(sender, envelope, item, &mut out),
            Payload::ContextUpdate {
                key,
                content,
                content_type,
                visible_to,
            } => self.on_context_update(
                sender, envelope, key, content, content_type, visible_to, &mut out,
            ),
            Payload::ContextRemove { key } => {
                self.on_context_remove(sender, envelope, key, &mut out)
            }
            Payload::SecretShare { key, value, recipients } => {
                self.on_secret_share(sender, envelope, key, value, recipients, &mut out)
            }
            Payload::SecretRevoke { key } => {
                self.on_secret_revoke(sender, envelope, key, &mut out)
            }

            Payload::PromptDraft { .. } | Payload::PromptSubmit { .. } => {
                if self.unauthorized(sender, &envelope, Check::Prompt, &mut out) {
                    return out;
                }
                self.append_and_broadcast(envelope, &mut out);
            }
            Payload::PromptAmend { .. } => self.on_prompt_amend(sender, envelope, &mut out),

            // Model-turn streaming and tool telemetry: append and broadcast
            // verbatim.
            Payload::ThinkingStart {}
            | Payload::ThinkingChunk { .. }
            | Payload::ThinkingEnd {}
            | Payload::ResponseStart {}
            | Payload::ResponseChunk { .. }
            | Payload::ResponseEnd { .. }
            | Payload::ToolOutput { .. }
            | Payload::ToolResult { .. } => self.append_and_broadcast(envelope, &mut out),

            Payload::ToolPropose { proposal } => {
                self.on_tool_propose(sender, envelope, proposal, &mut out)
            }
            Payload::ToolApprove { proposal } | Payload::GateApprove { proposal } => {
                self.on_gate_approve(sender, envelope, proposal, &mut out)
            }
            Payload::ToolReject { proposal, reason } | Payload::GateReject { proposal, reason } => {
                self.on_gate_reject(sender, envelope, proposal, reason, &mut out)
            }

            // Broker-authored messages a client must never inject: accepting
            // them would bypass the gate machinery entirely.
            Payload::ToolExecute { .. } | Payload::GateRequest { .. } | Payload::GateTimeout { .. } => {
                out.error_to(
                    sender,
                    &session_id,
                    ErrorCode::Unauthorized,
                    format!("{} is broker-authored", envelope.type_name()),
                    Some(envelope.id),
                );
            }

            Payload::InterruptRaise { .. } => {
                if self.unauthorized(sender, &envelope, Check::Interrupt, &mut out) {
                    return out;
                }
                self.append_and_broadcast(envelope, &mut out);
            }
            Payload::InterruptAcknowledge { .. } => self.append_and_broadcast(envelope, &mut out),

            Payload::ForkCreate { fork, name, from_message } => {
                self.on_fork_create(sender, envelope, fork, name, from_message, &mut out)
            }
            Payload::ForkSwitch { fork } => self.on_fork_switch(sender, envelope, fork, &mut out),
            Payload::MergePropose { source, target } => {
                self.on_merge(sender, envelope, source, target, false, &mut out)
            }
            Payload::MergeExecute { source, target } => {
                self.on_merge(sender, envelope, source, target, true, &mut out)
            }

            Payload::Error(err) => self.on_error(sender, envelope, err, &mut out),
        }

        out
    }

    // ── Session lifecycle ─────────────────────────────────────────────────────

    fn on_session_create(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        out: &mut RouterOutput,
    ) {
        let Payload::SessionCreate { name, config } = envelope.payload.clone() else {
            unreachable!()
        };
        let session_id = envelope.session.clone();
        match self.sessions.create(session_id.clone(), name, config) {
            Some(session) => {
                info!(session = %session_id, "session created");
                let created = session.append(envelope);
                out.deliver(created, vec![sender.clone()]);
                out.session_created = Some(session_id);
            }
            None => out.error_to(
                sender,
                &session_id,
                ErrorCode::InvalidState,
                format!("session {session_id} already exists"),
                Some(envelope.id),
            ),
        }
    }

    fn on_session_join(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        out: &mut RouterOutput,
    ) {
        let Payload::SessionJoin { participant, supported_versions } = envelope.payload.clone()
        else {
            unreachable!()
        };
        let session_id = envelope.session.clone();

        if !versions_compatible(&supported_versions) {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::InvalidMessage,
                format!("unsupported protocol versions {supported_versions:?}"),
                Some(envelope.id),
            );
            return;
        }
        if &participant.id != sender {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::InvalidMessage,
                "join participant id must match the connection's sender",
                Some(envelope.id),
            );
            return;
        }

        let default_config = self.default_config.clone();
        let (session, created) = self.sessions.get_or_create(&session_id, &default_config);
        if created {
            info!(session = %session_id, "session auto-created on join");
            out.session_created = Some(session_id.clone());
        }

        if !session.participants.contains(sender)
            && session.participants.len() >= session.config.max_participants
        {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::InvalidState,
                format!(
                    "session is full ({} participants)",
                    session.config.max_participants
                ),
                Some(envelope.id),
            );
            return;
        }

        session.participants.insert(participant.clone());
        info!(session = %session_id, participant = %sender, "participant joined");
        session.append(envelope);

        // Announce the joiner to everyone, including the joiner.
        let everyone = session.participants.ids();
        let announce = session.append(Envelope::from_system(
            session_id.clone(),
            Payload::ParticipantAnnounce {
                participant: participant.clone(),
            },
        ));
        out.deliver(announce, everyone);

        // Replay minimal state to the joiner: the current participant list
        // and the context visible to them.  Replay envelopes are addressed
        // to the joiner only and are not logged again.
        for existing in session.participants.infos() {
            if existing.id == participant.id {
                continue;
            }
            out.deliver(
                Envelope::from_system(
                    session_id.clone(),
                    Payload::ParticipantAnnounce { participant: existing },
                ),
                vec![sender.clone()],
            );
        }
        for item in session.context.visible_to(sender) {
            out.deliver(
                Envelope::from_system(
                    session_id.clone(),
                    Payload::ContextAdd { item: item.clone() },
                ),
                vec![sender.clone()],
            );
        }
    }

    fn on_leave(&mut self, sender: &ParticipantId, envelope: Envelope, out: &mut RouterOutput) {
        let session_id = envelope.session.clone();
        let session = self.sessions.get_mut(&session_id).expect("session exists");

        session.participants.remove(sender);
        info!(session = %session_id, participant = %sender, "participant left");

        let mut recipients = session.participants.ids();
        recipients.push(sender.clone());

        let leave = session.append(envelope);
        out.deliver(leave, recipients.clone());

        let update = session.append(Envelope::from_system(
            session_id,
            Payload::PresenceUpdate {
                participant: sender.clone(),
                presence: Presence::Disconnected,
            },
        ));
        out.deliver(update, recipients);
    }

    fn on_session_end(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::EndSession, out) {
            return;
        }
        let session_id = envelope.session.clone();
        let session = self.sessions.get_mut(&session_id).expect("session exists");
        let everyone = session.participants.ids();
        let end = session.append(envelope);
        out.deliver(end, everyone);
        out.session_ended = Some(session_id);
    }

    fn on_config_update(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        config: SessionConfig,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Admin, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        session.config = config;
        self.append_and_broadcast(envelope, out);
    }

    fn on_role_change(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        participant: ParticipantId,
        roles: Vec<Role>,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::ManageParticipants, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        if !session.participants.set_roles(&participant, roles) {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::ParticipantNotFound,
                format!("unknown participant {participant}"),
                Some(envelope.id),
            );
            return;
        }
        self.append_and_broadcast(envelope, out);
    }

    // ── Context and secrets ───────────────────────────────────────────────────

    fn on_context_add(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        item: ContextItem,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::AddContext, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");

        session.context.add(item.clone());
        // Broadcast the stored item so recipients see the computed ref.
        let stored = session
            .context
            .get(&item.key)
            .cloned()
            .expect("just inserted");
        let recipients = visibility_audience(&stored.visible_to, sender, session);

        let mut enriched = envelope;
        enriched.payload = Payload::ContextAdd { item: stored };
        let enriched = session.append(enriched);
        out.deliver(enriched, recipients);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_context_update(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        key: String,
        content: Option<serde_json::Value>,
        content_type: Option<huddle_protocol::ContentType>,
        visible_to: Option<Vec<ParticipantId>>,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::AddContext, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");

        let exists = session.context.get(&key).is_some();
        if exists {
            session
                .context
                .update(&key, content, content_type, visible_to);
        } else if let Some(content) = content {
            // Upsert: tool handlers synthesize `context.update` for files a
            // tool just created, which have no prior item under that key.
            let now = chrono::Utc::now();
            session.context.add(ContextItem {
                key: key.clone(),
                content_type: content_type.unwrap_or(huddle_protocol::ContentType::Text),
                content: Some(content),
                content_ref: None,
                visible_to: visible_to.unwrap_or_default(),
                added_by: sender.clone(),
                added_at: now,
                updated_at: now,
            });
        } else {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                format!("unknown context key `{key}`"),
                Some(envelope.id),
            );
            return;
        }
        let visible = session
            .context
            .get(&key)
            .map(|i| i.visible_to.clone())
            .unwrap_or_default();
        let recipients = visibility_audience(&visible, sender, session);
        let update = session.append(envelope);
        out.deliver(update, recipients);
    }

    fn on_context_remove(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        key: String,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::AddContext, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        match session.context.remove(&key) {
            Some(removed) => {
                let recipients = visibility_audience(&removed.visible_to, sender, session);
                let env = session.append(envelope);
                out.deliver(env, recipients);
            }
            None => out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                format!("unknown context key `{key}`"),
                Some(envelope.id),
            ),
        }
    }

    fn on_secret_share(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        key: String,
        value: String,
        recipients: Vec<ParticipantId>,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::AddContext, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");

        // A secret is a context item whose visibility IS the recipient
        // list; it never widens to the whole session.
        let mut visible = recipients;
        if !visible.contains(sender) {
            visible.push(sender.clone());
        }
        let now = chrono::Utc::now();
        session.context.add(ContextItem {
            key: key.clone(),
            content_type: huddle_protocol::ContentType::Text,
            content: Some(serde_json::Value::String(value)),
            content_ref: None,
            visible_to: visible.clone(),
            added_by: sender.clone(),
            added_at: now,
            updated_at: now,
        });

        let audience: Vec<ParticipantId> = visible
            .into_iter()
            .filter(|p| session.participants.contains(p))
            .collect();
        let env = session.append(envelope);
        out.deliver(env, audience);
    }

    fn on_secret_revoke(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        key: String,
        out: &mut RouterOutput,
    ) {
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        match session.context.remove(&key) {
            Some(removed) => {
                let recipients = visibility_audience(&removed.visible_to, sender, session);
                let env = session.append(envelope);
                out.deliver(env, recipients);
            }
            None => out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                format!("unknown secret `{key}`"),
                Some(envelope.id),
            ),
        }
    }

    // ── Prompts ───────────────────────────────────────────────────────────────

    fn on_prompt_amend(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Prompt, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        let target_is_prompt = envelope.reply_to.as_ref().and_then(|r| session.get_by_id(r)).map(
            |prior| {
                matches!(
                    prior.payload,
                    Payload::PromptDraft { .. } | Payload::PromptSubmit { .. }
                )
            },
        );
        if target_is_prompt != Some(true) {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                "prompt.amend must reference a prior prompt in this session",
                Some(envelope.id),
            );
            return;
        }
        self.append_and_broadcast(envelope, out);
    }

    // ── Tools and gates ───────────────────────────────────────────────────────

    fn on_tool_propose(
        &mut self,
        _sender: &ParticipantId,
        envelope: Envelope,
        proposal: ToolProposal,
        out: &mut RouterOutput,
    ) {
        let session_id = envelope.session.clone();
        let proposal_id = envelope.id.clone();
        let session = self.sessions.get_mut(&session_id).expect("session exists");

        let everyone = session.participants.ids();
        let proposed = session.append(envelope);
        out.deliver(proposed, everyone.clone());

        // The proposal's own flag or the session's category policy can
        // each force a gate.
        let needs_gate = proposal.requires_approval
            || session.config.category_requires_approval(proposal.category);
        if !needs_gate {
            // No gate: authorize execution immediately.
            debug!(proposal = %proposal_id, tool = %proposal.tool_name, "auto-approved");
            let execute = session.append(
                Envelope::from_system(
                    session_id,
                    Payload::ToolExecute {
                        proposal: proposal_id.clone(),
                        agent: proposal.proposing_agent,
                    },
                )
                .with_ref(proposal_id),
            );
            out.deliver(execute, everyone);
            return;
        }

        // Approval path: suggested approvers compose into a `specific`
        // rule; otherwise the session default applies.
        let quorum = if proposal.suggested_approvers.is_empty() {
            session.config.default_gate_quorum.clone()
        } else {
            QuorumRule::Specific {
                participants: proposal.suggested_approvers.clone(),
            }
        };
        let request = huddle_protocol::GateRequest {
            action_type: "tool".to_string(),
            action_ref: proposal_id.clone(),
            quorum,
            timeout_seconds: session.config.gate_timeout_seconds,
            message: proposal.description.clone(),
        };
        let gate = Gate::new(request.clone());

        // A gate nobody can ever satisfy resolves immediately.
        if let GateVerdict::Rejected { reason } = gate.evaluate(&session.participants.infos()) {
            info!(proposal = %proposal_id, %reason, "gate rejected at creation");
            let reject = session.append(
                Envelope::from_system(
                    session_id,
                    Payload::GateReject {
                        proposal: proposal_id.clone(),
                        reason: Some(reason),
                    },
                )
                .with_ref(proposal_id),
            );
            out.deliver(reject, everyone);
            return;
        }

        let timeout_seconds = request.timeout_seconds;
        session.gates.insert(proposal_id.clone(), gate);
        let gate_req = session.append(
            Envelope::from_system(session_id.clone(), Payload::GateRequest { request })
                .with_ref(proposal_id.clone()),
        );
        out.deliver(gate_req, everyone);

        if timeout_seconds > 0 {
            out.gate_timers.push(GateTimer {
                session: session_id,
                proposal: proposal_id,
                after: Duration::from_secs(timeout_seconds),
            });
        }
    }

    fn on_gate_approve(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        proposal: MessageId,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Approve, out) {
            return;
        }
        let session_id = envelope.session.clone();
        let session = self.sessions.get_mut(&session_id).expect("session exists");

        if !session.gates.contains_key(&proposal) {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::InvalidState,
                format!("no pending gate for proposal {proposal}"),
                Some(envelope.id),
            );
            return;
        }
        let infos = session.participants.infos();
        let gate = session.gates.get_mut(&proposal).expect("checked above");
        gate.add_approval(sender.clone());
        let verdict = gate.evaluate(&infos);

        let everyone = session.participants.ids();
        let approve = session.append(envelope);
        out.deliver(approve, everyone.clone());

        match verdict {
            GateVerdict::Approved => {
                session.gates.remove(&proposal);
                let agent = proposing_agent(session, &proposal);
                info!(proposal = %proposal, "gate approved");
                let execute = session.append(
                    Envelope::from_system(
                        session_id,
                        Payload::ToolExecute {
                            proposal: proposal.clone(),
                            agent,
                        },
                    )
                    .with_ref(proposal),
                );
                out.deliver(execute, everyone);
            }
            GateVerdict::Rejected { reason } => {
                // An approval cannot reject a healthy gate, but eligibility
                // may have drained since it opened (approvers left).
                session.gates.remove(&proposal);
                warn!(proposal = %proposal, %reason, "gate unsatisfiable; rejecting");
                let reject = session.append(
                    Envelope::from_system(
                        session_id,
                        Payload::GateReject {
                            proposal: proposal.clone(),
                            reason: Some(reason),
                        },
                    )
                    .with_ref(proposal),
                );
                out.deliver(reject, everyone);
            }
            GateVerdict::Pending { waiting_on } => {
                debug!(proposal = %proposal, %waiting_on, "gate still pending");
            }
        }
    }

    fn on_gate_reject(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        proposal: MessageId,
        reason: Option<String>,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Approve, out) {
            return;
        }
        let session_id = envelope.session.clone();
        let session = self.sessions.get_mut(&session_id).expect("session exists");

        if session.gates.remove(&proposal).is_none() {
            out.error_to(
                sender,
                &session_id,
                ErrorCode::InvalidState,
                format!("no pending gate for proposal {proposal}"),
                Some(envelope.id),
            );
            return;
        }
        info!(proposal = %proposal, participant = %sender, "gate rejected");

        let was_gate_reject = matches!(envelope.payload, Payload::GateReject { .. });
        let everyone = session.participants.ids();
        let inbound = session.append(envelope);
        out.deliver(inbound, everyone.clone());

        // Agents watch `gate.reject`; synthesize one when the rejection
        // arrived in the tool.* dialect.
        if !was_gate_reject {
            let synthesized = session.append(
                Envelope::from_system(
                    session_id,
                    Payload::GateReject {
                        proposal: proposal.clone(),
                        reason,
                    },
                )
                .with_ref(proposal),
            );
            out.deliver(synthesized, everyone);
        }
    }

    /// A gate-expiry timer fired.  No-op when the gate already resolved.
    pub fn handle_gate_timeout(
        &mut self,
        session_id: &SessionId,
        proposal: &MessageId,
    ) -> RouterOutput {
        let mut out = RouterOutput::default();
        let Some(session) = self.sessions.get_mut(session_id) else {
            return out;
        };
        if session.gates.remove(proposal).is_none() {
            return out;
        }
        let resolution = session.config.gate_timeout_resolution;
        info!(proposal = %proposal, ?resolution, "gate timed out");

        let everyone = session.participants.ids();
        let timeout = session.append(
            Envelope::from_system(
                session_id.clone(),
                Payload::GateTimeout {
                    proposal: proposal.clone(),
                    resolution,
                },
            )
            .with_ref(proposal.clone()),
        );
        out.deliver(timeout, everyone.clone());

        if resolution == GateResolution::AutoApproved {
            let agent = proposing_agent(session, proposal);
            let execute = session.append(
                Envelope::from_system(
                    session_id.clone(),
                    Payload::ToolExecute {
                        proposal: proposal.clone(),
                        agent,
                    },
                )
                .with_ref(proposal.clone()),
            );
            out.deliver(execute, everyone);
        }
        out
    }

    // ── Forks ─────────────────────────────────────────────────────────────────

    fn on_fork_create(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        fork: huddle_protocol::ForkId,
        name: String,
        from_message: Option<MessageId>,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Fork, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        if !session.config.allow_forks {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                "forks are disabled for this session",
                Some(envelope.id),
            );
            return;
        }
        if session.forks.contains_key(&fork) {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                format!("fork {fork} already exists"),
                Some(envelope.id),
            );
            return;
        }
        session.forks.insert(
            fork.clone(),
            ForkInfo {
                id: fork,
                name,
                from_message,
                created_at: chrono::Utc::now(),
                merged_into: None,
            },
        );
        self.append_and_broadcast(envelope, out);
    }

    fn on_fork_switch(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        fork: huddle_protocol::ForkId,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Fork, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        if !session.forks.contains_key(&fork) {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                format!("unknown fork {fork}"),
                Some(envelope.id),
            );
            return;
        }
        session.current_fork = Some(fork);
        self.append_and_broadcast(envelope, out);
    }

    fn on_merge(
        &mut self,
        sender: &ParticipantId,
        envelope: Envelope,
        source: huddle_protocol::ForkId,
        target: huddle_protocol::ForkId,
        execute: bool,
        out: &mut RouterOutput,
    ) {
        if self.unauthorized(sender, &envelope, Check::Fork, out) {
            return;
        }
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        if !session.forks.contains_key(&source) || !session.forks.contains_key(&target) {
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::InvalidState,
                "merge requires two existing forks",
                Some(envelope.id),
            );
            return;
        }
        if execute {
            if let Some(info) = session.forks.get_mut(&source) {
                info.merged_into = Some(target.clone());
            }
            session.current_fork = Some(target);
        }
        self.append_and_broadcast(envelope, out);
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    fn on_error(
        &mut self,
        _sender: &ParticipantId,
        envelope: Envelope,
        err: ErrorPayload,
        out: &mut RouterOutput,
    ) {
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");

        // Route to the participant the error concerns when the reference
        // resolves; broadcast otherwise.
        let target = err
            .related_to
            .as_ref()
            .and_then(|id| session.get_by_id(id))
            .map(|related| related.sender.clone())
            .filter(|p| session.participants.contains(p));

        let recipients = match target {
            Some(p) => vec![p],
            None => session.participants.ids(),
        };
        let env = session.append(envelope);
        out.deliver(env, recipients);
    }

    // ── Disconnects, heartbeats, shutdown ─────────────────────────────────────

    /// A transport closed without a leave: synthesize one.
    pub fn handle_disconnect(&mut self, participant: &ParticipantId) -> RouterOutput {
        let mut out = RouterOutput::default();
        let affected: Vec<SessionId> = self
            .sessions
            .ids()
            .into_iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .map(|s| s.participants.contains(participant))
                    .unwrap_or(false)
            })
            .collect();

        for session_id in affected {
            debug!(session = %session_id, %participant, "synthesizing leave for closed connection");
            let leave = Envelope::new(
                session_id,
                participant.clone(),
                Payload::SessionLeave {
                    reason: LeaveReason::Disconnected,
                },
            );
            self.on_leave(participant, leave, &mut out);
        }
        out
    }

    /// One heartbeat sweep for one session: ping everyone, demote the
    /// silent.  Presence transitions broadcast; pings do not.
    pub fn handle_heartbeat_sweep(&mut self, session_id: &SessionId) -> RouterOutput {
        let mut out = RouterOutput::default();
        let Some(session) = self.sessions.get_mut(session_id) else {
            return out;
        };
        let now = chrono::Utc::now();
        session.last_heartbeat_sweep = now;
        let config = session.config.clone();
        let everyone = session.participants.ids();

        let mut transitions = Vec::new();
        for entry in session.participants.iter_mut() {
            let next = entry.presence_for(now, &config);
            if next != entry.presence {
                entry.presence = next;
                transitions.push((entry.info.id.clone(), next));
            }
        }
        for (participant, presence) in transitions {
            debug!(session = %session_id, %participant, ?presence, "presence transition");
            let update = session.append(Envelope::from_system(
                session_id.clone(),
                Payload::PresenceUpdate { participant, presence },
            ));
            out.deliver(update, everyone.clone());
        }

        for participant in everyone {
            out.deliver(
                Envelope::from_system(session_id.clone(), Payload::HeartbeatPing {}),
                vec![participant],
            );
        }
        out
    }

    /// Broker shutdown: every session ends aborted.
    pub fn shutdown(&mut self) -> RouterOutput {
        let mut out = RouterOutput::default();
        for session_id in self.sessions.ids() {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                continue;
            };
            let everyone = session.participants.ids();
            let end = session.append(Envelope::from_system(
                session_id.clone(),
                Payload::SessionEnd {
                    reason: "server shutdown".to_string(),
                    final_state: SessionEndState::Aborted,
                },
            ));
            out.deliver(end, everyone);
            self.sessions.remove(&session_id);
        }
        out
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn append_and_broadcast(&mut self, envelope: Envelope, out: &mut RouterOutput) {
        let session = self
            .sessions
            .get_mut(&envelope.session)
            .expect("session exists");
        let everyone = session.participants.ids();
        let env = session.append(envelope);
        out.deliver(env, everyone);
    }

    /// Returns `true` (and answers the sender with UNAUTHORIZED) when the
    /// sender lacks the role/capability the operation requires.
    fn unauthorized(
        &mut self,
        sender: &ParticipantId,
        envelope: &Envelope,
        check: Check,
        out: &mut RouterOutput,
    ) -> bool {
        let session = self.sessions.get(&envelope.session).expect("session exists");
        let Some(entry) = session.participants.get(sender) else {
            // Membership was verified earlier; defensive fallthrough.
            return false;
        };
        let info = &entry.info;
        let allowed = match check {
            Check::Prompt => info.has_capability(Capability::Prompt),
            Check::Approve => info.can_approve(),
            Check::AddContext => info.has_capability(Capability::AddContext),
            Check::Interrupt => info.has_capability(Capability::Interrupt),
            Check::Fork => info.has_capability(Capability::Fork),
            Check::EndSession => {
                info.has_role(Role::Admin) || info.has_capability(Capability::EndSession)
            }
            Check::ManageParticipants => {
                info.has_role(Role::Admin)
                    || info.has_capability(Capability::ManageParticipants)
            }
            Check::Admin => info.has_role(Role::Admin),
        };
        if !allowed {
            warn!(
                participant = %sender,
                ty = envelope.type_name(),
                "unauthorized; audit"
            );
            out.error_to(
                sender,
                &envelope.session,
                ErrorCode::Unauthorized,
                format!("{} requires {}", envelope.type_name(), check.describe()),
                Some(envelope.id.clone()),
            );
        }
        !allowed
    }
}

#[derive(Debug, Clone, Copy)]
enum Check {
    Prompt,
    Approve,
    AddContext,
    Interrupt,
    Fork,
    EndSession,
    ManageParticipants,
    Admin,
}

impl Check {
    fn describe(self) -> &'static str {
        match self {
            Check::Prompt => "the `prompt` capability",
            Check::Approve => "the `approve` capability or the `approver` role",
            Check::AddContext => "the `add_context` capability",
            Check::Interrupt => "the `interrupt` capability",
            Check::Fork => "the `fork` capability",
            Check::EndSession => "the `admin` role or `end_session` capability",
            Check::ManageParticipants => "the `admin` role or `manage_participants` capability",
            Check::Admin => "the `admin` role",
        }
    }
}

/// Audience for a context event: the whitelist when present (sender always
/// included), everyone otherwise.
fn visibility_audience(
    visible_to: &[ParticipantId],
    sender: &ParticipantId,
    session: &crate::session::Session,
) -> Vec<ParticipantId> {
    if visible_to.is_empty() {
        session.participants.ids()
    } else {
        let mut audience: Vec<ParticipantId> = visible_to
            .iter()
            .filter(|p| session.participants.contains(p))
            .cloned()
            .collect();
        if !audience.contains(sender) && session.participants.contains(sender) {
            audience.push(sender.clone());
        }
        audience
    }
}

/// The agent a `tool.execute` should be addressed to: the proposal's
/// declared agent, falling back to the proposal envelope's sender.
fn proposing_agent(session: &crate::session::Session, proposal: &MessageId) -> ParticipantId {
    session
        .get_by_id(proposal)
        .map(|env| match &env.payload {
            Payload::ToolPropose { proposal } => proposal.proposing_agent.clone(),
            _ => env.sender.clone(),
        })
        .unwrap_or_else(ParticipantId::system)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
