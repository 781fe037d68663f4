// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The closed set of protocol message payloads.
//!
//! Every envelope carries exactly one [`Payload`] variant.  On the wire the
//! discriminator is the `type` field and the variant body is the `payload`
//! field, flattened into the envelope object:
//!
//! ```json
//! {
//!   "version": 1,
//!   "id": "01J...",
//!   "type": "prompt.submit",
//!   "payload": { "content": "list the files", "target": "01J..." },
//!   ...
//! }
//! ```
//!
//! Adding a variant here is a protocol change; bump
//! [`crate::envelope::PROTOCOL_VERSION`] when the change is not
//! backward-compatible.

use serde::{Deserialize, Serialize};

use crate::error::ErrorPayload;
use crate::id::{ForkId, MessageId, ParticipantId};
use crate::types::{
    ContentType, ContextItem, FinishReason, GateRequest, GateResolution, InterruptAction,
    InterruptUrgency, LeaveReason, OutputStream, ParticipantInfo, Presence, Role, SessionConfig,
    SessionEndState, ToolProposal,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Payload {
    // ── Session lifecycle ─────────────────────────────────────────────────────
    #[serde(rename = "session.create")]
    SessionCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        config: SessionConfig,
    },
    #[serde(rename = "session.join")]
    SessionJoin {
        participant: ParticipantInfo,
        supported_versions: Vec<u32>,
    },
    #[serde(rename = "session.leave")]
    SessionLeave { reason: LeaveReason },
    #[serde(rename = "session.end")]
    SessionEnd {
        reason: String,
        final_state: SessionEndState,
    },
    #[serde(rename = "session.config_update")]
    SessionConfigUpdate { config: SessionConfig },

    // ── Participants and presence ─────────────────────────────────────────────
    #[serde(rename = "participant.announce")]
    ParticipantAnnounce { participant: ParticipantInfo },
    #[serde(rename = "participant.role_change")]
    ParticipantRoleChange {
        participant: ParticipantId,
        roles: Vec<Role>,
    },
    #[serde(rename = "heartbeat.ping")]
    HeartbeatPing {},
    #[serde(rename = "heartbeat.pong")]
    HeartbeatPong {},
    #[serde(rename = "presence.update")]
    PresenceUpdate {
        participant: ParticipantId,
        presence: Presence,
    },

    // ── Context and secrets ───────────────────────────────────────────────────
    #[serde(rename = "context.add")]
    ContextAdd { item: ContextItem },
    #[serde(rename = "context.update")]
    ContextUpdate {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<ContentType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visible_to: Option<Vec<ParticipantId>>,
    },
    #[serde(rename = "context.remove")]
    ContextRemove { key: String },
    #[serde(rename = "secret.share")]
    SecretShare {
        key: String,
        value: String,
        recipients: Vec<ParticipantId>,
    },
    #[serde(rename = "secret.revoke")]
    SecretRevoke { key: String },

    // ── Prompts ───────────────────────────────────────────────────────────────
    #[serde(rename = "prompt.draft")]
    PromptDraft {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    #[serde(rename = "prompt.submit")]
    PromptSubmit {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
    },
    /// Replaces the content of the draft/submit referenced by the
    /// envelope's `ref`.
    #[serde(rename = "prompt.amend")]
    PromptAmend { content: String },

    // ── Model turn streaming ──────────────────────────────────────────────────
    #[serde(rename = "thinking.start")]
    ThinkingStart {},
    #[serde(rename = "thinking.chunk")]
    ThinkingChunk { content: String },
    #[serde(rename = "thinking.end")]
    ThinkingEnd {},
    #[serde(rename = "response.start")]
    ResponseStart {},
    #[serde(rename = "response.chunk")]
    ResponseChunk { content: String },
    #[serde(rename = "response.end")]
    ResponseEnd { finish_reason: FinishReason },

    // ── Tools ─────────────────────────────────────────────────────────────────
    #[serde(rename = "tool.propose")]
    ToolPropose { proposal: ToolProposal },
    /// Alias for `gate.approve` kept for clients that speak the tool-first
    /// dialect; routed identically.
    #[serde(rename = "tool.approve")]
    ToolApprove { proposal: MessageId },
    #[serde(rename = "tool.reject")]
    ToolReject {
        proposal: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Authorization to run: emitted by the broker once a gate approves
    /// (or immediately when no approval is required).
    #[serde(rename = "tool.execute")]
    ToolExecute {
        proposal: MessageId,
        agent: ParticipantId,
    },
    #[serde(rename = "tool.output")]
    ToolOutput {
        proposal: MessageId,
        stream: OutputStream,
        data: String,
    },
    #[serde(rename = "tool.result")]
    ToolResult {
        proposal: MessageId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── Gates ─────────────────────────────────────────────────────────────────
    #[serde(rename = "gate.request")]
    GateRequest { request: GateRequest },
    #[serde(rename = "gate.approve")]
    GateApprove { proposal: MessageId },
    #[serde(rename = "gate.reject")]
    GateReject {
        proposal: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "gate.timeout")]
    GateTimeout {
        proposal: MessageId,
        resolution: GateResolution,
    },

    // ── Interrupts ────────────────────────────────────────────────────────────
    #[serde(rename = "interrupt.raise")]
    InterruptRaise {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ParticipantId>,
        urgency: InterruptUrgency,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "interrupt.acknowledge")]
    InterruptAcknowledge {
        interrupt: MessageId,
        action_taken: InterruptAction,
    },

    // ── Forks and merges ──────────────────────────────────────────────────────
    #[serde(rename = "fork.create")]
    ForkCreate {
        fork: ForkId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_message: Option<MessageId>,
    },
    #[serde(rename = "fork.switch")]
    ForkSwitch { fork: ForkId },
    #[serde(rename = "merge.propose")]
    MergePropose { source: ForkId, target: ForkId },
    #[serde(rename = "merge.execute")]
    MergeExecute { source: ForkId, target: ForkId },

    // ── Errors ────────────────────────────────────────────────────────────────
    #[serde(rename = "error")]
    Error(ErrorPayload),
}

impl Payload {
    /// The wire discriminator for this payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::SessionCreate { .. } => "session.create",
            Payload::SessionJoin { .. } => "session.join",
            Payload::SessionLeave { .. } => "session.leave",
            Payload::SessionEnd { .. } => "session.end",
            Payload::SessionConfigUpdate { .. } => "session.config_update",
            Payload::ParticipantAnnounce { .. } => "participant.announce",
            Payload::ParticipantRoleChange { .. } => "participant.role_change",
            Payload::HeartbeatPing {} => "heartbeat.ping",
            Payload::HeartbeatPong {} => "heartbeat.pong",
            Payload::PresenceUpdate { .. } => "presence.update",
            Payload::ContextAdd { .. } => "context.add",
            Payload::ContextUpdate { .. } => "context.update",
            Payload::ContextRemove { .. } => "context.remove",
            Payload::SecretShare { .. } => "secret.share",
            Payload::SecretRevoke { .. } => "secret.revoke",
            Payload::PromptDraft { .. } => "prompt.draft",
            Payload::PromptSubmit { .. } => "prompt.submit",
            Payload::PromptAmend { .. } => "prompt.amend",
            Payload::ThinkingStart {} => "thinking.start",
            Payload::ThinkingChunk { .. } => "thinking.chunk",
            Payload::ThinkingEnd {} => "thinking.end",
            Payload::ResponseStart {} => "response.start",
            Payload::ResponseChunk { .. } => "response.chunk",
            Payload::ResponseEnd { .. } => "response.end",
            Payload::ToolPropose { .. } => "tool.propose",
            Payload::ToolApprove { .. } => "tool.approve",
            Payload::ToolReject { .. } => "tool.reject",
            Payload::ToolExecute { .. } => "tool.execute",
            Payload::ToolOutput { .. } => "tool.output",
            Payload::ToolResult { .. } => "tool.result",
            Payload::GateRequest { .. } => "gate.request",
            Payload::GateApprove { .. } => "gate.approve",
            Payload::GateReject { .. } => "gate.reject",
            Payload::GateTimeout { .. } => "gate.timeout",
            Payload::InterruptRaise { .. } => "interrupt.raise",
            Payload::InterruptAcknowledge { .. } => "interrupt.acknowledge",
            Payload::ForkCreate { .. } => "fork.create",
            Payload::ForkSwitch { .. } => "fork.switch",
            Payload::MergePropose { .. } => "merge.propose",
            Payload::MergeExecute { .. } => "merge.execute",
            Payload::Error(_) => "error",
        }
    }

    /// All wire discriminators, in declaration order.  Used to tell an
    /// unknown `type` apart from a merely malformed payload body.
    pub fn known_types() -> &'static [&'static str] {
        &[
            "session.create",
            "session.join",
            "session.leave",
            "session.end",
            "session.config_update",
            "participant.announce",
            "participant.role_change",
            "heartbeat.ping",
            "heartbeat.pong",
            "presence.update",
            "context.add",
            "context.update",
            "context.remove",
            "secret.share",
            "secret.revoke",
            "prompt.draft",
            "prompt.submit",
            "prompt.amend",
            "thinking.start",
            "thinking.chunk",
            "thinking.end",
            "response.start",
            "response.chunk",
            "response.end",
            "tool.propose",
            "tool.approve",
            "tool.reject",
            "tool.execute",
            "tool.output",
            "tool.result",
            "gate.request",
            "gate.approve",
            "gate.reject",
            "gate.timeout",
            "interrupt.raise",
            "interrupt.acknowledge",
            "fork.create",
            "fork.switch",
            "merge.propose",
            "merge.execute",
            "error",
        ]
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParticipantType, QuorumRule};

    #[test]
    fn type_name_matches_serialized_tag() {
        let p = Payload::PromptSubmit {
            content: "hi".into(),
            target: None,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["type"], p.type_name());
    }

    #[test]
    fn empty_payload_variants_serialize_with_empty_object() {
        let json = serde_json::to_value(&Payload::HeartbeatPing {}).unwrap();
        assert_eq!(json["type"], "heartbeat.ping");
        assert_eq!(json["payload"], serde_json::json!({}));
    }

    #[test]
    fn every_type_name_is_in_known_types() {
        // Spot-check a spread of variants across the families.
        for p in [
            Payload::SessionLeave {
                reason: LeaveReason::Normal,
            },
            Payload::PresenceUpdate {
                participant: ParticipantId::from("p1"),
                presence: Presence::Away,
            },
            Payload::ResponseEnd {
                finish_reason: FinishReason::ToolUse,
            },
            Payload::GateTimeout {
                proposal: MessageId::from("m1"),
                resolution: GateResolution::Rejected,
            },
            Payload::Error(ErrorPayload::new(
                crate::error::ErrorCode::InvalidState,
                "x",
            )),
        ] {
            assert!(
                Payload::known_types().contains(&p.type_name()),
                "{} missing from known_types",
                p.type_name()
            );
        }
    }

    #[test]
    fn known_types_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for t in Payload::known_types() {
            assert!(seen.insert(t), "duplicate type: {t}");
        }
        assert_eq!(seen.len(), 41);
    }

    #[test]
    fn session_join_round_trips() {
        let p = Payload::SessionJoin {
            participant: ParticipantInfo {
                id: ParticipantId::from("p1"),
                name: "alice".into(),
                participant_type: ParticipantType::Human,
                roles: vec![Role::Driver],
                capabilities: vec![],
                transport: Some("websocket".into()),
                metadata: None,
            },
            supported_versions: vec![1],
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn gate_request_round_trips() {
        let p = Payload::GateRequest {
            request: GateRequest {
                action_type: "tool".into(),
                action_ref: MessageId::from("m1"),
                quorum: QuorumRule::Specific {
                    participants: vec![ParticipantId::from("p1"), ParticipantId::from("p2")],
                },
                timeout_seconds: 120,
                message: "approve `npm install lodash`?".into(),
            },
        };
        let json = serde_json::to_string(&p).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn unknown_type_fails_to_deserialize() {
        let json = r#"{"type":"session.explode","payload":{}}"#;
        assert!(serde_json::from_str::<Payload>(json).is_err());
    }
}
