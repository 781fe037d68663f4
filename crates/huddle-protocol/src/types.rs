// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{MessageId, ParticipantId};

// ─── Participants ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Human,
    Agent,
}

/// Session roles.  Roles describe *who a participant is* in the session;
/// capabilities (below) describe *what they may do*.  Authorization checks
/// accept either side: e.g. gate approval requires role `approver` OR
/// capability `approve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Navigator,
    Adversary,
    Observer,
    Approver,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Prompt,
    Approve,
    Interrupt,
    Fork,
    AddContext,
    ManageParticipants,
    EndSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Active,
    Idle,
    Away,
    Disconnected,
}

/// Static identity of a participant, carried by `session.join` and
/// `participant.announce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub id: ParticipantId,
    pub name: String,
    #[serde(rename = "type")]
    pub participant_type: ParticipantType,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Transport label for diagnostics ("websocket", "loopback", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ParticipantInfo {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Eligible to vote on gates: role `approver` or capability `approve`.
    pub fn can_approve(&self) -> bool {
        self.has_role(Role::Approver) || self.has_capability(Capability::Approve)
    }
}

// ─── Context ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    File,
    Reference,
    Structured,
    Image,
    AudioTranscript,
}

/// Hashed reference to context content: SHA-256 over canonical JSON for
/// structured content, raw bytes for text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRef {
    pub hash: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

/// A keyed piece of shared session state.
///
/// `visible_to` is a whitelist of participant ids; an empty list means the
/// item is visible to every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub key: String,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<ContentRef>,
    #[serde(default)]
    pub visible_to: Vec<ParticipantId>,
    pub added_by: ParticipantId,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextItem {
    /// Whether `participant` may see this item.
    pub fn is_visible_to(&self, participant: &ParticipantId) -> bool {
        self.visible_to.is_empty() || self.visible_to.contains(participant)
    }
}

// ─── Tools and gates ──────────────────────────────────────────────────────────

/// Closed set of tool action categories used by approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    FileRead,
    FileWrite,
    FileDelete,
    ShellExecute,
    NetworkRequest,
    Deploy,
    Database,
    SecretAccess,
    ExternalApi,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

/// An agent's request to run a tool.  The proposal id is the id of the
/// `tool.propose` envelope that carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProposal {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub proposing_agent: ParticipantId,
    pub category: ToolCategory,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    pub description: String,
    /// Approvers suggested by the proposer; when present the broker gates
    /// on exactly these participants (`specific` quorum).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_approvers: Vec<ParticipantId>,
}

/// Rule that decides when a gate is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuorumRule {
    /// At least `count` approvals from any eligible approver.
    Any { count: usize },
    /// Every eligible approver must approve.
    All,
    /// `count` approvals from participants carrying `role`.
    Role { role: Role, count: usize },
    /// All listed participants must approve.
    Specific { participants: Vec<ParticipantId> },
    /// Strictly more than half of eligible approvers.
    Majority,
}

/// Payload of a `gate.request`: what is being gated and under which rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRequest {
    /// What kind of action is gated ("tool", "config_update", ...).
    pub action_type: String,
    /// The proposal envelope this gate protects.
    pub action_ref: MessageId,
    pub quorum: QuorumRule,
    /// 0 = no timeout; the gate stays open until resolved.
    pub timeout_seconds: u64,
    pub message: String,
}

/// How an expired gate resolves.  The broker always emits `gate.timeout`
/// with the session's configured resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResolution {
    Rejected,
    AutoApproved,
    Escalated,
}

// ─── Turn and interrupt enums ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Complete,
    ToolUse,
    Interrupted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptUrgency {
    Normal,
    Emergency,
}

/// What an agent actually did in response to an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptAction {
    Paused,
    Stopped,
    Acknowledged,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveReason {
    Normal,
    Disconnected,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEndState {
    Completed,
    Aborted,
}

// ─── Session configuration (wire-visible) ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderingMode {
    /// Envelopes may carry `causal_refs`; consumers reconstruct a partial order.
    Causal,
    /// The broker assigns a strictly increasing, contiguous `seq` per session.
    Total,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantTimeoutPolicy {
    Wait,
    Skip,
    PauseSession,
}

/// Per-session options, carried by `session.create` and
/// `session.config_update`.
///
/// The defaults are the permissive demo configuration: `any 1` quorum with
/// no categories requiring approval means most sessions auto-approve
/// everything.  Deployments that want real gating list categories in
/// `require_approval_for`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub require_approval_for: Vec<ToolCategory>,
    #[serde(default = "default_quorum")]
    pub default_gate_quorum: QuorumRule,
    #[serde(default = "default_true")]
    pub allow_forks: bool,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default = "default_ordering_mode")]
    pub ordering_mode: OrderingMode,
    #[serde(default = "default_timeout_policy")]
    pub on_participant_timeout: ParticipantTimeoutPolicy,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_away_timeout")]
    pub away_timeout_seconds: u64,
    /// Timer armed on every gate this session opens.  0 leaves gates open
    /// indefinitely until someone votes.
    #[serde(default)]
    pub gate_timeout_seconds: u64,
    /// How gates resolve when their timer fires.
    #[serde(default = "default_gate_timeout_resolution")]
    pub gate_timeout_resolution: GateResolution,
}

fn default_quorum() -> QuorumRule {
    QuorumRule::Any { count: 1 }
}
fn default_true() -> bool {
    true
}
fn default_max_participants() -> usize {
    10
}
fn default_ordering_mode() -> OrderingMode {
    OrderingMode::Causal
}
fn default_timeout_policy() -> ParticipantTimeoutPolicy {
    ParticipantTimeoutPolicy::Wait
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    120
}
fn default_away_timeout() -> u64 {
    600
}
fn default_gate_timeout_resolution() -> GateResolution {
    GateResolution::Rejected
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            require_approval_for: Vec::new(),
            default_gate_quorum: default_quorum(),
            allow_forks: true,
            max_participants: default_max_participants(),
            ordering_mode: default_ordering_mode(),
            on_participant_timeout: default_timeout_policy(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            idle_timeout_seconds: default_idle_timeout(),
            away_timeout_seconds: default_away_timeout(),
            gate_timeout_seconds: 0,
            gate_timeout_resolution: default_gate_timeout_resolution(),
        }
    }
}

impl SessionConfig {
    /// Whether a proposal in `category` needs a gate under this config.
    pub fn category_requires_approval(&self, category: ToolCategory) -> bool {
        self.require_approval_for.contains(&category)
            || self.require_approval_for.contains(&ToolCategory::All)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_visibility_means_visible_to_all() {
        let item = ContextItem {
            key: "readme".into(),
            content_type: ContentType::Text,
            content: Some(serde_json::Value::String("hi".into())),
            content_ref: None,
            visible_to: vec![],
            added_by: ParticipantId::from("p1"),
            added_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(item.is_visible_to(&ParticipantId::from("anyone")));
    }

    #[test]
    fn whitelist_visibility_excludes_others() {
        let item = ContextItem {
            key: "secret-notes".into(),
            content_type: ContentType::Text,
            content: None,
            content_ref: None,
            visible_to: vec![ParticipantId::from("p1")],
            added_by: ParticipantId::from("p1"),
            added_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(item.is_visible_to(&ParticipantId::from("p1")));
        assert!(!item.is_visible_to(&ParticipantId::from("p2")));
    }

    #[test]
    fn approver_role_grants_approval_eligibility() {
        let p = ParticipantInfo {
            id: ParticipantId::from("p1"),
            name: "alice".into(),
            participant_type: ParticipantType::Human,
            roles: vec![Role::Approver],
            capabilities: vec![],
            transport: None,
            metadata: None,
        };
        assert!(p.can_approve());
    }

    #[test]
    fn approve_capability_grants_approval_eligibility() {
        let p = ParticipantInfo {
            id: ParticipantId::from("p1"),
            name: "bob".into(),
            participant_type: ParticipantType::Human,
            roles: vec![Role::Observer],
            capabilities: vec![Capability::Approve],
            transport: None,
            metadata: None,
        };
        assert!(p.can_approve());
    }

    #[test]
    fn observer_without_capability_cannot_approve() {
        let p = ParticipantInfo {
            id: ParticipantId::from("p1"),
            name: "carol".into(),
            participant_type: ParticipantType::Human,
            roles: vec![Role::Observer],
            capabilities: vec![Capability::Prompt],
            transport: None,
            metadata: None,
        };
        assert!(!p.can_approve());
    }

    #[test]
    fn default_config_is_the_permissive_demo_default() {
        let cfg = SessionConfig::default();
        assert!(cfg.require_approval_for.is_empty());
        assert_eq!(cfg.default_gate_quorum, QuorumRule::Any { count: 1 });
        assert_eq!(cfg.gate_timeout_resolution, GateResolution::Rejected);
        assert_eq!(cfg.ordering_mode, OrderingMode::Causal);
    }

    #[test]
    fn category_all_requires_approval_for_everything() {
        let cfg = SessionConfig {
            require_approval_for: vec![ToolCategory::All],
            ..SessionConfig::default()
        };
        assert!(cfg.category_requires_approval(ToolCategory::FileRead));
        assert!(cfg.category_requires_approval(ToolCategory::Deploy));
    }

    #[test]
    fn quorum_rule_serializes_with_type_tag() {
        let json = serde_json::to_string(&QuorumRule::Any { count: 2 }).unwrap();
        assert!(json.contains("\"type\":\"any\""), "{json}");
        let json = serde_json::to_string(&QuorumRule::Majority).unwrap();
        assert!(json.contains("\"type\":\"majority\""), "{json}");
    }

    #[test]
    fn risk_levels_order_by_severity() {
        assert!(RiskLevel::Safe < RiskLevel::Low);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn session_config_round_trips_through_yaml_style_json() {
        let cfg = SessionConfig {
            require_approval_for: vec![ToolCategory::ShellExecute, ToolCategory::FileWrite],
            default_gate_quorum: QuorumRule::Role {
                role: Role::Approver,
                count: 2,
            },
            ordering_mode: OrderingMode::Total,
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
