// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Wire protocol for huddle sessions.
//!
//! Every event in a session is an [`Envelope`]: a typed record with a
//! sortable id, an RFC 3339 timestamp, a sender, and one of the closed set
//! of [`Payload`] variants.  Envelopes travel as newline-framed UTF-8 JSON
//! over a bidirectional transport (WebSocket in production, an in-process
//! channel in tests).
//!
//! The crate is deliberately free of broker or agent logic: it defines the
//! shapes both sides agree on and nothing else.

pub mod envelope;
pub mod error;
pub mod id;
pub mod payload;
pub mod types;

pub use envelope::{versions_compatible, Envelope, PROTOCOL_VERSION, SUPPORTED_VERSIONS};
pub use error::{ErrorCode, ErrorPayload, ProtocolError};
pub use id::{ForkId, MessageId, ParticipantId, SessionId};
pub use payload::Payload;
pub use types::{
    Capability, ContentRef, ContentType, ContextItem, FinishReason, GateRequest, GateResolution,
    InterruptAction, InterruptUrgency, LeaveReason, OrderingMode, OutputStream, ParticipantInfo,
    ParticipantTimeoutPolicy, ParticipantType, Presence, QuorumRule, RiskLevel, Role,
    SessionConfig, SessionEndState, ToolCategory, ToolProposal,
};
