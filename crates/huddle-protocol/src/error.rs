// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::id::MessageId;

/// Closed set of error codes carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    Unauthorized,
    SessionNotFound,
    ParticipantNotFound,
    GateFailed,
    Timeout,
    RateLimited,
    ContextTooLarge,
    InvalidState,
    TransportError,
    AgentError,
    InternalError,
}

/// Payload of an `error` envelope.
///
/// Gate outcomes and tool failures are NOT errors — they travel as
/// `gate.reject` / `gate.timeout` / `tool.result` events.  Error envelopes
/// are reserved for protocol violations, authorization failures, agent-side
/// provider failures, and internal bugs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    /// `false` only for internal bugs; everything else may be retried.
    pub recoverable: bool,
    /// The inbound message this error responds to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_to: Option<MessageId>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: !matches!(code, ErrorCode::InternalError),
            related_to: None,
        }
    }

    pub fn related_to(mut self, id: MessageId) -> Self {
        self.related_to = Some(id);
        self
    }
}

/// Failures while framing or decoding envelopes off the wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u32),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::InvalidMessage).unwrap();
        assert_eq!(json, "\"INVALID_MESSAGE\"");
        let json = serde_json::to_string(&ErrorCode::AgentError).unwrap();
        assert_eq!(json, "\"AGENT_ERROR\"");
    }

    #[test]
    fn internal_error_defaults_to_unrecoverable() {
        let e = ErrorPayload::new(ErrorCode::InternalError, "bug");
        assert!(!e.recoverable);
    }

    #[test]
    fn protocol_errors_default_to_recoverable() {
        let e = ErrorPayload::new(ErrorCode::InvalidMessage, "bad frame");
        assert!(e.recoverable);
    }

    #[test]
    fn related_to_is_omitted_when_absent() {
        let e = ErrorPayload::new(ErrorCode::Unauthorized, "nope");
        let json = serde_json::to_string(&e).unwrap();
        assert!(!json.contains("related_to"), "{json}");
    }
}
