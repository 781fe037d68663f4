// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::id::{ForkId, MessageId, ParticipantId, SessionId};
use crate::payload::Payload;

/// Current schema generation.  `session.join` carries the set of versions
/// the client speaks; the broker rejects joins whose sets do not intersect
/// [`SUPPORTED_VERSIONS`].
pub const PROTOCOL_VERSION: u32 = 1;
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// The common record wrapping every protocol event.
///
/// Wire format is one newline-framed UTF-8 JSON object per envelope.  The
/// payload discriminator (`type`) and body (`payload`) are flattened into
/// the envelope object; see [`Payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub session: SessionId,
    pub sender: ParticipantId,
    #[serde(flatten)]
    pub payload: Payload,
    /// Earlier message in the same session this one responds to.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// Monotone per-session sequence number, assigned by the broker in
    /// `total` ordering mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Causal predecessors, populated in `causal` ordering mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causal_refs: Vec<MessageId>,
    /// Branch this envelope is scoped to; absent means the session trunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork: Option<ForkId>,
}

impl Envelope {
    /// Construct an envelope with a fresh id and the current timestamp.
    ///
    /// The timestamp is truncated to millisecond precision so that a
    /// serialize/deserialize round trip yields an equal structure (RFC 3339
    /// carries exactly three fractional digits on the wire).
    pub fn new(session: SessionId, sender: ParticipantId, payload: Payload) -> Self {
        let now = Utc::now();
        let millis = now
            .to_rfc3339_opts(SecondsFormat::Millis, true)
            .parse()
            .unwrap_or(now);
        Self {
            version: PROTOCOL_VERSION,
            id: MessageId::generate(),
            timestamp: millis,
            session,
            sender,
            payload,
            reply_to: None,
            seq: None,
            causal_refs: Vec::new(),
            fork: None,
        }
    }

    /// Envelope sent by the broker itself.
    pub fn from_system(session: SessionId, payload: Payload) -> Self {
        Self::new(session, ParticipantId::system(), payload)
    }

    pub fn with_ref(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_fork(mut self, fork: ForkId) -> Self {
        self.fork = Some(fork);
        self
    }

    pub fn with_causal_refs(mut self, refs: Vec<MessageId>) -> Self {
        self.causal_refs = refs;
        self
    }

    /// The wire discriminator of the payload.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// Serialize to a single newline-terminated JSON frame.
    pub fn to_frame(&self) -> Result<String, ProtocolError> {
        let mut frame = serde_json::to_string(self)?;
        frame.push('\n');
        Ok(frame)
    }

    /// Parse one frame.  Distinguishes an unknown `type` (a client speaking
    /// a newer dialect) from a structurally malformed envelope so the
    /// router can phrase the error usefully.
    pub fn from_frame(frame: &str) -> Result<Self, ProtocolError> {
        let trimmed = frame.trim_end_matches('\n');
        match serde_json::from_str::<Envelope>(trimmed) {
            Ok(env) => Ok(env),
            Err(e) => {
                if let Ok(raw) = serde_json::from_str::<serde_json::Value>(trimmed) {
                    if let Some(ty) = raw.get("type").and_then(|t| t.as_str()) {
                        if !Payload::known_types().contains(&ty) {
                            return Err(ProtocolError::UnknownType(ty.to_string()));
                        }
                    }
                }
                Err(ProtocolError::Malformed(e))
            }
        }
    }
}

/// True when the peer's advertised versions intersect ours.
pub fn versions_compatible(supported: &[u32]) -> bool {
    supported.iter().any(|v| SUPPORTED_VERSIONS.contains(v))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
