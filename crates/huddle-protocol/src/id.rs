// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Declare a typed id wrapper over a ULID string.
///
/// All externally visible ids share the same shape: 48-bit millisecond
/// timestamp + 80 random bits, Crockford base32.  They sort
/// lexicographically in creation order, which the event log relies on for
/// cheap "is this older than that" comparisons without parsing.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Mint a fresh id with the current wall-clock timestamp.
            pub fn generate() -> Self {
                Self(Ulid::new().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(
    /// Unique id of a single protocol envelope.
    MessageId
);
id_type!(
    /// Id of a session (one shared event log, context table, gate table).
    SessionId
);
id_type!(
    /// Id of a fork (named branch of a session's event stream).
    ForkId
);

/// Id of a participant within a session.
///
/// Participant ids are normally ULIDs minted by the joining client, but the
/// broker itself speaks as the reserved literal `system` when it
/// synthesizes events (disconnect leaves, gate timeouts, shutdown).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub const SYSTEM: &'static str = "system";

    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// The reserved broker identity.
    pub fn system() -> Self {
        Self(Self::SYSTEM.to_string())
    }

    pub fn is_system(&self) -> bool {
        self.0 == Self::SYSTEM
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
