// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use huddle_protocol::SessionConfig;

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9170
}

/// Top-level broker configuration.
///
/// ```yaml
/// host: 127.0.0.1
/// port: 9170
/// bridge:
///   host: 127.0.0.1
///   port: 7411
/// session:
///   require_approval_for: [shell_execute, file_write]
///   default_gate_quorum: { type: any, count: 1 }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Interface to listen on.  Default: loopback only.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Decision-tracking daemon reached through the `/bridge/*` reverse
    /// proxy.  `None` makes the proxy answer 503.
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
    /// Defaults applied to sessions that are auto-created on join.
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bridge: None,
            session: SessionConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
}

impl BridgeConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
