// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Broker configuration: YAML files, deep-merged in layers.
//!
//! Search order (later overrides earlier):
//! 1. `/etc/huddle/broker.yaml`
//! 2. `~/.config/huddle/broker.yaml`
//! 3. `.huddle/broker.yaml` (workspace-local)
//! 4. Path given to [`load`] explicitly (`--config`).
//!
//! All defaults produce a runnable loopback broker with the permissive
//! demo gating (see [`huddle_protocol::SessionConfig`]).

pub mod loader;
pub mod schema;

pub use loader::load;
pub use schema::{BridgeConfig, BrokerConfig};
