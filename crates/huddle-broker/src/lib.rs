// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The session broker.
//!
//! Humans and agents connect over WebSocket (or an in-process loopback in
//! tests), join sessions, and exchange typed envelopes.  The broker owns
//! the per-session event log, the participant/presence tables, the shared
//! context store, and the approval gates in front of tool execution.  All
//! state mutation funnels through [`router::Router`] under the single
//! event loop in [`broker::Broker`].

pub mod bridge;
pub mod broker;
pub mod context;
pub mod gate;
pub mod heartbeat;
pub mod http;
pub mod participant;
pub mod router;
pub mod session;
pub mod transport;

pub use broker::{Broker, BrokerEvent, BrokerHandle};
pub use context::ContextStore;
pub use gate::{Gate, GateVerdict};
pub use http::{app, serve, AppState};
pub use participant::{ParticipantEntry, ParticipantTable};
pub use router::{GateTimer, Outbound, Router, RouterOutput};
pub use session::{ForkInfo, Session, SessionRegistry};
pub use transport::{ConnectionHandle, ConnectionRegistry};
