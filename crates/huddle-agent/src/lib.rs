// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent side of a huddle session: a WebSocket client with reconnect,
//! the single-active tool batch, and the orchestration loop that turns
//! prompts into completions, proposals, and batched tool results.

pub mod agent;
pub mod batch;
pub mod client;

pub use agent::Agent;
pub use batch::{BatchManager, CompletedBatch, EntryStatus, ToolResultRecord};
pub use client::BrokerClient;
