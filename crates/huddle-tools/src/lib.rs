// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The tool-execution substrate.
//!
//! Three layers, each usable on its own:
//!
//! 1. [`classify`] — pure risk classification of shell command strings
//!    over an immutable, priority-ordered pattern table.
//! 2. [`exec`] — streamed subprocess execution with timeout and per-stream
//!    output caps; [`snapshot`] — filesystem-change detection around tool
//!    runs.
//! 3. [`Tool`] / [`ToolRegistry`] — the interface agents use to expose
//!    built-in and external tools to the model, including the per-call
//!    classification that drives proposals and approval gating.

pub mod classify;
pub mod exec;
pub mod registry;
pub mod shell;
pub mod snapshot;
pub mod tool;

pub use classify::{classify, CommandCategory, CommandClass};
pub use exec::{run_streamed, ExecChunk, ExecOutcome, ExecRequest};
pub use registry::{ToolRegistry, ToolSchema, ToolTrust};
pub use shell::ShellTool;
pub use snapshot::{diff, snapshot, ChangeKind, DirSnapshot, FileChange};
pub use tool::{ProposalSpec, StreamSink, Tool, ToolCall, ToolOutput, ToolStreamChunk};
