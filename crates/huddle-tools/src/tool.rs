// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use huddle_protocol::{OutputStream, RiskLevel, ToolCategory};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// Subprocess exit code, when the tool ran one.
    pub exit_code: Option<i32>,
    /// If true, the tool execution failed non-fatally (message in `content`).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            exit_code: None,
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            exit_code: None,
            is_error: true,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

/// A chunk of live tool output, forwarded to the session as `tool.output`
/// while the tool is still running.
#[derive(Debug, Clone)]
pub struct ToolStreamChunk {
    pub call_id: String,
    pub stream: OutputStream,
    pub data: String,
}

/// Handle a tool uses to stream output chunks while it runs.
///
/// Emitting never blocks; a dropped receiver silently discards chunks so a
/// disconnected consumer cannot stall execution.
#[derive(Debug, Clone)]
pub struct StreamSink {
    call_id: String,
    tx: Option<mpsc::UnboundedSender<ToolStreamChunk>>,
}

impl StreamSink {
    pub fn new(call_id: impl Into<String>, tx: mpsc::UnboundedSender<ToolStreamChunk>) -> Self {
        Self {
            call_id: call_id.into(),
            tx: Some(tx),
        }
    }

    /// Sink that drops everything (tools that run without an observer).
    pub fn discard(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            tx: None,
        }
    }

    pub fn emit(&self, stream: OutputStream, data: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ToolStreamChunk {
                call_id: self.call_id.clone(),
                stream,
                data: data.into(),
            });
        }
    }
}

/// How a specific call should be proposed into the session.
///
/// Static tools return the same spec for every call; the shell tool
/// derives it from the command classifier, so a `ls` call and a
/// `rm -rf` call from the same tool propose very differently.
#[derive(Debug, Clone)]
pub struct ProposalSpec {
    pub category: ToolCategory,
    pub risk: RiskLevel,
    pub requires_approval: bool,
    /// `Some(reason)` refuses the call outright: no proposal, no execution.
    pub blocked_reason: Option<String>,
    pub description: String,
}

/// Trait every built-in and external tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Action category used by session approval policy.
    fn category(&self) -> ToolCategory;
    /// Default risk level for this tool.
    fn risk(&self) -> RiskLevel;
    /// Whether this tool's calls need a gate by default.
    fn requires_approval(&self) -> bool;

    /// Per-call proposal spec.  The default is the tool's static policy;
    /// override when the risk depends on the arguments.
    fn classify(&self, _call: &ToolCall) -> ProposalSpec {
        ProposalSpec {
            category: self.category(),
            risk: self.risk(),
            requires_approval: self.requires_approval(),
            blocked_reason: None,
            description: self.description().to_string(),
        }
    }

    /// Execute the tool.  Failures are wrapped in [`ToolOutput::err`],
    /// never surfaced as panics or `Err` to the caller.
    async fn execute(&self, call: &ToolCall, sink: &StreamSink) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_output_is_not_error() {
        let o = ToolOutput::ok("c1", "fine");
        assert!(!o.is_error);
        assert_eq!(o.exit_code, None);
    }

    #[test]
    fn err_output_carries_message() {
        let o = ToolOutput::err("c1", "boom");
        assert!(o.is_error);
        assert_eq!(o.content, "boom");
    }

    #[test]
    fn exit_code_is_attached() {
        let o = ToolOutput::ok("c1", "done").with_exit_code(Some(0));
        assert_eq!(o.exit_code, Some(0));
    }

    #[tokio::test]
    async fn sink_delivers_chunks_with_call_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = StreamSink::new("c9", tx);
        sink.emit(OutputStream::Stdout, "hello");
        let chunk = rx.recv().await.unwrap();
        assert_eq!(chunk.call_id, "c9");
        assert_eq!(chunk.data, "hello");
        assert_eq!(chunk.stream, OutputStream::Stdout);
    }

    #[test]
    fn discard_sink_swallows_chunks() {
        let sink = StreamSink::discard("c1");
        // Must not panic or block.
        sink.emit(OutputStream::Stderr, "nobody listening");
    }
}
