// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use huddle_protocol::{OutputStream, RiskLevel, ToolCategory};

use crate::classify::{classify, CommandCategory};
use crate::exec::{run_streamed, ExecChunk, ExecRequest};
use crate::tool::{ProposalSpec, StreamSink, Tool, ToolCall, ToolOutput};

/// Built-in tool that runs a shell command through the risk classifier
/// and the streamed executor.
///
/// Every call is classified before it is proposed into the session, so a
/// `cat README.md` and a `rm -rf build` from the same tool carry very
/// different risk levels — and a blocked command never reaches the
/// executor at all.
pub struct ShellTool {
    pub default_timeout_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
        }
    }
}

impl ShellTool {
    fn command_of(call: &ToolCall) -> Option<String> {
        call.args
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout + stderr.\n\
         'command' is required and can be any bash one-liner.\n\
         Output is capped per stream; long-running commands are killed at the timeout.\n\
         Prefer non-interactive commands. Avoid commands that require a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The complete bash one-liner to execute."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::ShellExecute
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn requires_approval(&self) -> bool {
        true
    }

    fn classify(&self, call: &ToolCall) -> ProposalSpec {
        let Some(command) = Self::command_of(call) else {
            return ProposalSpec {
                category: ToolCategory::ShellExecute,
                risk: RiskLevel::Medium,
                requires_approval: true,
                blocked_reason: Some("missing required 'command' argument".into()),
                description: String::new(),
            };
        };
        let class = classify(&command);
        ProposalSpec {
            category: ToolCategory::ShellExecute,
            risk: class.risk,
            requires_approval: class.requires_approval,
            blocked_reason: class
                .is_blocked()
                .then(|| format!("blocked command ({}): {command}", class.reason)),
            description: format!("run `{command}` ({})", class.reason),
        }
    }

    async fn execute(&self, call: &ToolCall, sink: &StreamSink) -> ToolOutput {
        let Some(command) = Self::command_of(call) else {
            return ToolOutput::err(&call.id, "missing required 'command' argument");
        };

        let class = classify(&command);
        if class.category == CommandCategory::Blocked {
            // Defence in depth: the proposal path refuses blocked commands
            // before execution is ever authorized.  If one still arrives
            // here, refuse again without spawning anything.
            warn!(cmd = %command, "blocked command reached execute; refusing");
            return ToolOutput::err(
                &call.id,
                format!("blocked command ({}): {command}", class.reason),
            );
        }

        let mut req = ExecRequest::for_class(&command, &class);
        if let Some(t) = call.args.get("timeout_secs").and_then(|v| v.as_u64()) {
            req.timeout = std::time::Duration::from_secs(t);
        } else if class.category == CommandCategory::Read {
            req.timeout = std::time::Duration::from_secs(self.default_timeout_secs);
        }
        if let Some(cwd) = call.args.get("cwd").and_then(|v| v.as_str()) {
            req.cwd = Some(cwd.into());
        }

        debug!(cmd = %command, category = ?class.category, "executing shell tool");

        let outcome = match run_streamed(&req, |chunk| match chunk {
            ExecChunk::Stdout(data) => sink.emit(OutputStream::Stdout, data),
            ExecChunk::Stderr(data) => sink.emit(OutputStream::Stderr, data),
        })
        .await
        {
            Ok(o) => o,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
        };

        if outcome.timed_out {
            return ToolOutput::err(
                &call.id,
                format!("timeout after {}s", req.timeout.as_secs()),
            );
        }
        if outcome.truncated {
            return ToolOutput::err(
                &call.id,
                format!("output exceeded {} bytes; process killed", req.max_buffer_bytes),
            );
        }

        let mut content = String::new();
        if !outcome.stdout.is_empty() {
            content.push_str(&outcome.stdout);
        }
        if !outcome.stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&outcome.stderr);
        }

        let code = outcome.exit_code.unwrap_or(-1);
        if content.is_empty() {
            content = format!("[exit {code}]");
        }
        if code == 0 {
            ToolOutput::ok(&call.id, content).with_exit_code(outcome.exit_code)
        } else {
            ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                .with_exit_code(outcome.exit_code)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
