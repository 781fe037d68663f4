// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::tool::{ProposalSpec, StreamSink, Tool, ToolCall, ToolOutput};

use huddle_protocol::RiskLevel;

/// A tool schema – mirrors huddle_model::ToolSchema but keeps this crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How far this server trusts its registered external tools.
///
/// Trust shifts the approval requirement without touching each tool's own
/// policy: a trusted server only gates high-risk calls, an untrusted one
/// gates everything that is not provably safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolTrust {
    Trusted,
    #[default]
    Standard,
    Untrusted,
}

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    trust: ToolTrust,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            trust: ToolTrust::Standard,
        }
    }

    pub fn with_trust(mut self, trust: ToolTrust) -> Self {
        self.trust = trust;
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for all registered tools, name-sorted for stable
    /// request building.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Per-call proposal spec with the server trust level applied.
    ///
    /// Unknown tools classify as blocked so the caller records a failure
    /// instead of proposing something that can never execute.
    pub fn classify(&self, call: &ToolCall) -> ProposalSpec {
        let Some(tool) = self.tools.get(&call.name) else {
            return ProposalSpec {
                category: huddle_protocol::ToolCategory::ExternalApi,
                risk: RiskLevel::Medium,
                requires_approval: true,
                blocked_reason: Some(format!("unknown tool: {}", call.name)),
                description: String::new(),
            };
        };
        let mut spec = tool.classify(call);
        spec.requires_approval = match self.trust {
            ToolTrust::Trusted => spec.requires_approval && spec.risk >= RiskLevel::High,
            ToolTrust::Standard => spec.requires_approval,
            ToolTrust::Untrusted => spec.risk > RiskLevel::Safe,
        };
        spec
    }

    pub async fn execute(&self, call: &ToolCall, sink: &StreamSink) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call, sink).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
