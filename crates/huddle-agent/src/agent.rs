// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The agent orchestration loop.
//!
//! The agent is a session participant of type `agent`.  It is a
//! sequential driver: one inbound event at a time, no event-handler web.
//! A prompt starts a completion; tool uses from the completion open ONE
//! batch; execution authorizations and gate rejections resolve batch
//! entries as they arrive (in any order); when the last entry resolves,
//! the results feed back to the model as a single user turn — one
//! tool-result block per tool use, always — and the loop either
//! continues or, after a human rejection, stops.
//!
//! ```text
//! prompt.submit ──► completion ──► tool.propose × N ──► [gates]
//!        ▲                                                  │
//!        │                             tool.execute / gate.reject
//!        │                                                  ▼
//!   next completion  ◄── ONE user turn with N results ◄── batch
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use huddle_model::{
    CompletionProvider, CompletionRequest, ContentBlock, Message, ResponseEvent, ToolResultBlock,
    ToolSchema, ToolUseBlock,
};
use huddle_protocol::{
    Envelope, ErrorCode, ErrorPayload, FinishReason, GateResolution, InterruptAction,
    InterruptUrgency, MessageId, ParticipantId, ParticipantInfo, Payload, SessionId, ToolProposal,
};
use huddle_tools::{snapshot, StreamSink, ToolCall, ToolRegistry};

use crate::batch::BatchManager;

/// Directory depth the filesystem-change detector walks.
const SNAPSHOT_DEPTH: usize = 6;

pub struct Agent {
    info: ParticipantInfo,
    session: SessionId,
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    outbound: mpsc::UnboundedSender<Envelope>,
    history: Vec<Message>,
    batch: BatchManager,
    /// Proposals sent and not yet executed/denied: proposal id → the
    /// tool call to run once authorized.
    proposed: HashMap<MessageId, ToolCall>,
    /// When set, tool executions are bracketed by filesystem snapshots
    /// and every changed file is shared back as a context update.
    watch_dir: Option<PathBuf>,
    system_prompt: Option<String>,
    stopped: bool,
}

impl Agent {
    pub fn new(
        info: ParticipantInfo,
        session: SessionId,
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            info,
            session,
            provider,
            tools,
            outbound,
            history: Vec::new(),
            batch: BatchManager::new(),
            proposed: HashMap::new(),
            watch_dir: None,
            system_prompt: None,
            stopped: false,
        }
    }

    pub fn with_watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = Some(dir.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn id(&self) -> &ParticipantId {
        &self.info.id
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// The `session.join` announcing this agent.
    pub fn join_envelope(&self) -> Envelope {
        Envelope::new(
            self.session.clone(),
            self.info.id.clone(),
            Payload::SessionJoin {
                participant: self.info.clone(),
                supported_versions: huddle_protocol::SUPPORTED_VERSIONS.to_vec(),
            },
        )
    }

    /// Join the session and process inbound events until the session
    /// ends or the channel closes.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        let _ = self.outbound.send(self.join_envelope());
        info!(agent = %self.info.id, session = %self.session, "agent joined");

        while let Some(envelope) = inbound.recv().await {
            self.handle_event(envelope).await;
            if self.stopped {
                break;
            }
        }
        info!(agent = %self.info.id, "agent loop finished");
    }

    /// Process one inbound envelope.  Public so tests can drive the loop
    /// directly without a transport.
    pub async fn handle_event(&mut self, envelope: Envelope) {
        // The broker echoes our own events back with the broadcast; they
        // carry nothing we do not already know.
        if envelope.sender == self.info.id {
            return;
        }

        match envelope.payload.clone() {
            Payload::HeartbeatPing {} => {
                self.send(Payload::HeartbeatPong {}, Some(envelope.id));
            }
            Payload::SessionEnd { .. } => {
                debug!(agent = %self.info.id, "session ended");
                self.stopped = true;
            }
            Payload::PromptSubmit { content, target } => {
                if target.is_none() || target.as_ref() == Some(&self.info.id) {
                    self.on_prompt(envelope.id, content).await;
                }
            }
            Payload::ToolExecute { proposal, agent } => {
                if agent == self.info.id {
                    self.on_execute(proposal).await;
                }
            }
            Payload::GateReject { proposal, reason } => {
                self.on_rejection(proposal, reason.unwrap_or_else(|| "rejected".into()))
                    .await;
            }
            Payload::GateTimeout { proposal, resolution } => {
                // Auto-approval is followed by a broker-authored
                // tool.execute; anything else is a denial.
                if resolution != GateResolution::AutoApproved {
                    self.on_rejection(proposal, "approval gate timed out".into())
                        .await;
                }
            }
            Payload::InterruptRaise { target, urgency, .. } => {
                if target.is_none() || target.as_ref() == Some(&self.info.id) {
                    self.on_interrupt(envelope.id, urgency);
                }
            }
            _ => {}
        }
    }

    // ── Prompt flow ───────────────────────────────────────────────────────────

    async fn on_prompt(&mut self, prompt_id: MessageId, content: String) {
        info!(agent = %self.info.id, prompt = %prompt_id, "prompt received");
        if self.history.is_empty() {
            if let Some(system) = &self.system_prompt {
                self.history.push(Message::system(system.clone()));
            }
        }
        self.history.push(Message::user(content));
        self.drive(prompt_id).await;
    }

    /// Run completion rounds until one produces unresolved tool uses, a
    /// rejection stops the turn, or the model finishes in text.
    ///
    /// Written as a loop rather than recursion: a round whose proposals
    /// all resolve synchronously (every command blocked) completes its
    /// batch immediately and would otherwise recurse.
    async fn drive(&mut self, prompt_ref: MessageId) {
        let mut next = Some(prompt_ref);
        while let Some(prompt) = next.take() {
            self.completion_round(&prompt).await;
            next = self.check_batch();
        }
    }

    /// One model call: stream text/thinking out, collect tool uses,
    /// propose them.
    async fn completion_round(&mut self, prompt_ref: &MessageId) {
        self.send(Payload::ThinkingStart {}, Some(prompt_ref.clone()));
        self.send(Payload::ResponseStart {}, Some(prompt_ref.clone()));

        let tools: Vec<ToolSchema> = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();
        let request = CompletionRequest {
            messages: self.history.clone(),
            tools,
            stream: true,
        };

        let mut stream = match self.provider.complete(request).await {
            Ok(s) => s,
            Err(e) => {
                warn!(agent = %self.info.id, "completion failed: {e}");
                self.send(
                    Payload::Error(
                        ErrorPayload::new(
                            ErrorCode::AgentError,
                            format!("completion provider failed: {e}"),
                        )
                        .related_to(prompt_ref.clone()),
                    ),
                    Some(prompt_ref.clone()),
                );
                self.batch.clear();
                self.proposed.clear();
                self.send(Payload::ThinkingEnd {}, Some(prompt_ref.clone()));
                self.send(
                    Payload::ResponseEnd {
                        finish_reason: FinishReason::Error,
                    },
                    Some(prompt_ref.clone()),
                );
                return;
            }
        };

        let mut text = String::new();
        let mut pending: HashMap<u32, PendingToolUse> = HashMap::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(ResponseEvent::TextDelta(delta)) if !delta.is_empty() => {
                    text.push_str(&delta);
                    self.send(
                        Payload::ResponseChunk { content: delta },
                        Some(prompt_ref.clone()),
                    );
                }
                Ok(ResponseEvent::ThinkingDelta(delta)) => {
                    self.send(
                        Payload::ThinkingChunk { content: delta },
                        Some(prompt_ref.clone()),
                    );
                }
                Ok(ResponseEvent::ToolUse {
                    index,
                    id,
                    name,
                    arguments,
                }) => {
                    let ptu = pending.entry(index).or_default();
                    if !id.is_empty() {
                        ptu.id = id;
                    }
                    if !name.is_empty() {
                        ptu.name = name;
                    }
                    ptu.args_buf.push_str(&arguments);
                }
                Ok(ResponseEvent::Usage { .. }) | Ok(ResponseEvent::TextDelta(_)) => {}
                Ok(ResponseEvent::Done) => break,
                Ok(ResponseEvent::Error(e)) => warn!("model stream error: {e}"),
                Err(e) => {
                    warn!("model stream failed: {e}");
                    break;
                }
            }
        }

        // Flush accumulated tool uses in index order; drop the ones that
        // cannot be dispatched.
        let mut ordered: Vec<(u32, PendingToolUse)> = pending.into_iter().collect();
        ordered.sort_by_key(|(idx, _)| *idx);
        let tool_uses: Vec<ToolUseBlock> = ordered
            .into_iter()
            .filter_map(|(_, ptu)| ptu.finish())
            .collect();

        if tool_uses.is_empty() {
            if !text.is_empty() {
                self.history.push(Message::assistant(text));
            }
            self.send(Payload::ThinkingEnd {}, Some(prompt_ref.clone()));
            self.send(
                Payload::ResponseEnd {
                    finish_reason: FinishReason::Complete,
                },
                Some(prompt_ref.clone()),
            );
            return;
        }

        // Record the assistant turn with all its blocks, then open the
        // batch for this round.
        let mut blocks = Vec::new();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text { text });
        }
        blocks.extend(tool_uses.iter().cloned().map(ContentBlock::ToolUse));
        self.history.push(Message::assistant_blocks(blocks));

        self.batch.start(prompt_ref.clone());
        for tu in &tool_uses {
            self.batch.add_tool(&tu.id, &tu.name);
        }
        for tu in tool_uses {
            self.propose_tool(prompt_ref, tu);
        }

        self.send(Payload::ThinkingEnd {}, Some(prompt_ref.clone()));
        self.send(
            Payload::ResponseEnd {
                finish_reason: FinishReason::ToolUse,
            },
            Some(prompt_ref.clone()),
        );
    }

    /// Classify one tool use and propose it into the session — or refuse
    /// it outright when the classifier blocks it.
    fn propose_tool(&mut self, prompt_ref: &MessageId, tu: ToolUseBlock) {
        let call = ToolCall {
            id: tu.id.clone(),
            name: tu.name.clone(),
            args: tu.arguments,
        };
        let spec = self.tools.classify(&call);

        if let Some(reason) = spec.blocked_reason {
            // Refused at creation: no proposal, no gate, no subprocess.
            warn!(agent = %self.info.id, tool = %call.name, %reason, "blocked at propose time");
            self.send(
                Payload::Error(
                    ErrorPayload::new(ErrorCode::AgentError, reason.clone())
                        .related_to(prompt_ref.clone()),
                ),
                Some(prompt_ref.clone()),
            );
            self.batch.resolve_failed(&tu.id, format!("refused: {reason}"));
            self.batch.mark_rejected();
            return;
        }

        let envelope = Envelope::new(
            self.session.clone(),
            self.info.id.clone(),
            Payload::ToolPropose {
                proposal: ToolProposal {
                    tool_name: call.name.clone(),
                    arguments: call.args.clone(),
                    proposing_agent: self.info.id.clone(),
                    category: spec.category,
                    risk_level: spec.risk,
                    requires_approval: spec.requires_approval,
                    description: spec.description,
                    suggested_approvers: vec![],
                },
            },
        )
        .with_ref(prompt_ref.clone());

        self.batch.set_proposal_id(&tu.id, envelope.id.clone());
        self.proposed.insert(envelope.id.clone(), call);
        let _ = self.outbound.send(envelope);
    }

    // ── Tool execution and denial ─────────────────────────────────────────────

    async fn on_execute(&mut self, proposal_id: MessageId) {
        let Some(call) = self.proposed.remove(&proposal_id) else {
            warn!(proposal = %proposal_id, "tool.execute for an unknown proposal");
            return;
        };
        debug!(agent = %self.info.id, tool = %call.name, proposal = %proposal_id, "executing");

        let before = self
            .watch_dir
            .as_ref()
            .map(|dir| snapshot::snapshot(dir, SNAPSHOT_DEPTH));

        // Forward live output into the session while the tool runs.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let sink = StreamSink::new(call.id.clone(), chunk_tx);
        let forwarder = {
            let outbound = self.outbound.clone();
            let session = self.session.clone();
            let sender = self.info.id.clone();
            let proposal = proposal_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    let env = Envelope::new(
                        session.clone(),
                        sender.clone(),
                        Payload::ToolOutput {
                            proposal: proposal.clone(),
                            stream: chunk.stream,
                            data: chunk.data,
                        },
                    )
                    .with_ref(proposal.clone());
                    if outbound.send(env).is_err() {
                        break;
                    }
                }
            })
        };

        let output = self.tools.execute(&call, &sink).await;
        drop(sink);
        let _ = forwarder.await;

        // Share what the tool changed on disk before reporting the result.
        if let (Some(before), Some(dir)) = (before, self.watch_dir.clone()) {
            for change in snapshot::diff(&before, &dir, SNAPSHOT_DEPTH) {
                debug!(path = %change.relative_path, kind = ?change.kind, "file changed by tool");
                self.send(
                    Payload::ContextUpdate {
                        key: change.relative_path,
                        content: Some(serde_json::Value::String(change.content)),
                        content_type: Some(huddle_protocol::ContentType::File),
                        visible_to: None,
                    },
                    Some(proposal_id.clone()),
                );
            }
        }

        self.send(
            Payload::ToolResult {
                proposal: proposal_id.clone(),
                success: !output.is_error,
                exit_code: output.exit_code,
                output: if output.is_error {
                    String::new()
                } else {
                    output.content.clone()
                },
                error: output.is_error.then(|| output.content.clone()),
            },
            Some(proposal_id.clone()),
        );

        match self.batch.find_by_proposal(&proposal_id) {
            Some(tool_use_id) => {
                if output.is_error {
                    self.batch.resolve_failed(&tool_use_id, output.content);
                } else {
                    self.batch.resolve_success(&tool_use_id, output.content);
                }
                if let Some(prompt) = self.check_batch() {
                    self.drive(prompt).await;
                }
            }
            None => {
                // Lenient fallback: a result with no active batch still
                // reaches the model so the conversation stays coherent.
                warn!(proposal = %proposal_id, "tool result with no active batch; forwarding alone");
                self.history.push(Message::tool_results(vec![ToolResultBlock {
                    tool_use_id: call.id.clone(),
                    content: output.content,
                    is_error: output.is_error,
                }]));
                self.drive(proposal_id).await;
            }
        }
    }

    async fn on_rejection(&mut self, proposal_id: MessageId, reason: String) {
        if self.proposed.remove(&proposal_id).is_none() {
            // Not one of ours (another agent's gate).
            return;
        }
        info!(agent = %self.info.id, proposal = %proposal_id, %reason, "proposal denied");

        match self.batch.find_by_proposal(&proposal_id) {
            Some(tool_use_id) => {
                self.batch
                    .resolve_failed(&tool_use_id, format!("Command rejected by human: {reason}"));
                self.batch.mark_rejected();
                if let Some(prompt) = self.check_batch() {
                    self.drive(prompt).await;
                }
            }
            None => {
                warn!(proposal = %proposal_id, "denial with no active batch; dropping");
            }
        }
    }

    /// Feed a completed batch back to the model: ONE user message with
    /// one tool-result block per tool use, in tool-use order.  Returns
    /// the prompt to continue with, or `None` when the turn is over.
    fn check_batch(&mut self) -> Option<MessageId> {
        if !self.batch.is_complete() {
            return None;
        }
        let done = self.batch.complete()?;
        let blocks: Vec<ToolResultBlock> = done
            .results
            .into_iter()
            .map(|(tool_use_id, record)| ToolResultBlock {
                tool_use_id,
                content: record.content,
                is_error: record.is_error,
            })
            .collect();
        self.history.push(Message::tool_results(blocks));

        if done.had_rejection {
            // A human said no: report and stop instead of arguing.
            info!(agent = %self.info.id, "turn stopped after rejection");
            self.send(
                Payload::ResponseEnd {
                    finish_reason: FinishReason::Complete,
                },
                Some(done.prompt_ref),
            );
            None
        } else {
            Some(done.prompt_ref)
        }
    }

    // ── Interrupts ────────────────────────────────────────────────────────────

    fn on_interrupt(&mut self, interrupt_id: MessageId, urgency: InterruptUrgency) {
        let action = match urgency {
            InterruptUrgency::Emergency => {
                // Drop everything: history, batch, open proposals.  Gates
                // still pending at the broker time out on their own.
                warn!(agent = %self.info.id, "emergency interrupt; abandoning state");
                self.history.clear();
                self.batch.clear();
                self.proposed.clear();
                InterruptAction::Stopped
            }
            InterruptUrgency::Normal => InterruptAction::Acknowledged,
        };
        self.send(
            Payload::InterruptAcknowledge {
                interrupt: interrupt_id.clone(),
                action_taken: action,
            },
            Some(interrupt_id),
        );
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    fn send(&self, payload: Payload, reply_to: Option<MessageId>) {
        let mut envelope = Envelope::new(self.session.clone(), self.info.id.clone(), payload);
        if let Some(r) = reply_to {
            envelope = envelope.with_ref(r);
        }
        let _ = self.outbound.send(envelope);
    }
}

/// Tool-use accumulation across streamed deltas, keyed by the provider's
/// parallel-tool-call index.
#[derive(Default)]
struct PendingToolUse {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolUse {
    /// `None` when the accumulated call cannot be dispatched.
    fn finish(self) -> Option<ToolUseBlock> {
        if self.name.is_empty() || self.id.is_empty() {
            warn!(
                id = %self.id,
                name = %self.name,
                "dropping undispatchable tool use from model"
            );
            return None;
        }
        let arguments = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(name = %self.name, "invalid tool arguments from model: {e}; substituting {{}}");
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        Some(ToolUseBlock {
            id: self.id,
            name: self.name,
            arguments,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
