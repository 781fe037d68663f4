// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The tool batch: all tool uses from one model completion, tracked until
//! every one of them is resolved.
//!
//! The completion provider's tool-calling contract demands exactly one
//! result per tool use from the previous assistant turn, delivered
//! together in the next user turn.  Results arrive out of order (an
//! auto-approved read finishes while a gated write waits for a human), so
//! the batch holds everything until the last entry resolves — only then
//! may the agent call the model again.

use tracing::warn;

use huddle_protocol::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Resolved,
}

/// Recorded outcome for one tool use.
#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub content: String,
    pub is_error: bool,
}

#[derive(Debug)]
pub struct BatchEntry {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Id of the `tool.propose` envelope, once sent.
    pub proposal_id: Option<MessageId>,
    pub status: EntryStatus,
    pub result: Option<ToolResultRecord>,
}

#[derive(Debug)]
struct ActiveBatch {
    prompt_ref: MessageId,
    had_rejection: bool,
    /// Insertion order is the tool-use order from the completion; the
    /// result blocks are forwarded in the same order.
    entries: Vec<BatchEntry>,
}

/// The completed batch, ready to feed back to the model.
#[derive(Debug)]
pub struct CompletedBatch {
    pub prompt_ref: MessageId,
    pub had_rejection: bool,
    pub results: Vec<(String, ToolResultRecord)>,
}

/// Single-batch-at-a-time manager (per agent, per prompt).
#[derive(Debug, Default)]
pub struct BatchManager {
    active: Option<ActiveBatch>,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a batch for a prompt.  Starting while a batch is still
    /// pending is an anomaly: the old batch is discarded with a log line
    /// rather than silently merged.
    pub fn start(&mut self, prompt_ref: MessageId) {
        if let Some(old) = &self.active {
            warn!(
                prompt = %old.prompt_ref,
                pending = old.entries.iter().filter(|e| e.status == EntryStatus::Pending).count(),
                "starting a new batch over a pending one; discarding"
            );
        }
        self.active = Some(ActiveBatch {
            prompt_ref,
            had_rejection: false,
            entries: Vec::new(),
        });
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn prompt_ref(&self) -> Option<&MessageId> {
        self.active.as_ref().map(|b| &b.prompt_ref)
    }

    pub fn add_tool(&mut self, tool_use_id: impl Into<String>, tool_name: impl Into<String>) {
        if let Some(batch) = &mut self.active {
            batch.entries.push(BatchEntry {
                tool_use_id: tool_use_id.into(),
                tool_name: tool_name.into(),
                proposal_id: None,
                status: EntryStatus::Pending,
                result: None,
            });
        }
    }

    pub fn set_proposal_id(&mut self, tool_use_id: &str, proposal_id: MessageId) {
        if let Some(entry) = self.entry_mut(tool_use_id) {
            entry.proposal_id = Some(proposal_id);
        }
    }

    /// The tool-use id whose proposal is `proposal_id`, if it is in the
    /// active batch.
    pub fn find_by_proposal(&self, proposal_id: &MessageId) -> Option<String> {
        self.active.as_ref().and_then(|b| {
            b.entries
                .iter()
                .find(|e| e.proposal_id.as_ref() == Some(proposal_id))
                .map(|e| e.tool_use_id.clone())
        })
    }

    pub fn resolve_success(&mut self, tool_use_id: &str, content: impl Into<String>) {
        self.resolve(tool_use_id, content.into(), false);
    }

    pub fn resolve_failed(&mut self, tool_use_id: &str, error: impl Into<String>) {
        self.resolve(tool_use_id, error.into(), true);
    }

    fn resolve(&mut self, tool_use_id: &str, content: String, is_error: bool) {
        match self.entry_mut(tool_use_id) {
            Some(entry) => {
                if entry.status == EntryStatus::Resolved {
                    warn!(tool_use_id, "tool use resolved twice; keeping the first result");
                    return;
                }
                entry.status = EntryStatus::Resolved;
                entry.result = Some(ToolResultRecord { content, is_error });
            }
            None => warn!(tool_use_id, "resolution for a tool use not in the batch"),
        }
    }

    /// Record that some entry was denied by a human.  The agent stops
    /// after feeding the results back instead of continuing the loop.
    pub fn mark_rejected(&mut self) {
        if let Some(batch) = &mut self.active {
            batch.had_rejection = true;
        }
    }

    /// A batch is complete iff every entry is resolved.  An empty or
    /// absent batch is not complete: there is nothing to feed back.
    pub fn is_complete(&self) -> bool {
        match &self.active {
            Some(batch) => {
                !batch.entries.is_empty()
                    && batch.entries.iter().all(|e| e.status == EntryStatus::Resolved)
            }
            None => false,
        }
    }

    /// Take the completed batch.  `None` while any entry is pending.
    pub fn complete(&mut self) -> Option<CompletedBatch> {
        if !self.is_complete() {
            return None;
        }
        let batch = self.active.take()?;
        Some(CompletedBatch {
            prompt_ref: batch.prompt_ref,
            had_rejection: batch.had_rejection,
            results: batch
                .entries
                .into_iter()
                .map(|e| {
                    let record = e.result.unwrap_or(ToolResultRecord {
                        content: String::new(),
                        is_error: true,
                    });
                    (e.tool_use_id, record)
                })
                .collect(),
        })
    }

    /// Drop the batch without completing it (emergency interrupt,
    /// provider failure).
    pub fn clear(&mut self) {
        self.active = None;
    }

    fn entry_mut(&mut self, tool_use_id: &str) -> Option<&mut BatchEntry> {
        self.active
            .as_mut()
            .and_then(|b| b.entries.iter_mut().find(|e| e.tool_use_id == tool_use_id))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> MessageId {
        MessageId::from("prompt-1")
    }

    #[test]
    fn empty_manager_is_not_complete() {
        let m = BatchManager::new();
        assert!(!m.is_complete());
        assert!(!m.is_active());
    }

    #[test]
    fn batch_with_pending_entries_is_not_complete() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.add_tool("tu_2", "shell");
        m.resolve_success("tu_1", "ok");
        assert!(!m.is_complete());
        assert!(m.complete().is_none());
    }

    #[test]
    fn all_resolved_completes_in_insertion_order() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.add_tool("tu_2", "shell");
        // Out-of-order resolution must not reorder the results.
        m.resolve_failed("tu_2", "rejected by human: not today");
        m.resolve_success("tu_1", "file list");
        assert!(m.is_complete());

        let done = m.complete().unwrap();
        assert_eq!(done.prompt_ref, prompt());
        let ids: Vec<&str> = done.results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["tu_1", "tu_2"]);
        assert!(!done.results[0].1.is_error);
        assert!(done.results[1].1.is_error);
        // The manager is empty again.
        assert!(!m.is_active());
    }

    #[test]
    fn proposal_id_lookup_round_trips() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.set_proposal_id("tu_1", MessageId::from("prop-9"));
        assert_eq!(
            m.find_by_proposal(&MessageId::from("prop-9")),
            Some("tu_1".to_string())
        );
        assert_eq!(m.find_by_proposal(&MessageId::from("prop-0")), None);
    }

    #[test]
    fn double_resolution_keeps_the_first_result() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.resolve_success("tu_1", "first");
        m.resolve_failed("tu_1", "second");
        let done = m.complete().unwrap();
        assert_eq!(done.results[0].1.content, "first");
        assert!(!done.results[0].1.is_error);
    }

    #[test]
    fn rejection_flag_survives_to_completion() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.mark_rejected();
        m.resolve_failed("tu_1", "rejected by human: no");
        let done = m.complete().unwrap();
        assert!(done.had_rejection);
    }

    #[test]
    fn starting_over_a_pending_batch_discards_it() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");

        m.start(MessageId::from("prompt-2"));
        assert_eq!(m.prompt_ref(), Some(&MessageId::from("prompt-2")));
        // The old entry is gone.
        assert_eq!(m.find_by_proposal(&MessageId::from("prop-1")), None);
        assert!(!m.is_complete());
    }

    #[test]
    fn clear_abandons_everything() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.clear();
        assert!(!m.is_active());
        assert!(m.complete().is_none());
    }

    #[test]
    fn resolution_for_unknown_tool_use_is_ignored() {
        let mut m = BatchManager::new();
        m.start(prompt());
        m.add_tool("tu_1", "shell");
        m.resolve_success("tu_ghost", "??");
        assert!(!m.is_complete());
    }
}
