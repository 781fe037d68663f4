// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::trace;

use huddle_protocol::{
    Envelope, ForkId, MessageId, OrderingMode, SessionConfig, SessionId,
};

use crate::context::ContextStore;
use crate::gate::Gate;
use crate::participant::ParticipantTable;

/// A named branch of the session's event stream.
#[derive(Debug, Clone)]
pub struct ForkInfo {
    pub id: ForkId,
    pub name: String,
    pub from_message: Option<MessageId>,
    pub created_at: DateTime<Utc>,
    pub merged_into: Option<ForkId>,
}

/// One bounded multi-party conversation: participants, an append-only
/// event log, shared context, pending gates, and forks.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub name: Option<String>,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub participants: ParticipantTable,
    pub context: ContextStore,
    /// Pending gates, keyed by the proposal message id they protect.
    pub gates: HashMap<MessageId, Gate>,
    pub forks: HashMap<ForkId, ForkInfo>,
    pub current_fork: Option<ForkId>,
    /// Time of the last heartbeat sweep for this session.
    pub last_heartbeat_sweep: DateTime<Utc>,
    log: Vec<Envelope>,
    index: HashMap<MessageId, usize>,
    seq: u64,
}

impl Session {
    pub fn new(id: SessionId, name: Option<String>, config: SessionConfig) -> Self {
        Self {
            id,
            name,
            config,
            created_at: Utc::now(),
            participants: ParticipantTable::new(),
            context: ContextStore::new(),
            gates: HashMap::new(),
            forks: HashMap::new(),
            current_fork: None,
            last_heartbeat_sweep: Utc::now(),
            log: Vec::new(),
            index: HashMap::new(),
            seq: 0,
        }
    }

    /// Record an envelope in the log, assigning `seq` first when the
    /// session runs in total-ordering mode.  Returns the envelope as it
    /// must be broadcast (with `seq` filled in).
    ///
    /// The log is append-only: past entries are never mutated.
    pub fn append(&mut self, mut envelope: Envelope) -> Envelope {
        if self.config.ordering_mode == OrderingMode::Total {
            envelope.seq = Some(self.seq);
            self.seq += 1;
        }
        trace!(session = %self.id, ty = envelope.type_name(), "append");
        self.index.insert(envelope.id.clone(), self.log.len());
        self.log.push(envelope.clone());
        envelope
    }

    /// Look up a prior log entry by message id (for `ref` resolution).
    pub fn get_by_id(&self, id: &MessageId) -> Option<&Envelope> {
        self.index.get(id).map(|&i| &self.log[i])
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    pub fn log(&self) -> &[Envelope] {
        &self.log
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Next sequence number that would be assigned (diagnostics).
    pub fn seq_counter(&self) -> u64 {
        self.seq
    }
}

/// In-memory map session-id → session.
///
/// All access goes through the broker's single event loop, which is the
/// serialized writer the ordering guarantees rely on; no interior locking
/// is needed here.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session; `None` when the id is already taken.
    pub fn create(
        &mut self,
        id: SessionId,
        name: Option<String>,
        config: SessionConfig,
    ) -> Option<&mut Session> {
        if self.sessions.contains_key(&id) {
            return None;
        }
        self.sessions
            .insert(id.clone(), Session::new(id.clone(), name, config));
        self.sessions.get_mut(&id)
    }

    /// Get the session, creating it with `default_config` if unknown
    /// (lazy auto-create on `session.join`).
    pub fn get_or_create(
        &mut self,
        id: &SessionId,
        default_config: &SessionConfig,
    ) -> (&mut Session, bool) {
        let created = !self.sessions.contains_key(id);
        let session = self
            .sessions
            .entry(id.clone())
            .or_insert_with(|| Session::new(id.clone(), None, default_config.clone()));
        (session, created)
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{ParticipantId, Payload};

    fn sid() -> SessionId {
        SessionId::from("s1")
    }

    fn env(payload: Payload) -> Envelope {
        Envelope::new(sid(), ParticipantId::from("p1"), payload)
    }

    fn chunk(text: &str) -> Envelope {
        env(Payload::ResponseChunk {
            content: text.into(),
        })
    }

    #[test]
    fn append_preserves_order_and_indexes_by_id() {
        let mut s = Session::new(sid(), None, SessionConfig::default());
        let a = s.append(chunk("a"));
        let b = s.append(chunk("b"));
        assert_eq!(s.log_len(), 2);
        assert_eq!(s.get_by_id(&a.id).unwrap().id, a.id);
        assert_eq!(s.get_by_id(&b.id).unwrap().id, b.id);
    }

    #[test]
    fn causal_mode_assigns_no_seq() {
        let mut s = Session::new(sid(), None, SessionConfig::default());
        let e = s.append(chunk("a"));
        assert_eq!(e.seq, None);
    }

    #[test]
    fn total_mode_assigns_contiguous_seq() {
        let config = SessionConfig {
            ordering_mode: OrderingMode::Total,
            ..SessionConfig::default()
        };
        let mut s = Session::new(sid(), None, config);
        let seqs: Vec<u64> = (0..5).map(|_| s.append(chunk("x")).seq.unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        // Logged copies carry the same seq as the broadcast copies.
        for (i, e) in s.log().iter().enumerate() {
            assert_eq!(e.seq, Some(i as u64));
        }
    }

    #[test]
    fn unknown_message_id_resolves_to_none() {
        let s = Session::new(sid(), None, SessionConfig::default());
        assert!(s.get_by_id(&MessageId::from("nope")).is_none());
        assert!(!s.contains_message(&MessageId::from("nope")));
    }

    #[test]
    fn registry_create_rejects_duplicates() {
        let mut reg = SessionRegistry::new();
        assert!(reg
            .create(sid(), Some("a".into()), SessionConfig::default())
            .is_some());
        assert!(reg.create(sid(), None, SessionConfig::default()).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn registry_get_or_create_is_lazy() {
        let mut reg = SessionRegistry::new();
        let (_, created) = reg.get_or_create(&sid(), &SessionConfig::default());
        assert!(created);
        let (_, created_again) = reg.get_or_create(&sid(), &SessionConfig::default());
        assert!(!created_again);
    }

    #[test]
    fn registry_remove_drops_the_session() {
        let mut reg = SessionRegistry::new();
        reg.create(sid(), None, SessionConfig::default());
        assert!(reg.remove(&sid()).is_some());
        assert!(reg.is_empty());
    }
}
