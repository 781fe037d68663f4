// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};

use huddle_protocol::{ParticipantId, ParticipantInfo, Presence, Role, SessionConfig};

/// One participant as the session sees it: static identity plus the
/// liveness bookkeeping the heartbeat scheduler drives.
#[derive(Debug, Clone)]
pub struct ParticipantEntry {
    pub info: ParticipantInfo,
    pub presence: Presence,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

impl ParticipantEntry {
    pub fn new(info: ParticipantInfo) -> Self {
        let now = Utc::now();
        Self {
            info,
            presence: Presence::Active,
            last_heartbeat_at: now,
            last_active_at: now,
        }
    }

    /// Any received envelope proves activity.
    pub fn touch_active(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn touch_heartbeat(&mut self) {
        self.last_heartbeat_at = Utc::now();
    }

    /// Presence this participant should be in given the configured
    /// timeouts.  Disconnected is sticky: only a reconnect clears it.
    pub fn presence_for(&self, now: DateTime<Utc>, config: &SessionConfig) -> Presence {
        if self.presence == Presence::Disconnected {
            return Presence::Disconnected;
        }
        let silent_secs = (now - self.last_heartbeat_at).num_seconds().max(0) as u64;
        if silent_secs > config.away_timeout_seconds {
            Presence::Away
        } else if silent_secs > config.idle_timeout_seconds {
            Presence::Idle
        } else {
            Presence::Active
        }
    }
}

/// Session-owned table of participants.
#[derive(Debug, Default)]
pub struct ParticipantTable {
    entries: Vec<ParticipantEntry>,
}

impl ParticipantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: ParticipantInfo) {
        // A rejoin replaces the stale entry instead of duplicating it.
        self.entries.retain(|e| e.info.id != info.id);
        self.entries.push(ParticipantEntry::new(info));
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<ParticipantEntry> {
        let idx = self.entries.iter().position(|e| &e.info.id == id)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&ParticipantEntry> {
        self.entries.iter().find(|e| &e.info.id == id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut ParticipantEntry> {
        self.entries.iter_mut().find(|e| &e.info.id == id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticipantEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParticipantEntry> {
        self.entries.iter_mut()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.entries.iter().map(|e| e.info.id.clone()).collect()
    }

    pub fn infos(&self) -> Vec<ParticipantInfo> {
        self.entries.iter().map(|e| e.info.clone()).collect()
    }

    /// Replace a participant's role set (from `participant.role_change`).
    pub fn set_roles(&mut self, id: &ParticipantId, roles: Vec<Role>) -> bool {
        match self.get_mut(id) {
            Some(entry) => {
                entry.info.roles = roles;
                true
            }
            None => false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
