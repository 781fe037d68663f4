// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The approval-gate state machine.
//!
//! A gate is opened for every tool proposal whose category requires
//! approval.  Approvals and rejections accumulate as idempotent set
//! inserts; after every vote the gate is re-evaluated against the quorum
//! rule.  Any rejection terminates the gate immediately, regardless of how
//! many approvals it already has.
//!
//! ```text
//! open ──(approval, quorum not met)──> open
//! open ──(approval, quorum met)──────> approved  → tool.execute
//! open ──(rejection)─────────────────> rejected  → gate.reject
//! open ──(timer expiry)──────────────> resolved by configured policy
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use huddle_protocol::{GateRequest, ParticipantId, ParticipantInfo, QuorumRule, Role};

/// Verdict of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum GateVerdict {
    Approved,
    Rejected { reason: String },
    Pending { waiting_on: String },
}

impl GateVerdict {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateVerdict::Pending { .. })
    }
}

/// One pending approval checkpoint.
#[derive(Debug, Clone)]
pub struct Gate {
    pub request: GateRequest,
    pub approvals: BTreeSet<ParticipantId>,
    pub rejections: BTreeSet<ParticipantId>,
    pub created_at: DateTime<Utc>,
    /// `None` when `timeout_seconds == 0`: no timer, open indefinitely.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Gate {
    pub fn new(request: GateRequest) -> Self {
        let created_at = Utc::now();
        let expires_at = (request.timeout_seconds > 0)
            .then(|| created_at + Duration::seconds(request.timeout_seconds as i64));
        Self {
            request,
            approvals: BTreeSet::new(),
            rejections: BTreeSet::new(),
            created_at,
            expires_at,
        }
    }

    /// Idempotent: approving twice counts once.
    pub fn add_approval(&mut self, participant: ParticipantId) {
        self.approvals.insert(participant);
    }

    pub fn add_rejection(&mut self, participant: ParticipantId) {
        self.rejections.insert(participant);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Evaluate the quorum rule against the current participant set.
    ///
    /// Eligibility is recomputed per call: participants who joined after
    /// the gate opened can vote, and a rule naming a role follows role
    /// changes.  A rule with no eligible voters can never be satisfied and
    /// rejects immediately.
    pub fn evaluate(&self, participants: &[ParticipantInfo]) -> GateVerdict {
        // Rejection short-circuits everything.
        if let Some(rejector) = self.rejections.iter().next() {
            return GateVerdict::Rejected {
                reason: format!("rejected by {rejector}"),
            };
        }

        match &self.request.quorum {
            QuorumRule::Any { count } => {
                let eligible = eligible_approvers(participants);
                if eligible.is_empty() {
                    return no_eligible_approvers();
                }
                let have = self.approvals_from(&eligible);
                if have >= *count {
                    GateVerdict::Approved
                } else {
                    GateVerdict::Pending {
                        waiting_on: format!("{have}/{count} approvals"),
                    }
                }
            }
            QuorumRule::All => {
                let eligible = eligible_approvers(participants);
                if eligible.is_empty() {
                    return no_eligible_approvers();
                }
                let missing: Vec<&ParticipantId> = eligible
                    .iter()
                    .filter(|id| !self.approvals.contains(*id))
                    .collect();
                if missing.is_empty() {
                    GateVerdict::Approved
                } else {
                    GateVerdict::Pending {
                        waiting_on: format!("{} of {} approvers", missing.len(), eligible.len()),
                    }
                }
            }
            QuorumRule::Role { role, count } => {
                let eligible: Vec<ParticipantId> = participants
                    .iter()
                    .filter(|p| p.has_role(*role))
                    .map(|p| p.id.clone())
                    .collect();
                if eligible.is_empty() {
                    return no_eligible_approvers();
                }
                let have = self.approvals_from(&eligible);
                if have >= *count {
                    GateVerdict::Approved
                } else {
                    GateVerdict::Pending {
                        waiting_on: format!("{have}/{count} {role:?} approvals"),
                    }
                }
            }
            QuorumRule::Specific { participants: listed } => {
                if listed.is_empty() {
                    return no_eligible_approvers();
                }
                let missing: Vec<&ParticipantId> = listed
                    .iter()
                    .filter(|id| !self.approvals.contains(*id))
                    .collect();
                if missing.is_empty() {
                    GateVerdict::Approved
                } else {
                    GateVerdict::Pending {
                        waiting_on: format!("{} named approvers", missing.len()),
                    }
                }
            }
            QuorumRule::Majority => {
                let eligible = eligible_approvers(participants);
                if eligible.is_empty() {
                    return no_eligible_approvers();
                }
                let have = self.approvals_from(&eligible);
                if have * 2 > eligible.len() {
                    GateVerdict::Approved
                } else {
                    GateVerdict::Pending {
                        waiting_on: format!("{have}/{} (majority)", eligible.len()),
                    }
                }
            }
        }
    }

    fn approvals_from(&self, eligible: &[ParticipantId]) -> usize {
        self.approvals.iter().filter(|a| eligible.contains(a)).count()
    }
}

fn eligible_approvers(participants: &[ParticipantInfo]) -> Vec<ParticipantId> {
    participants
        .iter()
        .filter(|p| p.can_approve())
        .map(|p| p.id.clone())
        .collect()
}

fn no_eligible_approvers() -> GateVerdict {
    GateVerdict::Rejected {
        reason: "no eligible approvers".to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::{Capability, MessageId, ParticipantType};

    fn approver(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: ParticipantId::from(id),
            name: id.to_string(),
            participant_type: ParticipantType::Human,
            roles: vec![Role::Approver],
            capabilities: vec![],
            transport: None,
            metadata: None,
        }
    }

    fn observer(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            id: ParticipantId::from(id),
            name: id.to_string(),
            participant_type: ParticipantType::Human,
            roles: vec![Role::Observer],
            capabilities: vec![],
            transport: None,
            metadata: None,
        }
    }

    fn gate(quorum: QuorumRule, timeout_seconds: u64) -> Gate {
        Gate::new(GateRequest {
            action_type: "tool".into(),
            action_ref: MessageId::from("m1"),
            quorum,
            timeout_seconds,
            message: "approve?".into(),
        })
    }

    // ── Any ───────────────────────────────────────────────────────────────────

    #[test]
    fn any_quorum_approves_at_count() {
        let mut g = gate(QuorumRule::Any { count: 1 }, 0);
        let ps = vec![approver("a1"), observer("o1")];
        assert!(matches!(g.evaluate(&ps), GateVerdict::Pending { .. }));
        g.add_approval(ParticipantId::from("a1"));
        assert_eq!(g.evaluate(&ps), GateVerdict::Approved);
    }

    #[test]
    fn any_quorum_ignores_votes_from_non_approvers() {
        let mut g = gate(QuorumRule::Any { count: 1 }, 0);
        let ps = vec![approver("a1"), observer("o1")];
        g.add_approval(ParticipantId::from("o1"));
        assert!(matches!(g.evaluate(&ps), GateVerdict::Pending { .. }));
    }

    #[test]
    fn approval_is_idempotent() {
        let mut g = gate(QuorumRule::Any { count: 2 }, 0);
        let ps = vec![approver("a1"), approver("a2")];
        g.add_approval(ParticipantId::from("a1"));
        g.add_approval(ParticipantId::from("a1"));
        assert!(
            matches!(g.evaluate(&ps), GateVerdict::Pending { .. }),
            "double-approve must count once"
        );
    }

    // ── All ───────────────────────────────────────────────────────────────────

    #[test]
    fn all_quorum_needs_every_eligible_approver() {
        let mut g = gate(QuorumRule::All, 0);
        let ps = vec![approver("a1"), approver("a2"), observer("o1")];
        g.add_approval(ParticipantId::from("a1"));
        assert!(matches!(g.evaluate(&ps), GateVerdict::Pending { .. }));
        g.add_approval(ParticipantId::from("a2"));
        assert_eq!(g.evaluate(&ps), GateVerdict::Approved);
    }

    // ── Role ──────────────────────────────────────────────────────────────────

    #[test]
    fn role_quorum_counts_only_that_role() {
        let mut g = gate(
            QuorumRule::Role {
                role: Role::Driver,
                count: 1,
            },
            0,
        );
        let driver = ParticipantInfo {
            roles: vec![Role::Driver],
            ..approver("d1")
        };
        let ps = vec![driver, approver("a1")];
        g.add_approval(ParticipantId::from("a1"));
        assert!(matches!(g.evaluate(&ps), GateVerdict::Pending { .. }));
        g.add_approval(ParticipantId::from("d1"));
        assert_eq!(g.evaluate(&ps), GateVerdict::Approved);
    }

    // ── Specific ──────────────────────────────────────────────────────────────

    #[test]
    fn specific_quorum_requires_all_listed() {
        let mut g = gate(
            QuorumRule::Specific {
                participants: vec![ParticipantId::from("p1"), ParticipantId::from("p2")],
            },
            0,
        );
        let ps = vec![approver("p1"), approver("p2")];
        g.add_approval(ParticipantId::from("p1"));
        assert!(matches!(g.evaluate(&ps), GateVerdict::Pending { .. }));
        g.add_approval(ParticipantId::from("p2"));
        assert_eq!(g.evaluate(&ps), GateVerdict::Approved);
    }

    #[test]
    fn specific_with_empty_list_rejects() {
        let g = gate(QuorumRule::Specific { participants: vec![] }, 0);
        assert!(matches!(
            g.evaluate(&[approver("a1")]),
            GateVerdict::Rejected { reason } if reason.contains("no eligible")
        ));
    }

    // ── Majority ──────────────────────────────────────────────────────────────

    #[test]
    fn majority_is_strictly_more_than_half() {
        let mut g = gate(QuorumRule::Majority, 0);
        let ps = vec![approver("a1"), approver("a2"), approver("a3"), approver("a4")];
        g.add_approval(ParticipantId::from("a1"));
        g.add_approval(ParticipantId::from("a2"));
        // 2 of 4 is not a majority.
        assert!(matches!(g.evaluate(&ps), GateVerdict::Pending { .. }));
        g.add_approval(ParticipantId::from("a3"));
        assert_eq!(g.evaluate(&ps), GateVerdict::Approved);
    }

    // ── Rejection and eligibility ─────────────────────────────────────────────

    #[test]
    fn rejection_short_circuits_despite_approvals() {
        let mut g = gate(QuorumRule::Any { count: 1 }, 0);
        let ps = vec![approver("a1"), approver("a2")];
        g.add_approval(ParticipantId::from("a1"));
        g.add_rejection(ParticipantId::from("a2"));
        assert!(matches!(g.evaluate(&ps), GateVerdict::Rejected { .. }));
    }

    #[test]
    fn no_eligible_approvers_rejects_immediately() {
        let g = gate(QuorumRule::Any { count: 1 }, 0);
        assert!(matches!(
            g.evaluate(&[observer("o1")]),
            GateVerdict::Rejected { reason } if reason == "no eligible approvers"
        ));
    }

    #[test]
    fn approve_capability_makes_a_voter_eligible() {
        let mut g = gate(QuorumRule::Any { count: 1 }, 0);
        let voter = ParticipantInfo {
            roles: vec![Role::Observer],
            capabilities: vec![Capability::Approve],
            ..observer("v1")
        };
        let ps = vec![voter];
        g.add_approval(ParticipantId::from("v1"));
        assert_eq!(g.evaluate(&ps), GateVerdict::Approved);
    }

    // ── Expiry ────────────────────────────────────────────────────────────────

    #[test]
    fn zero_timeout_never_expires() {
        let g = gate(QuorumRule::Any { count: 1 }, 0);
        assert!(g.expires_at.is_none());
        assert!(!g.is_expired(Utc::now() + Duration::days(365)));
    }

    #[test]
    fn positive_timeout_expires_after_deadline() {
        let g = gate(QuorumRule::Any { count: 1 }, 60);
        assert!(!g.is_expired(Utc::now()));
        assert!(g.is_expired(Utc::now() + Duration::seconds(61)));
    }

    #[test]
    fn verdicts_know_terminality() {
        assert!(GateVerdict::Approved.is_terminal());
        assert!(GateVerdict::Rejected { reason: "x".into() }.is_terminal());
        assert!(!GateVerdict::Pending {
            waiting_on: "y".into()
        }
        .is_terminal());
    }
}
