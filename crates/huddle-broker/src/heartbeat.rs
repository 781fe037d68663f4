// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use huddle_protocol::SessionId;

use crate::broker::BrokerEvent;

/// Per-session heartbeat timers.
///
/// Each monitored session gets one background task that does nothing but
/// tick: every `heartbeat_interval_seconds` it enqueues a
/// [`BrokerEvent::HeartbeatSweep`] for the broker loop.  All actual
/// presence computation happens in the router, under the same serialized
/// dispatch as every other mutation — the timer tasks never touch state.
pub struct HeartbeatScheduler {
    event_tx: mpsc::UnboundedSender<BrokerEvent>,
    tasks: HashMap<SessionId, JoinHandle<()>>,
}

impl HeartbeatScheduler {
    pub fn new(event_tx: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self {
            event_tx,
            tasks: HashMap::new(),
        }
    }

    /// Start monitoring a session.  Restarting an already monitored
    /// session replaces its timer.
    pub fn start(&mut self, session: SessionId, interval: Duration) {
        debug!(%session, ?interval, "heartbeat monitoring started");
        let tx = self.event_tx.clone();
        let id = session.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh session
            // is not swept before anyone had a chance to heartbeat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.send(BrokerEvent::HeartbeatSweep { session: id.clone() }).is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.tasks.insert(session, task) {
            old.abort();
        }
    }

    pub fn stop(&mut self, session: &SessionId) {
        if let Some(task) = self.tasks.remove(session) {
            debug!(%session, "heartbeat monitoring stopped");
            task.abort();
        }
    }

    pub fn stop_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }

    pub fn is_monitoring(&self, session: &SessionId) -> bool {
        self.tasks.contains_key(session)
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticks_arrive_on_the_event_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sched = HeartbeatScheduler::new(tx);
        sched.start(SessionId::from("s1"), Duration::from_millis(10));

        let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no sweep arrived")
            .unwrap();
        assert!(matches!(
            ev,
            BrokerEvent::HeartbeatSweep { session } if session == SessionId::from("s1")
        ));
    }

    #[tokio::test]
    async fn stop_halts_the_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sched = HeartbeatScheduler::new(tx);
        let sid = SessionId::from("s1");
        sched.start(sid.clone(), Duration::from_millis(10));
        assert!(sched.is_monitoring(&sid));

        sched.stop(&sid);
        assert!(!sched.is_monitoring(&sid));

        // Drain anything in flight, then verify silence.
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_all_clears_every_task() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sched = HeartbeatScheduler::new(tx);
        sched.start(SessionId::from("s1"), Duration::from_secs(60));
        sched.start(SessionId::from("s2"), Duration::from_secs(60));
        sched.stop_all();
        assert!(!sched.is_monitoring(&SessionId::from("s1")));
        assert!(!sched.is_monitoring(&SessionId::from("s2")));
    }
}
