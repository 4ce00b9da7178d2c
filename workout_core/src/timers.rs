//! Orchestrator-owned timers.
//!
//! Each timer is a task that sleeps and then posts
//! [`SessionInput::TimerElapsed`] into the orchestrator inbox. Re-arming or
//! cancelling aborts the task, and every arm gets a fresh epoch so a message
//! already in flight from an aborted timer is recognised as stale.

use crate::orchestrator::SessionInput;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Post-boundary false-positive suppression
    Cooldown,
    Hint,
    Highlight,
    ReplaceReveal,
    ReplaceTimeout,
}

pub struct SessionTimers {
    inbox: mpsc::UnboundedSender<SessionInput>,
    slots: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    epoch: u64,
}

impl SessionTimers {
    pub fn new(inbox: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            inbox,
            slots: HashMap::new(),
            epoch: 0,
        }
    }

    /// (Re)start `kind`, replacing any pending instance
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);
        self.epoch += 1;
        let epoch = self.epoch;
        let inbox = self.inbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inbox.send(SessionInput::TimerElapsed { kind, epoch });
        });
        self.slots.insert(kind, (epoch, handle));
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.slots.remove(&kind) {
            handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (kind, (_, handle)) in self.slots.drain() {
            tracing::trace!(?kind, "Cancelling timer");
            handle.abort();
        }
    }

    /// Consume a fired timer; `false` if it was cancelled or re-armed since
    pub fn take_fired(&mut self, kind: TimerKind, epoch: u64) -> bool {
        match self.slots.get(&kind) {
            Some((current, _)) if *current == epoch => {
                self.slots.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
