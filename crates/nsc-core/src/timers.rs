//! Stage-scoped timers.
//!
//! The state machine decides *which* timers are armed and records an epoch
//! per kind; [`TimerSet`] owns the tokio tasks that deliver the expiry back
//! as an [`Event::TimerFired`]. Every task is aborted when its guard drops,
//! and a fired token is only honoured if its epoch is still the armed one,
//! so a timer can never act on a stage it no longer belongs to.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::machine::Event;
use crate::types::Stage;

/// Timers the connection state machine can arm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Informational warning while waiting for a signer
    SignerSlow,
    /// Hard timeout while waiting for a signer
    SignerTimeout,
    /// Window in which a late approval URL overrides a secret rejection
    GraceWindow,
    /// Delay between `connected` and starting the sign-in
    Settle,
    /// Informational warning for the connected/signing/syncing episode
    AuthSlow,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::SignerSlow,
        TimerKind::SignerTimeout,
        TimerKind::GraceWindow,
        TimerKind::Settle,
        TimerKind::AuthSlow,
    ];

    /// Whether a timer of this kind may stay armed in `stage`.
    pub fn survives(&self, stage: Stage) -> bool {
        match self {
            TimerKind::SignerSlow | TimerKind::SignerTimeout => stage == Stage::WaitingForSigner,
            TimerKind::GraceWindow => {
                matches!(stage, Stage::WaitingForSigner | Stage::AwaitingApproval)
            }
            TimerKind::Settle => stage == Stage::Connected,
            TimerKind::AuthSlow => stage.is_authenticating(),
        }
    }
}

/// Identifies one arming of a timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub epoch: u64,
}

/// A spawned task that is aborted when the guard is dropped.
#[derive(Debug)]
pub struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Running timer tasks, at most one per kind.
#[derive(Debug, Default)]
pub struct TimerSet {
    running: HashMap<TimerKind, TaskGuard>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the timer for `token.kind`.
    pub fn arm(&mut self, token: TimerToken, after: Duration, events: mpsc::UnboundedSender<Event>) {
        trace!(kind = ?token.kind, epoch = token.epoch, ?after, "arming timer");
        let guard = TaskGuard::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::TimerFired(token));
        });
        // Replacing drops (and aborts) the previous task of the same kind.
        self.running.insert(token.kind, guard);
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        if self.running.remove(&kind).is_some() {
            trace!(?kind, "timer disarmed");
        }
    }

    pub fn disarm_all(&mut self) {
        self.running.clear();
    }

    /// Number of timers whose task has not completed yet.
    pub fn pending(&self) -> usize {
        self.running.values().filter(|g| !g.is_finished()).count()
    }
}
