//! Scheduler / Clock
//!
//! Non-blocking timers for the connection session. A fired timer comes back
//! into the session's input queue as [`SessionInput::Timer`], so it is
//! handled on the same serialized path as every GATT callback.

use crate::infrastructure::bluetooth::session::SessionInput;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Generation counter of a session; bumped on every connect and teardown
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Deadline for the wait identified by the id
    Timeout(u64),
    /// Pacing pause before the next queued operation
    Settle(u64),
}

/// A scheduled action, valid only while `epoch` matches the live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub epoch: Epoch,
    pub kind: TimerKind,
}

pub trait Scheduler: Send {
    /// Deliver `token` back to the session after `delay`
    fn schedule(&mut self, delay: Duration, token: TimerToken);

    /// Drop every pending timer
    fn cancel_all(&mut self);

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Scheduler backed by spawned tokio sleeps
pub struct TokioScheduler {
    inputs: mpsc::UnboundedSender<SessionInput>,
    pending: Vec<JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(inputs: mpsc::UnboundedSender<SessionInput>) -> Self {
        Self {
            inputs,
            pending: Vec::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration, token: TimerToken) {
        self.pending.retain(|handle| !handle.is_finished());

        let inputs = self.inputs.clone();
        trace!("Scheduling {:?} in {:?}", token, delay);
        self.pending.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inputs.send(SessionInput::Timer(token));
        }));
    }

    fn cancel_all(&mut self) {
        for handle in self.pending.drain(..) {
            handle.abort();
        }
    }

    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(kind: TimerKind) -> TimerToken {
        TimerToken { epoch: 3, kind }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);

        scheduler.schedule(Duration::from_millis(500), token(TimerKind::Settle(1)));
        scheduler.schedule(Duration::from_millis(100), token(TimerKind::Timeout(2)));

        match rx.recv().await {
            Some(SessionInput::Timer(t)) => assert_eq!(t.kind, TimerKind::Timeout(2)),
            other => panic!("unexpected input: {:?}", other),
        }
        match rx.recv().await {
            Some(SessionInput::Timer(t)) => assert_eq!(t, token(TimerKind::Settle(1))),
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_pending_timers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut scheduler = TokioScheduler::new(tx);

        scheduler.schedule(Duration::from_millis(50), token(TimerKind::Timeout(1)));
        scheduler.cancel_all();
        drop(scheduler);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
