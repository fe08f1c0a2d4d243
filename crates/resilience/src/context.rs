//! Per-request cancellation and deadline.

use std::future::pending;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Carries the caller's cancellation signal and deadline through every
/// suspension point of a request (backend calls, L2 round trips, retry sleeps).
///
/// Cloning is cheap; all clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Handle that cancels every [`RequestContext`] created alongside it.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl RequestContext {
    /// A context that never cancels.
    pub fn background() -> Self {
        Self::default()
    }

    /// A cancellable context and the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        let ctx = Self {
            cancel: Some(receiver),
            deadline: None,
        };
        (ctx, CancelHandle { sender })
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the caller has given up (explicitly or by deadline).
    pub fn is_cancelled(&self) -> bool {
        let flagged = self
            .cancel
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false);
        let expired = self
            .deadline
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false);
        flagged || expired
    }

    /// Resolves once the request is cancelled or its deadline passes.
    /// Never resolves for a background context.
    pub async fn cancelled(&self) {
        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        let flag = async {
            match &self.cancel {
                Some(receiver) => {
                    let mut receiver = receiver.clone();
                    while !*receiver.borrow_and_update() {
                        if receiver.changed().await.is_err() {
                            // Handle dropped without cancelling.
                            pending::<()>().await;
                        }
                    }
                }
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            _ = deadline => {}
            _ = flag => {}
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        // Receivers may already be gone; nothing to do then.
        let _ = self.sender.send(true);
    }
}
