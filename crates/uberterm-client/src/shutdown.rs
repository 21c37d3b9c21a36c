//! One-shot, idempotent shutdown broadcast shared by the pump loops.

use std::sync::Arc;

use crate::{Error, Result};

/// Why an orderly session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The local detach sequence was typed.
    Detached,
    /// The server closed the connection.
    ServerClosed,
    /// Shutdown was requested from outside the pump.
    Requested,
}

#[derive(Debug)]
enum Outcome {
    Exit(ExitReason),
    Failed(Error),
}

#[derive(Debug)]
struct Inner {
    signaled: tokio::sync::watch::Sender<bool>,
    outcome: parking_lot::Mutex<Option<Outcome>>,
}

/// Broadcast-once shutdown signal.
///
/// The first party to signal wins and records why; later signals are absorbed.
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (signaled, _) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                signaled,
                outcome: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Signal an orderly shutdown. Returns true if this call fired the signal.
    pub fn trigger(&self, origin: &str, reason: ExitReason) -> bool {
        let fired = self.fire(Outcome::Exit(reason));
        if fired {
            tracing::debug!("{origin}: shutdown ({reason:?})");
        } else {
            tracing::trace!("{origin}: shutdown already signaled");
        }
        fired
    }

    /// Signal shutdown because of an error. Returns true if this call fired
    /// the signal; otherwise the error is logged and dropped.
    pub fn fail(&self, origin: &str, error: Error) -> bool {
        let message = error.to_string();
        let fired = self.fire(Outcome::Failed(error));
        if fired {
            tracing::debug!("{origin}: shutdown after error: {message}");
        } else {
            tracing::debug!("{origin}: error after shutdown: {message}");
        }
        fired
    }

    fn fire(&self, outcome: Outcome) -> bool {
        let mut outcome = Some(outcome);
        // The watch lock serializes concurrent signalers; only the first one
        // flips the flag and stores its outcome.
        self.inner.signaled.send_if_modified(|signaled| {
            if *signaled {
                return false;
            }
            *signaled = true;
            *self.inner.outcome.lock() = outcome.take();
            true
        })
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.inner.signaled.borrow()
    }

    /// Resolves once the signal has fired (immediately if it already has).
    pub async fn triggered(&self) {
        let mut rx = self.inner.signaled.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|signaled| *signaled).await;
    }

    /// Consume the recorded outcome. Called once all loops have stopped.
    pub(crate) fn take_outcome(&self) -> Result<ExitReason> {
        match self.inner.outcome.lock().take() {
            Some(Outcome::Exit(reason)) => Ok(reason),
            Some(Outcome::Failed(error)) => Err(error),
            None => Ok(ExitReason::Requested),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_trigger_is_absorbed() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger("test", ExitReason::Detached));
        assert!(!shutdown.trigger("test", ExitReason::Requested));
        assert!(!shutdown.fail("test", Error::EmptyFrame));
        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.take_outcome().unwrap(), ExitReason::Detached);
    }

    #[test]
    fn test_first_error_is_kept() {
        let shutdown = Shutdown::new();
        assert!(shutdown.fail("output", Error::EmptyFrame));
        assert!(!shutdown.trigger("input", ExitReason::Detached));
        assert!(matches!(shutdown.take_outcome(), Err(Error::EmptyFrame)));
    }

    #[test]
    fn test_concurrent_triggers_fire_once() {
        let shutdown = Shutdown::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shutdown = shutdown.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    shutdown.trigger("thread", ExitReason::Requested)
                })
            })
            .collect();

        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&fired| fired)
            .count();
        assert_eq!(fired, 1);
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.triggered().await })
        };
        tokio::task::yield_now().await;
        shutdown.trigger("test", ExitReason::Requested);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Late waiters resolve immediately.
        tokio::time::timeout(std::time::Duration::from_millis(10), shutdown.triggered())
            .await
            .unwrap();
    }
}
