//! Reconnect requests and backoff policy
//!
//! Any component that notices a broken connection calls
//! [`ReconnectRequester::request`]. Requests are collapsed: while one is
//! pending, further requests are dropped, so an outage seen by several tasks
//! at once still produces a single reconnect episode.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

/// Producer side of the reconnect signal. Cheap to clone.
#[derive(Clone)]
pub struct ReconnectRequester {
    pending: Arc<AtomicBool>,
    tx: mpsc::Sender<()>,
}

/// Consumer side of the reconnect signal, owned by the supervisor.
pub struct ReconnectReceiver {
    pending: Arc<AtomicBool>,
    rx: mpsc::Receiver<()>,
}

/// Create a linked requester/receiver pair
pub fn reconnect_channel() -> (ReconnectRequester, ReconnectReceiver) {
    let pending = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel(1);
    (
        ReconnectRequester {
            pending: pending.clone(),
            tx,
        },
        ReconnectReceiver { pending, rx },
    )
}

impl ReconnectRequester {
    /// Ask the supervisor to reconnect. Returns false when a request was
    /// already pending and this one was dropped.
    pub fn request(&self, reason: &str) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(reason, "Reconnect already pending, request dropped");
            return false;
        }

        match self.tx.try_send(()) {
            Ok(()) => {
                tracing::info!(reason, "Reconnect requested");
                true
            }
            Err(_) => {
                // Receiver gone (shutting down) or slot somehow occupied.
                self.pending.store(false, Ordering::Release);
                false
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl ReconnectReceiver {
    /// Wait for the next request. The pending flag is cleared before
    /// returning so failures seen during the episode are not lost.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await?;
        self.pending.store(false, Ordering::Release);
        Some(())
    }

    /// Take a queued request without waiting
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> bool {
        if self.rx.try_recv().is_ok() {
            self.pending.store(false, Ordering::Release);
            true
        } else {
            false
        }
    }
}

/// Two-tier reconnect policy: bounded exponential backoff, then a slow
/// cooldown retry that never gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            max_retries: 10,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before the given attempt: `base` for attempt 0, otherwise
    /// `min(base * 2^attempt, max_delay)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.base_delay;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Fresh state for a new reconnect episode
    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }
}

/// Progress through one reconnect episode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryState {
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_requests_are_dropped() {
        let (requester, mut receiver) = reconnect_channel();

        assert!(requester.request("first"));
        for _ in 0..20 {
            assert!(!requester.request("duplicate"));
        }
        assert!(requester.is_pending());

        assert!(receiver.recv().await.is_some());
        assert!(!requester.is_pending());

        // Nothing else was queued behind the first request.
        assert!(receiver.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_requests_collapse_to_one() {
        let (requester, mut receiver) = reconnect_channel();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let requester = requester.clone();
                tokio::spawn(async move { requester.request("concurrent") })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert!(receiver.recv().await.is_some());
        assert!(receiver.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_after_receive_is_accepted() {
        let (requester, mut receiver) = reconnect_channel();
        assert!(requester.request("a"));
        receiver.recv().await.unwrap();
        assert!(requester.request("b"));
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.delay_for(5), Duration::from_secs(160));
        assert_eq!(policy.delay_for(6), Duration::from_secs(300));
        assert_eq!(policy.delay_for(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (0..policy.max_retries).map(|k| policy.delay_for(k)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= policy.max_delay));
    }
}
