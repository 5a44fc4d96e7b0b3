//! Engine lifecycle with live-operation tracking.
//!
//! Uses `ArcSwap` for lock-free state transitions and an atomic counter with
//! RAII guards, one per live operation, so draining knows when every runner
//! has exited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

/// Engine state.
///
/// State machine: Starting -> Running -> Draining -> Stopped. Any state can
/// move to Poisoned, which is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Built but not yet accepting work.
    Starting,
    /// Launching ops and accepting new inbound conversations.
    Running,
    /// Live ops may finish; nothing new starts.
    Draining,
    /// All runners have exited.
    Stopped,
    /// An invariant violation was detected. Nothing new starts.
    Poisoned,
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ArcSwap<EngineState>,
    live: Arc<AtomicU64>,
    terminate: watch::Sender<bool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (terminate, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(EngineState::Starting),
            live: Arc::new(AtomicU64::new(0)),
            terminate,
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        **self.state.load()
    }

    /// Moves to `to` if the current state is one of `from`. Returns whether
    /// the transition happened.
    fn transition(&self, from: &[EngineState], to: EngineState) -> bool {
        let prev = self.state.rcu(|current| {
            if from.contains(current) {
                Arc::new(to)
            } else {
                Arc::clone(current)
            }
        });
        from.contains(&prev)
    }

    pub(crate) fn set_running(&self) -> bool {
        self.transition(&[EngineState::Starting], EngineState::Running)
    }

    pub(crate) fn begin_drain(&self) -> bool {
        self.transition(&[EngineState::Running], EngineState::Draining)
    }

    pub(crate) fn mark_stopped(&self) -> bool {
        self.transition(&[EngineState::Draining], EngineState::Stopped)
    }

    pub(crate) fn poison(&self) {
        self.state.store(Arc::new(EngineState::Poisoned));
    }

    pub(crate) fn live_guard(&self) -> LiveOpGuard {
        self.live.fetch_add(1, Ordering::Relaxed);
        LiveOpGuard {
            live: Arc::clone(&self.live),
        }
    }

    pub(crate) fn live_count(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    /// Receiver that flips to `true` when runners must stop immediately.
    pub(crate) fn terminate_receiver(&self) -> watch::Receiver<bool> {
        self.terminate.subscribe()
    }

    pub(crate) fn terminate(&self) {
        // Stored even with no receiver, so late subscribers still see it.
        self.terminate.send_replace(true);
    }

    /// Waits until no live op remains, up to `timeout`. Returns `true` if the
    /// engine drained.
    pub(crate) async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.live.load(Ordering::Relaxed) == 0 {
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Decrements the live-op counter when dropped, including during unwinding.
#[derive(Debug)]
pub(crate) struct LiveOpGuard {
    live: Arc<AtomicU64>,
}

impl Drop for LiveOpGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_starting() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), EngineState::Starting);
        assert_eq!(lifecycle.live_count(), 0);
    }

    #[test]
    fn transitions_follow_state_machine() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.begin_drain());
        assert!(lifecycle.set_running());
        assert!(!lifecycle.set_running());
        assert!(lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), EngineState::Draining);
        assert!(lifecycle.mark_stopped());
        assert_eq!(lifecycle.state(), EngineState::Stopped);
    }

    #[test]
    fn poisoned_is_final() {
        let lifecycle = Lifecycle::new();
        lifecycle.set_running();
        lifecycle.poison();
        assert!(!lifecycle.begin_drain());
        assert!(!lifecycle.mark_stopped());
        assert_eq!(lifecycle.state(), EngineState::Poisoned);
    }

    #[test]
    fn live_guard_counts() {
        let lifecycle = Lifecycle::new();
        let a = lifecycle.live_guard();
        let b = lifecycle.live_guard();
        assert_eq!(lifecycle.live_count(), 2);
        drop(a);
        drop(b);
        assert_eq!(lifecycle.live_count(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let lifecycle = Lifecycle::new();
        let guard = lifecycle.live_guard();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out() {
        let lifecycle = Lifecycle::new();
        let _guard = lifecycle.live_guard();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn terminate_notifies_receivers() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.terminate_receiver();
        assert!(!*rx.borrow());
        lifecycle.terminate();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[test]
    fn late_subscriber_sees_terminate() {
        let lifecycle = Lifecycle::new();
        lifecycle.terminate();
        assert!(*lifecycle.terminate_receiver().borrow());
    }
}
