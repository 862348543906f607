//! Sticky one-shot readiness notification.
//!
//! A freshly RCU-installed [`StorageState`](crate::state::StorageState) is
//! published before its fields are necessarily valid; [`Readiness`] is the
//! rendezvous point that lets a background task finish populating the state
//! and then release every waiter in one shot. Once fired, `Readiness` stays
//! fired -- waiting on an already-fired instance never blocks.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A single-fire notification underlying `StorageState::ready`: fields
/// other than `ready` itself must not be observed until it has fired.
#[derive(Debug, Default)]
pub struct Readiness {
    fired: AtomicBool,
    notify: Notify,
}

impl Readiness {
    /// Creates a new, unfired readiness event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Creates a readiness event that is already fired.
    ///
    /// Used by devices whose placement transition completes synchronously
    /// (e.g. the in-memory device never has anything to wait for).
    #[must_use]
    pub fn fired() -> Self {
        Self {
            fired: AtomicBool::new(true),
            notify: Notify::new(),
        }
    }

    /// Fires the event, releasing every current and future waiter.
    ///
    /// Idempotent: firing an already-fired event is a no-op.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    /// Returns `true` if the event has fired.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Waits for the event to fire. Returns immediately if already fired.
    pub async fn wait(&self) {
        if self.is_fired() {
            return;
        }
        // Register interest before re-checking the flag so a fire() racing
        // with this call can never be missed between the check and the wait.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn fired_on_construction_never_blocks() {
        let r = Readiness::fired();
        tokio::time::timeout(Duration::from_millis(50), r.wait())
            .await
            .expect("wait on pre-fired readiness must not block");
    }

    #[tokio::test]
    async fn wait_blocks_until_fired() {
        let r = Arc::new(Readiness::new());
        let waiter = {
            let r = r.clone();
            tokio::spawn(async move {
                r.wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        r.fire();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter must complete after fire")
            .unwrap();
    }

    #[tokio::test]
    async fn fire_is_idempotent() {
        let r = Readiness::new();
        r.fire();
        r.fire();
        assert!(r.is_fired());
        r.wait().await;
    }
}
