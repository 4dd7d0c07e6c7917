//! Serializing cooldown gate for the rate-limited publisher endpoint.
//!
//! Only one holder of a [`CooldownPermit`] exists at a time. When a permit is dropped the
//! release instant is stamped, and the next [`Cooldown::acquire`] sleeps until the configured
//! interval has elapsed since that instant. The wait is unconditional: there is no way to
//! obtain a permit early.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Instant, sleep_until};

/// Shared cooldown gate. Clones share the same underlying slot.
#[derive(Clone)]
pub struct Cooldown {
    interval: Duration,
    last_release: Arc<Mutex<Option<Instant>>>,
}

/// Exclusive right to issue one request; the cooldown clock starts when it is dropped.
pub struct CooldownPermit {
    slot: OwnedMutexGuard<Option<Instant>>,
}

impl Cooldown {
    /// Gate that separates consecutive permits by at least `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_release: Arc::new(Mutex::new(None)),
        }
    }

    /// Configured minimum spacing.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for exclusive access, then for the remainder of the cooldown.
    pub async fn acquire(&self) -> CooldownPermit {
        let slot = self.last_release.clone().lock_owned().await;
        self.wait_after(*slot).await;
        CooldownPermit { slot }
    }

    /// Wait out the cooldown following the most recent release without taking a permit.
    ///
    /// Returns immediately when no permit was ever released or the interval already passed.
    pub async fn settle(&self) {
        let slot = self.last_release.lock().await;
        self.wait_after(*slot).await;
    }

    async fn wait_after(&self, released: Option<Instant>) {
        let Some(released) = released else {
            return;
        };
        let ready_at = released + self.interval;
        let now = Instant::now();
        if ready_at > now {
            tracing::debug!(
                wait_ms = (ready_at - now).as_millis() as u64,
                "Waiting for publisher cooldown"
            );
            sleep_until(ready_at).await;
        }
    }
}

impl Drop for CooldownPermit {
    fn drop(&mut self) {
        *self.slot = Some(Instant::now());
    }
}
