/**
 * One-way "initial listing applied" flag
 *
 * The flag lives behind a reader/writer lock so the synchronizer and any
 * number of `is_ready` callers can look at it concurrently, and a `Notify`
 * wakes the callers parked in `ReadyGate::wait` when it flips.
 */
use std::sync::{PoisonError, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct ReadyGate {
    synced: RwLock<bool>,
    notify: Notify,
}

impl ReadyGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.synced.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flip to ready and wake every waiter
    ///
    /// Returns `false` if the gate was already open; it never closes again.
    pub fn open(&self) -> bool {
        {
            let mut synced = self.synced.write().unwrap_or_else(PoisonError::into_inner);
            if *synced {
                return false;
            }
            *synced = true;
        }
        self.notify.notify_waiters();
        true
    }

    /// Park until the gate opens or `cancel` fires
    ///
    /// An already fired token wins, even over an open gate.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }

        // Register interest before looking at the flag, otherwise an `open`
        // between the check and the await would be missed.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_ready() {
            return true;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = &mut notified => self.is_ready(),
        }
    }
}
