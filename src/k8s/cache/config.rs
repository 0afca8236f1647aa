/**
 * Configuration constants for the resource synchronizer
 */
use crate::error::{Error, Result};
use std::time::Duration;

/// How often the driver re-lists to heal missed watch events
pub const DEFAULT_RESYNC_INTERVAL_SECONDS: u64 = 60;

/// Maximum backoff time in seconds between watch restart attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Tuning knobs for a `ResourceSynchronizer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Period of the re-list/reconcile pass
    pub resync_interval: Duration,
    /// First delay after a failed watch
    pub initial_backoff: Duration,
    /// Ceiling for the doubling backoff
    pub max_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECONDS),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECONDS),
            max_backoff: Duration::from_secs(MAX_BACKOFF_SECONDS),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn with_resync_interval(resync_interval: Duration) -> Self {
        Self {
            resync_interval,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// Returns a configuration error for a zero resync interval, a zero
    /// initial backoff, or a ceiling below the initial backoff
    pub fn validate(&self) -> Result<()> {
        if self.resync_interval.is_zero() {
            return Err(Error::Configuration(
                "resync interval must be greater than zero".to_string(),
            ));
        }
        if self.initial_backoff.is_zero() {
            return Err(Error::Configuration(
                "initial backoff must be greater than zero".to_string(),
            ));
        }
        if self.max_backoff < self.initial_backoff {
            return Err(Error::Configuration(format!(
                "max backoff {:?} is shorter than initial backoff {:?}",
                self.max_backoff, self.initial_backoff
            )));
        }
        Ok(())
    }

    /// Next delay after `current`, doubling up to the ceiling
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_RESYNC_INTERVAL_SECONDS > 0, "DEFAULT_RESYNC_INTERVAL_SECONDS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS >= INITIAL_BACKOFF_SECONDS, "MAX_BACKOFF_SECONDS must not be below INITIAL_BACKOFF_SECONDS");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
};
