use crate::k8s::registry::ResourceRecord;
use std::time::{Duration, Instant};

/// A record as held by the cache, with local bookkeeping
#[derive(Debug, Clone)]
pub struct CachedRecord {
    pub record: ResourceRecord,
    pub last_updated: Instant,
    pub version: u64, // local count of applied updates
}

impl CachedRecord {
    #[must_use]
    pub fn new(record: ResourceRecord) -> Self {
        Self {
            record,
            last_updated: Instant::now(),
            version: 0,
        }
    }

    /// Swap in a newer state, returning the one it replaces
    pub fn update(&mut self, record: ResourceRecord) -> ResourceRecord {
        self.last_updated = Instant::now();
        self.version += 1;
        std::mem::replace(&mut self.record, record)
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.last_updated.elapsed()
    }
}
