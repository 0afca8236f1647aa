/**
 * Resource cache
 *
 * Keyed snapshot of one collection plus the apply and diff logic that turns
 * watch events and fresh listings into observer events.
 */
use super::cached_data::CachedRecord;
use super::subscription::ResourceEvent;
use crate::k8s::registry::{ChangeKind, ResourceKey, ResourceRecord, WatchEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

/// Local snapshot of one collection
///
/// Only the synchronizer's driver writes to it; everything else gets
/// read-only views.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: RwLock<HashMap<ResourceKey, CachedRecord>>,
    mutations: AtomicU64,
}

impl ResourceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ResourceKey, CachedRecord>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ResourceKey, CachedRecord>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn count_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        self.read().get(key).map(|entry| entry.record.clone())
    }

    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.read().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All records, ordered by key
    #[must_use]
    pub fn snapshot(&self) -> Vec<ResourceRecord> {
        let mut records: Vec<_> = self.read().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Absorb a listed record without producing an event
    pub fn insert(&self, record: ResourceRecord) {
        let mut entries = self.write();
        match entries.get_mut(&record.key) {
            Some(entry) => {
                entry.update(record);
            }
            None => {
                entries.insert(record.key.clone(), CachedRecord::new(record));
            }
        }
        drop(entries);
        self.count_mutation();
    }

    /// Apply one change and report what it did to the cache
    ///
    /// Returns `None` when the change leaves the cache as it was: a re-sent
    /// state we already hold, or a delete for something we never had.
    pub fn apply(&self, event: WatchEvent) -> Option<ResourceEvent> {
        let WatchEvent { change, record } = event;
        let mut entries = self.write();

        let outcome = match change {
            ChangeKind::Added | ChangeKind::Modified => match entries.get_mut(&record.key) {
                Some(entry) if entry.record.same_state(&record) => {
                    debug!("Skipping unchanged {}", record.key);
                    None
                }
                Some(entry) => {
                    let old = entry.update(record.clone());
                    Some(ResourceEvent::Updated { old, new: record })
                }
                None => {
                    entries.insert(record.key.clone(), CachedRecord::new(record.clone()));
                    Some(ResourceEvent::Added(record))
                }
            },
            ChangeKind::Deleted => entries
                .remove(&record.key)
                .map(|_| ResourceEvent::Deleted(record)),
        };
        drop(entries);

        if outcome.is_some() {
            self.count_mutation();
        }
        outcome
    }

    /// Changes that turn the cache into `listed`
    ///
    /// Records present in both with the same state produce nothing. Deletes
    /// carry the last state the cache held.
    #[must_use]
    pub fn diff(&self, listed: &[ResourceRecord]) -> Vec<WatchEvent> {
        let entries = self.read();
        let listed_keys: HashSet<&ResourceKey> = listed.iter().map(|r| &r.key).collect();

        let mut changes: Vec<WatchEvent> = listed
            .iter()
            .filter_map(|record| match entries.get(&record.key) {
                None => Some(WatchEvent::new(ChangeKind::Added, record.clone())),
                Some(entry) if !entry.record.same_state(record) => {
                    Some(WatchEvent::new(ChangeKind::Modified, record.clone()))
                }
                Some(_) => None,
            })
            .collect();

        let mut gone: Vec<_> = entries
            .values()
            .filter(|entry| !listed_keys.contains(&entry.record.key))
            .map(|entry| WatchEvent::new(ChangeKind::Deleted, entry.record.clone()))
            .collect();
        gone.sort_by(|a, b| a.record.key.cmp(&b.record.key));
        changes.extend(gone);
        changes
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.read();
        let total_entries = entries.len();
        let updated_entries = entries.values().filter(|e| e.version > 0).count();
        let oldest_entry_age = entries.values().map(CachedRecord::age).max();
        drop(entries);

        CacheStats {
            total_entries,
            updated_entries,
            total_mutations: self.mutations.load(Ordering::Relaxed),
            oldest_entry_age,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_entries: usize,
    /// Entries that changed at least once after being first stored
    pub updated_entries: usize,
    pub total_mutations: u64,
    pub oldest_entry_age: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::json;

    fn record(name: &str, rv: &str) -> ResourceRecord {
        ResourceRecord::new(
            ResourceKey::namespaced("default", name),
            Some(rv.to_string()),
            json!({ "name": name, "rv": rv }),
        )
    }

    #[test]
    fn test_apply_add_update_delete() {
        let cache = ResourceCache::new();

        let added = cache.apply(WatchEvent::new(ChangeKind::Added, record("a", "1")));
        assert!(matches!(added, Some(ResourceEvent::Added(r)) if r.key.name == "a"));

        let updated = cache.apply(WatchEvent::new(ChangeKind::Modified, record("a", "2")));
        match updated {
            Some(ResourceEvent::Updated { old, new }) => {
                assert_eq!(old.resource_version.as_deref(), Some("1"));
                assert_eq!(new.resource_version.as_deref(), Some("2"));
            }
            other => panic!("expected update, got {other:?}"),
        }

        let deleted = cache.apply(WatchEvent::new(ChangeKind::Deleted, record("a", "3")));
        assert!(matches!(deleted, Some(ResourceEvent::Deleted(_))));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().total_mutations, 3);
    }

    #[test]
    fn test_apply_is_idempotent_for_known_state() {
        let cache = ResourceCache::new();
        cache.insert(record("a", "1"));

        assert!(cache.apply(WatchEvent::new(ChangeKind::Added, record("a", "1"))).is_none());
        assert!(cache.apply(WatchEvent::new(ChangeKind::Modified, record("a", "1"))).is_none());
        assert!(cache.apply(WatchEvent::new(ChangeKind::Deleted, record("zz", "9"))).is_none());
        assert_eq!(cache.stats().total_mutations, 1);
    }

    #[test]
    fn test_added_for_known_key_becomes_update() {
        let cache = ResourceCache::new();
        cache.insert(record("a", "1"));

        let event = cache.apply(WatchEvent::new(ChangeKind::Added, record("a", "5")));
        assert!(matches!(event, Some(ResourceEvent::Updated { .. })));

        let event = cache.apply(WatchEvent::new(ChangeKind::Modified, record("b", "6")));
        assert!(matches!(event, Some(ResourceEvent::Added(_))));
    }

    #[test]
    fn test_diff_reports_only_net_changes() {
        let cache = ResourceCache::new();
        cache.insert(record("a", "1"));
        cache.insert(record("b", "2"));
        cache.insert(record("c", "3"));

        let listed = vec![record("a", "1"), record("b", "7"), record("d", "8")];
        let changes = cache.diff(&listed);

        let summary: Vec<_> = changes
            .iter()
            .map(|e| (e.change, e.record.key.name.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (ChangeKind::Modified, "b"),
                (ChangeKind::Added, "d"),
                (ChangeKind::Deleted, "c"),
            ]
        );
        // the delete carries the cached state
        assert_eq!(changes[2].record.resource_version.as_deref(), Some("3"));

        assert!(cache.diff(&cache.snapshot()).is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let cache = ResourceCache::new();
        cache.insert(record("b", "1"));
        cache.insert(record("a", "2"));
        let names: Vec<_> = cache.snapshot().into_iter().map(|r| r.key.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(cache.contains(&ResourceKey::namespaced("default", "a")));
        assert_eq!(cache.get(&ResourceKey::namespaced("default", "b")).unwrap().resource_version.as_deref(), Some("1"));
    }
}
