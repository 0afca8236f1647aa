/**
 * In-process registry
 *
 * Keeps one collection in memory together with an ordered change log, so a
 * watch can resume from any resource version still in the log, much like an
 * API server does. Faults can be injected to exercise the synchronizer's
 * recovery paths without a cluster.
 */
use super::{
    ChangeKind, Listing, ResourceKey, ResourceKind, ResourceRecord, ResourceRegistry, WatchEvent,
    WatchStream,
};
use crate::error::{Error, Result};
use crate::k8s::cache::errors::{
    expired_resume_token_error, kind_not_found_error, registry_unavailable_error,
};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

type WatchSender = mpsc::UnboundedSender<Result<WatchEvent>>;

struct Watcher {
    namespace: Option<String>,
    sender: WatchSender,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKey, ResourceRecord>,
    log: Vec<(u64, WatchEvent)>,
    revision: u64,
    /// Oldest revision a watch may still resume from
    compacted: u64,
    watchers: Vec<Watcher>,
    list_failure: Option<String>,
    invalid: bool,
    list_calls: usize,
    watch_calls: usize,
}

impl State {
    fn next_record(&mut self, key: ResourceKey, payload: Value) -> ResourceRecord {
        self.revision += 1;
        ResourceRecord::new(key, Some(self.revision.to_string()), payload)
    }

    fn publish(&mut self, event: WatchEvent) {
        self.log.push((self.revision, event.clone()));
        self.watchers.retain(|watcher| {
            if !event.record.key.in_namespace(watcher.namespace.as_deref()) {
                return !watcher.sender.is_closed();
            }
            watcher.sender.send(Ok(event.clone())).is_ok()
        });
    }
}

/// Registry for a single [`ResourceKind`], held entirely in memory
pub struct MemoryRegistry {
    kind: ResourceKind,
    state: Mutex<State>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new object and announce it as `Added`
    ///
    /// An existing object under the same key is replaced and announced as
    /// `Modified` instead.
    pub fn create(&self, key: ResourceKey, payload: Value) -> ResourceRecord {
        let mut state = self.state();
        let change = if state.objects.contains_key(&key) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let record = state.next_record(key, payload);
        state.objects.insert(record.key.clone(), record.clone());
        state.publish(WatchEvent::new(change, record.clone()));
        record
    }

    /// Replace an object's payload and announce it as `Modified`
    ///
    /// Returns `None` if the object does not exist.
    pub fn update(&self, key: &ResourceKey, payload: Value) -> Option<ResourceRecord> {
        let mut state = self.state();
        if !state.objects.contains_key(key) {
            return None;
        }
        let record = state.next_record(key.clone(), payload);
        state.objects.insert(key.clone(), record.clone());
        state.publish(WatchEvent::new(ChangeKind::Modified, record.clone()));
        Some(record)
    }

    /// Remove an object and announce it as `Deleted`
    pub fn delete(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        let mut state = self.state();
        let removed = state.objects.remove(key)?;
        let record = state.next_record(key.clone(), removed.payload);
        state.publish(WatchEvent::new(ChangeKind::Deleted, record.clone()));
        Some(record)
    }

    /// Replace (or create) an object without telling any watcher
    ///
    /// Models an event lost between the server and the client; only a
    /// re-list will reveal it.
    pub fn update_silently(&self, key: ResourceKey, payload: Value) -> ResourceRecord {
        let mut state = self.state();
        let record = state.next_record(key, payload);
        state.objects.insert(record.key.clone(), record.clone());
        record
    }

    /// Remove an object without telling any watcher
    pub fn delete_silently(&self, key: &ResourceKey) -> Option<ResourceRecord> {
        let mut state = self.state();
        let removed = state.objects.remove(key)?;
        state.revision += 1;
        Some(removed)
    }

    /// Fail every open watch stream and close it
    pub fn disconnect_watchers(&self) {
        let watchers = std::mem::take(&mut self.state().watchers);
        debug!("Disconnecting {} watcher(s)", watchers.len());
        for watcher in watchers {
            let _ = watcher
                .sender
                .send(Err(Error::Registry("watch connection reset".to_string())));
        }
    }

    /// Drop the change log; watches resuming from before now will be refused
    pub fn compact(&self) {
        let mut state = self.state();
        state.log.clear();
        state.compacted = state.revision;
    }

    /// Make every following `list` fail with `message`
    pub fn fail_lists(&self, message: impl Into<String>) {
        self.state().list_failure = Some(message.into());
    }

    pub fn clear_failures(&self) {
        self.state().list_failure = None;
    }

    /// Mark the handle unusable, `validate` starts failing
    pub fn invalidate(&self) {
        self.state().invalid = true;
    }

    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    #[must_use]
    pub fn watch_calls(&self) -> usize {
        self.state().watch_calls
    }

    /// Watch streams whose receiving side is still alive
    #[must_use]
    pub fn active_watchers(&self) -> usize {
        self.state()
            .watchers
            .iter()
            .filter(|watcher| !watcher.sender.is_closed())
            .count()
    }

    /// Current collection version
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.state().revision
    }

    fn check_kind(&self, kind: &ResourceKind) -> Result<()> {
        if *kind == self.kind {
            Ok(())
        } else {
            Err(kind_not_found_error(kind))
        }
    }
}

#[async_trait]
impl ResourceRegistry for MemoryRegistry {
    fn validate(&self) -> Result<()> {
        if self.state().invalid {
            return Err(registry_unavailable_error("memory registry was invalidated"));
        }
        Ok(())
    }

    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Listing> {
        let mut state = self.state();
        state.list_calls += 1;
        self.check_kind(kind)?;
        if let Some(message) = &state.list_failure {
            return Err(Error::Registry(message.clone()));
        }

        let records = state
            .objects
            .values()
            .filter(|record| record.key.in_namespace(namespace))
            .cloned()
            .collect();
        Ok(Listing {
            records,
            resume_token: Some(state.revision.to_string()),
        })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resume_token: Option<&str>,
    ) -> Result<WatchStream> {
        let mut state = self.state();
        state.watch_calls += 1;
        self.check_kind(kind)?;

        let from = match resume_token {
            Some(token) => token
                .parse::<u64>()
                .map_err(|_| Error::Registry(format!("malformed resume token {token:?}")))?,
            None => state.revision,
        };
        if from < state.compacted {
            return Err(expired_resume_token_error(resume_token.unwrap_or_default()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        for (revision, event) in &state.log {
            if *revision > from && event.record.key.in_namespace(namespace) {
                let _ = sender.send(Ok(event.clone()));
            }
        }
        state.watchers.push(Watcher {
            namespace: namespace.map(ToOwned::to_owned),
            sender,
        });

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::json;

    fn pods() -> ResourceKind {
        ResourceKind::new("", "v1", "pods")
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace() {
        let registry = MemoryRegistry::new(pods());
        registry.create(ResourceKey::namespaced("default", "a"), json!({}));
        registry.create(ResourceKey::namespaced("other", "b"), json!({}));

        let all = registry.list(&pods(), None).await.unwrap();
        assert_eq!(all.records.len(), 2);
        assert_eq!(all.resume_token.as_deref(), Some("2"));

        let scoped = registry.list(&pods(), Some("other")).await.unwrap();
        assert_eq!(scoped.records.len(), 1);
        assert_eq!(scoped.records[0].key.name, "b");
    }

    #[tokio::test]
    async fn test_watch_replays_from_resume_token() {
        let registry = MemoryRegistry::new(pods());
        let a = ResourceKey::namespaced("default", "a");
        registry.create(a.clone(), json!({"v": 1}));
        registry.update(&a, json!({"v": 2}));
        registry.delete(&a);
        assert_eq!(registry.revision(), 3);

        let mut stream = registry.watch(&pods(), None, Some("1")).await.unwrap();
        let modified = stream.next().await.unwrap().unwrap();
        assert_eq!(modified.change, ChangeKind::Modified);
        assert_eq!(modified.record.payload, json!({"v": 2}));
        let deleted = stream.next().await.unwrap().unwrap();
        assert_eq!(deleted.change, ChangeKind::Deleted);
        assert_eq!(deleted.record.resource_version.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_live_events_reach_open_watch() {
        let registry = MemoryRegistry::new(pods());
        let mut stream = registry.watch(&pods(), Some("default"), None).await.unwrap();

        registry.create(ResourceKey::namespaced("other", "skip"), json!({}));
        registry.create(ResourceKey::namespaced("default", "keep"), json!({}));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.record.key.name, "keep");
        assert_eq!(registry.active_watchers(), 1);
    }

    #[tokio::test]
    async fn test_silent_changes_are_not_watched() {
        let registry = MemoryRegistry::new(pods());
        let mut stream = registry.watch(&pods(), None, None).await.unwrap();
        let a = ResourceKey::namespaced("default", "a");

        registry.update_silently(a.clone(), json!({}));
        registry.create(ResourceKey::namespaced("default", "b"), json!({}));

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.record.key.name, "b");
        assert!(registry.delete_silently(&a).is_some());
        assert_eq!(registry.list(&pods(), None).await.unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_then_ends_streams() {
        let registry = MemoryRegistry::new(pods());
        let mut stream = registry.watch(&pods(), None, None).await.unwrap();

        registry.disconnect_watchers();

        assert!(matches!(stream.next().await, Some(Err(Error::Registry(_)))));
        assert!(stream.next().await.is_none());
        assert_eq!(registry.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_compaction_expires_old_tokens() {
        let registry = MemoryRegistry::new(pods());
        registry.create(ResourceKey::namespaced("default", "a"), json!({}));
        registry.create(ResourceKey::namespaced("default", "b"), json!({}));
        registry.compact();

        assert!(registry.watch(&pods(), None, Some("1")).await.is_err());
        assert!(registry.watch(&pods(), None, Some("2")).await.is_ok());
        assert!(registry.watch(&pods(), None, Some("abc")).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let registry = MemoryRegistry::new(pods());
        registry.fail_lists("forbidden");
        assert!(matches!(
            registry.list(&pods(), None).await,
            Err(Error::Registry(msg)) if msg == "forbidden"
        ));
        registry.clear_failures();
        assert!(registry.list(&pods(), None).await.is_ok());
        assert_eq!(registry.list_calls(), 2);

        let services = ResourceKind::new("", "v1", "services");
        assert!(registry.list(&services, None).await.is_err());

        assert!(registry.validate().is_ok());
        registry.invalidate();
        assert!(matches!(registry.validate(), Err(Error::Configuration(_))));
    }
}
