use crate::error::Error;
use crate::k8s::registry::ResourceRecord;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// A change the cache went through, as delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    Added(ResourceRecord),
    Updated {
        old: ResourceRecord,
        new: ResourceRecord,
    },
    Deleted(ResourceRecord),
}

impl ResourceEvent {
    /// The state the event leaves behind (the last known state for deletes)
    #[must_use]
    pub fn record(&self) -> &ResourceRecord {
        match self {
            Self::Added(record) | Self::Deleted(record) => record,
            Self::Updated { new, .. } => new,
        }
    }
}

/// Receives live changes once the synchronizer is ready
///
/// Callbacks run on the synchronizer's own task, one after another. A slow
/// callback delays every later event for every observer, so hand long work
/// off to another task (see [`ChannelObserver`]). A panicking callback is
/// caught and reported, it does not stop delivery.
pub trait ResourceObserver: Send + Sync {
    fn on_add(&self, record: &ResourceRecord);

    fn on_update(&self, old: &ResourceRecord, new: &ResourceRecord);

    fn on_delete(&self, record: &ResourceRecord);

    /// Label used when reporting a panic
    fn name(&self) -> &str {
        "observer"
    }
}

type RecordFn = Box<dyn Fn(&ResourceRecord) + Send + Sync>;
type UpdateFn = Box<dyn Fn(&ResourceRecord, &ResourceRecord) + Send + Sync>;

/// Observer assembled from closures; missing slots ignore their events
#[derive(Default)]
pub struct ObserverFns {
    name: Option<String>,
    add: Option<RecordFn>,
    update: Option<UpdateFn>,
    delete: Option<RecordFn>,
}

impl ObserverFns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn on_add(mut self, f: impl Fn(&ResourceRecord) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_update(
        mut self,
        f: impl Fn(&ResourceRecord, &ResourceRecord) + Send + Sync + 'static,
    ) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_delete(mut self, f: impl Fn(&ResourceRecord) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl ResourceObserver for ObserverFns {
    fn on_add(&self, record: &ResourceRecord) {
        if let Some(f) = &self.add {
            f(record);
        }
    }

    fn on_update(&self, old: &ResourceRecord, new: &ResourceRecord) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, record: &ResourceRecord) {
        if let Some(f) = &self.delete {
            f(record);
        }
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("observer-fns")
    }
}

/// Forwards every event onto a channel
///
/// The channel is unbounded so delivery never waits on the consumer; a
/// consumer that stops reading makes the queue grow. Events sent after the
/// receiver is dropped are discarded.
pub struct ChannelObserver {
    pub id: String,
    sender: mpsc::UnboundedSender<ResourceEvent>,
}

impl ChannelObserver {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResourceEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();
        (Self { id, sender }, receiver)
    }

    fn forward(&self, event: ResourceEvent) {
        // Send update, ignore if receiver dropped
        let _ = self.sender.send(event);
    }
}

impl ResourceObserver for ChannelObserver {
    fn on_add(&self, record: &ResourceRecord) {
        self.forward(ResourceEvent::Added(record.clone()));
    }

    fn on_update(&self, old: &ResourceRecord, new: &ResourceRecord) {
        self.forward(ResourceEvent::Updated {
            old: old.clone(),
            new: new.clone(),
        });
    }

    fn on_delete(&self, record: &ResourceRecord) {
        self.forward(ResourceEvent::Deleted(record.clone()));
    }

    fn name(&self) -> &str {
        &self.id
    }
}

/// Registered observers, in registration order
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn ResourceObserver>>>,
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.len())
            .finish()
    }
}

impl ObserverSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn ResourceObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand `event` to every observer, containing panics
    ///
    /// Returns one `ObserverPanic` per observer that panicked.
    pub fn dispatch(&self, event: &ResourceEvent) -> Vec<Error> {
        // Callbacks run without the lock held so they may register observers.
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        observers
            .iter()
            .filter_map(|observer| {
                catch_unwind(AssertUnwindSafe(|| deliver(observer.as_ref(), event)))
                    .err()
                    .map(|payload| Error::ObserverPanic {
                        observer: observer.name().to_string(),
                        message: panic_message(payload.as_ref()),
                    })
            })
            .collect()
    }
}

fn deliver(observer: &dyn ResourceObserver, event: &ResourceEvent) {
    match event {
        ResourceEvent::Added(record) => observer.on_add(record),
        ResourceEvent::Updated { old, new } => observer.on_update(old, new),
        ResourceEvent::Deleted(record) => observer.on_delete(record),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
