pub mod cached_data;
pub mod config;
pub mod data_cache;
pub mod errors;
pub mod ready_gate;
pub mod subscription;
pub mod synchronizer;

pub use cached_data::CachedRecord;
pub use config::SyncConfig;
pub use data_cache::{CacheStats, ResourceCache};
pub use ready_gate::ReadyGate;
pub use subscription::{ChannelObserver, ObserverFns, ObserverSet, ResourceEvent, ResourceObserver};
pub use synchronizer::{ErrorReporter, ResourceSynchronizer, SyncStats, WatchConnectionStatus};
