//! Watch-based resource synchronization for Kubernetes-style collections.
//!
//! A [`ResourceSynchronizer`](k8s::cache::ResourceSynchronizer) lists a
//! collection once, keeps the result warm through a watch stream, and only
//! starts telling observers about changes once that first listing has been
//! absorbed.

pub mod error;
pub mod k8s;
