pub mod cache;
pub mod client;
pub mod registry;

/// Default user agent for `kubesync` - automatically uses the package version
///
/// Every [`KubeRegistry`](registry::KubeRegistry) built through
/// `client::new(Some(USER_AGENT))` identifies itself with this value so the
/// long-lived list/watch traffic is easy to pick out in API server audit logs.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
