/**
 * Helper functions for creating common error types
 */
use crate::error::Error;
use crate::k8s::registry::ResourceKind;

/// Create a configuration error for a kind that cannot address a collection
#[must_use]
pub fn invalid_kind_error(kind: &ResourceKind, reason: &str) -> Error {
    Error::Configuration(format!(
        "invalid resource kind (group {:?}, version {:?}, plural {:?}): {reason}",
        kind.group, kind.version, kind.plural
    ))
}

/// Create a configuration error for a registry handle that cannot be used
#[must_use]
pub fn registry_unavailable_error(message: &str) -> Error {
    Error::Configuration(format!("registry handle is not usable: {message}"))
}

/// Create an `AlreadyStarted` error for a synchronizer started twice
#[must_use]
pub fn already_started_error(kind: &ResourceKind) -> Error {
    Error::Configuration(format!("synchronizer for {kind} already started"))
}

/// Create a registry error for a kind the registry does not serve
#[must_use]
pub fn kind_not_found_error(kind: &ResourceKind) -> Error {
    Error::Registry(format!("the server could not find the requested resource {kind}"))
}

/// Create a registry error for a resume token older than the retained history
#[must_use]
pub fn expired_resume_token_error(token: &str) -> Error {
    Error::Registry(format!("too old resource version: {token}"))
}
