// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::warn;

/// Create a new k8s client to interact with k8s cluster api
///
/// An unusable user agent is logged and skipped, the client falls back to
/// kube's default.
///
/// # Errors
///
/// Will return `Err` if no kubeconfig or in-cluster configuration can be inferred
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;

    if let Some(user_agent) = custom_user_agent {
        match user_agent_header(user_agent) {
            Ok(header) => config.headers.push(header),
            Err(e) => warn!("Ignoring invalid user agent {:?}: {}", user_agent, e),
        }
    }

    let client = Client::try_from(config)?;

    Ok(client)
}

/// Like [`new`], but an invalid user agent is an error
///
/// # Errors
///
/// Will return `Err` if the user agent is not a valid header value or if no
/// configuration can be inferred
pub async fn new_strict(user_agent: &str) -> Result<Client> {
    let header = user_agent_header(user_agent)?;
    let mut config = Config::infer().await?;
    config.headers.push(header);
    Ok(Client::try_from(config)?)
}

/// Build the `user-agent` header pair
///
/// # Errors
///
/// Will return `Err` if `user_agent` contains characters not allowed in a header
pub fn user_agent_header(user_agent: &str) -> Result<(HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(user_agent)?;
    Ok((HeaderName::from_static("user-agent"), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::k8s::USER_AGENT;

    #[test]
    fn test_default_user_agent_is_valid_header() {
        let (name, value) = user_agent_header(USER_AGENT).unwrap();
        assert_eq!(name.as_str(), "user-agent");
        assert!(value.to_str().unwrap().starts_with("kubesync/"));
    }

    #[test]
    fn test_control_characters_are_rejected() {
        let result = user_agent_header("\u{007F}InvalidAgent");
        assert!(matches!(result, Err(Error::HttpHeader(_))));
    }
}
