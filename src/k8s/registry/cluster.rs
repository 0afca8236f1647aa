/**
 * Kubernetes-backed registry
 *
 * Lists and watches any collection by group/version/plural through the
 * dynamic `DynamicObject` API, so no compiled-in types are needed.
 */
use super::{
    ChangeKind, Listing, ResourceKey, ResourceKind, ResourceRecord, ResourceRegistry, WatchEvent,
    WatchStream,
};
use crate::error::{Error, Result};
use crate::k8s::cache::config::WATCH_TIMEOUT_SECONDS;
use crate::k8s::{client, USER_AGENT};
use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::serde_json;
use kube::api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use tracing::debug;

/// Registry talking to a live API server
#[derive(Clone)]
pub struct KubeRegistry {
    client: Client,
    watch_timeout_secs: u32,
}

impl KubeRegistry {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            watch_timeout_secs: WATCH_TIMEOUT_SECONDS,
        }
    }

    /// Build a registry from the inferred kubeconfig, tagged with [`USER_AGENT`]
    ///
    /// # Errors
    ///
    /// Returns an error if no cluster configuration can be inferred
    pub async fn try_default() -> Result<Self> {
        let client = client::new(Some(USER_AGENT)).await?;
        Ok(Self::new(client))
    }

    /// Server-side timeout for each watch request; the driver re-watches when it lapses
    #[must_use]
    pub const fn with_watch_timeout(mut self, seconds: u32) -> Self {
        self.watch_timeout_secs = seconds;
        self
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        // The kind name never appears in the request path, the plural does.
        let gvk = GroupVersionKind::gvk(&kind.group, &kind.version, &kind.plural);
        let resource = ApiResource::from_gvk_with_plural(&gvk, &kind.plural);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ResourceRegistry for KubeRegistry {
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<Listing> {
        let objects = self.api(kind, namespace).list(&ListParams::default()).await?;
        let resume_token = objects.metadata.resource_version.clone();
        let records = objects
            .items
            .into_iter()
            .map(record_from_object)
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Listed {} {} (resourceVersion {:?})",
            records.len(),
            kind,
            resume_token
        );
        Ok(Listing {
            records,
            resume_token,
        })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        resume_token: Option<&str>,
    ) -> Result<WatchStream> {
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let stream = self
            .api(kind, namespace)
            .watch(&wp, resume_token.unwrap_or("0"))
            .await?;

        Ok(stream
            .filter_map(|event| future::ready(convert_event(event)))
            .boxed())
    }
}

fn record_from_object(object: DynamicObject) -> Result<ResourceRecord> {
    let key = ResourceKey {
        namespace: object.namespace(),
        name: object.name_any(),
    };
    let resource_version = object.resource_version();
    let payload = serde_json::to_value(&object)?;
    Ok(ResourceRecord::new(key, resource_version, payload))
}

fn convert_event(event: kube::Result<KubeWatchEvent<DynamicObject>>) -> Option<Result<WatchEvent>> {
    let (change, object) = match event {
        Ok(KubeWatchEvent::Added(object)) => (ChangeKind::Added, object),
        Ok(KubeWatchEvent::Modified(object)) => (ChangeKind::Modified, object),
        Ok(KubeWatchEvent::Deleted(object)) => (ChangeKind::Deleted, object),
        Ok(KubeWatchEvent::Bookmark(_)) => return None,
        Ok(KubeWatchEvent::Error(status)) => {
            return Some(Err(Error::Registry(format!("watch error: {status:?}"))));
        }
        Err(e) => return Some(Err(e.into())),
    };
    Some(record_from_object(object).map(|record| WatchEvent::new(change, record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::http::{Request, Response};
    use k8s_openapi::serde_json::json;
    use kube::client::Body;

    fn mock_registry() -> (KubeRegistry, tower_test::mock::Handle<Request<Body>, Response<Body>>) {
        let (service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(service, "default");
        (KubeRegistry::new(client), handle)
    }

    fn pod(name: &str, resource_version: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "resourceVersion": resource_version,
            },
        })
    }

    #[tokio::test]
    async fn test_list_converts_objects_and_keeps_resource_version() {
        let (registry, mut handle) = mock_registry();
        let kind = ResourceKind::new("", "v1", "pods");

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("list request");
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
            let body = json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": { "resourceVersion": "42" },
                "items": [pod("web-0", "40"), pod("web-1", "41")],
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            );
        });

        let listing = registry.list(&kind, Some("default")).await.unwrap();
        server.await.unwrap();

        assert_eq!(listing.resume_token.as_deref(), Some("42"));
        assert_eq!(listing.records.len(), 2);
        assert_eq!(listing.records[0].key, ResourceKey::namespaced("default", "web-0"));
        assert_eq!(listing.records[1].resource_version.as_deref(), Some("41"));
        assert_eq!(listing.records[1].payload["metadata"]["name"], "web-1");
    }

    #[tokio::test]
    async fn test_cluster_wide_list_uses_group_path() {
        let (registry, mut handle) = mock_registry();
        let kind = ResourceKind::new("apps", "v1", "deployments");

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("list request");
            assert_eq!(request.uri().path(), "/apis/apps/v1/deployments");
            let body = json!({
                "apiVersion": "apps/v1",
                "kind": "DeploymentList",
                "metadata": { "resourceVersion": "7" },
                "items": [],
            });
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
            );
        });

        let listing = registry.list(&kind, None).await.unwrap();
        server.await.unwrap();
        assert!(listing.records.is_empty());
        assert_eq!(listing.resume_token.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_watch_maps_events_and_skips_bookmarks() {
        let (registry, mut handle) = mock_registry();
        let registry = registry.with_watch_timeout(30);
        let kind = ResourceKind::new("", "v1", "pods");

        let server = tokio::spawn(async move {
            let (request, send) = handle.next_request().await.expect("watch request");
            assert_eq!(request.uri().path(), "/api/v1/namespaces/default/pods");
            let query = request.uri().query().unwrap_or_default().to_string();
            assert!(query.contains("watch=true"));
            assert!(query.contains("resourceVersion=42"));
            assert!(query.contains("timeoutSeconds=30"));

            let lines = [
                json!({ "type": "ADDED", "object": pod("web-2", "43") }),
                json!({
                    "type": "BOOKMARK",
                    "object": {
                        "apiVersion": "v1",
                        "kind": "Pod",
                        "metadata": { "resourceVersion": "44" },
                    },
                }),
                json!({ "type": "DELETED", "object": pod("web-0", "45") }),
            ];
            let mut body = Vec::new();
            for line in lines {
                body.extend(serde_json::to_vec(&line).unwrap());
                body.push(b'\n');
            }
            send.send_response(Response::builder().body(Body::from(body)).unwrap());
        });

        let events: Vec<_> = registry
            .watch(&kind, Some("default"), Some("42"))
            .await
            .unwrap()
            .collect()
            .await;
        server.await.unwrap();

        assert_eq!(events.len(), 2);
        let added = events[0].as_ref().unwrap();
        assert_eq!(added.change, ChangeKind::Added);
        assert_eq!(added.record.key.name, "web-2");
        let deleted = events[1].as_ref().unwrap();
        assert_eq!(deleted.change, ChangeKind::Deleted);
        assert_eq!(deleted.record.resource_version.as_deref(), Some("45"));
    }
}
