use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use kube::core::{DynamicObject, GroupVersion};
use kube::discovery::{self, Scope};
use kube::Client;
use serde_json::json;

use crate::api::v1::gitrepository::{GitRepository, GitRepositoryStatus};
use crate::model::Manifest;
use crate::util::errors::{Error, Result};

/// Field manager identity used for every server-side apply.
pub static FIELD_MANAGER: &str = "nopea";

/// Capability interface over the Kubernetes API.
///
/// One production implementation ([`KubeOps`]) and an in-memory fake for
/// tests. Everything the controller, workers, drift engine and leader
/// election need from the cluster goes through here.
#[async_trait]
pub trait K8sOps: Send + Sync {
    async fn list_repos(&self, namespace: &str) -> Result<(Vec<GitRepository>, String)>;

    /// Open a watch stream from `resource_version`.
    async fn watch_repos(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<GitRepository>>>>;

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Option<GitRepository>>;

    async fn update_status(&self, namespace: &str, name: &str, status: GitRepositoryStatus) -> Result<()>;

    /// Fetch the live object a manifest corresponds to, if present.
    async fn get_live(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Manifest>>;

    /// Server-side apply with force; returns the server's echo of the object.
    async fn apply(&self, manifest: &Manifest) -> Result<Manifest>;

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    async fn create_lease(&self, namespace: &str, name: &str, lease: &Lease) -> Result<Lease>;

    /// Replace the lease; optimistic concurrency via the embedded
    /// `resourceVersion`. A write conflict surfaces as [`Error::LeaseConflict`].
    async fn update_lease(&self, namespace: &str, name: &str, lease: &Lease) -> Result<Lease>;
}

/// The real client, backed by `kube`.
#[derive(Clone)]
pub struct KubeOps {
    client: Client,
}

impl KubeOps {
    pub fn new(client: Client) -> Self {
        KubeOps { client }
    }

    fn repos(&self, namespace: &str) -> Api<GitRepository> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn leases(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
    ) -> Result<Api<DynamicObject>> {
        let gv = GroupVersion::from_str(api_version)
            .map_err(|e| Error::SerializationError(format!("bad apiVersion {api_version:?}: {e}")))?;
        let gvk = gv.with_kind(kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(Error::KubeError)?;
        Ok(match caps.scope {
            Scope::Cluster => Api::all_with(self.client.clone(), &ar),
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &ar),
        })
    }
}

#[async_trait]
impl K8sOps for KubeOps {
    async fn list_repos(&self, namespace: &str) -> Result<(Vec<GitRepository>, String)> {
        let list = self
            .repos(namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        Ok((list.items, resource_version))
    }

    async fn watch_repos(
        &self,
        namespace: &str,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<GitRepository>>>> {
        // Forward through a task that owns the Api, so the returned stream
        // is 'static. An open failure arrives as the first stream item.
        let api = self.repos(namespace);
        let version = resource_version.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            match api.watch(&WatchParams::default(), &version).await {
                Ok(stream) => {
                    futures::pin_mut!(stream);
                    while let Some(item) = stream.next().await {
                        let item = item.map_err(|e| Error::WatchDisconnected(e.to_string()));
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(Error::WatchDisconnected(e.to_string())))
                        .await;
                }
            }
        });
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn get_repo(&self, namespace: &str, name: &str) -> Result<Option<GitRepository>> {
        self.repos(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn update_status(&self, namespace: &str, name: &str, status: GitRepositoryStatus) -> Result<()> {
        let patch = Patch::Apply(json!({
            "apiVersion": "nopea.io/v1",
            "kind": "GitRepository",
            "status": status,
        }));
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.repos(namespace)
            .patch_status(name, &params, &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn get_live(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Manifest>> {
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        let Some(object) = api.get_opt(name).await.map_err(Error::KubeError)? else {
            return Ok(None);
        };
        let mut value = serde_json::to_value(&object)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        // A DynamicObject fetched without type info would not round-trip.
        if value.get("apiVersion").is_none() {
            value["apiVersion"] = json!(api_version);
            value["kind"] = json!(kind);
        }
        Manifest::from_value(value)
            .ok_or_else(|| Error::SerializationError(format!("live object {kind}/{namespace}/{name} lacks identity")))
            .map(Some)
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        let namespace = manifest.namespace().unwrap_or("default");
        let api = self
            .dynamic_api(manifest.api_version(), manifest.kind(), namespace)
            .await?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(manifest.name(), &params, &Patch::Apply(manifest.as_value()))
            .await
            .map_err(Error::KubeError)?;
        let value = serde_json::to_value(&applied)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        Manifest::from_value(value)
            .ok_or_else(|| Error::SerializationError("apply echo lacks identity fields".into()))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        self.leases(namespace).get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create_lease(&self, namespace: &str, name: &str, lease: &Lease) -> Result<Lease> {
        self.leases(namespace)
            .create(&PostParams::default(), lease)
            .await
            .map_err(map_lease_err)
    }

    async fn update_lease(&self, namespace: &str, name: &str, lease: &Lease) -> Result<Lease> {
        self.leases(namespace)
            .replace(name, &PostParams::default(), lease)
            .await
            .map_err(map_lease_err)
    }
}

fn map_lease_err(e: kube::Error) -> Error {
    match &e {
        kube::Error::Api(response) if response.code == 409 => {
            Error::LeaseConflict(response.message.clone())
        }
        _ => Error::KubeError(e),
    }
}
