//! Typed access to the target cluster.

pub mod crds;
mod logs;
mod port_forward;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::Scope;
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{is_kube_not_found, HarnessError, Result};
use crate::helm::{MemoryClientGetter, RestClientGetter, RestMapper};
pub use crds::{
    ClusterIssuer, DNSEndpoint, Endpoint, PdsBackup, PdsBackupJob, PdsRestore, VolumeSnapshot,
};
pub use logs::{ComponentSelector, LOG_SEPARATOR};
pub use port_forward::PortForward;

/// Builds a label map from literal pairs.
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// `k1=v1,k2=v2` in key order.
pub fn format_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn selector_params(labels: &BTreeMap<String, String>) -> ListParams {
    if labels.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&format_selector(labels))
    }
}

/// A one-off job run on the target cluster.
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
}

#[derive(Clone)]
pub struct K8sCluster {
    client: Client,
    getter: Arc<dyn RestClientGetter>,
}

impl K8sCluster {
    pub fn new(client: Client) -> Self {
        let getter = Arc::new(MemoryClientGetter::from_client(client.clone()));
        Self { client, getter }
    }

    pub async fn from_getter(getter: Arc<dyn RestClientGetter>) -> Result<Self> {
        let client = getter.client().await?;
        Ok(Self { client, getter })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn getter(&self) -> Arc<dyn RestClientGetter> {
        self.getter.clone()
    }

    /// UID of the `kube-system` namespace, which the control plane uses as
    /// the cluster ID of a deployment target.
    pub async fn kube_system_uid(&self) -> Result<String> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces
            .get("kube-system")
            .await?
            .metadata
            .uid
            .ok_or_else(|| HarnessError::Missing("kube-system namespace UID".into()))
    }

    pub async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&selector_params(labels)).await?.items)
    }

    pub async fn list_services(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&selector_params(labels)).await?.items)
    }

    pub async fn list_deployments(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&selector_params(labels)).await?.items)
    }

    pub async fn delete_pods_by_selector(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format_selector(labels);
        info!(namespace, selector = %selector, "deleting pods");
        api.delete_collection(&DeleteParams::default(), &selector_params(labels))
            .await?;
        Ok(())
    }

    pub async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    /// Sets `spec.replicas` and returns the previous value.
    pub async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<i32> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let previous = api
            .get(name)
            .await?
            .spec
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(namespace, deployment = name, previous, replicas, "scaled deployment");
        Ok(previous)
    }

    pub async fn get_statefulset(&self, namespace: &str, name: &str) -> Result<StatefulSet> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    /// True once the controller has observed the latest spec and the
    /// statefulset runs exactly `replicas` pods, all of them ready.
    pub async fn statefulset_ready(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<bool> {
        let sts = self.get_statefulset(namespace, name).await?;
        let generation = sts.metadata.generation;
        let Some(status) = sts.status else {
            return Ok(false);
        };
        let ready = status.ready_replicas.unwrap_or(0);
        let observed = match (generation, status.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (Some(_), None) => false,
            (None, _) => true,
        };
        debug!(
            namespace,
            statefulset = name,
            ready,
            current = status.replicas,
            expected = replicas,
            observed,
            "statefulset readiness"
        );
        Ok(observed && ready == replicas && status.replicas == replicas)
    }

    pub async fn get_cronjob(&self, namespace: &str, name: &str) -> Result<CronJob> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn list_cronjobs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<CronJob>> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&selector_params(labels)).await?.items)
    }

    pub async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn list_pvcs(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&selector_params(labels)).await?.items)
    }

    pub async fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    pub async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name, "labels": labels },
        }))
        .map_err(|e| HarnessError::InternalError(e.to_string()))?;
        let created = api.create(&PostParams::default(), &namespace).await?;
        info!(namespace = name, "created namespace");
        Ok(created)
    }

    /// Creates the namespace or merges `labels` into an existing one.
    /// Returns whether it was created.
    pub async fn ensure_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<bool> {
        match self.create_namespace(name, labels).await {
            Ok(_) => Ok(true),
            Err(HarnessError::KubeError(kube::Error::Api(e))) if e.code == 409 => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                let patch = json!({ "metadata": { "labels": labels } });
                api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                debug!(namespace = name, "namespace already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        info!(namespace = name, "deleted namespace");
        Ok(())
    }

    /// Runs `command` once with `RestartPolicy=Never`, no retries and a
    /// 30 second TTL after completion.
    pub async fn create_job(&self, namespace: &str, spec: &JobSpec) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let env: Vec<_> = spec
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let job: Job = serde_json::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": spec.name },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": 30,
                "template": {
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": spec.name,
                            "image": spec.image,
                            "env": env,
                            "command": spec.command,
                        }],
                    },
                },
            },
        }))
        .map_err(|e| HarnessError::InternalError(e.to_string()))?;
        let created = api.create(&PostParams::default(), &job).await?;
        info!(namespace, job = %spec.name, image = %spec.image, "created job");
        Ok(created)
    }

    pub async fn get_pds_backup(&self, namespace: &str, name: &str) -> Result<PdsBackup> {
        let api: Api<PdsBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn list_pds_backups(&self, namespace: &str) -> Result<Vec<PdsBackup>> {
        let api: Api<PdsBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn delete_pds_backup(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<PdsBackup> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        info!(namespace, backup = name, "deleted backup CR");
        Ok(())
    }

    pub async fn get_pds_backup_job(&self, namespace: &str, name: &str) -> Result<PdsBackupJob> {
        let api: Api<PdsBackupJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn get_pds_restore(&self, namespace: &str, name: &str) -> Result<PdsRestore> {
        let api: Api<PdsRestore> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn get_volume_snapshot(&self, namespace: &str, name: &str) -> Result<VolumeSnapshot> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    /// Endpoints of the DNSEndpoints whose name contains `name_filter`,
    /// restricted to `record_type` when given.
    pub async fn get_dns_endpoints(
        &self,
        namespace: &str,
        name_filter: &str,
        record_type: Option<&str>,
    ) -> Result<Vec<Endpoint>> {
        let api: Api<DNSEndpoint> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|e| {
                e.metadata
                    .name
                    .as_deref()
                    .is_some_and(|n| n.contains(name_filter))
            })
            .flat_map(|e| e.spec.endpoints)
            .filter(|ep| record_type.map_or(true, |t| ep.record_type == t))
            .collect())
    }

    pub async fn get_cluster_issuer(&self, name: &str) -> Result<ClusterIssuer> {
        let api: Api<ClusterIssuer> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    pub async fn create_self_signed_issuer(&self, name: &str) -> Result<ClusterIssuer> {
        let api: Api<ClusterIssuer> = Api::all(self.client.clone());
        let mut issuer = ClusterIssuer::new(name, Default::default());
        issuer.spec.self_signed = Some(json!({}));
        let created = api.create(&PostParams::default(), &issuer).await?;
        info!(issuer = name, "created self-signed cluster issuer");
        Ok(created)
    }

    pub async fn delete_cluster_issuer(&self, name: &str) -> Result<()> {
        let api: Api<ClusterIssuer> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    /// Lists objects of any served kind, named by kind, plural or short
    /// name (`sts`, `pvc`, ...).
    pub async fn dynamic_list(
        &self,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mapper = self.getter.rest_mapper().await?;
        self.dynamic_list_with(&mapper, kind, namespace).await
    }

    pub async fn dynamic_list_with(
        &self,
        mapper: &RestMapper,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let (resource, caps) = mapper.resolve(kind)?;
        let api: Api<DynamicObject> = match (namespace, caps.scope) {
            (Some(ns), Scope::Namespaced) => {
                Api::namespaced_with(self.client.clone(), ns, &resource)
            }
            _ => Api::all_with(self.client.clone(), &resource),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    pub async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        remote_port: u16,
    ) -> Result<PortForward> {
        PortForward::start(self.client.clone(), namespace, pod, remote_port).await
    }

    /// `Ok(true)` when `result` failed with 404.
    pub fn absent<T>(result: Result<T>) -> Result<bool> {
        match result {
            Ok(_) => Ok(false),
            Err(HarnessError::KubeError(e)) if is_kube_not_found(&e) => Ok(true),
            Err(e) => Err(e),
        }
    }
}
