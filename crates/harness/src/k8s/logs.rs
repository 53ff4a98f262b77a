//! Pod log collection for job output and failure diagnostics.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::AsyncReadExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use tracing::{debug, warn};

use super::{format_selector, K8sCluster};
use crate::error::{HarnessError, Result};

/// Separator written between the logs of consecutive pods of a job.
pub const LOG_SEPARATOR: &str = "\n----------\n";

/// Pods to collect logs from when dumping a component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSelector {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

impl ComponentSelector {
    pub fn new(namespace: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        Self {
            namespace: namespace.into(),
            labels: super::labels(labels),
        }
    }
}

impl K8sCluster {
    /// Logs of `pod` written in the last `since`, read to the end of the
    /// stream.
    pub async fn get_pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        since: Duration,
    ) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            since_seconds: Some(since.as_secs().max(1) as i64),
            ..Default::default()
        };
        let mut stream = pods.log_stream(pod, &params).await?;
        let mut logs = String::new();
        stream.read_to_string(&mut logs).await?;
        debug!(namespace, pod, bytes = logs.len(), "read pod logs");
        Ok(logs)
    }

    /// Concatenated logs of every pod created by `job`.
    pub async fn get_job_logs(
        &self,
        namespace: &str,
        job: &str,
        since: Duration,
    ) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("job-name={}", job);
        let list = pods.list(&ListParams::default().labels(&selector)).await?;
        if list.items.is_empty() {
            return Err(HarnessError::NoPodsForJob(job.to_string()));
        }

        let mut chunks = Vec::with_capacity(list.items.len());
        for pod in list.items {
            let name = pod.metadata.name.unwrap_or_default();
            chunks.push(self.get_pod_logs(namespace, &name, since).await?);
        }
        Ok(chunks.join(LOG_SEPARATOR))
    }

    /// Logs of every pod matching `components`, keyed `namespace/pod`.
    /// Pods whose logs cannot be read are recorded with the error text.
    pub async fn dump_component_logs(
        &self,
        components: &[ComponentSelector],
        since: Duration,
    ) -> Result<BTreeMap<String, String>> {
        let mut dump = BTreeMap::new();
        for component in components {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &component.namespace);
            let selector = format_selector(&component.labels);
            let list = pods.list(&ListParams::default().labels(&selector)).await?;
            for pod in list.items {
                let name = pod.metadata.name.unwrap_or_default();
                let key = format!("{}/{}", component.namespace, name);
                let logs = match self.get_pod_logs(&component.namespace, &name, since).await {
                    Ok(logs) => logs,
                    Err(e) => {
                        warn!(pod = %key, error = %e, "failed to read pod logs");
                        format!("<failed to read logs: {}>", e)
                    }
                };
                dump.insert(key, logs);
            }
        }
        Ok(dump)
    }
}
