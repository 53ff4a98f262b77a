//! Cross-checks between what the control plane reports and what exists on
//! the target cluster.
//!
//! Single-shot checks return the first disagreement as a
//! [`CorrelationError`]; the `wait_*` forms retry them until both views
//! converge.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::S3Settings;
use crate::cp::models::{Backup, BackupJob, BackupTargetState, Deployment, Restore};
use crate::cp::ControlPlane;
use crate::error::{HarnessError, Result};
use crate::k8s::{K8sCluster, PdsBackupJob};
use crate::px::{CloudCredential, PxProxy};
use crate::s3::ObjectStore;
use crate::wait::{self, WaitPolicy};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("{0} not found on the target cluster")]
    Missing(String),

    #[error("{what}: control plane has {expected:?}, target cluster has {actual:?}")]
    Mismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("{0}")]
    NotReady(String),

    #[error("malformed cloud snapshot ID {0:?}")]
    CloudSnapId(String),
}

impl CorrelationError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CorrelationError::Missing(_))
    }
}

/// Name of the backup job CR the agent creates for an ad hoc backup.
pub fn adhoc_backup_job_name(cluster_resource_name: &str) -> String {
    format!("{}-adhoc", cluster_resource_name)
}

/// Object-store prefix of a cloud snapshot ID `<px-id>/<path-prefix>`.
pub fn cloud_snap_prefix(cloud_snap_id: &str) -> Result<&str, CorrelationError> {
    match cloud_snap_id.split_once('/') {
        Some((px_id, prefix)) if !px_id.is_empty() && !prefix.is_empty() => Ok(prefix),
        _ => Err(CorrelationError::CloudSnapId(cloud_snap_id.to_string())),
    }
}

/// A backup job agrees with its CR when the CR's UID is the job ID and the
/// job succeeded with a cloud snapshot.
pub fn check_backup_job(job: &BackupJob, cr: &PdsBackupJob) -> Result<(), CorrelationError> {
    let uid = cr.metadata.uid.clone().unwrap_or_default();
    if job.id != uid {
        return Err(CorrelationError::Mismatch {
            what: "backup job UID".into(),
            expected: job.id.clone(),
            actual: uid,
        });
    }
    if !job.succeeded() {
        return Err(CorrelationError::NotReady(format!(
            "backup job {} is {}",
            job.id,
            job.status
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "pending".into())
        )));
    }
    let cp_snap = job.cloud_snap_id.clone().unwrap_or_default();
    if cp_snap.is_empty() {
        return Err(CorrelationError::NotReady(format!(
            "backup job {} has no cloud snapshot yet",
            job.id
        )));
    }
    if let Some(tc_snap) = cr.status.as_ref().and_then(|s| s.cloud_snap_id.clone()) {
        if tc_snap != cp_snap {
            return Err(CorrelationError::Mismatch {
                what: "cloud snapshot ID".into(),
                expected: cp_snap,
                actual: tc_snap,
            });
        }
    }
    Ok(())
}

fn bare_endpoint(endpoint: &str) -> String {
    endpoint
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_ascii_lowercase()
}

/// The Portworx credential must carry the bucket, region, access key and
/// endpoint of the backup target.
pub fn check_cloud_credential(
    credential: &CloudCredential,
    expected: &S3Settings,
) -> Result<(), CorrelationError> {
    let mismatch = |what: &str, expected: &str, actual: &str| CorrelationError::Mismatch {
        what: format!("{} of cloud credential {}", what, credential.name),
        expected: expected.to_string(),
        actual: actual.to_string(),
    };
    let Some(aws) = &credential.aws_credential else {
        return Err(CorrelationError::Mismatch {
            what: format!("provider of cloud credential {}", credential.name),
            expected: "s3".into(),
            actual: "other".into(),
        });
    };
    if credential.bucket != expected.bucket {
        return Err(mismatch("bucket", &expected.bucket, &credential.bucket));
    }
    if aws.region != expected.region {
        return Err(mismatch("region", &expected.region, &aws.region));
    }
    if aws.access_key != expected.access_key {
        return Err(mismatch("access key", &expected.access_key, &aws.access_key));
    }
    if bare_endpoint(&aws.endpoint) != bare_endpoint(&expected.endpoint) {
        return Err(mismatch("endpoint", &expected.endpoint, &aws.endpoint));
    }
    Ok(())
}

pub struct Correlator<'a> {
    cp: &'a ControlPlane,
    k8s: &'a K8sCluster,
    px: &'a PxProxy,
    policy: WaitPolicy,
}

impl<'a> Correlator<'a> {
    pub fn new(cp: &'a ControlPlane, k8s: &'a K8sCluster, px: &'a PxProxy) -> Self {
        Self {
            cp,
            k8s,
            px,
            policy: cp.policy(),
        }
    }

    pub fn with_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Kubernetes name of a control plane namespace.
    pub async fn namespace_name(&self, namespace_id: Option<&str>) -> Result<String> {
        let id = namespace_id
            .ok_or_else(|| HarnessError::Missing("namespace ID on control plane object".into()))?;
        Ok(self.cp.get_namespace(id).await?.name)
    }

    /// Healthy on the control plane and a fully ready statefulset on the
    /// target cluster.
    pub async fn deployment_initialized(&self, deployment: &Deployment) -> Result<bool> {
        let status = self.cp.deployment_status(&deployment.id).await?;
        if !status.is_healthy() {
            debug!(deployment_id = %deployment.id, health = %status.health, "not healthy yet");
            return Ok(false);
        }
        let namespace = self.namespace_name(deployment.namespace_id.as_deref()).await?;
        let ready = self
            .k8s
            .statefulset_ready(
                &namespace,
                &deployment.cluster_resource_name,
                deployment.node_count,
            )
            .await;
        match ready {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }

    pub async fn wait_deployment_initialized(
        &self,
        ctx: &CancellationToken,
        deployment: &Deployment,
    ) -> Result<()> {
        let what = format!("deployment {} to be initialized", deployment.id);
        wait::wait(ctx, self.policy.scaled(2), &what, || {
            self.deployment_initialized(deployment)
        })
        .await?;
        info!(
            deployment_id = %deployment.id,
            name = %deployment.cluster_resource_name,
            "deployment initialized"
        );
        Ok(())
    }

    pub async fn wait_deployment_removed_from_tc(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
        cluster_resource_name: &str,
    ) -> Result<()> {
        let what = format!("statefulset {}/{} to be removed", namespace, cluster_resource_name);
        wait::wait(ctx, self.policy, &what, || async move {
            K8sCluster::absent(self.k8s.get_statefulset(namespace, cluster_resource_name).await)
        })
        .await?;
        Ok(())
    }

    /// Pairs the ad hoc backup job CR of `backup` with its control plane job.
    pub async fn correlate_adhoc_backup(
        &self,
        backup: &Backup,
        namespace: &str,
    ) -> Result<BackupJob> {
        let name = adhoc_backup_job_name(&backup.cluster_resource_name);
        let cr = match self.k8s.get_pds_backup_job(namespace, &name).await {
            Ok(cr) => cr,
            Err(e) if e.is_not_found() => {
                let what = format!("backup job {}/{}", namespace, name);
                return Err(CorrelationError::Missing(what).into());
            }
            Err(e) => return Err(e),
        };
        let uid = cr.metadata.uid.clone().unwrap_or_default();
        let jobs = self.cp.list_backup_jobs_of_backup(&backup.id).await?;
        let known: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let job = jobs.into_iter().find(|j| j.id == uid).ok_or_else(|| {
            CorrelationError::Mismatch {
                what: format!("jobs of backup {}", backup.id),
                expected: known.join(","),
                actual: uid.clone(),
            }
        })?;
        check_backup_job(&job, &cr)?;
        Ok(job)
    }

    pub async fn wait_backup_correlated(
        &self,
        ctx: &CancellationToken,
        backup: &Backup,
        namespace: &str,
    ) -> Result<BackupJob> {
        let what = format!("backup {} to succeed on both sides", backup.id);
        let job = wait::poll_until(ctx, self.policy, &what, || async move {
            self.correlate_adhoc_backup(backup, namespace).await.map(Some)
        })
        .await?;
        info!(backup_id = %backup.id, job_id = %job.id, "backup correlated");
        Ok(job)
    }

    /// Schedule of the cron job the agent created for a scheduled backup.
    /// `None` until the backup CR and its cron job exist.
    pub async fn backup_cron_schedule(
        &self,
        backup: &Backup,
        namespace: &str,
    ) -> Result<Option<String>> {
        let cr = HarnessError::into_option(
            self.k8s
                .get_pds_backup(namespace, &backup.cluster_resource_name)
                .await,
        )?;
        let Some(cron_job) = cr.and_then(|cr| cr.status).and_then(|s| s.cron_job_name) else {
            return Ok(None);
        };
        let cron = HarnessError::into_option(self.k8s.get_cronjob(namespace, &cron_job).await)?;
        Ok(cron.and_then(|c| c.spec).map(|s| s.schedule))
    }

    pub async fn wait_backup_cron_schedule(
        &self,
        ctx: &CancellationToken,
        backup: &Backup,
        namespace: &str,
        schedule: &str,
    ) -> Result<()> {
        let what = format!("cron job of backup {} to run {:?}", backup.id, schedule);
        wait::wait(ctx, self.policy, &what, || async move {
            let found = self.backup_cron_schedule(backup, namespace).await?;
            match found.as_deref() {
                Some(s) if s == schedule => Ok(true),
                Some(s) => Err(HarnessError::from(CorrelationError::Mismatch {
                    what: "cron schedule".into(),
                    expected: schedule.to_string(),
                    actual: s.to_string(),
                })),
                None => Ok(false),
            }
        })
        .await?;
        Ok(())
    }

    /// After the backup CR is deleted on the target cluster, the control
    /// plane job, the backup job CR and its volume snapshot all go away.
    pub async fn wait_backup_job_cascade(
        &self,
        ctx: &CancellationToken,
        namespace: &str,
        job: &BackupJob,
        cr_name: &str,
        volume_snapshot: Option<&str>,
    ) -> Result<()> {
        self.cp.wait_backup_job_removed(ctx, &job.id).await?;
        let what = format!("backup job {}/{} to be removed", namespace, cr_name);
        wait::wait(ctx, self.policy, &what, || async move {
            K8sCluster::absent(self.k8s.get_pds_backup_job(namespace, cr_name).await)
        })
        .await?;
        if let Some(snapshot) = volume_snapshot {
            let what = format!("volume snapshot {}/{} to be removed", namespace, snapshot);
            wait::wait(ctx, self.policy, &what, || async move {
                K8sCluster::absent(self.k8s.get_volume_snapshot(namespace, snapshot).await)
            })
            .await?;
        }
        info!(job_id = %job.id, "backup job removed from both sides");
        Ok(())
    }

    pub async fn check_target_credential(
        &self,
        px_name: &str,
        expected: &S3Settings,
    ) -> Result<CloudCredential> {
        let credential = self
            .px
            .find_cloud_credential(px_name)
            .await?
            .ok_or_else(|| CorrelationError::Missing(format!("cloud credential {}", px_name)))?;
        check_cloud_credential(&credential, expected)?;
        Ok(credential)
    }

    /// Waits for the Portworx credential synthesised for a synced backup
    /// target and checks it against `expected`.
    pub async fn wait_target_credential(
        &self,
        ctx: &CancellationToken,
        state: &BackupTargetState,
        expected: &S3Settings,
    ) -> Result<CloudCredential> {
        let px_name = state.px_credentials_name.as_deref().ok_or_else(|| {
            HarnessError::Missing(format!(
                "PX credentials name of backup target state {}",
                state.id.as_deref().unwrap_or("<unknown>")
            ))
        })?;
        let what = format!("cloud credential {}", px_name);
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            self.check_target_credential(px_name, expected).await.map(Some)
        })
        .await?)
    }

    pub async fn px_credential_absent(&self, px_name: &str) -> Result<bool> {
        Ok(self.px.find_cloud_credential(px_name).await?.is_none())
    }

    pub async fn wait_target_credential_removed(
        &self,
        ctx: &CancellationToken,
        px_name: &str,
    ) -> Result<()> {
        let what = format!("cloud credential {} to be removed", px_name);
        wait::wait(ctx, self.policy, &what, || self.px_credential_absent(px_name)).await?;
        Ok(())
    }

    /// New deployment of a successful restore, waited until initialized.
    pub async fn wait_restored_deployment(
        &self,
        ctx: &CancellationToken,
        restore: &Restore,
    ) -> Result<Deployment> {
        let id = restore.deployment_id.as_deref().ok_or_else(|| {
            CorrelationError::NotReady(format!("restore {} has no deployment", restore.id))
        })?;
        let deployment = self.cp.get_deployment(id).await?;
        self.wait_deployment_initialized(ctx, &deployment).await?;
        Ok(deployment)
    }
}

/// Objects stored under the cloud snapshot's prefix.
pub async fn snapshot_objects(store: &dyn ObjectStore, cloud_snap_id: &str) -> Result<usize> {
    let prefix = cloud_snap_prefix(cloud_snap_id)?;
    store.count_objects(prefix).await
}

/// Waits until the cloud snapshot has objects (`present`) or none left.
pub async fn wait_snapshot_objects(
    ctx: &CancellationToken,
    policy: WaitPolicy,
    store: &dyn ObjectStore,
    cloud_snap_id: &str,
    present: bool,
) -> Result<usize> {
    let what = if present {
        format!("objects of cloud snapshot {}", cloud_snap_id)
    } else {
        format!("objects of cloud snapshot {} to be removed", cloud_snap_id)
    };
    Ok(wait::poll_until(ctx, policy, &what, || async move {
        let count = snapshot_objects(store, cloud_snap_id).await?;
        Ok::<_, HarnessError>(((count > 0) == present).then_some(count))
    })
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::tests::MemoryStore;
    use crate::tests::fake_cp::{FakeCp, PROJECT};
    use crate::tests::fake_kube::FakeKube;
    use axum::http::Method;
    use serde_json::json;
    use std::time::Duration;

    const PROXY: &str = "/api/v1/namespaces/portworx/services/portworx-api:9021/proxy";

    fn settings() -> S3Settings {
        S3Settings {
            endpoint: "s3.amazonaws.com".into(),
            bucket: "pds-backups".into(),
            region: "us-east-1".into(),
            access_key: "AKIA123".into(),
            secret_key: "secret".into(),
        }
    }

    fn credential(name: &str, region: &str) -> CloudCredential {
        serde_json::from_value(json!({
            "credential_id": "c1",
            "name": name,
            "bucket": "pds-backups",
            "aws_credential": {
                "access_key": "AKIA123",
                "endpoint": "https://s3.amazonaws.com/",
                "region": region,
            },
        }))
        .unwrap()
    }

    fn backup_job_cr(uid: &str) -> PdsBackupJob {
        serde_json::from_value(json!({
            "apiVersion": "backups.pds.io/v1",
            "kind": "BackupJob",
            "metadata": { "name": "cas-abc-adhoc", "uid": uid },
            "spec": {},
            "status": { "phase": "Succeeded", "cloudSnapId": "px-1/pds-backups/cas-abc" },
        }))
        .unwrap()
    }

    fn cp_job(id: &str, status: &str, snap: Option<&str>) -> BackupJob {
        let job = json!({ "id": id, "status": status, "cloud_snap_id": snap });
        serde_json::from_value(job).unwrap()
    }

    #[test]
    fn adhoc_name_and_snapshot_prefix() {
        assert_eq!(adhoc_backup_job_name("cas-abc"), "cas-abc-adhoc");
        assert_eq!(cloud_snap_prefix("px-1/pds-backups/cas-abc").unwrap(), "pds-backups/cas-abc");
        assert!(matches!(
            cloud_snap_prefix("no-separator"),
            Err(CorrelationError::CloudSnapId(_))
        ));
        assert!(cloud_snap_prefix("/leading").is_err());
    }

    #[test]
    fn backup_job_must_match_uid_and_have_snapshot() {
        let cr = backup_job_cr("uid-1");
        let job = cp_job("uid-1", "Succeeded", Some("px-1/pds-backups/cas-abc"));
        assert!(check_backup_job(&job, &cr).is_ok());

        let err = check_backup_job(&cp_job("uid-2", "Succeeded", Some("x/y")), &cr).unwrap_err();
        assert!(matches!(
            err,
            CorrelationError::Mismatch { ref what, .. } if what == "backup job UID"
        ));

        let err = check_backup_job(&cp_job("uid-1", "Active", None), &cr).unwrap_err();
        assert!(matches!(err, CorrelationError::NotReady(_)));

        let err =
            check_backup_job(&cp_job("uid-1", "Succeeded", Some("px-1/other")), &cr).unwrap_err();
        assert!(err.to_string().contains("cloud snapshot ID"));
    }

    #[test]
    fn credential_fields_are_compared() {
        assert!(check_cloud_credential(&credential("pds-bt", "us-east-1"), &settings()).is_ok());
        let err =
            check_cloud_credential(&credential("pds-bt", "eu-west-1"), &settings()).unwrap_err();
        assert!(err.to_string().contains("region of cloud credential pds-bt"));
    }

    async fn fixture() -> (FakeCp, FakeKube, ControlPlane, K8sCluster, PxProxy) {
        let cp_fake = FakeCp::new();
        let kube = FakeKube::new();
        kube.insert(
            "/api/v1/namespaces/portworx/services",
            json!({ "metadata": { "name": "portworx-api" } }),
        );
        let cp = cp_fake.control_plane().await;
        let client = kube.client().await;
        let px = PxProxy::connect(client.clone()).await.unwrap();
        (cp_fake, kube, cp, K8sCluster::new(client), px)
    }

    #[tokio::test]
    async fn adhoc_backup_is_correlated_by_uid() {
        let (cp_fake, kube, cp, k8s, px) = fixture().await;
        let cr = kube.insert(
            "/apis/backups.pds.io/v1/namespaces/dev/backupjobs",
            json!({
                "apiVersion": "backups.pds.io/v1",
                "kind": "BackupJob",
                "metadata": { "name": "cas-abc-adhoc" },
                "spec": {},
            }),
        );
        let uid = cr["metadata"]["uid"].as_str().unwrap().to_string();
        cp_fake.insert(
            "/api/backups/b1/jobs",
            json!({
                "id": uid,
                "status": "Succeeded",
                "cloud_snap_id": "px-1/pds-backups/cas-abc",
            }),
        );
        let backup: Backup = serde_json::from_value(json!({
            "id": "b1",
            "backup_type": "adhoc",
            "cluster_resource_name": "cas-abc",
        }))
        .unwrap();

        let correlator = Correlator::new(&cp, &k8s, &px);
        let job = correlator
            .wait_backup_correlated(&CancellationToken::new(), &backup, "dev")
            .await
            .unwrap();
        assert_eq!(job.id, uid);
    }

    #[tokio::test]
    async fn missing_backup_job_cr_times_out_with_reason() {
        let (cp_fake, _kube, cp, k8s, px) = fixture().await;
        cp_fake.collection("/api/backups/b1/jobs");
        let backup: Backup =
            serde_json::from_value(json!({ "id": "b1", "cluster_resource_name": "pg-1" })).unwrap();

        let correlator = Correlator::new(&cp, &k8s, &px)
            .with_policy(WaitPolicy::new(Duration::from_millis(50), Duration::from_millis(10)));
        let err = correlator
            .wait_backup_correlated(&CancellationToken::new(), &backup, "dev")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        assert!(err.to_string().contains("backup job dev/pg-1-adhoc not found"));
    }

    #[tokio::test]
    async fn deployment_needs_both_sides() {
        let (cp_fake, kube, cp, k8s, px) = fixture().await;
        cp_fake.insert(
            "/api/deployment-targets/dt-1/namespaces",
            json!({ "id": "ns-1", "name": "dev", "status": "available" }),
        );
        let deployment = cp_fake.insert(
            &format!("{}/deployments", PROJECT),
            json!({
                "id": "d1",
                "name": "pg-abc",
                "namespace_id": "ns-1",
                "node_count": 3,
                "cluster_resource_name": "pg-abc",
            }),
        );
        let deployment: Deployment = serde_json::from_value(deployment).unwrap();
        cp_fake.set("/api/deployments/d1/status", json!({ "health": "Healthy" }));
        let correlator = Correlator::new(&cp, &k8s, &px);

        assert!(!correlator.deployment_initialized(&deployment).await.unwrap());

        kube.insert(
            "/apis/apps/v1/namespaces/dev/statefulsets",
            json!({
                "apiVersion": "apps/v1",
                "kind": "StatefulSet",
                "metadata": { "name": "pg-abc" },
                "status": { "replicas": 3, "readyReplicas": 3 },
            }),
        );
        assert!(correlator.deployment_initialized(&deployment).await.unwrap());

        cp_fake.set("/api/deployments/d1/status", json!({ "health": "Unavailable" }));
        assert!(!correlator.deployment_initialized(&deployment).await.unwrap());
    }

    #[tokio::test]
    async fn target_credential_present_then_removed() {
        let (_cp_fake, kube, cp, k8s, px) = fixture().await;
        kube.respond(
            Method::GET,
            &format!("{}/v1/credentials", PROXY),
            200,
            r#"{"credential_ids":["c1"]}"#,
        );
        kube.respond(
            Method::GET,
            &format!("{}/v1/credentials/inspect/c1", PROXY),
            200,
            serde_json::to_string(&credential("pds-bt-1", "us-east-1")).unwrap(),
        );
        let correlator = Correlator::new(&cp, &k8s, &px);
        let state: BackupTargetState = serde_json::from_value(json!({
            "deployment_target_id": "dt-1",
            "state": "successful",
            "px_credentials_name": "pds-bt-1",
        }))
        .unwrap();

        let found = correlator
            .wait_target_credential(&CancellationToken::new(), &state, &settings())
            .await
            .unwrap();
        assert_eq!(found.credential_id, "c1");
        assert!(!correlator.px_credential_absent("pds-bt-1").await.unwrap());

        kube.respond(
            Method::GET,
            &format!("{}/v1/credentials", PROXY),
            200,
            r#"{"credential_ids":[]}"#,
        );
        correlator
            .wait_target_credential_removed(&CancellationToken::new(), "pds-bt-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn snapshot_objects_follow_deletion() {
        let store =
            MemoryStore::with_keys(&["pds-backups/cas-abc/0001", "pds-backups/cas-abc/0002"]);
        let policy = WaitPolicy::new(Duration::from_secs(1), Duration::from_millis(10));
        let ctx = CancellationToken::new();

        let count = wait_snapshot_objects(&ctx, policy, &store, "px-1/pds-backups/cas-abc", true)
            .await
            .unwrap();
        assert_eq!(count, 2);

        store.remove_prefix("pds-backups/cas-abc");
        let count = wait_snapshot_objects(&ctx, policy, &store, "px-1/pds-backups/cas-abc", false)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
