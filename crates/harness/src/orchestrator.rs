//! Scenario primitives composed from the control plane client, the target
//! cluster and the correlator.
//!
//! Every primitive that creates something pushes the matching [`Deferral`]
//! onto the scenario's [`CleanupStack`] before it waits on anything, so a
//! failed or cancelled wait still leaves the resource scheduled for removal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cleanup::{CleanupReport, CleanupStack, Deferral, DeferralExecutor};
use crate::config::S3Settings;
use crate::correlator::{self, CorrelationError, Correlator};
use crate::cp::models::{
    Backup, BackupCredentials, BackupCredentialsSpec, BackupJob, BackupPolicy, BackupSchedule,
    BackupTarget, BackupTargetState, Deployment, DeploymentTarget, DeploymentTargetPatch,
    Restore, ShortDeploymentSpec, UpdateDeploymentRequest,
};
use crate::cp::ControlPlane;
use crate::error::{ErrorKind, HarnessError, Result};
use crate::helm::HelmDriver;
use crate::k8s::{ClusterIssuer, K8sCluster};
use crate::px::{PxProxy, S3Credential};
use crate::s3::ObjectStore;
use crate::suite::random_name;
use crate::wait::{self, WaitPolicy, STANDARD_TIMEOUT};

/// Deployment in the PDS namespace that tunnels the agent to the control plane.
pub const TELEPORT_DEPLOYMENT: &str = "pds-teleport";

/// Handles shared by every scenario of a suite.
pub struct Environment {
    pub cp: ControlPlane,
    pub k8s: K8sCluster,
    pub px: PxProxy,
    pub helm: HelmDriver,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub s3: Option<S3Settings>,
    pub pds_namespace: String,
}

impl Environment {
    pub fn correlator(&self) -> Correlator<'_> {
        Correlator::new(&self.cp, &self.k8s, &self.px)
    }

    pub fn s3(&self) -> Result<&S3Settings> {
        self.s3
            .as_ref()
            .ok_or_else(|| HarnessError::Config("S3 backup settings are required".into()))
    }

    pub fn store(&self) -> Result<&dyn ObjectStore> {
        self.store
            .as_deref()
            .ok_or_else(|| HarnessError::Config("object store access is required".into()))
    }
}

#[async_trait]
impl DeferralExecutor for Environment {
    async fn execute(&self, deferral: &Deferral) -> Result<(), HarnessError> {
        // Teardown is never cancelled by the scenario that registered it.
        let ctx = CancellationToken::new();
        match deferral {
            Deferral::RemoveDeployment { id } => {
                self.cp.delete_deployment(id).await?;
                self.cp.wait_deployment_removed(&ctx, id).await
            }
            Deferral::DeleteBackupTarget { id } => {
                self.cp.delete_backup_target(id).await?;
                self.cp.wait_backup_target_removed(&ctx, id).await
            }
            Deferral::DeleteBackupCredentials { id } => self.cp.delete_backup_credentials(id).await,
            Deferral::DeleteBackupPolicy { id } => self.cp.delete_backup_policy(id).await,
            Deferral::DeleteBackup { id, local_only } => {
                self.cp.delete_backup(id, *local_only).await?;
                self.cp.wait_backup_removed(&ctx, id).await
            }
            Deferral::DeletePdsBackup { namespace, name } => {
                self.k8s.delete_pds_backup(namespace, name).await
            }
            Deferral::DeleteNamespace { name } => self.k8s.delete_namespace(name).await,
            Deferral::DeleteClusterIssuer { name } => self.k8s.delete_cluster_issuer(name).await,
            Deferral::RestoreReplicas {
                namespace,
                deployment,
                replicas,
            } => {
                self.k8s
                    .scale_deployment(namespace, deployment, *replicas)
                    .await?;
                Ok(())
            }
            Deferral::ResetTargetTls {
                target_id,
                issuer,
                required,
            } => {
                let patch = DeploymentTargetPatch {
                    name: None,
                    tls_issuer: Some(issuer.clone().unwrap_or_default()),
                    tls_required: Some(*required),
                };
                self.cp.patch_deployment_target(target_id, &patch).await?;
                Ok(())
            }
        }
    }
}

/// Where a scenario deploys: the registered deployment target and the test
/// namespace on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetContext {
    pub deployment_target_id: String,
    pub namespace_id: String,
    pub namespace: String,
}

/// Returns the error of `result` when it has the `expected` kind.
pub fn expect_error<T>(expected: ErrorKind, result: Result<T>) -> Result<HarnessError> {
    match result {
        Err(e) if e.kind() == expected => {
            info!(?expected, error = %e, "got expected error");
            Ok(e)
        }
        Err(e) => Err(HarnessError::UnexpectedOutcome {
            expected,
            actual: e.to_string(),
        }),
        Ok(_) => Err(HarnessError::UnexpectedOutcome {
            expected,
            actual: "success".into(),
        }),
    }
}

pub struct Scenario<'e> {
    name: String,
    env: &'e Environment,
    target: &'e TargetContext,
    ctx: CancellationToken,
    cleanup: CleanupStack,
}

impl<'e> Scenario<'e> {
    pub fn new(
        name: impl Into<String>,
        env: &'e Environment,
        target: &'e TargetContext,
        ctx: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            env,
            target,
            ctx,
            cleanup: CleanupStack::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    pub fn env(&self) -> &'e Environment {
        self.env
    }

    pub fn target(&self) -> &'e TargetContext {
        self.target
    }

    pub fn cp(&self) -> &'e ControlPlane {
        &self.env.cp
    }

    pub fn k8s(&self) -> &'e K8sCluster {
        &self.env.k8s
    }

    pub fn correlator(&self) -> Correlator<'e> {
        self.env.correlator()
    }

    pub fn cleanup(&self) -> &CleanupStack {
        &self.cleanup
    }

    pub fn defer(&mut self, deferral: Deferral) {
        self.cleanup.push(deferral);
    }

    /// Drains the cleanup stack. Safe to call more than once.
    pub async fn finish(&mut self) -> CleanupReport {
        let report = self.cleanup.drain(self.env).await;
        info!(
            scenario = %self.name,
            completed = report.completed,
            already_gone = report.already_gone,
            failed = report.failed.len(),
            "cleanup finished"
        );
        report
    }

    // Deployments

    /// Deploys under a random name derived from the dataservice and waits until
    /// both sides report it ready.
    pub async fn deploy_data_service(&mut self, spec: &ShortDeploymentSpec) -> Result<Deployment> {
        let name = random_name(&spec.prefix());
        self.deploy_named(spec, &name).await
    }

    pub async fn deploy_named(
        &mut self,
        spec: &ShortDeploymentSpec,
        name: &str,
    ) -> Result<Deployment> {
        let deployment = self
            .cp()
            .deploy(
                spec,
                name,
                &self.target.deployment_target_id,
                &self.target.namespace_id,
            )
            .await?;
        self.defer(Deferral::RemoveDeployment { id: deployment.id.clone() });
        self.cp().wait_deployment_healthy(&self.ctx, &deployment.id).await?;
        self.correlator()
            .wait_deployment_initialized(&self.ctx, &deployment)
            .await?;
        Ok(deployment)
    }

    /// Expects the control plane to reject the deployment with `expected`.
    pub async fn fail_deploy_data_service(
        &mut self,
        spec: &ShortDeploymentSpec,
        expected: ErrorKind,
    ) -> Result<HarnessError> {
        let name = random_name(&spec.prefix());
        let result = self
            .cp()
            .deploy(
                spec,
                &name,
                &self.target.deployment_target_id,
                &self.target.namespace_id,
            )
            .await;
        if let Ok(deployment) = &result {
            self.defer(Deferral::RemoveDeployment {
                id: deployment.id.clone(),
            });
        }
        expect_error(expected, result)
    }

    pub async fn update_deployment(
        &self,
        deployment_id: &str,
        update: &UpdateDeploymentRequest,
    ) -> Result<Deployment> {
        self.cp().update_deployment(deployment_id, update).await
    }

    pub async fn fail_update_deployment(
        &self,
        deployment_id: &str,
        update: &UpdateDeploymentRequest,
        expected: ErrorKind,
    ) -> Result<HarnessError> {
        expect_error(expected, self.cp().update_deployment(deployment_id, update).await)
    }

    /// Points the deployment's scheduled backup at a policy and target,
    /// both given by name.
    pub async fn set_backup_schedule(
        &self,
        deployment_id: &str,
        policy_name: &str,
        target_name: &str,
    ) -> Result<Deployment> {
        let scheduled_backup = self.cp().scheduled_backup(policy_name, target_name).await?;
        let update = UpdateDeploymentRequest {
            scheduled_backup: Some(scheduled_backup),
            ..Default::default()
        };
        self.update_deployment(deployment_id, &update).await
    }

    /// Deletes the deployment and waits until both sides forget it.
    pub async fn delete_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.cp().delete_deployment(&deployment.id).await?;
        self.cp()
            .wait_deployment_removed(&self.ctx, &deployment.id)
            .await?;
        self.correlator()
            .wait_deployment_removed_from_tc(
                &self.ctx,
                &self.target.namespace,
                &deployment.cluster_resource_name,
            )
            .await
    }

    // Backup configuration

    pub async fn create_backup_credentials(
        &mut self,
        name: &str,
        spec: &BackupCredentialsSpec,
    ) -> Result<BackupCredentials> {
        let credentials = self.cp().create_backup_credentials(name, spec).await?;
        self.defer(Deferral::DeleteBackupCredentials {
            id: credentials.id.clone(),
        });
        Ok(credentials)
    }

    pub async fn create_backup_policy(
        &mut self,
        name: &str,
        schedules: &[BackupSchedule],
    ) -> Result<BackupPolicy> {
        let policy = self.cp().create_backup_policy(name, schedules).await?;
        self.defer(Deferral::DeleteBackupPolicy {
            id: policy.id.clone(),
        });
        Ok(policy)
    }

    /// Creates S3 credentials and a backup target from the suite's S3
    /// settings and waits until the target is synced to the deployment
    /// target.
    pub async fn ensure_backup_target(
        &mut self,
        name: &str,
    ) -> Result<(BackupTarget, BackupTargetState)> {
        let s3 = self.env.s3()?.clone();
        let spec = BackupCredentialsSpec::S3 {
            endpoint: s3.endpoint.clone(),
            access_key: s3.access_key.clone(),
            secret_key: s3.secret_key.clone(),
        };
        let credentials = self.create_backup_credentials(name, &spec).await?;
        let target = self
            .cp()
            .create_backup_target(name, &credentials.id, &s3.bucket, &s3.region, "s3")
            .await?;
        self.defer(Deferral::DeleteBackupTarget {
            id: target.id.clone(),
        });
        let state = self
            .cp()
            .wait_backup_target_synced(&self.ctx, &target.id, &self.target.deployment_target_id)
            .await?;
        info!(
            backup_target_id = %target.id,
            px_credentials = ?state.px_credentials_name,
            "backup target synced"
        );
        Ok((target, state))
    }

    /// Checks the Portworx credential behind a synced backup target.
    pub async fn verify_backup_target_credential(&self, state: &BackupTargetState) -> Result<()> {
        let s3 = self.env.s3()?;
        self.correlator()
            .wait_target_credential(&self.ctx, state, s3)
            .await?;
        Ok(())
    }

    // Backups

    pub async fn adhoc_backup(
        &mut self,
        deployment: &Deployment,
        backup_target_id: &str,
    ) -> Result<(Backup, BackupJob)> {
        let backup = self
            .cp()
            .create_adhoc_backup(&deployment.id, backup_target_id)
            .await?;
        self.defer(Deferral::DeleteBackup {
            id: backup.id.clone(),
            local_only: false,
        });
        let job = self
            .correlator()
            .wait_backup_correlated(&self.ctx, &backup, &self.target.namespace)
            .await?;
        Ok((backup, job))
    }

    /// Deletes `backup` on the control plane only. The backup CR stays on
    /// the target cluster and is removed at cleanup.
    pub async fn delete_backup_local_only(&mut self, backup: &Backup) -> Result<()> {
        self.cp().delete_backup(&backup.id, true).await?;
        self.cp().wait_backup_removed(&self.ctx, &backup.id).await?;
        if !backup.cluster_resource_name.is_empty() {
            self.defer(Deferral::DeletePdsBackup {
                namespace: self.target.namespace.clone(),
                name: backup.cluster_resource_name.clone(),
            });
        }
        Ok(())
    }

    /// Waits for a scheduled backup of the deployment that is not one of
    /// `known`, i.e. the schedule created by the latest policy change.
    pub async fn wait_scheduled_backup(
        &self,
        deployment_id: &str,
        known: &[String],
    ) -> Result<Backup> {
        let what = format!("new scheduled backup of deployment {}", deployment_id);
        Ok(wait::poll_until(&self.ctx, self.cp().policy(), &what, || async move {
            let backups = self.cp().list_backups(deployment_id).await?;
            Ok::<_, HarnessError>(
                backups
                    .into_iter()
                    .find(|b| !b.is_adhoc() && !known.contains(&b.id)),
            )
        })
        .await?)
    }

    /// Waits for `n` successful jobs of a scheduled backup. The deadline
    /// grows with the schedule interval.
    pub async fn ensure_n_backup_jobs_success_from_schedule(
        &self,
        backup_id: &str,
        n: usize,
        schedule_interval: Duration,
    ) -> Result<Vec<BackupJob>> {
        let base = self.cp().policy();
        let slack = base.timeout.min(STANDARD_TIMEOUT);
        let scheduled = schedule_interval.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX));
        let policy = WaitPolicy::new(scheduled.saturating_add(slack), base.interval);
        self.cp()
            .ensure_n_backup_jobs_succeeded(&self.ctx, policy, backup_id, n)
            .await
    }

    pub async fn wait_backup_schedule(&self, backup: &Backup, schedule: &str) -> Result<()> {
        self.correlator()
            .wait_backup_cron_schedule(&self.ctx, backup, &self.target.namespace, schedule)
            .await
    }

    /// Deletes the backup CR on the target cluster and waits for the
    /// control plane job, the backup job CR and its volume snapshot to go.
    pub async fn delete_backup_job_from_tc(&self, backup: &Backup, job: &BackupJob) -> Result<()> {
        let namespace = &self.target.namespace;
        let cr_name = correlator::adhoc_backup_job_name(&backup.cluster_resource_name);
        let cr = self.k8s().get_pds_backup_job(namespace, &cr_name).await?;
        let snapshot = cr.status.and_then(|s| s.volume_snapshot_name);

        self.k8s()
            .delete_pds_backup(namespace, &backup.cluster_resource_name)
            .await?;
        self.correlator()
            .wait_backup_job_cascade(&self.ctx, namespace, job, &cr_name, snapshot.as_deref())
            .await
    }

    /// Waits until the cloud snapshot of `job` has objects in the bucket, or
    /// none left when `present` is false.
    pub async fn wait_snapshot_objects(&self, job: &BackupJob, present: bool) -> Result<usize> {
        let snap = job.cloud_snap_id.as_deref().ok_or_else(|| {
            CorrelationError::NotReady(format!("backup job {} has no cloud snapshot", job.id))
        })?;
        correlator::wait_snapshot_objects(
            &self.ctx,
            self.cp().policy(),
            self.env.store()?,
            snap,
            present,
        )
        .await
    }

    // Restores

    /// Creates a restore of `job`. The deployment it creates is removed at
    /// cleanup whether or not the restore succeeds.
    pub async fn start_restore(&mut self, job: &BackupJob, name: &str) -> Result<Restore> {
        let created = self
            .cp()
            .create_restore(
                &job.id,
                name,
                &self.target.namespace_id,
                &self.target.deployment_target_id,
            )
            .await?;
        self.defer_restored_deployment(&created);
        let restore = self.cp().get_restore(&created.id).await?;
        self.defer_restored_deployment(&restore);
        Ok(restore)
    }

    fn defer_restored_deployment(&mut self, restore: &Restore) {
        let Some(id) = &restore.deployment_id else {
            return;
        };
        let deferral = Deferral::RemoveDeployment { id: id.clone() };
        if !self.cleanup.entries().contains(&deferral) {
            self.defer(deferral);
        }
    }

    /// Restores `job` into the test namespace and waits for the new
    /// deployment to come up on both sides.
    pub async fn restore_from_backup_job(
        &mut self,
        job: &BackupJob,
        name: &str,
    ) -> Result<(Restore, Deployment)> {
        let restore = self.start_restore(job, name).await?;
        self.complete_restore(&restore.id).await
    }

    /// Expects the restore to fail with `error_code`.
    pub async fn wait_restore_failed(&self, restore_id: &str, error_code: &str) -> Result<Restore> {
        let restore = self.cp().wait_restore_failed(&self.ctx, restore_id).await?;
        let actual = restore.error_code.clone().unwrap_or_default();
        if actual != error_code {
            return Err(CorrelationError::Mismatch {
                what: format!("error code of restore {}", restore_id),
                expected: error_code.to_string(),
                actual,
            }
            .into());
        }
        Ok(restore)
    }

    /// Re-submits a failed restore. The control plane keeps the restore ID
    /// and the lineage to the original deployment.
    pub async fn retry_restore(
        &mut self,
        restore: &Restore,
        name: Option<&str>,
    ) -> Result<(Restore, Deployment)> {
        let retried = self.cp().retry_restore(&restore.id, name).await?;
        self.defer_restored_deployment(restore);
        self.defer_restored_deployment(&retried);
        if retried.id != restore.id {
            return Err(CorrelationError::Mismatch {
                what: "ID of retried restore".into(),
                expected: restore.id.clone(),
                actual: retried.id,
            }
            .into());
        }
        let (done, deployment) = self.complete_restore(&restore.id).await?;
        if restore.original_deployment_id.is_some()
            && done.original_deployment_id != restore.original_deployment_id
        {
            return Err(CorrelationError::Mismatch {
                what: format!("original deployment of restore {}", restore.id),
                expected: restore.original_deployment_id.clone().unwrap_or_default(),
                actual: done.original_deployment_id.clone().unwrap_or_default(),
            }
            .into());
        }
        Ok((done, deployment))
    }

    async fn complete_restore(&mut self, restore_id: &str) -> Result<(Restore, Deployment)> {
        let restore = match self.cp().wait_restore_successful(&self.ctx, restore_id).await {
            Ok(restore) => restore,
            Err(e) => {
                // The deployment may have been created while waiting.
                if let Ok(latest) = self.cp().get_restore(restore_id).await {
                    self.defer_restored_deployment(&latest);
                }
                return Err(e);
            }
        };
        self.defer_restored_deployment(&restore);
        let deployment = self
            .correlator()
            .wait_restored_deployment(&self.ctx, &restore)
            .await?;
        Ok((restore, deployment))
    }

    // Portworx credentials

    /// Makes sure a Portworx S3 credential named `name` exists, creating it
    /// from the suite's S3 settings. Returns its ID.
    pub async fn ensure_px_credential(&self, name: &str) -> Result<String> {
        if let Some(existing) = self.env.px.find_cloud_credential(name).await? {
            return Ok(existing.credential_id);
        }
        let s3 = self.env.s3()?;
        let id = self
            .env
            .px
            .create_s3_cloud_credential(&S3Credential {
                name: name.to_string(),
                bucket: s3.bucket.clone(),
                access_key: s3.access_key.clone(),
                secret_key: s3.secret_key.clone(),
                endpoint: s3.endpoint.clone(),
                region: s3.region.clone(),
            })
            .await?;
        info!(credential = name, id = %id, "created portworx cloud credential");
        Ok(id)
    }

    /// Deletes the Portworx credential and waits until it is no longer listed.
    pub async fn remove_px_credential(&self, name: &str) -> Result<()> {
        self.env.px.delete_cloud_credential_by_name(name).await?;
        self.correlator()
            .wait_target_credential_removed(&self.ctx, name)
            .await
    }

    // Target cluster connectivity and policy

    /// Scales the teleport deployment to zero so the control plane loses
    /// the target. Returns the replica count to restore.
    pub async fn disconnect_target(&mut self) -> Result<i32> {
        let namespace = self.env.pds_namespace.clone();
        let previous = self
            .k8s()
            .scale_deployment(&namespace, TELEPORT_DEPLOYMENT, 0)
            .await?;
        self.defer(Deferral::RestoreReplicas {
            namespace,
            deployment: TELEPORT_DEPLOYMENT.to_string(),
            replicas: previous,
        });
        warn!(scenario = %self.name, previous, "target disconnected");
        Ok(previous)
    }

    pub async fn reconnect_target(&self, replicas: i32) -> Result<DeploymentTarget> {
        self.k8s()
            .scale_deployment(&self.env.pds_namespace, TELEPORT_DEPLOYMENT, replicas)
            .await?;
        let target = self
            .cp()
            .wait_deployment_target_healthy(&self.ctx, &self.target.deployment_target_id)
            .await?;
        info!(scenario = %self.name, replicas, "target reconnected");
        Ok(target)
    }

    /// Sets the TLS policy of the deployment target; the previous policy is
    /// restored at cleanup.
    pub async fn set_target_tls_policy(
        &mut self,
        issuer: Option<&str>,
        required: bool,
    ) -> Result<DeploymentTarget> {
        let id = self.target.deployment_target_id.clone();
        let current = self.cp().get_deployment_target(&id).await?;
        self.defer(Deferral::ResetTargetTls {
            target_id: id.clone(),
            issuer: current.tls_issuer.clone(),
            required: current.tls_required.unwrap_or(false),
        });
        let patch = DeploymentTargetPatch {
            name: None,
            tls_issuer: issuer.map(str::to_string),
            tls_required: Some(required),
        };
        self.cp().patch_deployment_target(&id, &patch).await
    }

    pub async fn create_self_signed_issuer(&mut self, name: &str) -> Result<ClusterIssuer> {
        let issuer = self.k8s().create_self_signed_issuer(name).await?;
        self.defer(Deferral::DeleteClusterIssuer {
            name: name.to_string(),
        });
        Ok(issuer)
    }
}
