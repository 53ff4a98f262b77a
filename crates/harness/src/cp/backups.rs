use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::models::*;
use super::{find_named, gone, ControlPlane};
use crate::error::{HarnessError, Result};
use crate::wait::{self, WaitPolicy};

impl ControlPlane {
    // Backup credentials

    pub async fn create_backup_credentials(
        &self,
        name: &str,
        credentials: &BackupCredentialsSpec,
    ) -> Result<BackupCredentials> {
        info!(name, provider = credentials.provider(), "creating backup credentials");
        let request = CreateBackupCredentialsRequest {
            name: name.to_string(),
            credentials: credentials.clone(),
        };
        Ok(self
            .api
            .post(
                &format!("api/tenants/{}/backup-credentials", self.tenant.id),
                &request,
            )
            .await?)
    }

    pub async fn get_backup_credentials(&self, id: &str) -> Result<BackupCredentials> {
        Ok(self.api.get(&format!("api/backup-credentials/{}", id)).await?)
    }

    /// Same as [`get_backup_credentials`](Self::get_backup_credentials) but
    /// including provider secrets.
    pub async fn get_backup_credentials_secrets(&self, id: &str) -> Result<CredentialsView> {
        Ok(self
            .api
            .get(&format!("api/backup-credentials/{}/credentials", id))
            .await?)
    }

    pub async fn list_backup_credentials(&self) -> Result<Vec<BackupCredentials>> {
        let creds: Paginated<BackupCredentials> = self
            .api
            .get(&format!("api/tenants/{}/backup-credentials", self.tenant.id))
            .await?;
        Ok(creds.data)
    }

    pub async fn find_backup_credentials(&self, name: &str) -> Result<Option<BackupCredentials>> {
        let creds = self.list_backup_credentials().await?;
        Ok(find_named(creds, name, |c| &c.name))
    }

    pub async fn update_backup_credentials(
        &self,
        id: &str,
        name: &str,
        credentials: &BackupCredentialsSpec,
    ) -> Result<BackupCredentials> {
        info!(credentials_id = id, name, "updating backup credentials");
        let request = CreateBackupCredentialsRequest {
            name: name.to_string(),
            credentials: credentials.clone(),
        };
        Ok(self
            .api
            .put(&format!("api/backup-credentials/{}", id), &request)
            .await?)
    }

    pub async fn delete_backup_credentials(&self, id: &str) -> Result<()> {
        info!(credentials_id = id, "deleting backup credentials");
        Ok(self
            .api
            .delete(&format!("api/backup-credentials/{}", id))
            .await?)
    }

    // Backup targets

    pub async fn create_backup_target(
        &self,
        name: &str,
        credentials_id: &str,
        bucket: &str,
        region: &str,
        target_type: &str,
    ) -> Result<BackupTarget> {
        info!(name, bucket, region, target_type, "creating backup target");
        let request = CreateBackupTargetRequest {
            name: name.to_string(),
            backup_credentials_id: credentials_id.to_string(),
            bucket: bucket.to_string(),
            region: region.to_string(),
            target_type: target_type.to_string(),
        };
        Ok(self
            .api
            .post(
                &format!("api/tenants/{}/backup-targets", self.tenant.id),
                &request,
            )
            .await?)
    }

    pub async fn get_backup_target(&self, id: &str) -> Result<BackupTarget> {
        Ok(self.api.get(&format!("api/backup-targets/{}", id)).await?)
    }

    pub async fn list_backup_targets(&self) -> Result<Vec<BackupTarget>> {
        let targets: Paginated<BackupTarget> = self
            .api
            .get(&format!("api/tenants/{}/backup-targets", self.tenant.id))
            .await?;
        Ok(targets.data)
    }

    pub async fn find_backup_target(&self, name: &str) -> Result<Option<BackupTarget>> {
        let targets = self.list_backup_targets().await?;
        Ok(find_named(targets, name, |t| &t.name))
    }

    pub async fn backup_target_states(&self, id: &str) -> Result<Vec<BackupTargetState>> {
        let states: Paginated<BackupTargetState> = self
            .api
            .get(&format!("api/backup-targets/{}/states", id))
            .await?;
        Ok(states.data)
    }

    /// Waits until the target's credentials have been synced to the
    /// deployment target, returning the synced state.
    pub async fn wait_backup_target_synced(
        &self,
        ctx: &CancellationToken,
        backup_target_id: &str,
        deployment_target_id: &str,
    ) -> Result<BackupTargetState> {
        let what = format!(
            "backup target {} on deployment target {}",
            backup_target_id, deployment_target_id
        );
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            let states = self.backup_target_states(backup_target_id).await?;
            let state = states
                .into_iter()
                .find(|s| s.deployment_target_id == deployment_target_id);
            if let Some(state) = &state {
                debug!(backup_target_id, state = %state.state, "backup target state");
            }
            Ok::<_, HarnessError>(state.filter(BackupTargetState::created_in_tc))
        })
        .await?)
    }

    pub async fn delete_backup_target(&self, id: &str) -> Result<()> {
        info!(backup_target_id = id, "deleting backup target");
        Ok(self.api.delete(&format!("api/backup-targets/{}", id)).await?)
    }

    pub async fn wait_backup_target_removed(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<()> {
        let what = format!("backup target {} to be removed", id);
        wait::wait(ctx, self.policy, &what, || async move {
            gone(self.get_backup_target(id).await)
        })
        .await?;
        Ok(())
    }

    // Backup policies

    pub async fn create_backup_policy(
        &self,
        name: &str,
        schedules: &[BackupSchedule],
    ) -> Result<BackupPolicy> {
        info!(name, ?schedules, "creating backup policy");
        let request = BackupPolicyRequest {
            name: name.to_string(),
            schedules: schedules.to_vec(),
        };
        Ok(self
            .api
            .post(
                &format!("api/tenants/{}/backup-policies", self.tenant.id),
                &request,
            )
            .await?)
    }

    pub async fn update_backup_policy(
        &self,
        id: &str,
        name: &str,
        schedules: &[BackupSchedule],
    ) -> Result<BackupPolicy> {
        info!(backup_policy_id = id, ?schedules, "updating backup policy");
        let request = BackupPolicyRequest {
            name: name.to_string(),
            schedules: schedules.to_vec(),
        };
        Ok(self
            .api
            .put(&format!("api/backup-policies/{}", id), &request)
            .await?)
    }

    pub async fn list_backup_policies(&self) -> Result<Vec<BackupPolicy>> {
        let policies: Paginated<BackupPolicy> = self
            .api
            .get(&format!("api/tenants/{}/backup-policies", self.tenant.id))
            .await?;
        Ok(policies.data)
    }

    pub async fn get_backup_policy(&self, id: &str) -> Result<BackupPolicy> {
        Ok(self.api.get(&format!("api/backup-policies/{}", id)).await?)
    }

    pub async fn find_backup_policy(&self, name: &str) -> Result<Option<BackupPolicy>> {
        let policies = self.list_backup_policies().await?;
        Ok(find_named(policies, name, |p| &p.name))
    }

    pub async fn delete_backup_policy(&self, id: &str) -> Result<()> {
        info!(backup_policy_id = id, "deleting backup policy");
        Ok(self
            .api
            .delete(&format!("api/backup-policies/{}", id))
            .await?)
    }

    // Backups

    pub async fn create_adhoc_backup(
        &self,
        deployment_id: &str,
        backup_target_id: &str,
    ) -> Result<Backup> {
        info!(deployment_id, backup_target_id, "creating ad hoc backup");
        let request = CreateBackupRequest {
            backup_level: "snapshot".to_string(),
            backup_target_id: backup_target_id.to_string(),
            backup_type: "adhoc".to_string(),
        };
        Ok(self
            .api
            .post(&format!("api/deployments/{}/backups", deployment_id), &request)
            .await?)
    }

    pub async fn list_backups(&self, deployment_id: &str) -> Result<Vec<Backup>> {
        let backups: Paginated<Backup> = self
            .api
            .get(&format!("api/deployments/{}/backups", deployment_id))
            .await?;
        Ok(backups.data)
    }

    pub async fn get_backup(&self, id: &str) -> Result<Backup> {
        Ok(self.api.get(&format!("api/backups/{}", id)).await?)
    }

    /// Deletes a backup. With `local_only` the control plane forgets the
    /// backup but leaves the cloud snapshots in the object store.
    pub async fn delete_backup(&self, id: &str, local_only: bool) -> Result<()> {
        info!(backup_id = id, local_only, "deleting backup");
        let query = if local_only {
            vec![("local_only", "true".to_string())]
        } else {
            Vec::new()
        };
        Ok(self
            .api
            .delete_query(&format!("api/backups/{}", id), &query)
            .await?)
    }

    pub async fn wait_backup_removed(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let what = format!("backup {} to be removed", id);
        wait::wait(ctx, self.policy, &what, || async move {
            gone(self.get_backup(id).await)
        })
        .await?;
        Ok(())
    }

    // Backup jobs

    pub async fn list_backup_jobs_of_backup(&self, backup_id: &str) -> Result<Vec<BackupJob>> {
        let jobs: Paginated<BackupJob> = self
            .api
            .get(&format!("api/backups/{}/jobs", backup_id))
            .await?;
        Ok(jobs.data)
    }

    /// Project-wide backup job list narrowed by `filter`.
    pub async fn list_backup_jobs(&self, filter: &BackupJobFilter) -> Result<Vec<BackupJob>> {
        let jobs: Paginated<BackupJob> = self
            .api
            .get_query(
                &format!("api/projects/{}/backup-jobs", self.project.id),
                &filter.query(),
            )
            .await?;
        Ok(jobs.data)
    }

    pub async fn get_backup_job(&self, id: &str) -> Result<BackupJob> {
        Ok(self.api.get(&format!("api/backup-jobs/{}", id)).await?)
    }

    pub async fn delete_backup_job(&self, id: &str) -> Result<()> {
        info!(backup_job_id = id, "deleting backup job");
        Ok(self.api.delete(&format!("api/backup-jobs/{}", id)).await?)
    }

    pub async fn delete_backup_job_by_name(&self, backup_id: &str, name: &str) -> Result<()> {
        let jobs = self.list_backup_jobs_of_backup(backup_id).await?;
        let job = find_named(jobs, name, |j| &j.name)
            .ok_or_else(|| HarnessError::Missing(format!("backup job {:?}", name)))?;
        self.delete_backup_job(&job.id).await
    }

    pub async fn wait_backup_job_removed(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let what = format!("backup job {} to be removed", id);
        wait::wait(ctx, self.policy, &what, || async move {
            gone(self.get_backup_job(id).await)
        })
        .await?;
        Ok(())
    }

    /// Waits for the first job of `backup_id` to succeed. A failed job ends
    /// the wait.
    pub async fn wait_backup_job_succeeded(
        &self,
        ctx: &CancellationToken,
        backup_id: &str,
    ) -> Result<BackupJob> {
        let what = format!("backup job of backup {} to succeed", backup_id);
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            let jobs = self.list_backup_jobs_of_backup(backup_id).await?;
            if let Some(failed) = jobs
                .iter()
                .find(|j| j.status == Some(BackupJobStatus::Failed))
            {
                return Err(HarnessError::Failed(format!(
                    "backup job {} failed",
                    failed.id
                )));
            }
            Ok(jobs.into_iter().find(BackupJob::succeeded))
        })
        .await?)
    }

    /// Waits until at least `n` jobs of the (scheduled) backup `backup_id`
    /// have succeeded and returns them.
    pub async fn ensure_n_backup_jobs_succeeded(
        &self,
        ctx: &CancellationToken,
        policy: WaitPolicy,
        backup_id: &str,
        n: usize,
    ) -> Result<Vec<BackupJob>> {
        let what = format!("{} successful backup jobs of backup {}", n, backup_id);
        let filter = BackupJobFilter::by_backup(backup_id);
        let filter = &filter;
        Ok(wait::poll_until(ctx, policy, &what, || async move {
            let jobs = self.list_backup_jobs(filter).await?;
            let succeeded: Vec<BackupJob> = jobs.into_iter().filter(BackupJob::succeeded).collect();
            debug!(backup_id, succeeded = succeeded.len(), wanted = n, "scheduled backup jobs");
            Ok::<_, HarnessError>((succeeded.len() >= n).then_some(succeeded))
        })
        .await?)
    }

    // Restores

    pub async fn create_restore(
        &self,
        backup_job_id: &str,
        name: &str,
        namespace_id: &str,
        deployment_target_id: &str,
    ) -> Result<Restore> {
        info!(backup_job_id, name, "creating restore");
        let request = CreateRestoreRequest {
            name: name.to_string(),
            namespace_id: namespace_id.to_string(),
            deployment_target_id: deployment_target_id.to_string(),
        };
        Ok(self
            .api
            .post(&format!("api/backup-jobs/{}/restore", backup_job_id), &request)
            .await?)
    }

    pub async fn get_restore(&self, id: &str) -> Result<Restore> {
        Ok(self.api.get(&format!("api/restores/{}", id)).await?)
    }

    /// Re-submits a failed restore, optionally under a new name.
    pub async fn retry_restore(&self, id: &str, name: Option<&str>) -> Result<Restore> {
        info!(restore_id = id, ?name, "retrying restore");
        let request = RetryRestoreRequest {
            name: name.map(str::to_string),
        };
        Ok(self
            .api
            .post(&format!("api/restores/{}/retry", id), &request)
            .await?)
    }

    pub async fn wait_restore_successful(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<Restore> {
        let what = format!("restore {} to succeed", id);
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            let restore = self.get_restore(id).await?;
            match restore.status.clone() {
                Some(RestoreStatus::Successful) => Ok(Some(restore)),
                Some(RestoreStatus::Failed) => Err(HarnessError::Failed(format!(
                    "restore {} failed: {}",
                    id,
                    restore.error_code.as_deref().unwrap_or("unknown error")
                ))),
                _ => Ok(None),
            }
        })
        .await?)
    }

    pub async fn wait_restore_failed(&self, ctx: &CancellationToken, id: &str) -> Result<Restore> {
        let what = format!("restore {} to fail", id);
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            let restore = self.get_restore(id).await?;
            match restore.status.clone() {
                Some(RestoreStatus::Failed) => Ok(Some(restore)),
                Some(RestoreStatus::Successful) => Err(HarnessError::Failed(format!(
                    "restore {} succeeded unexpectedly",
                    id
                ))),
                _ => Ok(None),
            }
        })
        .await?)
    }
}
