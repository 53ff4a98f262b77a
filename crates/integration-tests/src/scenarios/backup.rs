use std::time::Duration;

use pds_harness::cp::models::{BackupCredentialsSpec, BackupSchedule, ShortDeploymentSpec};
use pds_harness::{expect_error, random_name, Deferral, ErrorKind, Result, Scenario};
use tracing::info;

use super::{CASSANDRA, POSTGRESQL};

pub const SCHEDULE: &str = "backup-with-schedule";
pub const DUPLICATE_CREDENTIALS: &str = "duplicate-backup-credentials";
pub const INVALID_CRON: &str = "backup-policy-invalid-cron";
pub const DELETE_FROM_TC: &str = "backup-job-deletion-from-tc";

const EVERY_MINUTE: &str = "*/1 * * * *";
const EVERY_TWO_MINUTES: &str = "*/2 * * * *";
const RETENTION: i32 = 10;

/// Scheduled backups follow the deployment's policy. After switching
/// policies the jobs are counted on the schedule the new policy created.
pub async fn backup_with_schedule(s: &mut Scenario<'_>, version: String) -> Result<()> {
    info!("TEST: scheduled backups follow a policy switch");
    let (target, _) = s.ensure_backup_target(&random_name("autotest-bt")).await?;
    let every_minute = s
        .create_backup_policy(
            &random_name("autotest-bp"),
            &[BackupSchedule::incremental(EVERY_MINUTE, RETENTION)],
        )
        .await?;
    let every_two = s
        .create_backup_policy(
            &random_name("autotest-bp"),
            &[BackupSchedule::incremental(EVERY_TWO_MINUTES, RETENTION)],
        )
        .await?;

    let spec = ShortDeploymentSpec::new(CASSANDRA, &version, 1)
        .with_backup(&every_minute.name, &target.name);
    let deployment = s.deploy_data_service(&spec).await?;

    let first = s.wait_scheduled_backup(&deployment.id, &[]).await?;
    s.defer(Deferral::DeleteBackup {
        id: first.id.clone(),
        local_only: false,
    });
    s.wait_backup_schedule(&first, EVERY_MINUTE).await?;
    let jobs = s
        .ensure_n_backup_jobs_success_from_schedule(&first.id, 2, Duration::from_secs(60))
        .await?;
    info!(backup = %first.id, jobs = jobs.len(), "  ✅ jobs from the */1 schedule");

    s.set_backup_schedule(&deployment.id, &every_two.name, &target.name)
        .await?;
    let second = s
        .wait_scheduled_backup(&deployment.id, &[first.id.clone()])
        .await?;
    s.defer(Deferral::DeleteBackup {
        id: second.id.clone(),
        local_only: false,
    });
    s.wait_backup_schedule(&second, EVERY_TWO_MINUTES).await?;
    let jobs = s
        .ensure_n_backup_jobs_success_from_schedule(&second.id, 2, Duration::from_secs(120))
        .await?;
    info!(backup = %second.id, jobs = jobs.len(), "  ✅ jobs from the */2 schedule");
    Ok(())
}

pub async fn duplicate_credentials(s: &mut Scenario<'_>) -> Result<()> {
    info!("TEST: backup credentials names are unique");
    let name = random_name("autotest-creds");
    let spec = BackupCredentialsSpec::Azure {
        account_name: "pdsautotest".into(),
        account_key: "cGRzLWF1dG90ZXN0LWtleQ==".into(),
    };
    s.create_backup_credentials(&name, &spec).await?;

    let duplicate = s.cp().create_backup_credentials(&name, &spec).await;
    if let Ok(credentials) = &duplicate {
        s.defer(Deferral::DeleteBackupCredentials {
            id: credentials.id.clone(),
        });
    }
    let err = expect_error(ErrorKind::Conflict, duplicate)?;
    info!(error = %err, "  ✅ duplicate rejected");
    Ok(())
}

pub async fn invalid_cron(s: &mut Scenario<'_>) -> Result<()> {
    info!("TEST: backup policies need a valid cron schedule");
    let result = s
        .cp()
        .create_backup_policy(
            &random_name("autotest-bp"),
            &[BackupSchedule::incremental("a s d f g", 1)],
        )
        .await;
    if let Ok(policy) = &result {
        s.defer(Deferral::DeleteBackupPolicy {
            id: policy.id.clone(),
        });
    }
    let err = expect_error(ErrorKind::Unprocessable, result)?;
    info!(error = %err, "  ✅ invalid schedule rejected");
    Ok(())
}

/// Deleting the backup CR on the target cluster cascades to the backup job
/// CR, its volume snapshot and the control plane's backup job.
pub async fn delete_backup_job_from_tc(s: &mut Scenario<'_>, version: String) -> Result<()> {
    info!("TEST: backup job deleted from the target cluster disappears everywhere");
    let (target, state) = s.ensure_backup_target(&random_name("autotest-bt")).await?;
    s.verify_backup_target_credential(&state).await?;

    let spec = ShortDeploymentSpec::new(POSTGRESQL, &version, 1);
    let deployment = s.deploy_data_service(&spec).await?;
    let (backup, job) = s.adhoc_backup(&deployment, &target.id).await?;
    info!(backup_job = %job.id, cloud_snap = ?job.cloud_snap_id, "  ✅ ad hoc backup correlated");

    s.delete_backup_job_from_tc(&backup, &job).await?;
    info!(backup_job = %job.id, "  ✅ backup job gone from both sides");
    Ok(())
}
