use pds_harness::cp::models::{ShortDeploymentSpec, PX_CLOUD_CREDENTIALS_NOT_FOUND};
use pds_harness::{random_name, HarnessError, Result, Scenario};
use tracing::info;

use super::CASSANDRA;

pub const RETRY_MISSING_PX_CREDENTIALS: &str = "restore-retry-missing-px-credentials";

pub async fn retry_missing_px_credentials(s: &mut Scenario<'_>, version: String) -> Result<()> {
    info!("TEST: restore fails without Portworx credentials and succeeds on retry");
    let (target, state) = s.ensure_backup_target(&random_name("autotest-bt")).await?;
    let px_name = state
        .px_credentials_name
        .clone()
        .ok_or_else(|| {
            HarnessError::Missing(format!(
                "PX credentials name of backup target {}",
                target.id
            ))
        })?;

    let spec = ShortDeploymentSpec::new(CASSANDRA, &version, 1);
    let deployment = s.deploy_data_service(&spec).await?;
    let (_, job) = s.adhoc_backup(&deployment, &target.id).await?;

    s.remove_px_credential(&px_name).await?;
    if !s.correlator().px_credential_absent(&px_name).await? {
        return Err(HarnessError::InternalError(format!(
            "cloud credential {} is still present",
            px_name
        )));
    }
    let restore = s
        .start_restore(&job, &random_name("autotest-restore"))
        .await?;
    let failed = s
        .wait_restore_failed(&restore.id, PX_CLOUD_CREDENTIALS_NOT_FOUND)
        .await?;
    info!(restore = %failed.id, "  ✅ restore failed on missing credentials");

    s.ensure_px_credential(&px_name).await?;
    let (restored, restored_deployment) = s.retry_restore(&failed, None).await?;
    let ready = s
        .k8s()
        .statefulset_ready(
            &s.target().namespace,
            &restored_deployment.cluster_resource_name,
            restored_deployment.node_count,
        )
        .await?;
    if !ready {
        return Err(HarnessError::InternalError(format!(
            "statefulset {} of the restored deployment is not ready",
            restored_deployment.cluster_resource_name
        )));
    }
    info!(
        restore = %restored.id,
        deployment = %restored_deployment.name,
        "  ✅ retried restore succeeded"
    );
    Ok(())
}
