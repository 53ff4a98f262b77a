use pds_harness::cp::models::ShortDeploymentSpec;
use pds_harness::{Result, Scenario};
use tracing::info;

use super::POSTGRESQL;

pub const LIFECYCLE: &str = "deployment-lifecycle";
pub const DISCONNECT: &str = "target-disconnect-reconnect";

pub async fn lifecycle(s: &mut Scenario<'_>, version: String) -> Result<()> {
    info!("TEST: deployment becomes healthy on both sides and is removed from both");
    let spec = ShortDeploymentSpec::new(POSTGRESQL, &version, 1);
    let deployment = s.deploy_data_service(&spec).await?;
    info!(deployment = %deployment.name, "  ✅ deployment healthy");

    s.delete_deployment(&deployment).await?;
    info!(deployment = %deployment.name, "  ✅ deployment removed");
    Ok(())
}

pub async fn disconnect(s: &mut Scenario<'_>, version: String) -> Result<()> {
    info!("TEST: target recovers after the agent tunnel is scaled down");
    let spec = ShortDeploymentSpec::new(POSTGRESQL, &version, 1);
    let deployment = s.deploy_data_service(&spec).await?;

    let replicas = s.disconnect_target().await?;
    let target = s.reconnect_target(replicas.max(1)).await?;
    info!(target = %target.name, "  ✅ target healthy again");

    s.cp().wait_deployment_healthy(s.ctx(), &deployment.id).await?;
    s.correlator()
        .wait_deployment_initialized(s.ctx(), &deployment)
        .await?;
    info!(deployment = %deployment.name, "  ✅ deployment survived the disconnect");
    Ok(())
}
