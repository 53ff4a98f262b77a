use pds_harness::cp::models::ShortDeploymentSpec;
use pds_harness::{random_name, ErrorKind, HarnessError, Result, Scenario};
use tracing::info;

use super::POSTGRESQL;

pub const TLS_REQUIRED: &str = "tls-required";

const POLICY_VIOLATION: &str = "policy requires enabling TLS";

pub async fn tls_required(s: &mut Scenario<'_>, version: String) -> Result<()> {
    info!("TEST: a target requiring TLS only accepts TLS deployments");
    let issuer = random_name("autotest-issuer");
    s.create_self_signed_issuer(&issuer).await?;
    s.set_target_tls_policy(Some(&issuer), true).await?;

    let plain = ShortDeploymentSpec::new(POSTGRESQL, &version, 1).with_tls(false);
    let err = s
        .fail_deploy_data_service(&plain, ErrorKind::Unprocessable)
        .await?;
    if !err.to_string().contains(POLICY_VIOLATION) {
        return Err(HarnessError::UnexpectedOutcome {
            expected: ErrorKind::Unprocessable,
            actual: err.to_string(),
        });
    }
    info!("  ✅ plain deployment rejected");

    let deployment = s.deploy_data_service(&plain.with_tls(true)).await?;
    info!(deployment = %deployment.name, "  ✅ TLS deployment healthy");
    Ok(())
}
