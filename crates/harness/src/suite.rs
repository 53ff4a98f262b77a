//! Suite lifecycle: setup, isolated scenario runs and teardown.
//!
//! A [`Suite`] owns the shared [`Environment`] and the target context every
//! scenario deploys into. Each scenario gets its own cleanup stack, drained
//! after the body on every exit path. Namespaces the suite creates during
//! setup are recorded on a suite-level stack and removed by
//! [`Suite::teardown`]; namespaces that already existed are left alone.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::distr::Alphanumeric;
use rand::Rng;
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::cleanup::{CleanupReport, CleanupStack, Deferral};
use crate::config::{HarnessConfig, VersionMatrix, LABEL_PDS_AVAILABLE};
use crate::cp::models::{BackupJobFilter, DeploymentTarget};
use crate::cp::{token_source, ApiClient, ControlPlane};
use crate::error::{HarnessError, Result};
use crate::helm::{ChartRelease, HelmDriver, MemoryClientGetter, RestClientGetter};
use crate::k8s::{labels, K8sCluster};
use crate::orchestrator::{Environment, Scenario, TargetContext};
use crate::px::PxProxy;
use crate::s3::{ObjectStore, S3ObjectStore};
use crate::wait::panic_message;

const NAME_SUFFIX_LEN: usize = 6;

pub const CERT_MANAGER_REPO: &str = "jetstack";
pub const CERT_MANAGER_CHART: &str = "cert-manager";
pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";
pub const PDS_REPO: &str = "pds";
pub const PDS_CHART: &str = "pds-target";
pub const PDS_RELEASE: &str = "pds";

/// `prefix-xxxxxx` with a random lowercase alphanumeric suffix.
pub fn random_name(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}-{}", prefix, suffix)
}

/// `key=value` for a helm value list, escaping the separators.
fn set_pair(key: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace(',', "\\,");
    format!("{}={}", key, escaped)
}

/// Result of one scenario, including its cleanup.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub error: Option<HarnessError>,
    pub cleanup: CleanupReport,
    pub elapsed: Duration,
}

impl ScenarioOutcome {
    /// A scenario passes when its body succeeded and nothing it left
    /// behind failed to clean up.
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.cleanup.is_clean()
    }
}

pub struct Suite {
    env: Environment,
    target: TargetContext,
    config: HarnessConfig,
    matrix: VersionMatrix,
    ctx: CancellationToken,
    teardown: CleanupStack,
}

impl Suite {
    /// Connects to the control plane and the target cluster, registers the
    /// target when asked to and prepares the test namespace.
    pub async fn setup(config: HarnessConfig, ctx: CancellationToken) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::new();
        let tokens = token_source(&config.auth_method()?, http.clone());
        let api = ApiClient::new(http.clone(), &config.control_plane.api_url, tokens)?;
        let cp = ControlPlane::connect(
            api,
            &config.control_plane.account_name,
            &config.control_plane.tenant_name,
            &config.control_plane.project_name,
        )
        .await?;

        let getter: Arc<dyn RestClientGetter> = Arc::new(MemoryClientGetter::from_path(
            config.target.kubeconfig.clone(),
            config.target.kube_context.clone(),
        ));
        let k8s = K8sCluster::from_getter(getter).await?;
        let px = PxProxy::connect(k8s.client().clone()).await?;
        let helm = HelmDriver::new(config.target.helm_binary.clone(), http);

        let s3 = if config.backup.s3_bucket.is_some() {
            Some(config.s3_settings()?)
        } else {
            None
        };
        let store = s3
            .as_ref()
            .map(|s| Arc::new(S3ObjectStore::new(s)) as Arc<dyn ObjectStore>);

        let env = Environment {
            cp,
            k8s,
            px,
            helm,
            store,
            s3,
            pds_namespace: config.target.pds_namespace.clone(),
        };
        Self::with_environment(env, config, ctx).await
    }

    /// Finishes setup on an already connected environment.
    pub async fn with_environment(
        env: Environment,
        config: HarnessConfig,
        ctx: CancellationToken,
    ) -> Result<Self> {
        let matrix = match &config.version_matrix {
            Some(path) => VersionMatrix::load(path)?,
            None => VersionMatrix::default(),
        };

        let deployment_target = match find_target(&env, &config).await? {
            Some(target) => target,
            None if config.target.register => register_target(&env, &config, &ctx).await?,
            None => {
                return Err(HarnessError::Missing(
                    "deployment target for the target cluster".into(),
                ))
            }
        };
        info!(
            target_id = %deployment_target.id,
            name = %deployment_target.name,
            "using deployment target"
        );

        let mut teardown = CleanupStack::new();
        let namespace = config.target.test_namespace.clone();
        let created = env
            .k8s
            .ensure_namespace(&namespace, &labels(&[(LABEL_PDS_AVAILABLE, "true")]))
            .await?;
        if created {
            teardown.push(Deferral::DeleteNamespace {
                name: namespace.clone(),
            });
        }
        let cp_namespace = env
            .cp
            .wait_namespace_available(&ctx, &deployment_target.id, &namespace)
            .await?;

        let target = TargetContext {
            deployment_target_id: deployment_target.id,
            namespace_id: cp_namespace.id,
            namespace,
        };
        Ok(Self {
            env,
            target,
            config,
            matrix,
            ctx,
            teardown,
        })
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn target(&self) -> &TargetContext {
        &self.target
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn ctx(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Image versions of `data_service` under test; `fallback` when the
    /// version matrix does not list any.
    pub fn image_versions(&self, data_service: &str, fallback: &str) -> Vec<String> {
        match self.matrix.versions(data_service) {
            [] => vec![fallback.to_string()],
            versions => versions.to_vec(),
        }
    }

    /// Runs `body` as the scenario `name`. The scenario's cleanup stack is
    /// drained afterwards whether the body returned, failed, panicked or
    /// was cancelled.
    pub async fn scenario<'a, F>(&'a self, name: &str, body: F) -> ScenarioOutcome
    where
        F: for<'s> FnOnce(&'s mut Scenario<'a>) -> BoxFuture<'s, Result<()>>,
    {
        let span = info_span!("scenario", name = %name);
        async move {
            info!("scenario started");
            let started = Instant::now();
            let mut scenario = Scenario::new(name, &self.env, &self.target, self.ctx.child_token());

            let error = match AssertUnwindSafe(body(&mut scenario)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(HarnessError::Panicked(panic_message(payload.as_ref()))),
            };
            let cleanup = scenario.finish().await;

            let outcome = ScenarioOutcome {
                name: name.to_string(),
                error,
                cleanup,
                elapsed: started.elapsed(),
            };
            match &outcome.error {
                None if outcome.cleanup.is_clean() => {
                    info!(elapsed = ?outcome.elapsed, "scenario passed")
                }
                None => warn!(
                    failed = outcome.cleanup.failed.len(),
                    "scenario passed but cleanup failed"
                ),
                Some(e) => error!(error = %e, kind = ?e.kind(), "scenario failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    /// Removes what setup created.
    pub async fn teardown(&mut self) -> CleanupReport {
        let report = self.teardown.drain(&self.env).await;
        info!(
            completed = report.completed,
            already_gone = report.already_gone,
            failed = report.failed.len(),
            "suite teardown finished"
        );
        report
    }

    pub async fn deregister_target(&self) -> Result<()> {
        deregister_target(&self.env, &self.target.deployment_target_id, &self.ctx).await
    }
}

async fn find_target(
    env: &Environment,
    config: &HarnessConfig,
) -> Result<Option<DeploymentTarget>> {
    if let Some(name) = &config.target.deployment_target_name {
        return env.cp.find_deployment_target_by_name(name).await;
    }
    let cluster_id = env.k8s.kube_system_uid().await?;
    env.cp.find_deployment_target_by_cluster_id(&cluster_id).await
}

async fn install_chart(
    env: &Environment,
    ctx: &CancellationToken,
    release: &ChartRelease,
) -> Result<()> {
    let getter = env.k8s.getter();
    match env
        .helm
        .release_status(ctx, getter.as_ref(), &release.release, &release.namespace)
        .await?
    {
        Some(status) => {
            info!(
                release = %status.name,
                revision = status.revision,
                status = %status.status,
                "release already installed"
            );
            env.helm.upgrade(ctx, getter.as_ref(), release).await?;
        }
        None => env.helm.install(ctx, getter.as_ref(), release).await?,
    }
    Ok(())
}

/// Installs cert-manager and the PDS agent chart on the target cluster and
/// waits for the control plane to list the cluster as a healthy target.
pub async fn register_target(
    env: &Environment,
    config: &HarnessConfig,
    ctx: &CancellationToken,
) -> Result<DeploymentTarget> {
    let cert_manager: Version = env
        .helm
        .resolve_chart_version(
            CERT_MANAGER_REPO,
            CERT_MANAGER_CHART,
            &config.target.cert_manager_version,
        )
        .await?;
    install_chart(
        env,
        ctx,
        &ChartRelease {
            repo: CERT_MANAGER_REPO.to_string(),
            chart: CERT_MANAGER_CHART.to_string(),
            version: cert_manager,
            release: CERT_MANAGER_CHART.to_string(),
            namespace: CERT_MANAGER_NAMESPACE.to_string(),
            values: "installCRDs=true".to_string(),
        },
    )
    .await?;

    let pds_namespace = &config.target.pds_namespace;
    env.k8s
        .ensure_namespace(pds_namespace, &labels(&[(LABEL_PDS_AVAILABLE, "true")]))
        .await?;

    let token = env
        .cp
        .service_account_token(&config.target.service_account_name)
        .await?;
    let api_endpoint = format!("{}/api", config.control_plane.api_url.trim_end_matches('/'));
    let values = [
        set_pair("tenantId", env.cp.tenant_id()),
        set_pair("bearerToken", &token),
        set_pair("apiEndpoint", &api_endpoint),
    ]
    .join(",");
    let pds_version = env
        .helm
        .resolve_chart_version(PDS_REPO, PDS_CHART, &config.target.pds_chart_version)
        .await?;
    install_chart(
        env,
        ctx,
        &ChartRelease {
            repo: PDS_REPO.to_string(),
            chart: PDS_CHART.to_string(),
            version: pds_version,
            release: PDS_RELEASE.to_string(),
            namespace: pds_namespace.clone(),
            values,
        },
    )
    .await?;

    let cluster_id = env.k8s.kube_system_uid().await?;
    env.cp.wait_deployment_target_registered(ctx, &cluster_id).await
}

/// Removes everything the control plane still tracks on the target, then
/// the agent release and the target itself.
pub async fn deregister_target(
    env: &Environment,
    target_id: &str,
    ctx: &CancellationToken,
) -> Result<()> {
    let deployments = env.cp.list_deployments_on_target(target_id).await?;
    let mut backups = Vec::new();
    for deployment in &deployments {
        backups.extend(env.cp.list_backups(&deployment.id).await?);
    }

    let jobs = env
        .cp
        .list_backup_jobs(&BackupJobFilter::by_deployment_target(target_id))
        .await?;
    for job in &jobs {
        HarnessError::into_option(env.cp.delete_backup_job(&job.id).await)?;
    }
    for backup in &backups {
        if HarnessError::into_option(env.cp.delete_backup(&backup.id, false).await)?.is_some() {
            env.cp.wait_backup_removed(ctx, &backup.id).await?;
        }
    }
    for deployment in &deployments {
        if HarnessError::into_option(env.cp.delete_deployment(&deployment.id).await)?.is_some() {
            env.cp.wait_deployment_removed(ctx, &deployment.id).await?;
        }
    }
    info!(
        target_id,
        deployments = deployments.len(),
        backups = backups.len(),
        backup_jobs = jobs.len(),
        "removed dangling resources"
    );

    let getter = env.k8s.getter();
    match env
        .helm
        .uninstall(ctx, getter.as_ref(), PDS_RELEASE, &env.pds_namespace)
        .await
    {
        Err(e) if e.is_not_found() => info!("agent release already uninstalled"),
        other => other?,
    }
    HarnessError::into_option(env.cp.delete_deployment_target(target_id).await)?;
    info!(target_id, "deployment target deregistered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::config_from_args;
    use crate::tests::fake_cp::{FakeCp, PROJECT, TENANT};
    use crate::tests::fake_kube::FakeKube;
    use crate::wait::WaitPolicy;
    use serde_json::json;
    use tracing_test::traced_test;

    async fn suite(cp: &FakeCp, kube: &FakeKube, extra: &[&str]) -> Result<Suite> {
        kube.insert(
            "/api/v1/namespaces/portworx/services",
            json!({ "metadata": { "name": "portworx-api" } }),
        );
        let kube_system = kube.insert(
            "/api/v1/namespaces",
            json!({ "metadata": { "name": "kube-system" } }),
        );
        cp.insert(
            &format!("{}/deployment-targets", TENANT),
            json!({
                "id": "dt-1",
                "name": "target",
                "status": "healthy",
                "cluster_id": kube_system["metadata"]["uid"],
            }),
        );
        cp.insert(
            "/api/deployment-targets/dt-1/namespaces",
            json!({ "id": "ns-1", "name": "dev", "status": "available" }),
        );
        let client = kube.client().await;
        let env = Environment {
            cp: cp.control_plane().await,
            k8s: K8sCluster::new(client.clone()),
            px: PxProxy::connect(client).await.unwrap(),
            helm: HelmDriver::new("/nonexistent/helm", reqwest::Client::new()),
            store: None,
            s3: None,
            pds_namespace: "pds-system".into(),
        };
        let mut args = vec![
            "--control-plane-url",
            "https://pds.example.com",
            "--pds-token",
            "t0k3n",
        ];
        args.extend_from_slice(extra);
        Suite::with_environment(env, config_from_args(&args), CancellationToken::new()).await
    }

    #[test]
    fn random_names_are_lowercase_and_distinct() {
        let a = random_name("autotest-postgresql");
        let b = random_name("autotest-postgresql");
        assert!(a.starts_with("autotest-postgresql-"));
        assert_eq!(a.len(), "autotest-postgresql-".len() + NAME_SUFFIX_LEN);
        assert!(a.chars().all(|c| !c.is_ascii_uppercase()));
        assert_ne!(a, b);
    }

    #[test]
    fn helm_values_are_escaped() {
        assert_eq!(set_pair("bearerToken", "a,b"), "bearerToken=a\\,b");
        let pair = set_pair("apiEndpoint", "https://x.io/api");
        let parsed = crate::helm::values::parse_set_values(&pair).unwrap();
        assert_eq!(parsed["apiEndpoint"], "https://x.io/api");
    }

    #[tokio::test]
    async fn setup_finds_target_by_cluster_id_and_creates_namespace() {
        let cp = FakeCp::new();
        let kube = FakeKube::new();
        let mut suite = suite(&cp, &kube, &[]).await.unwrap();

        assert_eq!(
            suite.target(),
            &TargetContext {
                deployment_target_id: "dt-1".into(),
                namespace_id: "ns-1".into(),
                namespace: "dev".into(),
            }
        );
        let ns = kube.get("/api/v1/namespaces/dev").unwrap();
        assert_eq!(ns["metadata"]["labels"][LABEL_PDS_AVAILABLE], "true");

        let report = suite.teardown().await;
        assert_eq!(report.completed, 1);
        assert!(!kube.contains("/api/v1/namespaces/dev"));
    }

    #[tokio::test]
    async fn existing_namespace_survives_teardown() {
        let cp = FakeCp::new();
        let kube = FakeKube::new();
        kube.insert("/api/v1/namespaces", json!({ "metadata": { "name": "dev" } }));
        let mut suite = suite(&cp, &kube, &[]).await.unwrap();

        let report = suite.teardown().await;
        assert_eq!(report.completed, 0);
        assert!(kube.contains("/api/v1/namespaces/dev"));
    }

    #[tokio::test]
    async fn unknown_target_without_registration_is_missing() {
        let cp = FakeCp::new();
        let kube = FakeKube::new();
        let err = suite(&cp, &kube, &["--deployment-target-name", "elsewhere"])
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    #[traced_test]
    async fn cleanup_runs_after_failure_and_panic() {
        let cp = FakeCp::new();
        let kube = FakeKube::new();
        let suite = suite(&cp, &kube, &[]).await.unwrap();

        cp.insert("/api/tenants/ten-1/backup-policies", json!({ "id": "bp-1", "name": "nightly" }));
        let outcome = suite
            .scenario("failing", |s| {
                Box::pin(async move {
                    s.defer(Deferral::DeleteBackupPolicy { id: "bp-1".into() });
                    Err::<(), _>(HarnessError::InternalError("boom".into()))
                })
            })
            .await;
        assert!(!outcome.passed());
        assert!(matches!(outcome.error, Some(HarnessError::InternalError(_))));
        assert_eq!(outcome.cleanup.completed, 1);
        assert!(cp.get("/api/backup-policies/bp-1").is_none());

        let outcome = suite
            .scenario("panicking", |s| {
                Box::pin(async move {
                    s.defer(Deferral::DeleteBackupPolicy { id: "bp-1".into() });
                    assert_eq!(1 + 1, 3, "assertion failed in body");
                    Ok(())
                })
            })
            .await;
        assert!(matches!(
            &outcome.error,
            Some(HarnessError::Panicked(m)) if m.contains("assertion failed")
        ));
        assert_eq!(outcome.cleanup.already_gone, 1);
        assert!(outcome.cleanup.is_clean());
        assert!(logs_contain("scenario failed"));
    }

    #[tokio::test]
    async fn cancelled_scenario_still_cleans_up() {
        let cp = FakeCp::new();
        let kube = FakeKube::new();
        let suite = suite(&cp, &kube, &[]).await.unwrap();
        cp.insert("/api/tenants/ten-1/backup-policies", json!({ "id": "bp-1", "name": "nightly" }));

        let outcome = suite
            .scenario("cancelled", |s| {
                Box::pin(async move {
                    s.defer(Deferral::DeleteBackupPolicy { id: "bp-1".into() });
                    s.ctx().cancel();
                    let policy = WaitPolicy::new(Duration::from_secs(5), Duration::from_millis(10));
                    crate::wait::wait(s.ctx(), policy, "never", || async {
                        Ok::<_, HarnessError>(false)
                    })
                    .await?;
                    Ok(())
                })
            })
            .await;
        assert_eq!(
            outcome.error.as_ref().map(HarnessError::kind),
            Some(crate::error::ErrorKind::Cancelled)
        );
        assert_eq!(outcome.cleanup.completed, 1);
        assert!(!suite.ctx().is_cancelled());
    }

    #[tokio::test]
    async fn deregistration_removes_dangling_resources_first() {
        let cp = FakeCp::new();
        let kube = FakeKube::new();
        let suite = suite(&cp, &kube, &[]).await.unwrap();
        cp.insert(
            &format!("{}/deployments", PROJECT),
            json!({ "id": "d1", "name": "pg", "deployment_target_id": "dt-1" }),
        );
        cp.insert(
            "/api/deployments/d1/backups",
            json!({ "id": "b1", "backup_type": "adhoc", "deployment_id": "d1" }),
        );
        cp.insert(
            &format!("{}/backup-jobs", PROJECT),
            json!({ "id": "j1", "name": "pg-adhoc", "deployment_target_id": "dt-1" }),
        );

        let result = suite.deregister_target().await;
        let deletes: Vec<String> = cp
            .requests()
            .into_iter()
            .filter(|r| r.starts_with("DELETE"))
            .map(|r| r.split('?').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            &deletes[..3],
            &[
                "DELETE /api/backup-jobs/j1".to_string(),
                "DELETE /api/backups/b1".to_string(),
                "DELETE /api/deployments/d1".to_string(),
            ]
        );
        // No helm binary here, so uninstalling the agent fails and the
        // target is kept.
        assert!(result.is_err());
        assert!(cp.get("/api/deployment-targets/dt-1").is_some());
    }
}
