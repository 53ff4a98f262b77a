//! Typed facade over the control plane REST API.

mod auth;
mod backups;
mod client;
pub mod models;
pub mod prometheus;

pub use auth::{
    token_source, AuthError, ClientCredentialsGrant, PasswordGrant, StaticToken, TokenSource,
};
pub use client::{ApiClient, ApiError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::wait::{self, WaitPolicy};
use models::*;

pub struct ControlPlane {
    api: ApiClient,
    account: Account,
    tenant: Tenant,
    project: Project,
    policy: WaitPolicy,
}

impl ControlPlane {
    /// Resolves the account, tenant and project names to IDs.
    pub async fn connect(
        api: ApiClient,
        account_name: &str,
        tenant_name: &str,
        project_name: &str,
    ) -> Result<Self> {
        let accounts: Paginated<Account> = api.get("api/accounts").await?;
        let account = find_named(accounts.data, account_name, |a| &a.name)
            .ok_or_else(|| HarnessError::Missing(format!("account {:?}", account_name)))?;

        let tenants: Paginated<Tenant> =
            api.get(&format!("api/accounts/{}/tenants", account.id)).await?;
        let tenant = find_named(tenants.data, tenant_name, |t| &t.name)
            .ok_or_else(|| HarnessError::Missing(format!("tenant {:?}", tenant_name)))?;

        let projects: Paginated<Project> =
            api.get(&format!("api/tenants/{}/projects", tenant.id)).await?;
        let project = find_named(projects.data, project_name, |p| &p.name)
            .ok_or_else(|| HarnessError::Missing(format!("project {:?}", project_name)))?;

        info!(
            account = %account.id,
            tenant = %tenant.id,
            project = %project.id,
            "connected to control plane"
        );
        Ok(Self {
            api,
            account,
            tenant,
            project,
            policy: WaitPolicy::STANDARD,
        })
    }

    pub fn with_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> WaitPolicy {
        self.policy
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn account_id(&self) -> &str {
        &self.account.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.id
    }

    pub fn project_id(&self) -> &str {
        &self.project.id
    }

    pub async fn metadata(&self) -> Result<Metadata> {
        Ok(self.api.get("api/metadata").await?)
    }

    pub async fn get_account(&self, id: &str) -> Result<Account> {
        Ok(self.api.get(&format!("api/accounts/{}", id)).await?)
    }

    pub async fn get_tenant(&self, id: &str) -> Result<Tenant> {
        Ok(self.api.get(&format!("api/tenants/{}", id)).await?)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        Ok(self.api.get(&format!("api/projects/{}", id)).await?)
    }

    // Deployment targets

    pub async fn list_deployment_targets(&self) -> Result<Vec<DeploymentTarget>> {
        let targets: Paginated<DeploymentTarget> = self
            .api
            .get(&format!("api/tenants/{}/deployment-targets", self.tenant.id))
            .await?;
        Ok(targets.data)
    }

    pub async fn get_deployment_target(&self, id: &str) -> Result<DeploymentTarget> {
        Ok(self.api.get(&format!("api/deployment-targets/{}", id)).await?)
    }

    pub async fn find_deployment_target_by_name(
        &self,
        name: &str,
    ) -> Result<Option<DeploymentTarget>> {
        let targets = self.list_deployment_targets().await?;
        Ok(find_named(targets, name, |t| &t.name))
    }

    pub async fn find_deployment_target_by_cluster_id(
        &self,
        cluster_id: &str,
    ) -> Result<Option<DeploymentTarget>> {
        let targets = self.list_deployment_targets().await?;
        Ok(targets
            .into_iter()
            .find(|t| t.cluster_id.as_deref() == Some(cluster_id)))
    }

    pub async fn patch_deployment_target(
        &self,
        id: &str,
        patch: &DeploymentTargetPatch,
    ) -> Result<DeploymentTarget> {
        info!(target_id = id, ?patch, "updating deployment target");
        Ok(self
            .api
            .put(&format!("api/deployment-targets/{}", id), patch)
            .await?)
    }

    pub async fn delete_deployment_target(&self, id: &str) -> Result<()> {
        info!(target_id = id, "deleting deployment target");
        Ok(self
            .api
            .delete(&format!("api/deployment-targets/{}", id))
            .await?)
    }

    /// Waits until a healthy target for the cluster with `cluster_id` shows up.
    pub async fn wait_deployment_target_registered(
        &self,
        ctx: &CancellationToken,
        cluster_id: &str,
    ) -> Result<DeploymentTarget> {
        let what = format!("deployment target for cluster {}", cluster_id);
        let target = wait::poll_until(ctx, self.policy, &what, || async move {
            let found = self.find_deployment_target_by_cluster_id(cluster_id).await?;
            Ok::<_, HarnessError>(found.filter(DeploymentTarget::is_healthy))
        })
        .await?;
        info!(target_id = %target.id, name = %target.name, "deployment target registered");
        Ok(target)
    }

    pub async fn wait_deployment_target_healthy(
        &self,
        ctx: &CancellationToken,
        id: &str,
    ) -> Result<DeploymentTarget> {
        let what = format!("deployment target {} to be healthy", id);
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            let target = self.get_deployment_target(id).await?;
            Ok::<_, HarnessError>(Some(target).filter(DeploymentTarget::is_healthy))
        })
        .await?)
    }

    // Namespaces

    pub async fn list_namespaces(&self, target_id: &str) -> Result<Vec<Namespace>> {
        let namespaces: Paginated<Namespace> = self
            .api
            .get(&format!("api/deployment-targets/{}/namespaces", target_id))
            .await?;
        Ok(namespaces.data)
    }

    pub async fn get_namespace(&self, id: &str) -> Result<Namespace> {
        Ok(self.api.get(&format!("api/namespaces/{}", id)).await?)
    }

    pub async fn find_namespace(&self, target_id: &str, name: &str) -> Result<Option<Namespace>> {
        let namespaces = self.list_namespaces(target_id).await?;
        Ok(find_named(namespaces, name, |n| &n.name))
    }

    /// Waits until the target reports the namespace as available for deployments.
    pub async fn wait_namespace_available(
        &self,
        ctx: &CancellationToken,
        target_id: &str,
        name: &str,
    ) -> Result<Namespace> {
        let what = format!("namespace {} on target {}", name, target_id);
        Ok(wait::poll_until(ctx, self.policy, &what, || async move {
            let found = self.find_namespace(target_id, name).await?;
            Ok::<_, HarnessError>(found.filter(Namespace::is_available))
        })
        .await?)
    }

    // Catalog

    pub async fn list_data_services(&self) -> Result<Vec<DataService>> {
        let services: Paginated<DataService> = self.api.get("api/data-services").await?;
        Ok(services.data)
    }

    pub async fn find_data_service(&self, name: &str) -> Result<DataService> {
        let services = self.list_data_services().await?;
        find_named(services, name, |s| &s.name)
            .ok_or_else(|| HarnessError::Missing(format!("data service {:?}", name)))
    }

    pub async fn list_images(&self, data_service_id: &str) -> Result<Vec<Image>> {
        let images: Paginated<Image> = self
            .api
            .get_query(
                "api/images",
                &[("data_service_id", data_service_id.to_string())],
            )
            .await?;
        Ok(images.data)
    }

    pub async fn find_image(&self, data_service_name: &str, version_tag: &str) -> Result<Image> {
        let service = self.find_data_service(data_service_name).await?;
        let images = self.list_images(&service.id).await?;
        images
            .into_iter()
            .find(|i| i.tag == version_tag)
            .ok_or_else(|| {
                HarnessError::Missing(format!("{} image {:?}", data_service_name, version_tag))
            })
    }

    pub async fn list_app_config_templates(&self, data_service_id: &str) -> Result<Vec<Template>> {
        self.list_templates("application-configuration-templates", Some(data_service_id))
            .await
    }

    pub async fn list_resource_templates(&self, data_service_id: &str) -> Result<Vec<Template>> {
        self.list_templates("resource-settings-templates", Some(data_service_id))
            .await
    }

    pub async fn list_storage_templates(&self) -> Result<Vec<Template>> {
        self.list_templates("storage-options-templates", None).await
    }

    async fn list_templates(
        &self,
        kind: &str,
        data_service_id: Option<&str>,
    ) -> Result<Vec<Template>> {
        let query: Vec<(&str, String)> = data_service_id
            .map(|id| vec![("data_service_id", id.to_string())])
            .unwrap_or_default();
        let templates: Paginated<Template> = self
            .api
            .get_query(&format!("api/tenants/{}/{}", self.tenant.id, kind), &query)
            .await?;
        Ok(templates.data)
    }

    pub async fn service_account_token(&self, name: &str) -> Result<String> {
        let accounts: Paginated<ServiceAccount> = self
            .api
            .get(&format!("api/tenants/{}/service-accounts", self.tenant.id))
            .await?;
        let account = find_named(accounts.data, name, |a| &a.name)
            .ok_or_else(|| HarnessError::Missing(format!("service account {:?}", name)))?;
        let token: ServiceAccountToken = self
            .api
            .get(&format!("api/service-accounts/{}/token", account.id))
            .await?;
        Ok(token.token)
    }

    // Deployments

    /// Creates a deployment named `name` from a spec given by names.
    pub async fn deploy(
        &self,
        spec: &ShortDeploymentSpec,
        name: &str,
        target_id: &str,
        namespace_id: &str,
    ) -> Result<Deployment> {
        let service = self.find_data_service(&spec.data_service_name).await?;
        let image = self
            .list_images(&service.id)
            .await?
            .into_iter()
            .find(|i| i.tag == spec.image_version_tag)
            .ok_or_else(|| {
                HarnessError::Missing(format!(
                    "{} image {:?}",
                    spec.data_service_name, spec.image_version_tag
                ))
            })?;

        let app_config = pick_template(
            self.list_app_config_templates(&service.id).await?,
            spec.app_config_template_name.as_deref(),
            "application configuration template",
        )?;
        let resources = pick_template(
            self.list_resource_templates(&service.id).await?,
            spec.resource_template_name.as_deref(),
            "resource settings template",
        )?;
        let storage = pick_template(
            self.list_storage_templates().await?,
            spec.storage_template_name.as_deref(),
            "storage options template",
        )?;

        let scheduled_backup = match (&spec.backup_policy_name, &spec.backup_target_name) {
            (Some(policy), Some(target)) => Some(self.scheduled_backup(policy, target).await?),
            (None, None) => None,
            _ => {
                return Err(HarnessError::Config(
                    "backup policy and backup target must be given together".into(),
                ))
            }
        };

        let request = CreateDeploymentRequest {
            name: name.to_string(),
            deployment_target_id: target_id.to_string(),
            namespace_id: namespace_id.to_string(),
            image_id: image.id,
            node_count: spec.node_count,
            tls_enabled: spec.tls_enabled,
            application_configuration_template_id: app_config.id,
            resource_settings_template_id: resources.id,
            storage_options_template_id: storage.id,
            service_type: spec.service_type.clone(),
            scheduled_backup,
        };
        info!(
            name,
            data_service = %spec.data_service_name,
            version = %spec.image_version_tag,
            nodes = spec.node_count,
            tls = spec.tls_enabled,
            "creating deployment"
        );
        Ok(self
            .api
            .post(&format!("api/projects/{}/deployments", self.project.id), &request)
            .await?)
    }

    pub(crate) async fn scheduled_backup(
        &self,
        policy_name: &str,
        target_name: &str,
    ) -> Result<ScheduledBackup> {
        let policy = self
            .find_backup_policy(policy_name)
            .await?
            .ok_or_else(|| HarnessError::Missing(format!("backup policy {:?}", policy_name)))?;
        let target = self
            .find_backup_target(target_name)
            .await?
            .ok_or_else(|| HarnessError::Missing(format!("backup target {:?}", target_name)))?;
        Ok(ScheduledBackup {
            backup_policy_id: Some(policy.id),
            backup_target_id: Some(target.id),
        })
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Deployment> {
        Ok(self.api.get(&format!("api/deployments/{}", id)).await?)
    }

    pub async fn deployment_status(&self, id: &str) -> Result<DeploymentStatus> {
        Ok(self.api.get(&format!("api/deployments/{}/status", id)).await?)
    }

    pub async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let deployments: Paginated<Deployment> = self
            .api
            .get(&format!("api/projects/{}/deployments", self.project.id))
            .await?;
        Ok(deployments.data)
    }

    pub async fn list_deployments_on_target(&self, target_id: &str) -> Result<Vec<Deployment>> {
        let deployments: Paginated<Deployment> = self
            .api
            .get_query(
                &format!("api/projects/{}/deployments", self.project.id),
                &[("deployment_target_id", target_id.to_string())],
            )
            .await?;
        Ok(deployments.data)
    }

    pub async fn update_deployment(
        &self,
        id: &str,
        update: &UpdateDeploymentRequest,
    ) -> Result<Deployment> {
        info!(deployment_id = id, ?update, "updating deployment");
        Ok(self.api.put(&format!("api/deployments/{}", id), update).await?)
    }

    pub async fn delete_deployment(&self, id: &str) -> Result<()> {
        info!(deployment_id = id, "deleting deployment");
        Ok(self.api.delete(&format!("api/deployments/{}", id)).await?)
    }

    pub async fn deployment_credentials(&self, id: &str) -> Result<DeploymentCredentials> {
        Ok(self
            .api
            .get(&format!("api/deployments/{}/credentials", id))
            .await?)
    }

    pub async fn deployment_connection_details(&self, id: &str) -> Result<ConnectionDetails> {
        Ok(self
            .api
            .get(&format!("api/deployments/{}/connection-info", id))
            .await?)
    }

    pub async fn wait_deployment_healthy(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let what = format!("deployment {} to be healthy", id);
        wait::wait(ctx, self.policy, &what, || async move {
            let status = self.deployment_status(id).await?;
            debug!(deployment_id = id, health = %status.health, "deployment status");
            Ok::<_, HarnessError>(status.is_healthy())
        })
        .await?;
        Ok(())
    }

    pub async fn wait_deployment_available(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let what = format!("deployment {} to be available", id);
        wait::wait(ctx, self.policy, &what, || async move {
            let status = self.deployment_status(id).await?;
            Ok::<_, HarnessError>(status.is_available())
        })
        .await?;
        Ok(())
    }

    /// Waits until the deployment is gone. A 404 is success.
    pub async fn wait_deployment_removed(&self, ctx: &CancellationToken, id: &str) -> Result<()> {
        let what = format!("deployment {} to be removed", id);
        wait::wait(ctx, self.policy, &what, || async move {
            gone(self.get_deployment(id).await)
        })
        .await?;
        Ok(())
    }
}

fn find_named<T>(items: Vec<T>, name: &str, key: impl Fn(&T) -> &String) -> Option<T> {
    items.into_iter().find(|item| key(item) == name)
}

fn pick_template(templates: Vec<Template>, name: Option<&str>, what: &str) -> Result<Template> {
    match name {
        Some(name) => find_named(templates, name, |t| &t.name)
            .ok_or_else(|| HarnessError::Missing(format!("{} {:?}", what, name))),
        None => templates
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::Missing(what.to_string())),
    }
}

/// Maps a lookup to "is it gone yet": 404 is `true`, presence is `false`.
pub(crate) fn gone<T>(lookup: Result<T>) -> Result<bool> {
    match lookup {
        Ok(_) => Ok(false),
        Err(e) if e.is_not_found() => Ok(true),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests;
