//! Request and response bodies of the control plane API.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug, Clone)]
pub struct Paginated<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub account_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub api_build: String,
    #[serde(default)]
    pub helm_chart_version: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTarget {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// UID of the `kube-system` namespace of the registered cluster.
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tls_issuer: Option<String>,
    #[serde(default)]
    pub tls_required: Option<bool>,
}

impl DeploymentTarget {
    pub fn is_healthy(&self) -> bool {
        self.status.as_deref() == Some("healthy")
    }
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentTargetPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_required: Option<bool>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub deployment_target_id: Option<String>,
}

impl Namespace {
    pub fn is_available(&self) -> bool {
        self.status.as_deref() == Some("available")
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DataService {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub data_service_id: Option<String>,
}

/// Application configuration, resource settings and storage option
/// templates share this shape.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub data_service_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServiceAccountToken {
    pub token: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBackup {
    #[serde(default)]
    pub backup_policy_id: Option<String>,
    #[serde(default)]
    pub backup_target_id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub namespace_id: Option<String>,
    #[serde(default)]
    pub deployment_target_id: Option<String>,
    #[serde(default)]
    pub data_service_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub node_count: i32,
    #[serde(default)]
    pub tls_enabled: bool,
    /// Name of the custom resource and statefulset on the target cluster.
    #[serde(default)]
    pub cluster_resource_name: String,
    #[serde(default)]
    pub application_configuration_template_id: Option<String>,
    #[serde(default)]
    pub resource_settings_template_id: Option<String>,
    #[serde(default)]
    pub storage_options_template_id: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub scheduled_backup: Option<ScheduledBackup>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentStatus {
    #[serde(default)]
    pub health: String,
    #[serde(default)]
    pub ready_replicas: Option<i32>,
}

impl DeploymentStatus {
    pub fn is_healthy(&self) -> bool {
        self.health == "Healthy"
    }

    pub fn is_available(&self) -> bool {
        self.health == "Healthy" || self.health == "Available"
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeploymentCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionDetails {
    #[serde(default)]
    pub pods: Vec<serde_json::Value>,
    #[serde(default)]
    pub ports: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub deployment_target_id: String,
    pub namespace_id: String,
    pub image_id: String,
    pub node_count: i32,
    pub tls_enabled: bool,
    pub application_configuration_template_id: String,
    pub resource_settings_template_id: String,
    pub storage_options_template_id: String,
    pub service_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_backup: Option<ScheduledBackup>,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateDeploymentRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_configuration_template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_settings_template_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_backup: Option<ScheduledBackup>,
}

/// Desired dataservice described by names; resolved to IDs at deploy time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortDeploymentSpec {
    pub data_service_name: String,
    pub image_version_tag: String,
    pub node_count: i32,
    pub tls_enabled: bool,
    pub name_prefix: Option<String>,
    pub app_config_template_name: Option<String>,
    pub resource_template_name: Option<String>,
    pub storage_template_name: Option<String>,
    pub service_type: String,
    pub backup_policy_name: Option<String>,
    pub backup_target_name: Option<String>,
}

impl ShortDeploymentSpec {
    pub fn new(data_service_name: &str, image_version_tag: &str, node_count: i32) -> Self {
        Self {
            data_service_name: data_service_name.to_string(),
            image_version_tag: image_version_tag.to_string(),
            node_count,
            tls_enabled: false,
            name_prefix: None,
            app_config_template_name: None,
            resource_template_name: None,
            storage_template_name: None,
            service_type: "ClusterIP".to_string(),
            backup_policy_name: None,
            backup_target_name: None,
        }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls_enabled = enabled;
        self
    }

    pub fn with_backup(mut self, policy_name: &str, target_name: &str) -> Self {
        self.backup_policy_name = Some(policy_name.to_string());
        self.backup_target_name = Some(target_name.to_string());
        self
    }

    /// Prefix for the generated deployment name.
    pub fn prefix(&self) -> String {
        self.name_prefix.clone().unwrap_or_else(|| {
            format!("autotest-{}", self.data_service_name.to_lowercase())
        })
    }
}

/// Provider-specific credential fields. Serialized under the provider key,
/// e.g. `{"s3": {...}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackupCredentialsSpec {
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
    },
    S3Compatible {
        endpoint: String,
        access_key: String,
        secret_key: String,
    },
    Google {
        project_id: String,
        key: String,
    },
    Azure {
        account_name: String,
        account_key: String,
    },
}

impl BackupCredentialsSpec {
    pub fn provider(&self) -> &'static str {
        match self {
            BackupCredentialsSpec::S3 { .. } => "s3",
            BackupCredentialsSpec::S3Compatible { .. } => "s3-compatible",
            BackupCredentialsSpec::Google { .. } => "google",
            BackupCredentialsSpec::Azure { .. } => "azure",
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateBackupCredentialsRequest {
    pub name: String,
    pub credentials: BackupCredentialsSpec,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupCredentials {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Credentials as returned with secrets (`/backup-credentials/{id}/credentials`).
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialsView {
    #[serde(default)]
    pub s3: Option<serde_json::Value>,
    #[serde(default)]
    pub s3_compatible: Option<serde_json::Value>,
    #[serde(default)]
    pub google: Option<serde_json::Value>,
    #[serde(default)]
    pub azure: Option<serde_json::Value>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateBackupTargetRequest {
    pub name: String,
    pub backup_credentials_id: String,
    pub bucket: String,
    pub region: String,
    #[serde(rename = "type")]
    pub target_type: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub backup_credentials_id: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(rename = "type", default)]
    pub target_type: Option<String>,
}

/// Per-deployment-target synchronisation state of a backup target.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupTargetState {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub deployment_target_id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub px_credentials_name: Option<String>,
    #[serde(default)]
    pub px_credentials_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl BackupTargetState {
    /// The credential object exists on the target cluster.
    pub fn created_in_tc(&self) -> bool {
        self.state == "successful"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupSchedule {
    pub schedule: String,
    pub retention_count: i32,
    #[serde(rename = "type", default = "default_schedule_type")]
    pub schedule_type: String,
}

fn default_schedule_type() -> String {
    "incremental".to_string()
}

impl BackupSchedule {
    pub fn incremental(schedule: &str, retention_count: i32) -> Self {
        Self {
            schedule: schedule.to_string(),
            retention_count,
            schedule_type: default_schedule_type(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicyRequest {
    pub name: String,
    pub schedules: Vec<BackupSchedule>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub schedules: Vec<BackupSchedule>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateBackupRequest {
    pub backup_level: String,
    pub backup_target_id: String,
    pub backup_type: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub id: String,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub backup_target_id: Option<String>,
    #[serde(default)]
    pub backup_policy_id: Option<String>,
    /// `adhoc` or `scheduled`.
    #[serde(default)]
    pub backup_type: String,
    #[serde(default)]
    pub cluster_resource_name: String,
}

impl Backup {
    pub fn is_adhoc(&self) -> bool {
        self.backup_type == "adhoc"
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum BackupJobStatus {
    Active,
    Succeeded,
    Failed,
    Unknown(String),
}

impl From<String> for BackupJobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Active" => BackupJobStatus::Active,
            "Succeeded" => BackupJobStatus::Succeeded,
            "Failed" => BackupJobStatus::Failed,
            _ => BackupJobStatus::Unknown(s),
        }
    }
}

impl From<BackupJobStatus> for String {
    fn from(s: BackupJobStatus) -> Self {
        s.to_string()
    }
}

impl fmt::Display for BackupJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupJobStatus::Active => f.write_str("Active"),
            BackupJobStatus::Succeeded => f.write_str("Succeeded"),
            BackupJobStatus::Failed => f.write_str("Failed"),
            BackupJobStatus::Unknown(s) => f.write_str(s),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupJob {
    /// Equal to the UID of the backup job custom resource.
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub backup_id: Option<String>,
    #[serde(default)]
    pub status: Option<BackupJobStatus>,
    #[serde(default)]
    pub cloud_snap_id: Option<String>,
    #[serde(default)]
    pub namespace_id: Option<String>,
    #[serde(default)]
    pub deployment_target_id: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
}

impl BackupJob {
    pub fn succeeded(&self) -> bool {
        self.status == Some(BackupJobStatus::Succeeded)
    }
}

/// Filters of the project-wide backup job list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupJobFilter {
    pub backup_id: Option<String>,
    pub deployment_id: Option<String>,
    pub deployment_target_id: Option<String>,
    pub namespace_id: Option<String>,
}

impl BackupJobFilter {
    pub fn by_backup(id: &str) -> Self {
        Self {
            backup_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_deployment(id: &str) -> Self {
        Self {
            deployment_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_deployment_target(id: &str) -> Self {
        Self {
            deployment_target_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn by_namespace(id: &str) -> Self {
        Self {
            namespace_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        [
            ("backup_id", &self.backup_id),
            ("deployment_id", &self.deployment_id),
            ("deployment_target_id", &self.deployment_target_id),
            ("namespace_id", &self.namespace_id),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.clone().map(|v| (k, v)))
        .collect()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(from = "String", into = "String")]
pub enum RestoreStatus {
    Pending,
    Running,
    Failed,
    Successful,
    Unknown(String),
}

impl From<String> for RestoreStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Pending" => RestoreStatus::Pending,
            "Running" => RestoreStatus::Running,
            "Failed" => RestoreStatus::Failed,
            "Successful" => RestoreStatus::Successful,
            _ => RestoreStatus::Unknown(s),
        }
    }
}

impl From<RestoreStatus> for String {
    fn from(s: RestoreStatus) -> Self {
        match s {
            RestoreStatus::Pending => "Pending".into(),
            RestoreStatus::Running => "Running".into(),
            RestoreStatus::Failed => "Failed".into(),
            RestoreStatus::Successful => "Successful".into(),
            RestoreStatus::Unknown(s) => s,
        }
    }
}

/// Error code reported when the Portworx credential of the backup target is gone.
pub const PX_CLOUD_CREDENTIALS_NOT_FOUND: &str = "PXCloudCredentialsNotFound";

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CreateRestoreRequest {
    pub name: String,
    pub namespace_id: String,
    pub deployment_target_id: String,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryRestoreRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Restore {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<RestoreStatus>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub backup_job_id: Option<String>,
    #[serde(default)]
    pub deployment_target_id: Option<String>,
    #[serde(default)]
    pub namespace_id: Option<String>,
    /// The deployment created by a successful restore.
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub original_deployment_id: Option<String>,
}
