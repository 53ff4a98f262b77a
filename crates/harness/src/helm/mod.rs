//! Helm v3 releases driven through the `helm` binary.
//!
//! Chart versions are resolved locally from the cached repository index;
//! release actions shell out to `helm` with the values written to a
//! temporary file and the cluster taken from a [`RestClientGetter`].

pub mod getter;
pub mod repo;
pub mod values;

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use semver::Version;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ErrorKind;
pub use getter::{KubeconfigSource, MemoryClientGetter, RestClientGetter, RestMapper};
use repo::{IndexFile, RepositoryFile};

#[derive(Error, Debug)]
pub enum HelmError {
    #[error("release {release} already exists in namespace {namespace}")]
    ReleaseExists { release: String, namespace: String },

    #[error("release {release} not found in namespace {namespace}")]
    ReleaseNotFound { release: String, namespace: String },

    #[error("release {0} already deleted")]
    AlreadyDeleted(String),

    #[error("helm {action} failed: {stderr}")]
    CommandFailed { action: &'static str, stderr: String },

    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("helm {action} cancelled")]
    Cancelled { action: &'static str },

    #[error("no version among {candidates} candidate(s) satisfies {constraint:?}")]
    NoMatchingVersion { constraint: String, candidates: usize },

    #[error("invalid version constraint {constraint:?}: {reason}")]
    InvalidConstraint { constraint: String, reason: String },

    #[error("repository {0} is not configured")]
    RepoNotFound(String),

    #[error("repository configuration: {0}")]
    RepoConfig(String),

    #[error("chart {chart} not found in repository {repo}")]
    ChartNotFound { repo: String, chart: String },

    #[error("invalid values: {0}")]
    InvalidValues(String),

    #[error("cluster access: {0}")]
    Kubeconfig(String),

    #[error("index download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HelmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HelmError::ReleaseNotFound { .. }
            | HelmError::AlreadyDeleted(_)
            | HelmError::RepoNotFound(_)
            | HelmError::ChartNotFound { .. }
            | HelmError::NoMatchingVersion { .. } => ErrorKind::NotFound,
            HelmError::ReleaseExists { .. } => ErrorKind::Conflict,
            HelmError::Cancelled { .. } => ErrorKind::Cancelled,
            HelmError::Spawn { .. }
            | HelmError::InvalidConstraint { .. }
            | HelmError::InvalidValues(_)
            | HelmError::RepoConfig(_)
            | HelmError::Kubeconfig(_) => ErrorKind::Fatal,
            HelmError::Http(_) => ErrorKind::TransientRemote,
            HelmError::CommandFailed { .. }
            | HelmError::Io(_)
            | HelmError::Yaml(_)
            | HelmError::Json(_) => ErrorKind::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// A chart release to install or upgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartRelease {
    pub repo: String,
    pub chart: String,
    pub version: Version,
    pub release: String,
    pub namespace: String,
    /// `k=v[,k=v]*`, see [`values::parse_set_values`].
    pub values: String,
}

impl ChartRelease {
    pub fn chart_ref(&self) -> String {
        format!("{}/{}", self.repo, self.chart)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseStatus {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: String,
    pub chart_version: Option<String>,
}

#[derive(Deserialize)]
struct StatusOutput {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    info: StatusInfo,
    #[serde(default)]
    chart: Option<StatusChart>,
}

#[derive(Deserialize, Default)]
struct StatusInfo {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct StatusChart {
    metadata: StatusChartMetadata,
}

#[derive(Deserialize)]
struct StatusChartMetadata {
    version: Option<String>,
}

impl From<StatusOutput> for ReleaseStatus {
    fn from(out: StatusOutput) -> Self {
        Self {
            name: out.name,
            namespace: out.namespace,
            revision: out.version,
            status: out.info.status,
            chart_version: out.chart.and_then(|c| c.metadata.version),
        }
    }
}

/// Maps helm's stderr onto the typed errors callers branch on.
pub fn classify_failure(
    action: &'static str,
    release: &str,
    namespace: &str,
    stderr: &str,
) -> HelmError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot re-use a name that is still in use") {
        return HelmError::ReleaseExists {
            release: release.to_string(),
            namespace: namespace.to_string(),
        };
    }
    if lower.contains("already deleted") {
        return HelmError::AlreadyDeleted(release.to_string());
    }
    if lower.contains("release: not found") || lower.contains("has no deployed releases") {
        return HelmError::ReleaseNotFound {
            release: release.to_string(),
            namespace: namespace.to_string(),
        };
    }
    HelmError::CommandFailed {
        action,
        stderr: stderr.trim().to_string(),
    }
}

pub fn install_args(release: &ChartRelease, values_file: &str) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        release.release.clone(),
        release.chart_ref(),
    ];
    args.extend(chart_args(release, values_file));
    args.push("--create-namespace".to_string());
    args
}

pub fn upgrade_args(release: &ChartRelease, values_file: &str) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        release.release.clone(),
        release.chart_ref(),
    ];
    args.extend(chart_args(release, values_file));
    args
}

fn chart_args(release: &ChartRelease, values_file: &str) -> Vec<String> {
    vec![
        "--version".to_string(),
        release.version.to_string(),
        "--namespace".to_string(),
        release.namespace.clone(),
        "--values".to_string(),
        values_file.to_string(),
        "--dependency-update".to_string(),
    ]
}

pub fn uninstall_args(release: &str, namespace: &str) -> Vec<String> {
    vec![
        "uninstall".to_string(),
        release.to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
    ]
}

#[derive(Debug, Clone)]
pub struct HelmDriver {
    binary: String,
    repository_config: PathBuf,
    repository_cache: PathBuf,
    http: reqwest::Client,
}

impl HelmDriver {
    pub fn new(binary: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            binary: binary.into(),
            repository_config: repo::default_repository_config(),
            repository_cache: repo::default_repository_cache(),
            http,
        }
    }

    pub fn with_repository_paths(mut self, config: PathBuf, cache: PathBuf) -> Self {
        self.repository_config = config;
        self.repository_cache = cache;
        self
    }

    fn index_path(&self, repo: &str) -> PathBuf {
        self.repository_cache.join(repo::index_file_name(repo))
    }

    /// Downloads `<url>/index.yaml` of a configured repository into the cache.
    pub async fn update_repo(&self, name: &str) -> Result<IndexFile, HelmError> {
        let file = RepositoryFile::load(&self.repository_config).await?;
        let entry = file.find(name)?;
        let url = format!("{}/index.yaml", entry.url.trim_end_matches('/'));
        debug!(repo = name, %url, "downloading repository index");

        let mut request = self.http.get(&url);
        if let Some(username) = &entry.username {
            request = request.basic_auth(username, entry.password.as_ref());
        }
        let raw = request.send().await?.error_for_status()?.text().await?;
        let index = IndexFile::parse(&raw)?;

        tokio::fs::create_dir_all(&self.repository_cache).await?;
        tokio::fs::write(self.index_path(name), raw).await?;
        info!(repo = name, charts = index.entries.len(), "repository index updated");
        Ok(index)
    }

    pub async fn load_index(&self, name: &str) -> Result<IndexFile, HelmError> {
        IndexFile::load(&self.index_path(name)).await
    }

    /// Highest version of `repo/chart` satisfying `constraint`. The cached
    /// index is used when present, otherwise it is downloaded first.
    pub async fn resolve_chart_version(
        &self,
        repo: &str,
        chart: &str,
        constraint: &str,
    ) -> Result<Version, HelmError> {
        let index = match self.load_index(repo).await {
            Ok(index) => index,
            Err(HelmError::Io(_)) => self.update_repo(repo).await?,
            Err(e) => return Err(e),
        };
        let versions = index
            .chart_versions(chart)
            .ok_or_else(|| HelmError::ChartNotFound {
                repo: repo.to_string(),
                chart: chart.to_string(),
            })?;
        let selected = repo::select_version(constraint, &versions)?;
        let version = selected
            .last()
            .cloned()
            .ok_or_else(|| HelmError::NoMatchingVersion {
                constraint: constraint.to_string(),
                candidates: versions.len(),
            })?;
        debug!(repo, chart, constraint, %version, "resolved chart version");
        Ok(version)
    }

    async fn cluster_args(&self, getter: &dyn RestClientGetter) -> Result<Vec<String>, HelmError> {
        let mut args = getter
            .helm_args()
            .await
            .map_err(|e| HelmError::Kubeconfig(e.to_string()))?;
        args.push("--repository-config".to_string());
        args.push(self.repository_config.display().to_string());
        args.push("--repository-cache".to_string());
        args.push(self.repository_cache.display().to_string());
        Ok(args)
    }

    async fn run(
        &self,
        ctx: &CancellationToken,
        action: &'static str,
        args: Vec<String>,
    ) -> Result<Result<String, String>, HelmError> {
        debug!(binary = %self.binary, ?args, "running helm");
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HelmError::Spawn {
                binary: self.binary.clone(),
                source,
            })?;

        let output = tokio::select! {
            _ = ctx.cancelled() => return Err(HelmError::Cancelled { action }),
            output = child.wait_with_output() => output?,
        };
        if output.status.success() {
            Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).into_owned()))
        }
    }

    pub async fn release_status(
        &self,
        ctx: &CancellationToken,
        getter: &dyn RestClientGetter,
        release: &str,
        namespace: &str,
    ) -> Result<Option<ReleaseStatus>, HelmError> {
        let mut args = vec![
            "status".to_string(),
            release.to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        args.extend(self.cluster_args(getter).await?);
        match self.run(ctx, "status", args).await? {
            Ok(stdout) => {
                let status: StatusOutput = serde_json::from_str(&stdout)?;
                Ok(Some(status.into()))
            }
            Err(stderr) => match classify_failure("status", release, namespace, &stderr) {
                HelmError::ReleaseNotFound { .. } => Ok(None),
                e => Err(e),
            },
        }
    }

    fn write_values(set: &str) -> Result<tempfile::NamedTempFile, HelmError> {
        let parsed = values::parse_set_values(set)?;
        let mut file = tempfile::Builder::new()
            .prefix("pds-values-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(serde_yaml::to_string(&parsed)?.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    pub async fn install(
        &self,
        ctx: &CancellationToken,
        getter: &dyn RestClientGetter,
        release: &ChartRelease,
    ) -> Result<(), HelmError> {
        if self
            .release_status(ctx, getter, &release.release, &release.namespace)
            .await?
            .is_some()
        {
            return Err(HelmError::ReleaseExists {
                release: release.release.clone(),
                namespace: release.namespace.clone(),
            });
        }
        let values_file = Self::write_values(&release.values)?;
        let mut args = install_args(release, &values_file.path().display().to_string());
        args.extend(self.cluster_args(getter).await?);

        info!(
            release = %release.release,
            chart = %release.chart_ref(),
            version = %release.version,
            "installing release"
        );
        self.run(ctx, "install", args).await?.map_err(|stderr| {
            classify_failure("install", &release.release, &release.namespace, &stderr)
        })?;
        Ok(())
    }

    pub async fn upgrade(
        &self,
        ctx: &CancellationToken,
        getter: &dyn RestClientGetter,
        release: &ChartRelease,
    ) -> Result<(), HelmError> {
        if self
            .release_status(ctx, getter, &release.release, &release.namespace)
            .await?
            .is_none()
        {
            return Err(HelmError::ReleaseNotFound {
                release: release.release.clone(),
                namespace: release.namespace.clone(),
            });
        }
        let values_file = Self::write_values(&release.values)?;
        let mut args = upgrade_args(release, &values_file.path().display().to_string());
        args.extend(self.cluster_args(getter).await?);

        info!(
            release = %release.release,
            chart = %release.chart_ref(),
            version = %release.version,
            "upgrading release"
        );
        self.run(ctx, "upgrade", args).await?.map_err(|stderr| {
            classify_failure("upgrade", &release.release, &release.namespace, &stderr)
        })?;
        Ok(())
    }

    /// Removes a release. Missing releases are reported as
    /// `ReleaseNotFound`/`AlreadyDeleted`; callers decide whether that matters.
    pub async fn uninstall(
        &self,
        ctx: &CancellationToken,
        getter: &dyn RestClientGetter,
        release: &str,
        namespace: &str,
    ) -> Result<(), HelmError> {
        let mut args = uninstall_args(release, namespace);
        args.extend(self.cluster_args(getter).await?);
        info!(release, namespace, "uninstalling release");
        self.run(ctx, "uninstall", args)
            .await?
            .map_err(|stderr| classify_failure("uninstall", release, namespace, &stderr))?;
        Ok(())
    }
}
