//! Cluster access for helm actions.
//!
//! A [`MemoryClientGetter`] builds each piece of cluster access once and
//! keeps it for the life of the getter: the REST config, the client, the
//! discovery result, the REST mapper and, for the helm binary, a kubeconfig
//! file on disk.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{ApiCapabilities, ApiResource, Discovery, Scope};
use tempfile::NamedTempFile;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{HarnessError, Result};

/// Short names accepted wherever a resource kind is named.
const SHORTCUTS: &[(&str, &str)] = &[
    ("po", "pods"),
    ("svc", "services"),
    ("deploy", "deployments"),
    ("sts", "statefulsets"),
    ("ns", "namespaces"),
    ("pvc", "persistentvolumeclaims"),
    ("sc", "storageclasses"),
    ("cm", "configmaps"),
    ("job", "jobs"),
    ("cj", "cronjobs"),
    ("secret", "secrets"),
];

#[async_trait]
pub trait RestClientGetter: Send + Sync {
    async fn rest_config(&self) -> Result<kube::Config>;
    async fn client(&self) -> Result<kube::Client>;
    async fn discovery(&self) -> Result<Arc<Discovery>>;
    async fn rest_mapper(&self) -> Result<Arc<RestMapper>>;
    /// The kubeconfig the getter was built from; `None` when running
    /// in-cluster.
    async fn raw_kubeconfig(&self) -> Result<Option<Kubeconfig>>;
    /// Flags pointing the helm binary at the same cluster.
    async fn helm_args(&self) -> Result<Vec<String>>;
}

/// Where cluster credentials come from.
#[derive(Debug, Clone)]
pub enum KubeconfigSource {
    /// `$KUBECONFIG`, `~/.kube/config`, then the in-cluster service account.
    Infer,
    Path(PathBuf),
    Inline(Kubeconfig),
}

pub struct MemoryClientGetter {
    source: KubeconfigSource,
    context: Option<String>,
    raw: OnceCell<Option<Kubeconfig>>,
    config: OnceCell<kube::Config>,
    client: OnceCell<kube::Client>,
    discovery: OnceCell<Arc<Discovery>>,
    mapper: OnceCell<Arc<RestMapper>>,
    kubeconfig_file: OnceCell<Option<Arc<NamedTempFile>>>,
}

impl MemoryClientGetter {
    pub fn new(source: KubeconfigSource, context: Option<String>) -> Self {
        Self {
            source,
            context,
            raw: OnceCell::new(),
            config: OnceCell::new(),
            client: OnceCell::new(),
            discovery: OnceCell::new(),
            mapper: OnceCell::new(),
            kubeconfig_file: OnceCell::new(),
        }
    }

    /// From the `--kubeconfig` flag: a path, or inference when empty.
    pub fn from_path(path: Option<PathBuf>, context: Option<String>) -> Self {
        let source = match path {
            Some(path) if !path.as_os_str().is_empty() => KubeconfigSource::Path(path),
            _ => KubeconfigSource::Infer,
        };
        Self::new(source, context)
    }

    /// Wraps an existing client. Helm is pointed at the ambient kubeconfig.
    pub fn from_client(client: kube::Client) -> Self {
        let getter = Self::new(KubeconfigSource::Infer, None);
        Self {
            client: OnceCell::from(client),
            ..getter
        }
    }

    fn options(&self) -> KubeConfigOptions {
        KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RestClientGetter for MemoryClientGetter {
    async fn rest_config(&self) -> Result<kube::Config> {
        let config = self
            .config
            .get_or_try_init(|| async {
                let config = match &self.source {
                    KubeconfigSource::Infer if self.context.is_none() => kube::Config::infer()
                        .await
                        .map_err(|e| HarnessError::Kubeconfig(e.to_string()))?,
                    KubeconfigSource::Infer => kube::Config::from_kubeconfig(&self.options())
                        .await
                        .map_err(|e| HarnessError::Kubeconfig(e.to_string()))?,
                    KubeconfigSource::Path(path) => {
                        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                            HarnessError::Kubeconfig(format!("{}: {}", path.display(), e))
                        })?;
                        kube::Config::from_custom_kubeconfig(kubeconfig, &self.options())
                            .await
                            .map_err(|e| HarnessError::Kubeconfig(e.to_string()))?
                    }
                    KubeconfigSource::Inline(kubeconfig) => {
                        kube::Config::from_custom_kubeconfig(kubeconfig.clone(), &self.options())
                            .await
                            .map_err(|e| HarnessError::Kubeconfig(e.to_string()))?
                    }
                };
                debug!(cluster_url = %config.cluster_url, "loaded REST config");
                Ok::<_, HarnessError>(config)
            })
            .await?;
        Ok(config.clone())
    }

    async fn client(&self) -> Result<kube::Client> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let config = self.rest_config().await?;
                crate::tls::install_crypto_provider()?;
                Ok::<_, HarnessError>(kube::Client::try_from(config)?)
            })
            .await?;
        Ok(client.clone())
    }

    async fn discovery(&self) -> Result<Arc<Discovery>> {
        let discovery = self
            .discovery
            .get_or_try_init(|| async {
                let client = self.client().await?;
                let discovery = Discovery::new(client).run().await?;
                Ok::<_, HarnessError>(Arc::new(discovery))
            })
            .await?;
        Ok(discovery.clone())
    }

    async fn rest_mapper(&self) -> Result<Arc<RestMapper>> {
        let mapper = self
            .mapper
            .get_or_try_init(|| async {
                let discovery = self.discovery().await?;
                Ok::<_, HarnessError>(Arc::new(RestMapper::from_discovery(&discovery)))
            })
            .await?;
        Ok(mapper.clone())
    }

    async fn raw_kubeconfig(&self) -> Result<Option<Kubeconfig>> {
        let raw = self
            .raw
            .get_or_try_init(|| async {
                let raw = match &self.source {
                    // Absent config files mean in-cluster credentials.
                    KubeconfigSource::Infer => Kubeconfig::read().ok(),
                    KubeconfigSource::Path(path) => Some(Kubeconfig::read_from(path).map_err(
                        |e| HarnessError::Kubeconfig(format!("{}: {}", path.display(), e)),
                    )?),
                    KubeconfigSource::Inline(kubeconfig) => Some(kubeconfig.clone()),
                };
                Ok::<_, HarnessError>(raw)
            })
            .await?;
        Ok(raw.clone())
    }

    async fn helm_args(&self) -> Result<Vec<String>> {
        let file = self
            .kubeconfig_file
            .get_or_try_init(|| async {
                let KubeconfigSource::Inline(kubeconfig) = &self.source else {
                    return Ok::<_, HarnessError>(None);
                };
                let yaml = serde_yaml::to_string(kubeconfig)
                    .map_err(|e| HarnessError::Kubeconfig(e.to_string()))?;
                let mut file = tempfile::Builder::new()
                    .prefix("pds-kubeconfig-")
                    .suffix(".yaml")
                    .tempfile()?;
                file.write_all(yaml.as_bytes())?;
                file.flush()?;
                Ok(Some(Arc::new(file)))
            })
            .await?;

        let mut args = Vec::new();
        match (&self.source, file) {
            (_, Some(file)) => {
                args.push("--kubeconfig".to_string());
                args.push(file.path().display().to_string());
            }
            (KubeconfigSource::Path(path), None) => {
                args.push("--kubeconfig".to_string());
                args.push(path.display().to_string());
            }
            _ => {}
        }
        if let Some(context) = &self.context {
            args.push("--kube-context".to_string());
            args.push(context.clone());
        }
        Ok(args)
    }
}

/// Resolves kind names, plurals, `plural.group` and short names to API
/// resources.
#[derive(Debug, Default)]
pub struct RestMapper {
    by_name: HashMap<String, (ApiResource, ApiCapabilities)>,
}

impl RestMapper {
    pub fn from_discovery(discovery: &Discovery) -> Self {
        let resources = discovery
            .groups_alphabetical()
            .into_iter()
            .flat_map(|group| group.recommended_resources());
        Self::from_resources(resources)
    }

    /// Earlier resources win when two share a name, so core types shadow
    /// same-named kinds in other groups.
    pub fn from_resources(
        resources: impl IntoIterator<Item = (ApiResource, ApiCapabilities)>,
    ) -> Self {
        let mut by_name = HashMap::new();
        for (resource, caps) in resources {
            let mut keys = vec![resource.plural.clone(), resource.kind.to_lowercase()];
            if !resource.group.is_empty() {
                keys.push(format!("{}.{}", resource.plural, resource.group));
            }
            for key in keys {
                by_name
                    .entry(key)
                    .or_insert_with(|| (resource.clone(), caps.clone()));
            }
        }
        Self { by_name }
    }

    pub fn expand(name: &str) -> String {
        let lower = name.to_lowercase();
        SHORTCUTS
            .iter()
            .find(|(short, _)| *short == lower)
            .map(|(_, full)| full.to_string())
            .unwrap_or(lower)
    }

    pub fn resolve(&self, name: &str) -> Result<(ApiResource, ApiCapabilities)> {
        let key = Self::expand(name);
        self.by_name
            .get(&key)
            .or_else(|| key.strip_suffix('s').and_then(|k| self.by_name.get(k)))
            .cloned()
            .ok_or_else(|| HarnessError::Missing(format!("resource type {:?}", name)))
    }

    pub fn is_namespaced(&self, name: &str) -> Result<bool> {
        let (_, caps) = self.resolve(name)?;
        Ok(matches!(caps.scope, Scope::Namespaced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::discovery::verbs;

    fn resource(
        group: &str,
        version: &str,
        kind: &str,
        plural: &str,
        scope: Scope,
    ) -> (ApiResource, ApiCapabilities) {
        let api_version = if group.is_empty() {
            version.to_string()
        } else {
            format!("{}/{}", group, version)
        };
        (
            ApiResource {
                group: group.into(),
                version: version.into(),
                api_version,
                kind: kind.into(),
                plural: plural.into(),
            },
            ApiCapabilities {
                scope,
                subresources: vec![],
                operations: vec![verbs::GET.into(), verbs::LIST.into()],
            },
        )
    }

    fn mapper() -> RestMapper {
        RestMapper::from_resources(vec![
            resource("", "v1", "Pod", "pods", Scope::Namespaced),
            resource("", "v1", "Event", "events", Scope::Namespaced),
            resource("", "v1", "Namespace", "namespaces", Scope::Cluster),
            resource("apps", "v1", "StatefulSet", "statefulsets", Scope::Namespaced),
            resource("events.k8s.io", "v1", "Event", "events", Scope::Namespaced),
            resource("backups.pds.io", "v1", "BackupJob", "backupjobs", Scope::Namespaced),
        ])
    }

    #[test]
    fn shortcuts_expand() {
        assert_eq!(RestMapper::expand("sts"), "statefulsets");
        assert_eq!(RestMapper::expand("PO"), "pods");
        assert_eq!(RestMapper::expand("backupjobs"), "backupjobs");
    }

    #[test]
    fn resolves_kind_plural_short_and_qualified_names() {
        let mapper = mapper();
        assert_eq!(mapper.resolve("sts").unwrap().0.kind, "StatefulSet");
        assert_eq!(mapper.resolve("StatefulSet").unwrap().0.group, "apps");
        assert_eq!(mapper.resolve("backupjob").unwrap().0.plural, "backupjobs");
        assert_eq!(
            mapper.resolve("events.events.k8s.io").unwrap().0.group,
            "events.k8s.io"
        );
        assert_eq!(mapper.resolve("events").unwrap().0.group, "");
        assert!(!mapper.is_namespaced("ns").unwrap());
        assert!(mapper.is_namespaced("po").unwrap());
    }

    #[test]
    fn unknown_kind_is_not_found() {
        let err = mapper().resolve("widgets").unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn path_source_points_helm_at_the_file() {
        let getter = MemoryClientGetter::from_path(
            Some(PathBuf::from("/etc/pds/kubeconfig")),
            Some("target".into()),
        );
        assert_eq!(
            getter.helm_args().await.unwrap(),
            vec!["--kubeconfig", "/etc/pds/kubeconfig", "--kube-context", "target"]
        );
    }

    #[tokio::test]
    async fn inline_source_is_materialised_once() {
        let kubeconfig = Kubeconfig::from_yaml(
            r#"
apiVersion: v1
kind: Config
clusters:
- name: tc
  cluster:
    server: https://10.0.0.1:6443
contexts:
- name: tc
  context:
    cluster: tc
    user: admin
current-context: tc
users:
- name: admin
  user:
    token: abc
"#,
        )
        .unwrap();
        let getter = MemoryClientGetter::new(KubeconfigSource::Inline(kubeconfig), None);

        let first = getter.helm_args().await.unwrap();
        let second = getter.helm_args().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0], "--kubeconfig");
        let written = std::fs::read_to_string(&first[1]).unwrap();
        assert!(written.contains("https://10.0.0.1:6443"));

        let config = getter.rest_config().await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.0.0.1"));
        assert!(getter.raw_kubeconfig().await.unwrap().is_some());
    }
}
