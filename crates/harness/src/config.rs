use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Deserialize;

use crate::error::HarnessError;
use crate::helm::repo::parse_constraint;

/// Label the control plane looks for on namespaces it may deploy into.
pub const LABEL_PDS_AVAILABLE: &str = "pds.portworx.com/available";

/// Issuer, credentials and raw token. Secrets are normally supplied via
/// `PDS_AUTH_*` variables (see [`HarnessConfig::load_secrets`]).
#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// OAuth2 token endpoint of the identity issuer.
    #[arg(long = "issuer-token-url", env = "PDS_ISSUER_TOKEN_URL")]
    pub issuer_token_url: Option<String>,

    #[arg(long = "issuer-client-id", env = "PDS_ISSUER_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long = "issuer-client-secret")]
    pub client_secret: Option<String>,

    #[arg(long = "pds-username", env = "PDS_USERNAME")]
    pub username: Option<String>,

    #[arg(long = "pds-password")]
    pub password: Option<String>,

    /// Static bearer token. Takes precedence over the issuer flow.
    #[arg(long = "pds-token")]
    pub token: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ControlPlaneArgs {
    /// Root URL of the control plane, e.g. `https://staging.pds.example.com`.
    #[arg(long = "control-plane-url", env = "PDS_CONTROL_PLANE_URL", default_value = "")]
    pub api_url: String,

    #[arg(long = "pds-account-name", env = "PDS_ACCOUNT_NAME", default_value = "Portworx")]
    pub account_name: String,

    #[arg(long = "pds-tenant-name", env = "PDS_TENANT_NAME", default_value = "Default")]
    pub tenant_name: String,

    #[arg(long = "pds-project-name", env = "PDS_PROJECT_NAME", default_value = "Default")]
    pub project_name: String,
}

#[derive(Args, Debug, Clone)]
pub struct TargetClusterArgs {
    /// Kubeconfig of the target cluster. Empty means in-cluster or `$KUBECONFIG`.
    #[arg(long = "target-kubeconfig", env = "PDS_TARGET_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long = "target-context", env = "PDS_TARGET_CONTEXT")]
    pub kube_context: Option<String>,

    /// Name of the deployment target. When unset the target is found by cluster ID.
    #[arg(long = "deployment-target-name", env = "PDS_DEPLOYMENT_TARGET_NAME")]
    pub deployment_target_name: Option<String>,

    #[arg(
        long = "service-account-name",
        env = "PDS_SERVICE_ACCOUNT_NAME",
        default_value = "Default-AgentWriter"
    )]
    pub service_account_name: String,

    /// Semver constraint for the PDS target chart.
    #[arg(long = "pds-helm-chart-version", env = "PDS_HELM_CHART_VERSION", default_value = "*")]
    pub pds_chart_version: String,

    #[arg(long = "cert-manager-version", env = "PDS_CERT_MANAGER_VERSION", default_value = "^1.11")]
    pub cert_manager_version: String,

    #[arg(long = "data-service-tls-enabled", env = "PDS_DATA_SERVICE_TLS_ENABLED")]
    pub data_service_tls_enabled: bool,

    #[arg(long = "test-namespace", env = "PDS_TEST_NAMESPACE", default_value = "dev")]
    pub test_namespace: String,

    #[arg(long = "pds-namespace", env = "PDS_NAMESPACE", default_value = "pds-system")]
    pub pds_namespace: String,

    #[arg(long = "helm-binary", env = "PDS_HELM_BINARY", default_value = "helm")]
    pub helm_binary: String,

    /// Install the agent charts if the target is not registered yet.
    #[arg(long = "register-target", env = "PDS_REGISTER_TARGET")]
    pub register: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    #[arg(long = "s3-endpoint", env = "PDS_S3_ENDPOINT", default_value = "s3.amazonaws.com")]
    pub s3_endpoint: String,

    #[arg(long = "s3-bucket", env = "PDS_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long = "s3-region", env = "PDS_S3_REGION", default_value = "us-east-1")]
    pub s3_region: String,

    #[arg(long = "s3-access-key")]
    pub s3_access_key: Option<String>,

    #[arg(long = "s3-secret-key")]
    pub s3_secret_key: Option<String>,
}

/// Every flag group of the harness, flattened into the runner's parser.
#[derive(Args, Debug, Clone)]
pub struct HarnessConfig {
    #[command(flatten)]
    pub auth: AuthArgs,

    #[command(flatten)]
    pub control_plane: ControlPlaneArgs,

    #[command(flatten)]
    pub target: TargetClusterArgs,

    #[command(flatten)]
    pub backup: BackupArgs,

    /// YAML file mapping dataservice names to image version tags.
    #[arg(long = "version-matrix", env = "PDS_VERSION_MATRIX")]
    pub version_matrix: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default)]
struct AuthSecrets {
    client_secret: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct S3Secrets {
    access_key: Option<String>,
    secret_key: Option<String>,
}

/// How requests to the control plane are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Token(String),
    Password {
        token_url: String,
        client_id: String,
        client_secret: String,
        username: String,
        password: String,
    },
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Settings {
    /// Endpoint with a scheme, as expected by the S3 SDK.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        }
    }
}

impl HarnessConfig {
    /// Fills secrets left empty on the command line from `PDS_AUTH_*` and
    /// `PDS_S3_*` variables.
    pub fn load_secrets(&mut self) -> Result<(), HarnessError> {
        let auth = envy::prefixed("PDS_AUTH_")
            .from_env::<AuthSecrets>()
            .map_err(|e| HarnessError::Config(format!("PDS_AUTH_*: {}", e)))?;
        let s3 = envy::prefixed("PDS_S3_")
            .from_env::<S3Secrets>()
            .map_err(|e| HarnessError::Config(format!("PDS_S3_*: {}", e)))?;
        self.apply_secrets(auth, s3);
        Ok(())
    }

    fn apply_secrets(&mut self, auth: AuthSecrets, s3: S3Secrets) {
        fill(&mut self.auth.client_secret, auth.client_secret);
        fill(&mut self.auth.password, auth.password);
        fill(&mut self.auth.token, auth.token);
        fill(&mut self.backup.s3_access_key, s3.access_key);
        fill(&mut self.backup.s3_secret_key, s3.secret_key);
    }

    pub fn auth_method(&self) -> Result<AuthMethod, HarnessError> {
        let auth = &self.auth;
        if let Some(token) = non_empty(&auth.token) {
            return Ok(AuthMethod::Token(token));
        }

        let token_url = non_empty(&auth.issuer_token_url).ok_or_else(|| {
            HarnessError::Config("either a token or an issuer token URL is required".into())
        })?;
        let client_id = non_empty(&auth.client_id)
            .ok_or_else(|| HarnessError::Config("issuer client ID is required".into()))?;
        let client_secret = non_empty(&auth.client_secret)
            .ok_or_else(|| HarnessError::Config("issuer client secret is required".into()))?;

        match (non_empty(&auth.username), non_empty(&auth.password)) {
            (Some(username), Some(password)) => Ok(AuthMethod::Password {
                token_url,
                client_id,
                client_secret,
                username,
                password,
            }),
            (None, None) => Ok(AuthMethod::ClientCredentials {
                token_url,
                client_id,
                client_secret,
            }),
            _ => Err(HarnessError::Config(
                "username and password must be given together".into(),
            )),
        }
    }

    /// Object-store settings, required by backup scenarios only.
    pub fn s3_settings(&self) -> Result<S3Settings, HarnessError> {
        let b = &self.backup;
        let bucket = non_empty(&b.s3_bucket)
            .ok_or_else(|| HarnessError::Config("S3 bucket is required for backups".into()))?;
        let access_key = non_empty(&b.s3_access_key)
            .ok_or_else(|| HarnessError::Config("S3 access key is required for backups".into()))?;
        let secret_key = non_empty(&b.s3_secret_key)
            .ok_or_else(|| HarnessError::Config("S3 secret key is required for backups".into()))?;
        Ok(S3Settings {
            endpoint: b.s3_endpoint.clone(),
            bucket,
            region: b.s3_region.clone(),
            access_key,
            secret_key,
        })
    }

    /// Checks everything needed before any remote call is made.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let url = self.control_plane.api_url.trim();
        if url.is_empty() {
            return Err(HarnessError::Config("control plane URL is required".into()));
        }
        reqwest::Url::parse(url)
            .map_err(|e| HarnessError::Config(format!("control plane URL {:?}: {}", url, e)))?;

        for (flag, value) in [
            ("account name", &self.control_plane.account_name),
            ("tenant name", &self.control_plane.tenant_name),
            ("project name", &self.control_plane.project_name),
            ("test namespace", &self.target.test_namespace),
            ("PDS namespace", &self.target.pds_namespace),
        ] {
            if value.trim().is_empty() {
                return Err(HarnessError::Config(format!("{} must not be empty", flag)));
            }
        }

        self.auth_method()?;

        for (flag, constraint) in [
            ("PDS chart version", &self.target.pds_chart_version),
            ("cert-manager version", &self.target.cert_manager_version),
        ] {
            parse_constraint(constraint)
                .map_err(|e| HarnessError::Config(format!("{}: {}", flag, e)))?;
        }

        if let Some(path) = &self.version_matrix {
            VersionMatrix::load(path)?;
        }
        Ok(())
    }
}

fn fill(slot: &mut Option<String>, from_env: Option<String>) {
    if non_empty(slot).is_none() {
        *slot = from_env.filter(|v| !v.is_empty());
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Dataservice name to the image version tags under test.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionMatrix {
    #[serde(rename = "dataServices", default)]
    pub data_services: BTreeMap<String, Vec<String>>,
}

impl VersionMatrix {
    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("version matrix {}: {}", path.display(), e))
        })?;
        Self::parse(&raw)
            .map_err(|e| HarnessError::Config(format!("version matrix {}: {}", path.display(), e)))
    }

    pub fn parse(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn versions(&self, data_service: &str) -> &[String] {
        self.data_services
            .get(data_service)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use clap::Parser;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        config: HarnessConfig,
    }

    /// Parses flags the way the runner does, ignoring the environment.
    pub(crate) fn config_from_args(args: &[&str]) -> HarnessConfig {
        let argv = std::iter::once("pds-integration-tests").chain(args.iter().copied());
        TestCli::try_parse_from(argv).unwrap().config
    }

    fn minimal() -> Vec<&'static str> {
        vec!["--control-plane-url", "https://pds.example.com", "--pds-token", "t0k3n"]
    }

    #[test]
    fn defaults_are_applied() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = config_from_args(&minimal());

        assert_eq!(config.control_plane.account_name, "Portworx");
        assert_eq!(config.target.service_account_name, "Default-AgentWriter");
        assert_eq!(config.target.cert_manager_version, "^1.11");
        assert_eq!(config.target.pds_namespace, "pds-system");
        assert!(!config.target.data_service_tls_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn token_wins_over_issuer() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut args = minimal();
        args.extend(["--issuer-token-url", "https://issuer/token"]);
        let config = config_from_args(&args);
        assert_eq!(config.auth_method().unwrap(), AuthMethod::Token("t0k3n".into()));
    }

    #[test]
    fn password_grant_requires_both_halves() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = config_from_args(&[
            "--control-plane-url",
            "https://pds.example.com",
            "--issuer-token-url",
            "https://issuer/token",
            "--issuer-client-id",
            "harness",
            "--pds-username",
            "alice",
        ]);
        config.apply_secrets(
            AuthSecrets {
                client_secret: Some("s3cret".into()),
                ..Default::default()
            },
            S3Secrets::default(),
        );

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("username and password"));

        config.auth.password = Some("hunter2".into());
        assert!(matches!(
            config.auth_method().unwrap(),
            AuthMethod::Password { ref username, .. } if username == "alice"
        ));
    }

    #[test]
    fn client_credentials_without_user() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut config = config_from_args(&[
            "--control-plane-url",
            "https://pds.example.com",
            "--issuer-token-url",
            "https://issuer/token",
            "--issuer-client-id",
            "harness",
            "--issuer-client-secret",
            "from-flag",
        ]);
        config.apply_secrets(
            AuthSecrets {
                client_secret: Some("from-env".into()),
                ..Default::default()
            },
            S3Secrets::default(),
        );

        match config.auth_method().unwrap() {
            AuthMethod::ClientCredentials { client_secret, .. } => {
                assert_eq!(client_secret, "from-flag")
            }
            other => panic!("unexpected auth method: {:?}", other),
        }
    }

    #[test]
    fn secrets_are_read_from_prefixed_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("PDS_S3_ACCESS_KEY", "AKIA-TEST");
        std::env::set_var("PDS_S3_SECRET_KEY", "secret-from-env");

        let mut args = minimal();
        args.extend(["--s3-bucket", "pds-backups"]);
        let mut config = config_from_args(&args);
        let loaded = config.load_secrets();

        std::env::remove_var("PDS_S3_ACCESS_KEY");
        std::env::remove_var("PDS_S3_SECRET_KEY");

        loaded.unwrap();
        let s3 = config.s3_settings().unwrap();
        assert_eq!(s3.access_key, "AKIA-TEST");
        assert_eq!(s3.secret_key, "secret-from-env");
        assert_eq!(s3.endpoint_url(), "https://s3.amazonaws.com");
    }

    #[test]
    fn missing_url_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = config_from_args(&["--pds-token", "t"]);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }

    #[test]
    fn bad_chart_constraint_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        let mut args = minimal();
        args.extend(["--cert-manager-version", "not a version"]);
        let config = config_from_args(&args);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cert-manager version"));
    }

    #[test]
    fn version_matrix_parses() {
        let matrix = VersionMatrix::parse(
            "dataServices:\n  Cassandra:\n    - 4.1.2\n  PostgreSQL: [\"14.6\", \"15.2\"]\n",
        )
        .unwrap();
        assert_eq!(matrix.versions("Cassandra"), ["4.1.2".to_string()]);
        assert_eq!(matrix.versions("PostgreSQL").len(), 2);
        assert!(matrix.versions("Kafka").is_empty());
    }
}
