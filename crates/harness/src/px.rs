//! Portworx REST calls tunnelled through the Kubernetes service proxy.

use http::Method;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{kube_error_kind, ErrorKind};

const PX_SERVICE: &str = "portworx-api";
const PX_PORT: u16 = 9021;

#[derive(Error, Debug)]
pub enum PxError {
    #[error("no portworx-api service found in the cluster")]
    NoPxService,

    #[error("portworx request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid portworx request {path}: {reason}")]
    Request { path: String, reason: String },

    #[error("cannot decode portworx response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cloud credential {0} not found")]
    CredentialNotFound(String),

    #[error("{} of {} deletions failed: {}", .failures.len(), .attempted, .failures.join("; "))]
    Multiple { attempted: usize, failures: Vec<String> },
}

impl PxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PxError::Kube(e) => kube_error_kind(e),
            PxError::NoPxService => ErrorKind::Fatal,
            PxError::CredentialNotFound(_) => ErrorKind::NotFound,
            PxError::Request { .. } | PxError::Decode { .. } | PxError::Multiple { .. } => {
                ErrorKind::Other
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CredentialIds {
    #[serde(default)]
    pub credential_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AwsCredential {
    #[serde(default)]
    pub access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub disable_ssl: bool,
    #[serde(default)]
    pub disable_path_style: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CloudCredential {
    #[serde(default)]
    pub credential_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_credential: Option<AwsCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_credential: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_credential: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VolumeLocator {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub locator: VolumeLocator,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct VolumeList {
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

/// Parameters of an S3 cloud credential.
#[derive(Debug, Clone)]
pub struct S3Credential {
    pub name: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
    pub region: String,
}

#[derive(Deserialize)]
struct CreateCredentialResponse {
    credential_id: String,
}

#[derive(Clone)]
pub struct PxProxy {
    client: Client,
    namespace: String,
}

impl PxProxy {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Finds the namespace running the `portworx-api` service.
    pub async fn connect(client: Client) -> Result<Self, PxError> {
        let services: Api<Service> = Api::all(client.clone());
        let params = ListParams::default().fields(&format!("metadata.name={}", PX_SERVICE));
        let namespace = services
            .list(&params)
            .await?
            .items
            .into_iter()
            .find_map(|s| s.metadata.namespace)
            .ok_or(PxError::NoPxService)?;
        info!(namespace = %namespace, "found portworx API service");
        Ok(Self::new(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn proxy_path(&self, path: &str) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}:{}/proxy/{}",
            self.namespace,
            PX_SERVICE,
            PX_PORT,
            path.trim_start_matches('/')
        )
    }

    /// Raw response body of `method path`.
    pub async fn raw(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Vec<u8>, PxError> {
        let uri = self.proxy_path(path);
        let payload = match body {
            Some(body) => serde_json::to_vec(body).map_err(|e| PxError::Request {
                path: path.to_string(),
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        debug!(%method, path, "portworx request");
        let request = http::Request::builder()
            .method(method)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .map_err(|e| PxError::Request {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(self.client.request_text(request).await?.into_bytes())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, PxError> {
        let raw = self.raw(method, path, body).await?;
        serde_json::from_slice(&raw).map_err(|source| PxError::Decode {
            path: path.to_string(),
            source,
        })
    }

    pub async fn get_cloud_credential(&self, id: &str) -> Result<CloudCredential, PxError> {
        self.call(Method::GET, &format!("v1/credentials/inspect/{}", id), None)
            .await
    }

    pub async fn list_cloud_credential_ids(&self) -> Result<Vec<String>, PxError> {
        let ids: CredentialIds = self.call(Method::GET, "v1/credentials", None).await?;
        Ok(ids.credential_ids)
    }

    /// Every credential, inspected one by one. Fails on the first credential
    /// that cannot be inspected.
    pub async fn list_cloud_credentials(&self) -> Result<Vec<CloudCredential>, PxError> {
        let ids = self.list_cloud_credential_ids().await?;
        let mut credentials = Vec::with_capacity(ids.len());
        for id in ids {
            credentials.push(self.get_cloud_credential(&id).await?);
        }
        Ok(credentials)
    }

    pub async fn find_cloud_credential(
        &self,
        name: &str,
    ) -> Result<Option<CloudCredential>, PxError> {
        Ok(self
            .list_cloud_credentials()
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    pub async fn delete_cloud_credential(&self, id: &str) -> Result<(), PxError> {
        self.raw(Method::DELETE, &format!("v1/credentials/{}", id), None)
            .await?;
        info!(credential = id, "deleted portworx cloud credential");
        Ok(())
    }

    pub async fn delete_cloud_credential_by_name(&self, name: &str) -> Result<(), PxError> {
        let credential = self
            .find_cloud_credential(name)
            .await?
            .ok_or_else(|| PxError::CredentialNotFound(name.to_string()))?;
        self.delete_cloud_credential(&credential.credential_id).await
    }

    /// Deletes every credential whose name starts with `prefix`, attempting
    /// all of them. Returns how many were deleted.
    pub async fn delete_cloud_credentials_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<usize, PxError> {
        let candidates: Vec<CloudCredential> = self
            .list_cloud_credentials()
            .await?
            .into_iter()
            .filter(|c| c.name.starts_with(prefix))
            .collect();
        let mut failures = Vec::new();
        for credential in &candidates {
            if let Err(e) = self.delete_cloud_credential(&credential.credential_id).await {
                warn!(
                    credential = %credential.name,
                    error = %e,
                    "failed to delete cloud credential"
                );
                failures.push(format!("{}: {}", credential.name, e));
            }
        }
        if failures.is_empty() {
            Ok(candidates.len())
        } else {
            Err(PxError::Multiple {
                attempted: candidates.len(),
                failures,
            })
        }
    }

    pub async fn create_s3_cloud_credential(
        &self,
        credential: &S3Credential,
    ) -> Result<String, PxError> {
        let body = serde_json::json!({
            "name": credential.name,
            "bucket": credential.bucket,
            "encryption_key": "",
            "aws_credential": {
                "access_key": credential.access_key,
                "secret_key": credential.secret_key,
                "endpoint": credential.endpoint,
                "region": credential.region,
                "disable_ssl": false,
                "disable_path_style": false,
            },
        });
        let created: CreateCredentialResponse =
            self.call(Method::POST, "v1/credentials", Some(&body)).await?;
        info!(
            name = %credential.name,
            id = %created.credential_id,
            "created portworx cloud credential"
        );
        Ok(created.credential_id)
    }

    pub async fn get_volumes(&self) -> Result<Vec<u8>, PxError> {
        self.raw(Method::POST, "v1/volumes/inspectwithfilters", Some(&serde_json::json!({})))
            .await
    }

    pub async fn volumes(&self) -> Result<VolumeList, PxError> {
        let raw = self.get_volumes().await?;
        serde_json::from_slice(&raw).map_err(|source| PxError::Decode {
            path: "v1/volumes/inspectwithfilters".into(),
            source,
        })
    }

    pub async fn delete_volume(&self, id: &str) -> Result<Vec<u8>, PxError> {
        self.raw(Method::DELETE, &format!("v1/volumes/{}", id), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake_kube::FakeKube;
    use serde_json::json;

    const PROXY: &str = "/api/v1/namespaces/portworx/services/portworx-api:9021/proxy";

    fn credential(id: &str, name: &str) -> String {
        json!({
            "credential_id": id,
            "name": name,
            "bucket": "pds-backups",
            "aws_credential": {
                "access_key": "AKIA123",
                "endpoint": "s3.amazonaws.com",
                "region": "us-east-1",
            },
        })
        .to_string()
    }

    fn failure_status(message: &str, reason: &str, code: u16) -> String {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        })
        .to_string()
    }

    fn inspect(fake: &FakeKube, id: &str, name: &str) {
        let path = format!("{}/v1/credentials/inspect/{}", PROXY, id);
        fake.respond(Method::GET, &path, 200, credential(id, name));
    }

    async fn proxy(fake: &FakeKube) -> PxProxy {
        fake.insert(
            "/api/v1/namespaces/portworx/services",
            json!({ "metadata": { "name": "portworx-api" } }),
        );
        fake.insert(
            "/api/v1/namespaces/other/services",
            json!({ "metadata": { "name": "unrelated" } }),
        );
        PxProxy::connect(fake.client().await).await.unwrap()
    }

    #[tokio::test]
    async fn discovers_portworx_namespace() {
        let fake = FakeKube::new();
        let px = proxy(&fake).await;
        assert_eq!(px.namespace(), "portworx");
    }

    #[tokio::test]
    async fn missing_service_is_distinct_error() {
        let fake = FakeKube::new();
        let err = PxProxy::connect(fake.client().await).await.err().unwrap();
        assert!(matches!(err, PxError::NoPxService));
    }

    #[tokio::test]
    async fn list_inspects_each_credential() {
        let fake = FakeKube::new();
        let px = proxy(&fake).await;
        fake.respond(
            Method::GET,
            &format!("{}/v1/credentials", PROXY),
            200,
            r#"{"credential_ids":["c1","c2"]}"#,
        );
        inspect(&fake, "c1", "pds-bt-1");
        inspect(&fake, "c2", "other");

        let credentials = px.list_cloud_credentials().await.unwrap();
        assert_eq!(credentials.len(), 2);
        let found = px.find_cloud_credential("pds-bt-1").await.unwrap().unwrap();
        assert_eq!(found.aws_credential.unwrap().access_key, "AKIA123");
    }

    #[tokio::test]
    async fn list_fails_on_first_inspect_failure() {
        let fake = FakeKube::new();
        let px = proxy(&fake).await;
        fake.respond(
            Method::GET,
            &format!("{}/v1/credentials", PROXY),
            200,
            r#"{"credential_ids":["c1","gone"]}"#,
        );
        inspect(&fake, "c1", "a");
        fake.respond(
            Method::GET,
            &format!("{}/v1/credentials/inspect/gone", PROXY),
            404,
            failure_status("not found", "NotFound", 404),
        );

        let err = px.list_cloud_credentials().await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn prefix_delete_attempts_every_candidate() {
        let fake = FakeKube::new();
        let px = proxy(&fake).await;
        fake.respond(
            Method::GET,
            &format!("{}/v1/credentials", PROXY),
            200,
            r#"{"credential_ids":["c1","c2","c3"]}"#,
        );
        inspect(&fake, "c1", "pds-a");
        inspect(&fake, "c2", "pds-b");
        inspect(&fake, "c3", "keep");
        fake.respond(
            Method::DELETE,
            &format!("{}/v1/credentials/c1", PROXY),
            500,
            failure_status("busy", "InternalError", 500),
        );
        fake.respond(Method::DELETE, &format!("{}/v1/credentials/c2", PROXY), 200, "{}");

        let err = px.delete_cloud_credentials_by_prefix("pds-").await.unwrap_err();
        match err {
            PxError::Multiple { attempted, failures } => {
                assert_eq!(attempted, 2);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("pds-a"));
            }
            e => panic!("unexpected {:?}", e),
        }
        assert!(fake
            .requests()
            .iter()
            .any(|r| r == &format!("DELETE {}/v1/credentials/c2", PROXY)));
        assert!(!fake
            .requests()
            .iter()
            .any(|r| r == &format!("DELETE {}/v1/credentials/c3", PROXY)));
    }

    #[tokio::test]
    async fn create_credential_and_volumes() {
        let fake = FakeKube::new();
        let px = proxy(&fake).await;
        fake.respond(
            Method::POST,
            &format!("{}/v1/credentials", PROXY),
            200,
            r#"{"credential_id":"new-1"}"#,
        );
        fake.respond(
            Method::POST,
            &format!("{}/v1/volumes/inspectwithfilters", PROXY),
            200,
            r#"{"volumes":[{"id":"vol-1","locator":{"name":"pvc-abc"}}]}"#,
        );

        let id = px
            .create_s3_cloud_credential(&S3Credential {
                name: "pds-bt-1".into(),
                bucket: "pds-backups".into(),
                access_key: "AKIA123".into(),
                secret_key: "secret".into(),
                endpoint: "s3.amazonaws.com".into(),
                region: "us-east-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(id, "new-1");

        let volumes = px.volumes().await.unwrap();
        assert_eq!(volumes.volumes[0].locator.name, "pvc-abc");
    }
}
