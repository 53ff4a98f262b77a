use std::sync::Arc;

use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::auth::{AuthError, TokenSource};
use crate::error::{status_kind, ErrorKind};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: u16,
        body: String,
    },

    #[error("{method} {path} failed: {source}")]
    Transport {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("decoding response of {method} {path}: {source}")]
    Decode {
        method: Method,
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid control plane URL: {0}")]
    Url(String),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            ApiError::Status { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Status { status, .. } => status_kind(*status),
            ApiError::Transport { .. } => ErrorKind::TransientRemote,
            ApiError::Decode { .. } => ErrorKind::Other,
            ApiError::Url(_) => ErrorKind::Fatal,
            ApiError::Auth(e) => e.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// JSON-over-HTTP client for the control plane API.
///
/// Paths are relative to the control plane root, e.g. `api/deployments/{id}`.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    root: Url,
    tokens: Arc<dyn TokenSource>,
}

impl ApiClient {
    pub fn new(
        http: reqwest::Client,
        root_url: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, ApiError> {
        let mut root =
            Url::parse(root_url).map_err(|e| ApiError::Url(format!("{}: {}", root_url, e)))?;
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        Ok(Self { http, root, tokens })
    }

    pub fn root(&self) -> &Url {
        &self.root
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn tokens(&self) -> Arc<dyn TokenSource> {
        self.tokens.clone()
    }

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.root
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Url(format!("{}: {}", path, e)))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(Method::GET, path, &[], None::<&()>).await
    }

    pub async fn get_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        self.send(Method::GET, path, query, None::<&()>).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.delete_query(path, &[]).await
    }

    pub async fn delete_query(&self, path: &str, query: &[(&str, String)]) -> Result<(), ApiError> {
        let _: serde_json::Value = self.send(Method::DELETE, path, query, None::<&()>).await?;
        Ok(())
    }

    async fn send<B, T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        let token = self.tokens.token().await?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            method: method.clone(),
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|source| ApiError::Transport {
            method: method.clone(),
            path: path.to_string(),
            source,
        })?;
        debug!(%method, path, status = status.as_u16(), "control plane request");

        if !status.is_success() {
            return Err(ApiError::Status {
                method,
                path: path.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        let payload: &[u8] = if bytes.iter().all(u8::is_ascii_whitespace) {
            b"null"
        } else {
            &bytes
        };
        serde_json::from_slice(payload).map_err(|source| ApiError::Decode {
            method,
            path: path.to_string(),
            source,
        })
    }
}
