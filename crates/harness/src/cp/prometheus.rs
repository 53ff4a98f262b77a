use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, TokenSource};

const TENANT_HEADER: &str = "X-PDS-TenantID";

/// Query client for the Prometheus instance proxied by the control plane.
pub struct PrometheusClient {
    http: reqwest::Client,
    query_url: Url,
    tenant_id: String,
    tokens: Arc<dyn TokenSource>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    /// `[unix_time, "value"]` for instant vectors.
    #[serde(default)]
    pub value: Option<(f64, String)>,
}

impl Sample {
    pub fn value(&self) -> Option<f64> {
        self.value.as_ref().and_then(|(_, v)| v.parse().ok())
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<Sample>,
}

impl PrometheusClient {
    /// `root` is the control plane root URL; queries go to `<root>/prometheus/api/v1/query`.
    pub fn new(
        http: reqwest::Client,
        root: &Url,
        tenant_id: &str,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, ApiError> {
        let query_url = root
            .join("prometheus/api/v1/query")
            .map_err(|e| ApiError::Url(e.to_string()))?;
        Ok(Self {
            http,
            query_url,
            tenant_id: tenant_id.to_string(),
            tokens,
        })
    }

    pub async fn query(&self, promql: &str) -> Result<Vec<Sample>, ApiError> {
        let path = self.query_url.path().to_string();
        let token = self.tokens.token().await?;
        let response = self
            .http
            .get(self.query_url.clone())
            .query(&[("query", promql)])
            .bearer_auth(token)
            .header(TENANT_HEADER, &self.tenant_id)
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                method: reqwest::Method::GET,
                path: path.clone(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| ApiError::Transport {
            method: reqwest::Method::GET,
            path: path.clone(),
            source,
        })?;
        debug!(promql, status = status.as_u16(), "prometheus query");
        if !status.is_success() {
            return Err(ApiError::Status {
                method: reqwest::Method::GET,
                path,
                status: status.as_u16(),
                body,
            });
        }

        let parsed: QueryResponse =
            serde_json::from_str(&body).map_err(|source| ApiError::Decode {
                method: reqwest::Method::GET,
                path: path.clone(),
                source,
            })?;
        if parsed.status != "success" {
            return Err(ApiError::Status {
                method: reqwest::Method::GET,
                path,
                status: status.as_u16(),
                body: parsed.error.unwrap_or(body),
            });
        }
        Ok(parsed.data.map(|d| d.result).unwrap_or_default())
    }
}
