use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::dangerous::insecure_decode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::AuthMethod;
use crate::error::{status_kind, ErrorKind};

/// Tokens are refreshed this long before the issuer says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("issuer rejected token request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed token response: {0}")]
    Decode(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Request(_) => ErrorKind::TransientRemote,
            AuthError::Rejected { status, .. } => status_kind(*status),
            AuthError::Decode(_) => ErrorKind::Other,
        }
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Bearer token valid for at least the next request.
    async fn token(&self) -> Result<String, AuthError>;
}

pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// OAuth2 token endpoint shared by the grant types.
struct Issuer {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cache: Mutex<Option<CachedToken>>,
}

impl Issuer {
    fn new(http: reqwest::Client, token_url: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cache: Mutex::new(None),
        }
    }

    async fn token(&self, grant: &[(&str, &str)]) -> Result<String, AuthError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        form.extend_from_slice(grant);

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Decode(e.to_string()))?;

        let lifetime = body
            .expires_in
            .map(Duration::from_secs)
            .or_else(|| jwt_lifetime(&body.access_token));
        debug!(
            token_url = %self.token_url,
            lifetime_secs = lifetime.map(|d| d.as_secs()),
            "fetched access token"
        );

        *cache = lifetime.map(|lifetime| CachedToken {
            value: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(EXPIRY_MARGIN),
        });
        Ok(body.access_token)
    }
}

/// Remaining lifetime of a JWT according to its `exp` claim. The signature
/// is not checked; the issuer is trusted.
fn jwt_lifetime(token: &str) -> Option<Duration> {
    let data = insecure_decode::<ExpiryClaims>(token).ok()?;
    let exp = data.claims.exp?;
    let now = u64::try_from(chrono::Utc::now().timestamp()).ok()?;
    Some(Duration::from_secs(exp.saturating_sub(now)))
}

/// Resource-owner password grant.
pub struct PasswordGrant {
    issuer: Issuer,
    username: String,
    password: String,
}

impl PasswordGrant {
    pub fn new(
        http: reqwest::Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            issuer: Issuer::new(http, token_url, client_id, client_secret),
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl TokenSource for PasswordGrant {
    async fn token(&self) -> Result<String, AuthError> {
        self.issuer
            .token(&[
                ("grant_type", "password"),
                ("username", &self.username),
                ("password", &self.password),
            ])
            .await
    }
}

pub struct ClientCredentialsGrant {
    issuer: Issuer,
}

impl ClientCredentialsGrant {
    pub fn new(
        http: reqwest::Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        Self {
            issuer: Issuer::new(http, token_url, client_id, client_secret),
        }
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsGrant {
    async fn token(&self) -> Result<String, AuthError> {
        self.issuer
            .token(&[("grant_type", "client_credentials")])
            .await
    }
}

pub fn token_source(method: &AuthMethod, http: reqwest::Client) -> Arc<dyn TokenSource> {
    match method {
        AuthMethod::Token(token) => Arc::new(StaticToken::new(token.clone())),
        AuthMethod::Password {
            token_url,
            client_id,
            client_secret,
            username,
            password,
        } => Arc::new(PasswordGrant::new(
            http,
            token_url,
            client_id,
            client_secret,
            username,
            password,
        )),
        AuthMethod::ClientCredentials {
            token_url,
            client_id,
            client_secret,
        } => Arc::new(ClientCredentialsGrant::new(
            http,
            token_url,
            client_id,
            client_secret,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fake_http::{serve, Recorded};
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::collections::HashMap;

    async fn issue(
        State(recorded): State<Recorded>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        let n = recorded.push(form.get("grant_type").cloned().unwrap_or_default());
        let mut body = serde_json::json!({ "access_token": format!("token-{}", n) });
        if form.get("username").map(String::as_str) == Some("cached") {
            body["expires_in"] = serde_json::json!(3600);
        }
        Json(body)
    }

    fn issuer_router(recorded: Recorded) -> Router {
        Router::new()
            .route("/token", post(issue))
            .with_state(recorded)
    }

    #[tokio::test]
    async fn password_token_is_cached_until_expiry() {
        let recorded = Recorded::default();
        let base = serve(issuer_router(recorded.clone())).await;
        let source = PasswordGrant::new(
            reqwest::Client::new(),
            &format!("{}/token", base),
            "harness",
            "secret",
            "cached",
            "pw",
        );

        assert_eq!(source.token().await.unwrap(), "token-1");
        assert_eq!(source.token().await.unwrap(), "token-1");
        assert_eq!(recorded.entries(), vec!["password"]);
    }

    #[tokio::test]
    async fn token_without_expiry_is_fetched_every_time() {
        let recorded = Recorded::default();
        let base = serve(issuer_router(recorded.clone())).await;
        let source = ClientCredentialsGrant::new(
            reqwest::Client::new(),
            &format!("{}/token", base),
            "harness",
            "secret",
        );

        assert_eq!(source.token().await.unwrap(), "token-1");
        assert_eq!(source.token().await.unwrap(), "token-2");
        assert_eq!(
            recorded.entries(),
            vec!["client_credentials", "client_credentials"]
        );
    }

    #[tokio::test]
    async fn rejected_request_is_surfaced() {
        let router = Router::new().route(
            "/token",
            post(|| async { (axum::http::StatusCode::UNAUTHORIZED, "invalid_client") }),
        );
        let base = serve(router).await;
        let source = ClientCredentialsGrant::new(
            reqwest::Client::new(),
            &format!("{}/token", base),
            "harness",
            "wrong",
        );

        let err = source.token().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { status: 401, .. }));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn jwt_expiry_is_read_without_verification() {
        let exp = chrono::Utc::now().timestamp() + 600;
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "harness", "exp": exp }),
            &EncodingKey::from_secret(b"issuer-only-knows"),
        )
        .unwrap();

        let lifetime = jwt_lifetime(&token).unwrap();
        assert!(lifetime > Duration::from_secs(590));
        assert!(lifetime <= Duration::from_secs(600));
        assert!(jwt_lifetime("not-a-jwt").is_none());
    }

    #[test]
    fn jwt_without_expiry_has_no_lifetime() {
        let key = EncodingKey::from_secret(b"issuer-only-knows");
        let claims = serde_json::json!({ "sub": "harness" });
        let token = encode(&Header::default(), &claims, &key).unwrap();
        assert!(jwt_lifetime(&token).is_none());

        let expired = chrono::Utc::now().timestamp() - 60;
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "harness", "exp": expired }),
            &key,
        )
        .unwrap();
        assert_eq!(jwt_lifetime(&token), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn static_token_is_returned_verbatim() {
        let source = token_source(&AuthMethod::Token("abc".into()), reqwest::Client::new());
        assert_eq!(source.token().await.unwrap(), "abc");
    }
}
