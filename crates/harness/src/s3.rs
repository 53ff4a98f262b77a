//! Object-store listing used to verify cloud snapshots.

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use tracing::debug;

use crate::config::S3Settings;
use crate::error::{HarnessError, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Keys of every object whose key starts with `prefix`.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn count_objects(&self, prefix: &str) -> Result<usize> {
        Ok(self.list_keys(prefix).await?.len())
    }
}

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Client with static credentials. Path-style addressing keeps
    /// S3-compatible endpoints (MinIO and friends) working.
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "pds-harness",
        );
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(settings.region.clone()))
            .endpoint_url(settings.endpoint_url())
            .force_path_style(true)
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: settings.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    HarnessError::ObjectStore(format!(
                        "listing s3://{}/{}: {}",
                        self.bucket,
                        prefix,
                        DisplayErrorContext(e)
                    ))
                })?;

            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );
            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        debug!(bucket = %self.bucket, prefix, objects = keys.len(), "listed objects");
        Ok(keys)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory bucket.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        pub(crate) keys: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        pub(crate) fn with_keys(keys: &[&str]) -> Self {
            Self {
                keys: Mutex::new(keys.iter().map(|k| k.to_string()).collect()),
            }
        }

        pub(crate) fn remove_prefix(&self, prefix: &str) {
            self.keys.lock().unwrap().retain(|k| !k.starts_with(prefix));
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .keys
                .lock()
                .unwrap()
                .iter()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn count_uses_prefix() {
        let store = MemoryStore::with_keys(&["cas/a/1", "cas/a/2", "cas/b/1"]);
        assert_eq!(store.count_objects("cas/a/").await.unwrap(), 2);
        store.remove_prefix("cas/a/");
        assert_eq!(store.count_objects("cas/a/").await.unwrap(), 0);
        assert_eq!(store.count_objects("cas/").await.unwrap(), 1);
    }

    #[test]
    fn store_keeps_bucket() {
        let store = S3ObjectStore::new(&S3Settings {
            endpoint: "minio.local:9000".into(),
            bucket: "pds-backups".into(),
            region: "us-east-1".into(),
            access_key: "minio".into(),
            secret_key: "minio123".into(),
        });
        assert_eq!(store.bucket(), "pds-backups");
    }
}
