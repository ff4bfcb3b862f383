use async_trait::async_trait;
use reqwest::Client;

use crate::config::Config;
use crate::storage::{object_path, BlobStore, StorageError};

/// Blob store speaking the Supabase storage REST API
#[derive(Clone)]
pub struct HttpBlobStore {
    client: Client,
    base_url: String,
    api_key: String,
    bucket: String,
}

impl HttpBlobStore {
    pub fn new(base_url: &str, api_key: &str, bucket: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            bucket: bucket.to_string(),
        }
    }

    /// Build from `STORAGE_URL` / `STORAGE_KEY` / `STORAGE_BUCKET`.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        match (&config.storage_url, &config.storage_key) {
            (Some(url), Some(key)) => Ok(Self::new(url, key, &config.storage_bucket)),
            _ => Err(StorageError::NotConfigured),
        }
    }

    fn upload_url(&self, path: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, path)
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url, self.bucket, path
        )
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError> {
        let path = object_path(name);
        let size = bytes.len();

        let res = self
            .client
            .post(self.upload_url(&path))
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StorageError::Request(e.to_string()))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            tracing::warn!(path = %path, status = status.as_u16(), "Attachment upload rejected");
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(path = %path, size, "Attachment uploaded");
        Ok(self.public_url(&path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use pretty_assertions::assert_eq;

    #[test]
    fn urls_follow_bucket_layout() {
        let store = HttpBlobStore::new("https://files.example.com/", "key", "paritalk-files");
        assert_eq!(
            store.upload_url("chat-files/1_abc.png"),
            "https://files.example.com/storage/v1/object/paritalk-files/chat-files/1_abc.png"
        );
        assert_eq!(
            store.public_url("chat-files/1_abc.png"),
            "https://files.example.com/storage/v1/object/public/paritalk-files/chat-files/1_abc.png"
        );
    }

    #[test]
    fn unconfigured_storage_is_reported() {
        let config = test_config("alice");
        assert!(matches!(
            HttpBlobStore::from_config(&config),
            Err(StorageError::NotConfigured)
        ));
    }
}
