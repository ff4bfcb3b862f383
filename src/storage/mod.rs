//! Blob storage for chat attachments.

pub mod http;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

pub use http::HttpBlobStore;

/// Folder every attachment is stored under
pub const ATTACHMENT_FOLDER: &str = "chat-files";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Blob storage is not configured")]
    NotConfigured,

    #[error("Upload request failed: {0}")]
    Request(String),

    #[error("Storage rejected upload ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a fresh object path derived from `name` and return
    /// its public URL.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String, StorageError>;
}

fn random_suffix() -> String {
    const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..9)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect()
}

/// `chat-files/{millis}_{9 base36 chars}.{ext}`, keeping the extension of
/// `name` (`bin` when it has none).
pub fn object_path(name: &str) -> String {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
        .unwrap_or("bin");
    format!(
        "{}/{}_{}.{}",
        ATTACHMENT_FOLDER,
        Utc::now().timestamp_millis(),
        random_suffix(),
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_paths_keep_extension_and_are_unique() {
        let a = object_path("holiday.photo.jpg");
        let b = object_path("holiday.photo.jpg");
        assert!(a.starts_with("chat-files/"));
        assert!(a.ends_with(".jpg"));
        assert_ne!(a, b);

        let file = a.trim_start_matches("chat-files/").trim_end_matches(".jpg");
        let (millis, suffix) = file.split_once('_').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn names_without_extension_fall_back_to_bin() {
        assert!(object_path("README").ends_with(".bin"));
        assert!(object_path("trailing.").ends_with(".bin"));
    }
}
