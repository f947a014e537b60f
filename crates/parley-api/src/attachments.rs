use std::path::{Path as FsPath, PathBuf};

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use parley_types::api::{Claims, UploadAttachmentQuery};
use parley_types::models::{Attachment, MAX_ATTACHMENT_SIZE, ValidationError};

use crate::error::ApiError;
use crate::state::AppState;

/// Local-disk blob storage for message attachments.
///
/// Blobs are content addressed: the id is the hex SHA-256 of the bytes, so
/// uploading the same file twice stores it once. Display metadata lives in a
/// `{id}.json` sidecar next to the blob.
pub struct AttachmentStore {
    dir: PathBuf,
    public_url: String,
}

#[derive(Serialize, Deserialize)]
struct Sidecar {
    name: String,
    mime: String,
}

impl AttachmentStore {
    pub fn new(dir: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, id: &str) -> String {
        format!("{}/attachments/{}", self.public_url, id)
    }

    pub async fn put(&self, bytes: &[u8], name: &str, mime: &str) -> std::io::Result<Attachment> {
        let id = hex::encode(Sha256::digest(bytes));

        tokio::fs::create_dir_all(&self.dir).await?;
        let blob_path = self.dir.join(&id);
        if tokio::fs::try_exists(&blob_path).await? {
            info!("attachment {} already stored", id);
        } else {
            write_then_rename(&blob_path, bytes).await?;
        }

        let sidecar = Sidecar {
            name: name.to_string(),
            mime: mime.to_string(),
        };
        let json = serde_json::to_vec(&sidecar).map_err(std::io::Error::other)?;
        write_then_rename(&self.dir.join(format!("{}.json", id)), &json).await?;

        Ok(Attachment {
            url: self.url_for(&id),
            name: name.to_string(),
            size: bytes.len() as u64,
            mime: mime.to_string(),
        })
    }

    /// Blob bytes plus the stored mime type, or `None` if unknown.
    pub async fn get(&self, id: &str) -> std::io::Result<Option<(Vec<u8>, String)>> {
        let blob_path = self.dir.join(id);
        let bytes = match tokio::fs::read(&blob_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mime = match tokio::fs::read(self.dir.join(format!("{}.json", id))).await {
            Ok(raw) => serde_json::from_slice::<Sidecar>(&raw)
                .map(|s| s.mime)
                .unwrap_or_else(|_| "application/octet-stream".into()),
            Err(_) => "application/octet-stream".into(),
        };
        Ok(Some((bytes, mime)))
    }
}

fn is_blob_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// A reader never sees a partial file. Each writer gets its own temp name.
async fn write_then_rename(path: &FsPath, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("{}.part", Uuid::new_v4().simple()));
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp, path).await
}

/// POST /attachments?name=..&mime=.. with the raw bytes as the body.
pub async fn upload(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<UploadAttachmentQuery>,
    bytes: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("empty upload".into()));
    }
    if bytes.len() as u64 > MAX_ATTACHMENT_SIZE {
        return Err(ValidationError::AttachmentTooLarge {
            max: MAX_ATTACHMENT_SIZE,
        }
        .into());
    }
    let name = query.name.trim();
    if name.is_empty() {
        return Err(ValidationError::AttachmentIncomplete("name").into());
    }
    if query.mime.trim().is_empty() {
        return Err(ValidationError::AttachmentIncomplete("mime").into());
    }

    let attachment = state
        .attachments
        .put(&bytes, name, query.mime.trim())
        .await
        .map_err(|e| {
            error!("failed to store attachment from {}: {}", claims.sub, e);
            ApiError::internal(e)
        })?;
    info!(
        "{} uploaded {} ({} bytes)",
        claims.username, attachment.name, attachment.size
    );

    Ok((StatusCode::CREATED, Json(attachment)))
}

/// GET /attachments/{id}
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // Ids are only ever hex digests; anything else could escape the directory.
    if !is_blob_id(&id) {
        return Err(ApiError::BadRequest("invalid attachment id".into()));
    }

    let (bytes, mime) = state
        .attachments
        .get(&id)
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::NotFound)?;

    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("parley-attachments-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn identical_uploads_share_a_blob() {
        let dir = temp_dir();
        let store = AttachmentStore::new(&dir, "http://localhost:3210/");

        let first = store.put(b"hello", "a.txt", "text/plain").await.unwrap();
        let second = store.put(b"hello", "b.txt", "text/plain").await.unwrap();
        assert_eq!(first.url, second.url);
        assert!(first.url.starts_with("http://localhost:3210/attachments/"));
        assert_eq!(first.size, 5);

        let id = first.url.rsplit('/').next().unwrap();
        let (bytes, mime) = store.get(id).await.unwrap().unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(mime, "text/plain");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_uploads_all_succeed() {
        let dir = temp_dir();
        let store = std::sync::Arc::new(AttachmentStore::new(&dir, "http://x"));
        let payload = vec![7u8; 256 * 1024];

        let uploads: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    store.put(&payload, &format!("copy-{}.bin", i), "application/octet-stream").await
                })
            })
            .collect();
        for upload in uploads {
            upload.await.unwrap().unwrap();
        }

        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());

        let id = hex::encode(Sha256::digest(&payload));
        let (bytes, _) = store.get(&id).await.unwrap().unwrap();
        assert_eq!(bytes, payload);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unknown_blob_is_none() {
        let store = AttachmentStore::new(temp_dir(), "http://x");
        let missing = "0".repeat(64);
        assert!(store.get(&missing).await.unwrap().is_none());
    }

    #[test]
    fn blob_ids_are_lowercase_hex_digests() {
        assert!(is_blob_id(&"ab".repeat(32)));
        assert!(!is_blob_id(&"AB".repeat(32)));
        assert!(!is_blob_id("../../etc/passwd"));
        assert!(!is_blob_id(&"a".repeat(63)));
    }
}
