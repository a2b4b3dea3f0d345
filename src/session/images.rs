//! Materialize inline image attachments to temp files

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::types::{AgentError, ImageAttachment, Result};

/// File extension for an image MIME type
fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "png",
    }
}

/// Decode each attachment into `dir` and return the written paths
pub async fn materialize_images(dir: &Path, images: &[ImageAttachment]) -> Result<Vec<PathBuf>> {
    if images.is_empty() {
        return Ok(Vec::new());
    }

    tokio::fs::create_dir_all(dir).await?;

    let mut paths = Vec::with_capacity(images.len());
    for image in images {
        let bytes = STANDARD
            .decode(image.data.trim())
            .map_err(|e| AgentError::internal(format!("invalid image data: {e}")))?;
        let path = dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            extension_for(&image.media_type)
        ));
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), media_type = %image.media_type, "Materialized image attachment");
        paths.push(path);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_materialize_writes_decoded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![ImageAttachment {
            media_type: "image/jpeg".to_string(),
            data: STANDARD.encode(b"fake-jpeg"),
        }];

        let paths = materialize_images(dir.path(), &images).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].extension().unwrap(), "jpg");
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"fake-jpeg");
    }

    #[tokio::test]
    async fn test_invalid_base64_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let images = vec![ImageAttachment {
            media_type: "image/png".to_string(),
            data: "***".to_string(),
        }];
        assert!(materialize_images(dir.path(), &images).await.is_err());
    }

    #[tokio::test]
    async fn test_no_images_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never-created");
        assert!(materialize_images(&missing, &[]).await.unwrap().is_empty());
        assert!(!missing.exists());
    }
}
