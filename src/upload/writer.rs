//! Atomic, size-bounded file writes (spec §4.8): write to a `.tmp` sibling
//! then rename over the destination, so a concurrent reader (an HTTP
//! segment handler) never observes a partially written file.

use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::error::UploadError;

/// Writes `data` to `path` atomically, refusing uploads over `limit` bytes.
pub async fn write_atomic(path: &Path, data: &[u8], limit: u64) -> Result<(), UploadError> {
    if data.len() as u64 > limit {
        return Err(UploadError::OversizeUpload { limit });
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("")
    ));
    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_atomic_writes_then_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.ts");
        write_atomic(&path, b"hello", 1024).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
        assert!(!dir.path().join("segment.tmp").exists());
    }

    #[tokio::test]
    async fn write_atomic_rejects_oversize_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.ts");
        let result = write_atomic(&path, b"hello world", 4).await;
        assert!(matches!(result, Err(UploadError::OversizeUpload { limit: 4 })));
    }
}
