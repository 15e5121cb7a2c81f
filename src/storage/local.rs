//! Local filesystem helpers.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::StorageError;

const READ_BUF: usize = 64 * 1024;

/// Incremental SHA-256 producing lowercase hex.
#[derive(Default)]
pub(crate) struct StreamingDigest(Sha256);

impl StreamingDigest {
    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    pub(crate) fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

pub(crate) async fn hash_file(path: &Path) -> Result<String, StorageError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| StorageError::io(path.display(), e))?;
    let mut digest = StreamingDigest::default();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::io(path.display(), e))?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish())
}

pub(crate) async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(parent.display(), e))?;
    }
    Ok(())
}

/// Copy through a temporary sibling so the destination appears atomically.
pub(crate) async fn copy_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    ensure_parent(dst).await?;
    let src: PathBuf = src.to_path_buf();
    let dst: PathBuf = dst.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let parent = dst.parent().unwrap_or_else(|| Path::new("."));
        let mut staged =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| StorageError::io(parent.display(), e))?;
        let mut source = std::fs::File::open(&src).map_err(|e| StorageError::io(src.display(), e))?;
        std::io::copy(&mut source, staged.as_file_mut())
            .map_err(|e| StorageError::io(dst.display(), e))?;
        staged
            .persist(&dst)
            .map_err(|e| StorageError::io(dst.display(), e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| StorageError::io("blocking copy task", std::io::Error::other(e)))?
}

/// Rename, falling back to copy + remove across filesystems.
pub(crate) async fn rename_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    ensure_parent(dst).await?;
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(StorageError::NotFound(src.display().to_string()))
        }
        Err(e) => {
            debug!(from = %src.display(), to = %dst.display(), error = %e, "rename failed, copying instead");
            copy_file(src, dst).await?;
            tokio::fs::remove_file(src)
                .await
                .map_err(|e| StorageError::io(src.display(), e))
        }
    }
}
