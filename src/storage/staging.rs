//! Closure-scoped access to a path as a local file or as a remote object.
//!
//! Tools that only read local files get a temporary download of a remote
//! object; tools that only take object addresses get a temporary upload of a
//! local file. The temporary copy is removed when the closure's future
//! completes, fails, or is dropped.

use std::future::Future;
use std::path::PathBuf;

use tracing::warn;

use super::{Location, StoragePath};
use crate::error::StorageError;

/// Deletes a temporary object when released or dropped.
struct TempObjectGuard {
    object: Option<StoragePath>,
}

impl TempObjectGuard {
    fn new(object: StoragePath) -> Self {
        Self {
            object: Some(object),
        }
    }

    async fn release(mut self) {
        if let Some(object) = self.object.take() {
            if let Err(e) = object.delete().await {
                warn!(path = %object, error = %e, "failed to remove temporary object");
            }
        }
    }
}

impl Drop for TempObjectGuard {
    fn drop(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = object.delete().await {
                    warn!(path = %object, error = %e, "failed to remove temporary object");
                }
            });
        }
    }
}

fn temp_file(path: &StoragePath) -> Result<tempfile::NamedTempFile, StorageError> {
    tempfile::Builder::new()
        .prefix("intake-")
        .suffix(path.suffix())
        .tempfile()
        .map_err(|e| StorageError::io("temporary file", e))
}

impl StoragePath {
    /// Run `f` with a local file holding this path's content.
    ///
    /// Local paths are passed through unchanged. Remote objects are
    /// downloaded to a temporary file that is deleted afterwards.
    pub async fn read_as_file<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        match self.location() {
            Location::Local(path) => f(path.clone()).await,
            Location::Remote { .. } => {
                let mut staged = temp_file(self)?;
                self.download_into(staged.as_file_mut()).await?;
                let result = f(staged.path().to_path_buf()).await;
                drop(staged);
                result
            }
        }
    }

    /// Run `f` with a local file path whose content becomes this path's
    /// content if `f` succeeds.
    pub async fn write_as_file<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        match self.location() {
            Location::Local(path) => {
                super::local::ensure_parent(path).await?;
                f(path.clone()).await
            }
            Location::Remote { .. } => {
                let staged = temp_file(self)?;
                let value = f(staged.path().to_path_buf()).await?;
                let local = self.storage().local_path(staged.path());
                local.copy(self, false).await?;
                drop(staged);
                Ok(value)
            }
        }
    }

    /// Run `f` with a remote object holding this path's content.
    ///
    /// Remote paths are passed through unchanged. Local files are uploaded
    /// below `storage.tmp_prefix` and the temporary object is deleted
    /// afterwards.
    pub async fn read_as_object<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(StoragePath) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        if self.is_remote() {
            return f(self.clone()).await;
        }
        let staged = self.storage().temp_object(self.name())?;
        self.copy(&staged, false).await?;
        let guard = TempObjectGuard::new(staged.clone());
        let result = f(staged).await;
        guard.release().await;
        result
    }

    /// Run `f` with a remote object path whose content is copied here if `f`
    /// succeeds.
    pub async fn write_as_object<T, E, F, Fut>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(StoragePath) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StorageError>,
    {
        if self.is_remote() {
            return f(self.clone()).await;
        }
        let staged = self.storage().temp_object(self.name())?;
        let guard = TempObjectGuard::new(staged.clone());
        let result = match f(staged.clone()).await {
            Ok(value) => staged.copy(self, false).await.map(|_| value).map_err(E::from),
            Err(e) => Err(e),
        };
        guard.release().await;
        result
    }
}
