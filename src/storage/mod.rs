//! Storage path abstraction over local files and remote objects.
//!
//! A [`StoragePath`] names either a local filesystem path or an object in a
//! remote bucket (`s3://bucket/key`) and offers one set of operations for both:
//! read, write, copy, move, list, delete, and content hashing. Copy and move
//! accept every backend combination through a single call; remote-to-remote
//! copies happen server-side.
//!
//! # Content identity
//!
//! [`StoragePath::content_hash`] is the lowercase hex SHA-256 of the object's
//! bytes on every backend. Local files are hashed by streaming them through
//! the digest. Remote objects report the digest as backend metadata
//! (`x-amz-checksum-sha256`, set on every upload this crate performs); objects
//! without a full-object checksum are hashed by streaming download. The value
//! is computed once per path value and shared by its clones.
//!
//! # Backends
//!
//! ```text
//! StoragePath ──▶ Location::Local ──▶ tokio::fs / walkdir
//!             └─▶ Location::Remote ──▶ dyn ObjectStore ──▶ S3Store | MemoryStore
//! ```
//!
//! The remote client is opened lazily on first use and reused for every path
//! created from the same [`Storage`].

pub mod list;
mod local;
pub mod memory;
pub mod retry;
pub mod s3;
mod staging;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::{S3Config, StorageConfig};
use crate::error::StorageError;

pub use list::PathLister;
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use s3::S3Store;

/// Address scheme for remote objects.
pub const REMOTE_SCHEME: &str = "s3://";

// ═══════════════════════════════════════════════════════════════════════
// Object store trait
// ═══════════════════════════════════════════════════════════════════════

/// Metadata about one remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// Hex SHA-256 of the full object, when the backend tracks it.
    pub sha256: Option<String>,
    pub content_type: Option<String>,
}

/// One page of a listing plus the token to fetch the next one.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ObjectMeta>,
    pub next_token: Option<String>,
}

/// Receives downloaded bytes chunk by chunk.
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> std::io::Result<()> + Send + 'a;

/// Operations a remote backend must provide.
///
/// Implementations are shared behind an `Arc` by every [`StoragePath`] of a
/// [`Storage`], so they must be `Send + Sync`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata for an object, or `None` if it does not exist.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError>;

    /// Stream an object's bytes into `sink`. Returns the number of bytes read.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut ChunkSink<'_>,
    ) -> Result<u64, StorageError>;

    /// Create or replace an object.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Server-side copy. Fails with [`StorageError::NotFound`] if the source is missing.
    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StorageError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// List one page of objects under `prefix`.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Location
// ═══════════════════════════════════════════════════════════════════════

/// Backend tag plus backend-specific address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

impl Location {
    /// Parse an address: `s3://bucket/key`, `file:///path`, or a plain path.
    pub fn parse(address: &str) -> Result<Self, StorageError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(StorageError::InvalidAddress(address.to_string()));
        }

        if let Some(rest) = trimmed.strip_prefix(REMOTE_SCHEME) {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(StorageError::InvalidAddress(address.to_string()));
            }
            return Ok(Location::Remote {
                bucket: bucket.to_string(),
                key: normalize_key(key),
            });
        }

        let local = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        if local.contains("://") {
            return Err(StorageError::InvalidAddress(address.to_string()));
        }
        Ok(Location::Local(normalize_local(Path::new(local))))
    }

    /// Append a relative path.
    pub fn join(&self, relative: &str) -> Location {
        match self {
            Location::Local(path) => Location::Local(normalize_local(&path.join(relative))),
            Location::Remote { bucket, key } => Location::Remote {
                bucket: bucket.clone(),
                key: normalize_key(&format!("{}/{}", key, relative)),
            },
        }
    }

    /// Final path component (file or object name).
    pub fn name(&self) -> &str {
        match self {
            Location::Local(path) => path.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            Location::Remote { key, .. } => key.rsplit('/').next().unwrap_or(key),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    /// `true` if `self` lies strictly below `other` on the same backend.
    pub fn is_within(&self, other: &Location) -> bool {
        match (self, other) {
            (Location::Local(a), Location::Local(b)) => a != b && a.starts_with(b),
            (
                Location::Remote { bucket: ba, key: ka },
                Location::Remote { bucket: bb, key: kb },
            ) => ba == bb && ka != kb && (kb.is_empty() || ka.starts_with(&format!("{}/", kb))),
            _ => false,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote { bucket, key } => write!(f, "{}{}/{}", REMOTE_SCHEME, bucket, key),
        }
    }
}

fn normalize_key(key: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in key.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// Absolute, lexically normalized path (no `.` or `..` components).
fn normalize_local(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// Storage handle
// ═══════════════════════════════════════════════════════════════════════

/// Factory for [`StoragePath`]s sharing one lazily opened remote client.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    remote: OnceLock<Arc<dyn ObjectStore>>,
    s3: Option<S3Config>,
    tmp_prefix: Option<Location>,
    retry: RetryPolicy,
}

impl Storage {
    /// Build from the `[storage]` section. The S3 client is not created
    /// until a remote path is first touched.
    pub fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let tmp_prefix = config
            .tmp_prefix
            .as_deref()
            .map(Location::parse)
            .transpose()?;
        Ok(Self {
            inner: Arc::new(StorageInner {
                remote: OnceLock::new(),
                s3: config.s3.clone(),
                tmp_prefix,
                retry: RetryPolicy::new(config.max_retries),
            }),
        })
    }

    /// Storage whose remote paths resolve to the given object store.
    pub fn with_object_store(
        store: Arc<dyn ObjectStore>,
        tmp_prefix: Option<&str>,
    ) -> Result<Self, StorageError> {
        let remote = OnceLock::new();
        let _ = remote.set(store);
        Ok(Self {
            inner: Arc::new(StorageInner {
                remote,
                s3: None,
                tmp_prefix: tmp_prefix.map(Location::parse).transpose()?,
                retry: RetryPolicy::default(),
            }),
        })
    }

    /// Storage without any remote backend configured. Remote addresses fall
    /// back to S3 with credentials and region from the environment.
    pub fn local() -> Self {
        Self {
            inner: Arc::new(StorageInner {
                remote: OnceLock::new(),
                s3: None,
                tmp_prefix: None,
                retry: RetryPolicy::default(),
            }),
        }
    }

    /// Construct a path from an address string.
    pub fn path(&self, address: &str) -> Result<StoragePath, StorageError> {
        Ok(self.at(Location::parse(address)?))
    }

    /// Construct a path for a local filesystem location.
    pub fn local_path(&self, path: impl AsRef<Path>) -> StoragePath {
        self.at(Location::Local(normalize_local(path.as_ref())))
    }

    fn at(&self, location: Location) -> StoragePath {
        StoragePath {
            location,
            storage: self.clone(),
            content_hash: Arc::new(OnceCell::new()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.retry
    }

    pub(crate) fn object_store(&self, address: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        if let Some(store) = self.inner.remote.get() {
            return Ok(store.clone());
        }
        let s3 = self.inner.s3.clone().unwrap_or_default();
        let store: Arc<dyn ObjectStore> = Arc::new(
            S3Store::from_env(&s3, self.inner.retry)
                .map_err(|e| StorageError::NoRemoteStore(format!("{}: {}", address, e)))?,
        );
        debug!(region = %s3.region, "opened remote object store");
        Ok(self.inner.remote.get_or_init(|| store).clone())
    }

    /// A fresh, uniquely named temporary object for `name`.
    pub(crate) fn temp_object(&self, name: &str) -> Result<StoragePath, StorageError> {
        let prefix = self
            .inner
            .tmp_prefix
            .as_ref()
            .filter(|p| p.is_remote())
            .ok_or_else(|| StorageError::NoTempPrefix(name.to_string()))?;
        let unique = format!("tmp-prefix-{}/{}", uuid::Uuid::new_v4(), name);
        Ok(self.at(prefix.join(&unique)))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// StoragePath
// ═══════════════════════════════════════════════════════════════════════

/// A local file or remote object with uniform operations.
///
/// Equality and hashing use the normalized location only. The cached
/// content hash is shared between clones.
#[derive(Clone)]
pub struct StoragePath {
    location: Location,
    storage: Storage,
    content_hash: Arc<OnceCell<String>>,
}

impl PartialEq for StoragePath {
    fn eq(&self, other: &Self) -> bool {
        self.location == other.location
    }
}

impl Eq for StoragePath {}

impl Hash for StoragePath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.location.hash(state);
    }
}

impl fmt::Debug for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StoragePath").field(&self.address()).finish()
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.location.fmt(f)
    }
}

impl StoragePath {
    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Address string that [`Storage::path`] parses back to this path.
    pub fn address(&self) -> String {
        self.location.to_string()
    }

    pub fn is_remote(&self) -> bool {
        self.location.is_remote()
    }

    /// Basename.
    pub fn name(&self) -> &str {
        self.location.name()
    }

    /// Extension including the dot, as written (e.g. `.PDF`), or empty.
    pub fn suffix(&self) -> &str {
        let name = self.name();
        match name.rfind('.') {
            Some(0) | None => "",
            Some(idx) => &name[idx..],
        }
    }

    /// Lowercase extension without the dot; used for type routing.
    pub fn extension(&self) -> Option<String> {
        let suffix = self.suffix();
        (suffix.len() > 1).then(|| suffix[1..].to_ascii_lowercase())
    }

    /// Basename without the extension.
    pub fn stem(&self) -> &str {
        let name = self.name();
        &name[..name.len() - self.suffix().len()]
    }

    /// MIME type inferred from the suffix.
    pub fn mime_type(&self) -> String {
        if self.extension().as_deref() == Some("md") {
            return "text/plain".to_string();
        }
        mime_guess::from_path(self.name())
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    /// Child path. The result has its own (empty) hash cache.
    pub fn join(&self, relative: &str) -> StoragePath {
        self.storage.at(self.location.join(relative))
    }

    /// Path named `name` in the same directory/prefix.
    pub fn sibling(&self, name: &str) -> StoragePath {
        self.join(&format!("../{}", name))
    }

    /// Path of `self` relative to `base`, if `self` lies below it.
    pub fn relative_to(&self, base: &StoragePath) -> Option<String> {
        match (&self.location, &base.location) {
            (Location::Local(p), Location::Local(b)) => p
                .strip_prefix(b)
                .ok()
                .map(|r| r.to_string_lossy().replace('\\', "/"))
                .filter(|r| !r.is_empty()),
            (
                Location::Remote { bucket, key },
                Location::Remote {
                    bucket: base_bucket,
                    key: base_key,
                },
            ) if bucket == base_bucket => {
                if base_key.is_empty() {
                    return Some(key.clone()).filter(|k| !k.is_empty());
                }
                key.strip_prefix(&format!("{}/", base_key))
                    .map(str::to_string)
                    .filter(|r| !r.is_empty())
            }
            _ => None,
        }
    }

    /// Seed the content hash cache (e.g. from listing metadata).
    pub fn with_content_hash(self, hash: impl Into<String>) -> Self {
        let _ = self.content_hash.set(hash.into());
        self
    }

    /// The content hash if it has already been computed.
    pub fn cached_content_hash(&self) -> Option<&str> {
        self.content_hash.get().map(String::as_str)
    }

    fn remote(&self) -> Result<(Arc<dyn ObjectStore>, &str, &str), StorageError> {
        match &self.location {
            Location::Remote { bucket, key } => {
                Ok((self.storage.object_store(&self.address())?, bucket, key))
            }
            Location::Local(_) => Err(StorageError::InvalidAddress(self.address())),
        }
    }

    pub async fn exists(&self) -> Result<bool, StorageError> {
        match &self.location {
            Location::Local(path) => Ok(tokio::fs::try_exists(path)
                .await
                .map_err(|e| StorageError::io(path.display(), e))?),
            Location::Remote { .. } => {
                let (store, bucket, key) = self.remote()?;
                Ok(store.head(bucket, key).await?.is_some())
            }
        }
    }

    /// Size in bytes.
    pub async fn size(&self) -> Result<u64, StorageError> {
        match &self.location {
            Location::Local(path) => Ok(tokio::fs::metadata(path)
                .await
                .map_err(|e| StorageError::io(path.display(), e))?
                .len()),
            Location::Remote { .. } => {
                let (store, bucket, key) = self.remote()?;
                store
                    .head(bucket, key)
                    .await?
                    .map(|meta| meta.size)
                    .ok_or_else(|| StorageError::NotFound(self.address()))
            }
        }
    }

    /// Hex SHA-256 of the content; computed once and cached.
    pub async fn content_hash(&self) -> Result<String, StorageError> {
        let hash = self
            .content_hash
            .get_or_try_init(|| async {
                match &self.location {
                    Location::Local(path) => local::hash_file(path).await,
                    Location::Remote { .. } => self.remote_content_hash().await,
                }
            })
            .await?;
        Ok(hash.clone())
    }

    async fn remote_content_hash(&self) -> Result<String, StorageError> {
        let (store, bucket, key) = self.remote()?;
        let meta = store
            .head(bucket, key)
            .await?
            .ok_or_else(|| StorageError::NotFound(self.address()))?;
        if let Some(sha) = meta.sha256 {
            return Ok(sha);
        }

        debug!(path = %self, "no checksum metadata, hashing by download");
        let mut hasher = local::StreamingDigest::default();
        store
            .get(bucket, key, &mut |chunk: &[u8]| {
                hasher.update(chunk);
                Ok(())
            })
            .await?;
        Ok(hasher.finish())
    }

    pub async fn read_bytes(&self) -> Result<Vec<u8>, StorageError> {
        match &self.location {
            Location::Local(path) => tokio::fs::read(path)
                .await
                .map_err(|e| StorageError::io(path.display(), e)),
            Location::Remote { .. } => {
                let (store, bucket, key) = self.remote()?;
                let mut out = Vec::new();
                store
                    .get(bucket, key, &mut |chunk: &[u8]| {
                        out.extend_from_slice(chunk);
                        Ok(())
                    })
                    .await?;
                Ok(out)
            }
        }
    }

    pub async fn read_text(&self) -> Result<String, StorageError> {
        let bytes = self.read_bytes().await?;
        String::from_utf8(bytes).map_err(|e| {
            StorageError::io(
                self.address(),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Create or replace the file/object. Local parents are created as needed.
    pub async fn write_bytes(&self, bytes: impl Into<Vec<u8>>) -> Result<(), StorageError> {
        let bytes = bytes.into();
        match &self.location {
            Location::Local(path) => {
                local::ensure_parent(path).await?;
                tokio::fs::write(path, bytes)
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))
            }
            Location::Remote { .. } => {
                let (store, bucket, key) = self.remote()?;
                store.put(bucket, key, bytes, &self.mime_type()).await
            }
        }
    }

    pub async fn write_text(&self, text: &str) -> Result<(), StorageError> {
        self.write_bytes(text.as_bytes().to_vec()).await
    }

    /// Open for reading.
    pub async fn open_read(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError> {
        match &self.location {
            Location::Local(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))?;
                Ok(Box::new(file))
            }
            Location::Remote { .. } => {
                let bytes = self.read_bytes().await?;
                Ok(Box::new(std::io::Cursor::new(bytes)))
            }
        }
    }

    /// Open for writing. Call [`PathWriter::finish`] to commit; remote
    /// objects are uploaded with a content type inferred from the suffix.
    pub async fn open_write(&self) -> Result<PathWriter, StorageError> {
        let sink = match &self.location {
            Location::Local(path) => {
                local::ensure_parent(path).await?;
                let file = tokio::fs::File::create(path)
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))?;
                WriterSink::Local(file)
            }
            Location::Remote { .. } => WriterSink::Remote(Vec::new()),
        };
        Ok(PathWriter {
            target: self.clone(),
            sink,
        })
    }

    /// Copy to `dest`, optionally deleting the original afterwards.
    ///
    /// A no-op when both paths denote the same location. A missing source
    /// fails with [`StorageError::NotFound`].
    pub async fn copy(&self, dest: &StoragePath, delete_original: bool) -> Result<(), StorageError> {
        if self == dest {
            return Ok(());
        }

        match (&self.location, &dest.location) {
            (Location::Local(src), Location::Local(dst)) => {
                debug!(from = %self, to = %dest, delete_original, "local transfer");
                if delete_original {
                    local::rename_file(src, dst).await?;
                } else {
                    local::copy_file(src, dst).await?;
                }
            }
            (Location::Local(src), Location::Remote { bucket, key }) => {
                debug!(from = %self, to = %dest, "uploading");
                let body = tokio::fs::read(src)
                    .await
                    .map_err(|e| StorageError::io(src.display(), e))?;
                let store = self.storage.object_store(&dest.address())?;
                store.put(bucket, key, body, &dest.mime_type()).await?;
                if delete_original {
                    self.delete().await?;
                }
            }
            (Location::Remote { .. }, Location::Local(dst)) => {
                debug!(from = %self, to = %dest, "downloading");
                local::ensure_parent(dst).await?;
                let parent = dst.parent().unwrap_or_else(|| Path::new("."));
                let mut staged = tempfile::NamedTempFile::new_in(parent)
                    .map_err(|e| StorageError::io(parent.display(), e))?;
                self.download_into(staged.as_file_mut()).await?;
                staged
                    .persist(dst)
                    .map_err(|e| StorageError::io(dst.display(), e.error))?;
                if delete_original {
                    self.delete().await?;
                }
            }
            (
                Location::Remote { bucket, key },
                Location::Remote {
                    bucket: dst_bucket,
                    key: dst_key,
                },
            ) => {
                debug!(from = %self, to = %dest, "server-side copy");
                let store = self.storage.object_store(&self.address())?;
                store.copy(bucket, key, dst_bucket, dst_key).await?;
                if delete_original {
                    self.delete().await?;
                }
            }
        }

        if let Some(hash) = self.content_hash.get() {
            let _ = dest.content_hash.set(hash.clone());
        }
        Ok(())
    }

    /// Move to `dest` (copy, then delete the original).
    pub async fn move_to(&self, dest: &StoragePath) -> Result<(), StorageError> {
        self.copy(dest, true).await
    }

    pub async fn delete(&self) -> Result<(), StorageError> {
        match &self.location {
            Location::Local(path) => {
                debug!(path = %self, "deleting file");
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| StorageError::io(path.display(), e))
            }
            Location::Remote { .. } => {
                debug!(path = %self, "deleting object");
                let (store, bucket, key) = self.remote()?;
                store.delete(bucket, key).await
            }
        }
    }

    /// Lazily list every file/object below this path.
    pub fn list(&self) -> PathLister {
        PathLister::new(self.clone())
    }

    pub(crate) async fn download_into(&self, file: &mut std::fs::File) -> Result<u64, StorageError> {
        let (store, bucket, key) = self.remote()?;
        let written = store
            .get(bucket, key, &mut |chunk: &[u8]| file.write_all(chunk))
            .await?;
        file.flush().map_err(|e| StorageError::io(self.address(), e))?;
        Ok(written)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Writer
// ═══════════════════════════════════════════════════════════════════════

/// Writable stream returned by [`StoragePath::open_write`].
pub struct PathWriter {
    target: StoragePath,
    sink: WriterSink,
}

enum WriterSink {
    Local(tokio::fs::File),
    Remote(Vec<u8>),
}

impl PathWriter {
    /// Flush and commit the written bytes.
    pub async fn finish(self) -> Result<(), StorageError> {
        match self.sink {
            WriterSink::Local(mut file) => file
                .flush()
                .await
                .map_err(|e| StorageError::io(self.target.address(), e)),
            WriterSink::Remote(bytes) => {
                let (store, bucket, key) = self.target.remote()?;
                store.put(bucket, key, bytes, &self.target.mime_type()).await
            }
        }
    }
}

impl AsyncWrite for PathWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().sink {
            WriterSink::Local(file) => Pin::new(file).poll_write(cx, buf),
            WriterSink::Remote(bytes) => {
                bytes.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().sink {
            WriterSink::Local(file) => Pin::new(file).poll_flush(cx),
            WriterSink::Remote(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().sink {
            WriterSink::Local(file) => Pin::new(file).poll_shutdown(cx),
            WriterSink::Remote(_) => Poll::Ready(Ok(())),
        }
    }
}
