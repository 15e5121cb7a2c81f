//! In-memory [`ObjectStore`] for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ChunkSink, ObjectMeta, ObjectPage, ObjectStore};
use crate::error::StorageError;

#[derive(Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    sha256: String,
}

/// Objects kept in a sorted map keyed by `(bucket, key)`.
///
/// Listing pages are `page_size` objects long so pagination paths get
/// exercised. `without_checksums` hides the SHA-256 metadata to force
/// download-based hashing.
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    page_size: usize,
    checksums: bool,
    downloads: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: 1000,
            checksums: true,
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn without_checksums(mut self) -> Self {
        self.checksums = false;
        self
    }

    /// Keys stored in `bucket`, sorted.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.content_type.clone())
    }

    /// Number of `get` calls served so far.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), StoredObject>> {
        // Every mutation is a single insert or remove.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fetch(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        Ok(self.fetch(bucket, key).map(|o| ObjectMeta {
            key: key.to_string(),
            size: o.bytes.len() as u64,
            sha256: self.checksums.then_some(o.sha256),
            content_type: Some(o.content_type),
        }))
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut ChunkSink<'_>,
    ) -> Result<u64, StorageError> {
        let object = self
            .fetch(bucket, key)
            .ok_or_else(|| StorageError::NotFound(format!("s3://{}/{}", bucket, key)))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        for chunk in object.bytes.chunks(8 * 1024) {
            sink(chunk).map_err(|e| StorageError::io(format!("s3://{}/{}", bucket, key), e))?;
        }
        Ok(object.bytes.len() as u64)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let sha256 = hex::encode(Sha256::digest(&body));
        self.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: body,
                content_type: content_type.to_string(),
                sha256,
            },
        );
        Ok(())
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StorageError> {
        let object = self
            .fetch(src_bucket, src_key)
            .ok_or_else(|| StorageError::NotFound(format!("s3://{}/{}", src_bucket, src_key)))?;
        self.lock()
            .insert((dst_bucket.to_string(), dst_key.to_string()), object);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.lock().remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        let objects = self.lock();
        let mut matching = objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .filter(|((_, k), _)| continuation.map_or(true, |after| k.as_str() > after));

        let mut page = ObjectPage::default();
        for ((_, key), object) in matching.by_ref().take(self.page_size) {
            page.objects.push(ObjectMeta {
                key: key.clone(),
                size: object.bytes.len() as u64,
                sha256: None,
                content_type: None,
            });
        }
        if matching.next().is_some() {
            page.next_token = page.objects.last().map(|o| o.key.clone());
        }
        Ok(page)
    }
}
