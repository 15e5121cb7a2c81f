//! Lazy, restartable listing below a [`StoragePath`].
//!
//! Local listings walk the directory tree in file-name order. Remote
//! listings fetch one page at a time and follow continuation tokens, so
//! memory stays bounded by a single page regardless of prefix size.

use std::collections::VecDeque;

use super::{Location, StoragePath};
use crate::error::StorageError;

pub struct PathLister {
    root: StoragePath,
    state: ListState,
}

enum ListState {
    Local(Option<walkdir::IntoIter>),
    Remote {
        buffer: VecDeque<super::ObjectMeta>,
        token: Option<String>,
        exhausted: bool,
    },
}

impl PathLister {
    pub(crate) fn new(root: StoragePath) -> Self {
        let state = Self::initial_state(&root);
        Self { root, state }
    }

    fn initial_state(root: &StoragePath) -> ListState {
        match root.location() {
            Location::Local(path) => {
                // A missing root lists as empty.
                let walker = path.exists().then(|| {
                    walkdir::WalkDir::new(path)
                        .follow_links(false)
                        .sort_by_file_name()
                        .into_iter()
                });
                ListState::Local(walker)
            }
            Location::Remote { .. } => ListState::Remote {
                buffer: VecDeque::new(),
                token: None,
                exhausted: false,
            },
        }
    }

    /// Start over from the first entry.
    pub fn restart(&mut self) {
        self.state = Self::initial_state(&self.root);
    }

    /// Next file or object, or `None` once the listing is exhausted.
    pub async fn next(&mut self) -> Result<Option<StoragePath>, StorageError> {
        match &mut self.state {
            ListState::Local(walker) => {
                let Some(iter) = walker.as_mut() else {
                    return Ok(None);
                };
                for entry in iter.by_ref() {
                    let entry = entry.map_err(|e| {
                        let path = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| self.root.address());
                        StorageError::io(path, std::io::Error::other(e))
                    })?;
                    if entry.file_type().is_file() {
                        return Ok(Some(self.root.storage().local_path(entry.path())));
                    }
                }
                Ok(None)
            }
            ListState::Remote {
                buffer,
                token,
                exhausted,
            } => {
                let Location::Remote { bucket, key } = self.root.location() else {
                    return Ok(None);
                };
                loop {
                    if let Some(object) = buffer.pop_front() {
                        let path = self
                            .root
                            .storage()
                            .path(&format!("s3://{}/{}", bucket, object.key))?;
                        return Ok(Some(match object.sha256 {
                            Some(hash) => path.with_content_hash(hash),
                            None => path,
                        }));
                    }
                    if *exhausted {
                        return Ok(None);
                    }

                    let prefix = if key.is_empty() {
                        String::new()
                    } else {
                        format!("{}/", key)
                    };
                    let store = self.root.storage().object_store(&self.root.address())?;
                    let page = store.list_page(bucket, &prefix, token.as_deref()).await?;
                    buffer.extend(page.objects.into_iter().filter(|o| !o.key.ends_with('/')));
                    *exhausted = page.next_token.is_none();
                    *token = page.next_token;
                }
            }
        }
    }

    /// Drain the listing into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<StoragePath>, StorageError> {
        let mut out = Vec::new();
        while let Some(path) = self.next().await? {
            out.push(path);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::{MemoryStore, ObjectStore, Storage};

    #[tokio::test]
    async fn local_listing_is_sorted_and_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), "c").unwrap();

        let storage = Storage::local();
        let names: Vec<String> = storage
            .local_path(dir.path())
            .list()
            .collect_all()
            .await
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn missing_local_root_lists_empty() {
        let storage = Storage::local();
        let items = storage
            .local_path("/definitely/not/here/intake")
            .list()
            .collect_all()
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn remote_listing_follows_pages_and_respects_prefix_boundary() {
        let store = Arc::new(MemoryStore::new().with_page_size(2));
        for key in ["in/1.pdf", "in/2.pdf", "in/3.pdf", "in/sub/4.pdf", "inbox/5.pdf"] {
            store
                .put("b", key, b"x".to_vec(), "application/pdf")
                .await
                .unwrap();
        }
        store.put("b", "in/dir/", Vec::new(), "").await.unwrap();

        let storage = Storage::with_object_store(store, None).unwrap();
        let mut lister = storage.path("s3://b/in").unwrap().list();
        let mut names = Vec::new();
        while let Some(p) = lister.next().await.unwrap() {
            names.push(p.address());
        }
        assert_eq!(
            names,
            vec!["s3://b/in/1.pdf", "s3://b/in/2.pdf", "s3://b/in/3.pdf", "s3://b/in/sub/4.pdf"]
        );

        lister.restart();
        assert_eq!(lister.next().await.unwrap().unwrap().address(), "s3://b/in/1.pdf");
    }
}
