//! Transcript blob storage.
//!
//! Uploads land under a key derived from the workspace canonical id and
//! session id. The filesystem implementation is the default; the in-memory
//! implementation backs tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::PathBuf;

/// Key for a session transcript blob.
#[must_use]
pub fn transcript_key(canonical_id: &str, session_id: &str) -> String {
    let workspace = canonical_id.replace(['/', ':'], "-");
    format!("transcripts/{workspace}/{session_id}.jsonl")
}

/// Content-addressed-ish blob storage seam.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under the key, overwriting any previous content.
    async fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()>;

    /// Fetch the bytes under the key, or None when absent.
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Blob store rooted in a local directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root` (created lazily on first put).
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Keys are slash-separated relative paths; reject anything that could
    /// escape the root.
    fn resolve(&self, key: &str) -> io::Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob key: {key}"),
            ));
        }
        Ok(self.root.join(key))
    }
}

impl std::fmt::Debug for FsBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsBlobStore").field("root", &self.root).finish()
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await
    }

    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// In-memory blob store for tests.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        self.blobs.insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_key_flattens_separators() {
        assert_eq!(
            transcript_key("github.com/u/r", "cc-1"),
            "transcripts/github.com-u-r/cc-1.jsonl"
        );
        assert_eq!(
            transcript_key("local:abc123", "cc-2"),
            "transcripts/local-abc123/cc-2.jsonl"
        );
    }

    #[tokio::test]
    async fn test_fs_round_trip_and_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());

        assert!(store.get("transcripts/w/cc-1.jsonl").await.unwrap().is_none());
        store.put("transcripts/w/cc-1.jsonl", b"line\n").await.unwrap();
        assert_eq!(
            store.get("transcripts/w/cc-1.jsonl").await.unwrap().unwrap(),
            b"line\n"
        );
    }

    #[tokio::test]
    async fn test_fs_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().to_path_buf());
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.put("/absolute", b"x").await.is_err());
        assert!(store.get("a//b").await.is_err());
    }
}
