//! Filesystem-backed bucket store
//!
//! Single-node stand-in for object storage: each bucket is a directory
//! under a configured root and each key is a file inside it.

use anyhow::{Context, Result};
use fleet_core::caps::{async_trait, BucketStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct FsBucketStore {
    root: PathBuf,
}

impl FsBucketStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        // Keys like "name.snapshot.json" are flat; refuse path traversal
        // by taking only the file name component.
        let file = Path::new(key)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("_"));
        self.root.join(bucket).join(file)
    }
}

#[async_trait]
impl BucketStore for FsBucketStore {
    async fn push(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.object_path(bucket, key);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("could not create bucket directory {}", dir.display()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("could not write object {}", path.display()))
    }

    async fn fetch(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(bucket, key);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("could not read object {}", path.display()))
            }
        }
    }
}
