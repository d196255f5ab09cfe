//! Local-directory uploader.
//!
//! Stands in for object storage on single-node deployments: artifacts are
//! copied under a root directory and served by whatever fronts that
//! directory at `public_base`.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ExecError, ExecResult};
use crate::ports::Uploader;

/// Copies artifacts into `root/<object_key>`.
#[derive(Debug, Clone)]
pub struct LocalDirUploader {
    root: PathBuf,
    public_base: String,
}

impl LocalDirUploader {
    /// Create an uploader writing under `root` and answering `<public_base>/<key>`.
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        let public_base = public_base.into().trim_end_matches('/').to_string();
        Self { root: root.into(), public_base }
    }

    /// Public base derived from bucket and endpoint: `https://<bucket>.<endpoint host>`.
    pub fn bucket_base(bucket: &str, endpoint: &str) -> String {
        let (scheme, host) = endpoint.split_once("://").unwrap_or(("https", endpoint));
        format!("{}://{}.{}", scheme, bucket, host.trim_end_matches('/'))
    }

    fn target(&self, object_key: &str) -> ExecResult<PathBuf> {
        let key = Path::new(object_key);
        if object_key.is_empty() || !key.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(ExecError::Upload(format!("invalid object key: {}", object_key)));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl Uploader for LocalDirUploader {
    async fn upload(&self, local_path: &Path, object_key: &str) -> ExecResult<String> {
        let target = self.target(object_key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target).await?;
        debug!(key = object_key, path = %target.display(), "Stored artifact");
        Ok(format!("{}/{}", self.public_base, object_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_copies_under_root() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), b"video").unwrap();

        let uploader = LocalDirUploader::new(root.path(), "https://files.example/");
        let url = uploader.upload(src.path(), "tasks/7/out.mp4").await.unwrap();

        assert_eq!(url, "https://files.example/tasks/7/out.mp4");
        assert_eq!(std::fs::read(root.path().join("tasks/7/out.mp4")).unwrap(), b"video");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let root = tempfile::tempdir().unwrap();
        let src = tempfile::NamedTempFile::new().unwrap();
        let uploader = LocalDirUploader::new(root.path(), "https://files");

        for key in ["../etc/passwd", "/abs", "", "a/../../b"] {
            assert!(matches!(uploader.upload(src.path(), key).await, Err(ExecError::Upload(_))));
        }
    }

    #[test]
    fn test_bucket_base() {
        assert_eq!(
            LocalDirUploader::bucket_base("media", "https://oss-cn-beijing.aliyuncs.com"),
            "https://media.oss-cn-beijing.aliyuncs.com"
        );
        assert_eq!(
            LocalDirUploader::bucket_base("media", "oss-cn-beijing.aliyuncs.com/"),
            "https://media.oss-cn-beijing.aliyuncs.com"
        );
    }
}
