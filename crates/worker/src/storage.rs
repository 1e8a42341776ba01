//! 资源文件存储能力
//!
//! Worker 可以不配置存储；需要资源文件的任务在没有存储时会被拒绝。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use scheduler_core::{SchedulerError, SchedulerResult};

#[async_trait]
pub trait StorageOperator: Send + Sync {
    /// 把资源 `resource` 下载到本地 `target`
    async fn download(&self, resource: &str, target: &Path) -> SchedulerResult<()>;

    async fn exists(&self, resource: &str) -> SchedulerResult<bool>;
}

/// 以本地目录作为资源仓库
pub struct LocalStorageOperator {
    base_dir: PathBuf,
}

impl LocalStorageOperator {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// 资源路径只能落在仓库目录之内
    fn resolve(&self, resource: &str) -> SchedulerResult<PathBuf> {
        let relative = Path::new(resource.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if resource.trim().is_empty() || escapes {
            return Err(SchedulerError::InvalidTaskParams(format!(
                "非法的资源路径: {resource}"
            )));
        }
        Ok(self.base_dir.join(relative))
    }
}

#[async_trait]
impl StorageOperator for LocalStorageOperator {
    async fn download(&self, resource: &str, target: &Path) -> SchedulerResult<()> {
        let source = self.resolve(resource)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, target).await.map_err(|e| {
            SchedulerError::TaskExecution(format!(
                "下载资源 {} 失败: {e}",
                source.display()
            ))
        })?;
        debug!("资源 {} 已落地到 {}", resource, target.display());
        Ok(())
    }

    async fn exists(&self, resource: &str) -> SchedulerResult<bool> {
        let source = self.resolve(resource)?;
        Ok(tokio::fs::try_exists(&source).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_download_copies_resource() {
        let repo = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(repo.path().join("scripts"))
            .await
            .unwrap();
        tokio::fs::write(repo.path().join("scripts/run.sh"), "echo hi")
            .await
            .unwrap();

        let storage = LocalStorageOperator::new(repo.path());
        assert!(storage.exists("/scripts/run.sh").await.unwrap());
        assert!(!storage.exists("scripts/missing.sh").await.unwrap());

        let target = work.path().join("nested/run.sh");
        storage.download("scripts/run.sh", &target).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&target).await.unwrap(), "echo hi");
    }

    #[tokio::test]
    async fn test_rejects_paths_outside_repository() {
        let repo = tempfile::tempdir().unwrap();
        let storage = LocalStorageOperator::new(repo.path());
        assert!(storage.exists("../etc/passwd").await.is_err());
        assert!(storage.exists("").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_resource_fails() {
        let repo = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let storage = LocalStorageOperator::new(repo.path());
        let result = storage.download("nope.txt", &work.path().join("nope.txt")).await;
        assert!(matches!(result, Err(SchedulerError::TaskExecution(_))));
    }
}
