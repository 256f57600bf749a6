//! 暂存写入：先写同目录隐藏文件，再以不覆盖或替换预留名的方式落盘。

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File, OpenOptions};
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::StorageError;

const STAGING_MARKER: &str = ".part.";

/// 暂存文件名形如 `.<name>.part.<uuid>`。
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.contains(STAGING_MARKER)
}

/// 目标同目录下的隐藏暂存文件。
pub struct StagedFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl StagedFile {
    /// 在目标同目录创建暂存文件。
    pub async fn new(target: &Path) -> Result<Self, StorageError> {
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Invariant("target has no parent directory".into()))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}{STAGING_MARKER}{}", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    /// 返回暂存文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理暂存文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 以硬链接发布，目标已存在时返回 `AlreadyExists`。
    pub async fn persist_new(self) -> Result<(), StorageError> {
        let synced = self.file.sync_all().await;
        drop(self.file);
        if let Err(err) = synced {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(StorageError::Io(err));
        }

        let linked = fs::hard_link(&self.temp_path, &self.target).await;
        let _ = fs::remove_file(&self.temp_path).await;
        linked?;

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }

    /// 替换本请求自己创建的占位文件。
    pub async fn persist_over_reserved(self) -> Result<(), StorageError> {
        let synced = self.file.sync_all().await;
        drop(self.file);
        if let Err(err) = synced {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

/// 清理目录中超过 `ttl` 的暂存残留（请求中断时留下）。
pub async fn cleanup_stale_staging(dir: &Path, ttl: Duration) -> Result<u64, io::Error> {
    if ttl.is_zero() || fs::metadata(dir).await.is_err() {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !is_staging_name(&name.to_string_lossy()) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = match metadata.modified().map(|modified| now.duration_since(modified)) {
            Ok(Ok(age)) => age,
            _ => continue,
        };
        if age < ttl {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(path = ?path, "removed stale staging file");
                removed += 1;
            }
            Err(err) => warn!(path = ?path, error = %err, "failed to remove stale staging file"),
        }
    }

    Ok(removed)
}
