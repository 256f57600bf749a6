//! 上传编排：确定存储名、暂存写入并生成响应描述。

use axum::body::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::Builder as TempBuilder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::atomic::StagedFile;
use crate::naming::resolve_unique;
use crate::sanitize::sanitize;
use crate::storage::{Storage, StorageError};
use crate::url::UrlBuilder;

const ANONYMOUS_NAME_LEN: usize = 16;

/// 存储名的生成方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamingMode {
    /// 由 tempfile 原子创建的随机名。
    Anonymous,
    /// 清洗后的客户端文件名，冲突时追加计数后缀。
    Sanitized,
}

/// 一个上传目标：目录、命名方式与 URL 生成方式。请求期间不可变。
#[derive(Clone, Debug)]
pub struct UploadTarget {
    storage: Storage,
    naming: NamingMode,
    url: UrlBuilder,
}

impl UploadTarget {
    /// 默认目录使用匿名名，其它目录保留清洗后的文件名。
    pub fn new(directory: PathBuf, default_root: &Path, url: UrlBuilder) -> Self {
        let naming = if directory == default_root {
            NamingMode::Anonymous
        } else {
            NamingMode::Sanitized
        };
        Self {
            storage: Storage::new(directory),
            naming,
            url,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn directory(&self) -> &Path {
        self.storage.root_path()
    }

    pub fn naming(&self) -> NamingMode {
        self.naming
    }

    pub fn url_for(&self, path: &Path) -> String {
        self.url.build(path)
    }
}

/// 已通过校验的上传文件。
#[derive(Debug)]
pub struct IncomingFile {
    pub original_name: String,
    pub content: Bytes,
    pub size: u64,
}

/// 已落盘的文件。
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub stored_name: String,
    pub original_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UploadedFile {
    pub filename: String,
    pub original_filename: String,
    pub url: String,
}

/// 按输入顺序保存文件，任一文件失败即中止整批。
///
/// 已写入的前序文件保留在磁盘上，不做回滚。
pub async fn store_files(
    target: &UploadTarget,
    files: Vec<IncomingFile>,
) -> Result<Vec<UploadedFile>, StorageError> {
    target.storage().ensure_root().await?;

    let mut uploaded = Vec::with_capacity(files.len());
    for file in files {
        let stored = store_file(target, file).await?;
        uploaded.push(UploadedFile {
            url: target.url_for(&stored.path),
            original_filename: sanitize(&stored.original_name).to_string(),
            filename: stored.stored_name,
        });
    }
    Ok(uploaded)
}

async fn store_file(target: &UploadTarget, file: IncomingFile) -> Result<StoredFile, StorageError> {
    let dir = target.directory();
    let (stored_name, reserved) = match target.naming() {
        NamingMode::Anonymous => (reserve_anonymous_name(dir).await?, true),
        NamingMode::Sanitized => (resolve_unique(dir, &file.original_name).await?, false),
    };
    let path = dir.join(&stored_name);
    debug!(stored_name, original = file.original_name, "storing upload");

    write_file(&path, &file.content, reserved).await?;

    info!(
        stored_name,
        original = file.original_name,
        size = file.size,
        "file stored"
    );
    Ok(StoredFile {
        stored_name,
        original_name: file.original_name,
        path,
    })
}

/// 经暂存文件写入 `path`；失败时连同预留的占位文件一起删除。
async fn write_file(path: &Path, content: &[u8], reserved: bool) -> Result<(), StorageError> {
    let result = write_staged(path, content, reserved).await;
    if result.is_err() && reserved {
        let _ = fs::remove_file(path).await;
    }
    result
}

async fn write_staged(path: &Path, content: &[u8], reserved: bool) -> Result<(), StorageError> {
    let mut staged = StagedFile::new(path).await?;
    if let Err(err) = staged.file_mut().write_all(content).await {
        staged.cleanup().await;
        return Err(StorageError::Io(err));
    }
    if reserved {
        staged.persist_over_reserved().await
    } else {
        staged.persist_new().await
    }
}

/// 由 tempfile 在目录内原子创建随机名占位文件。
async fn reserve_anonymous_name(dir: &Path) -> Result<String, StorageError> {
    let dir = dir.to_path_buf();
    let reserved = tokio::task::spawn_blocking(move || {
        let (_, path) = TempBuilder::new()
            .prefix("")
            .rand_bytes(ANONYMOUS_NAME_LEN)
            .tempfile_in(&dir)?
            .keep()
            .map_err(|err| err.error)?;
        Ok::<_, std::io::Error>((dir, path))
    })
    .await
    .map_err(|err| StorageError::Invariant(err.to_string()))??;

    let (dir, path) = reserved;
    if path.parent() != Some(dir.as_path()) {
        let _ = fs::remove_file(&path).await;
        return Err(StorageError::Invariant(
            "temporary file created outside the upload directory".into(),
        ));
    }
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| StorageError::Invariant("temporary file has no utf-8 name".into()))
}
