use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::atomic::is_staging_name;

/// 受管的上传目录。
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 把存储名映射到根目录内的路径；缺失、符号链接或非文件都返回 `NotFound`。
    pub async fn resolve(&self, name: &str, must_be_file: bool) -> Result<PathBuf, StorageError> {
        if !is_plain_name(name) {
            return Err(StorageError::NotFound);
        }
        let target = self.root.join(name);
        let metadata = match fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
            Err(err) => return Err(StorageError::Io(err)),
        };
        if metadata.file_type().is_symlink() {
            return Err(StorageError::NotFound);
        }
        if must_be_file && !metadata.is_file() {
            return Err(StorageError::NotFound);
        }
        Ok(target)
    }

    /// 根目录本身（必须已存在）。
    pub async fn resolve_root(&self) -> Result<PathBuf, StorageError> {
        match fs::metadata(&self.root).await {
            Ok(metadata) if metadata.is_dir() => Ok(self.root.clone()),
            Ok(_) => Err(StorageError::NotFound),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 列出目录下的普通文件（不递归，跳过隐藏文件与暂存文件）。
    pub async fn list_files(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        let mut entries = fs::read_dir(dir).await?;
        let mut names = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || is_staging_name(&name) {
                continue;
            }
            names.push(name);
        }

        Ok(names)
    }

    /// 删除已解析的文件。
    pub async fn remove(&self, target: &Path) -> Result<(), StorageError> {
        match fs::remove_file(target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

/// 存储名只能是单个普通路径段；`v1..2.png` 合法，`..` 不合法。
fn is_plain_name(name: &str) -> bool {
    if name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[derive(Debug)]
pub enum StorageError {
    NotFound,
    Io(io::Error),
    Invariant(String),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}
