//! 唯一文件名解析：清洗后按 `_<n>` 计数后缀递增直到不冲突。

use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use tokio::fs;
use tokio::io::ErrorKind;

use crate::sanitize::sanitize;
use crate::storage::StorageError;

static COUNTER_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(?P<stem>.*?)(?:_(?P<index>[1-9][0-9]*))?(?P<ext>\.[^.]+)?$")
        .expect("counter suffix pattern")
});

/// `stem[_n][.ext]` 变为 `stem_{n+1}[.ext]`，无计数时从 `_1` 开始。
pub fn counter_suffix(name: &str) -> String {
    let Some(captures) = COUNTER_SUFFIX.captures(name) else {
        return format!("{name}_1");
    };
    let stem = captures.name("stem").map_or("", |m| m.as_str());
    let ext = captures.name("ext").map_or("", |m| m.as_str());

    match captures.name("index") {
        None => format!("{stem}_1{ext}"),
        Some(index) => match index.as_str().parse::<u64>().ok().and_then(|n| n.checked_add(1)) {
            Some(next) => format!("{stem}_{next}{ext}"),
            // counter exhausted: nest a fresh one, the name still grows
            None => format!("{stem}_{}_1{ext}", index.as_str()),
        },
    }
}

/// 返回目录中尚未被占用的清洗后文件名。
///
/// 检查与后续创建之间不加锁；落盘时使用独占创建，竞争失败会报错而不是覆盖。
pub async fn resolve_unique(dir: &Path, desired: &str) -> Result<String, StorageError> {
    let mut candidate = sanitize(desired).to_string();
    while entry_exists(&dir.join(&candidate)).await? {
        candidate = counter_suffix(&candidate);
    }
    Ok(candidate)
}

async fn entry_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StorageError::Io(err)),
    }
}
