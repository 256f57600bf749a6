//! 客户端文件名清洗：只保留 `[A-Za-z0-9_-]`，扩展名单独处理。

use std::fmt;
use uuid::Uuid;

pub const MAX_BASE_LEN: usize = 200;
pub const MAX_EXTENSION_LEN: usize = 32;

/// 清洗后的基名与可选扩展名。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedName {
    pub base: String,
    pub extension: Option<String>,
}

impl fmt::Display for SanitizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.extension {
            Some(extension) => write!(f, "{}.{}", self.base, extension),
            None => f.write_str(&self.base),
        }
    }
}

/// 清洗客户端提供的文件名。
///
/// 目录部分被丢弃，最后一个 `.` 之后视为扩展名。基名和扩展名使用同一字符集过滤；
/// 基名为空时以随机标识替代，扩展名为空时省略。
pub fn sanitize(original: &str) -> SanitizedName {
    let trimmed = original.trim_end_matches(['/', '\\']);
    let basename = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let (stem, extension) = match basename.rfind('.') {
        Some(index) => (&basename[..index], Some(&basename[index + 1..])),
        None => (basename, None),
    };

    let mut base = keep_safe_chars(stem, MAX_BASE_LEN);
    if base.is_empty() {
        base = Uuid::new_v4().simple().to_string();
    }
    let extension = extension
        .map(|value| keep_safe_chars(value, MAX_EXTENSION_LEN))
        .filter(|value| !value.is_empty());

    SanitizedName { base, extension }
}

fn keep_safe_chars(value: &str, limit: usize) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(limit)
        .collect()
}
