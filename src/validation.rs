//! 上传请求校验：从 multipart 收集文件，并以嵌套结构返回错误。

use axum::body::Bytes;
use axum::extract::Multipart;
use futures_util::stream::StreamExt;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tracing::debug;

use crate::error::ApiError;
use crate::upload::IncomingFile;

pub const NO_FILE_MESSAGE: &str = "No file was uploaded.";

/// 与表单结构对应的错误树。
///
/// 只有消息时序列化为数组；有子节点时为对象，消息以 `"0"`、`"1"` 为键，随后是非空子节点。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorNode {
    pub messages: Vec<String>,
    pub children: Vec<(String, ErrorNode)>,
}

impl ErrorNode {
    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn child_mut(&mut self, name: &str) -> &mut ErrorNode {
        let position = match self.children.iter().position(|(key, _)| key == name) {
            Some(position) => position,
            None => {
                self.children.push((name.to_string(), ErrorNode::default()));
                self.children.len() - 1
            }
        };
        &mut self.children[position].1
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.children.iter().all(|(_, child)| child.is_empty())
    }
}

impl Serialize for ErrorNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let children: Vec<_> = self
            .children
            .iter()
            .filter(|(_, child)| !child.is_empty())
            .collect();
        if children.is_empty() {
            return self.messages.serialize(serializer);
        }
        let mut map = serializer.serialize_map(Some(self.messages.len() + children.len()))?;
        for (index, message) in self.messages.iter().enumerate() {
            map.serialize_entry(&index.to_string(), message)?;
        }
        for (name, child) in children {
            map.serialize_entry(name, child)?;
        }
        map.end()
    }
}

/// 单文件大小上限，记录配置时使用的是十进制还是二进制单位。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSize {
    pub bytes: u64,
    pub binary: bool,
}

impl FileSize {
    /// 解析 `10M`、`500k`、`2Mi`、`1048576` 等写法。
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (digits, unit) = value.split_at(split);
        let amount: u64 = digits.parse().ok()?;
        let (factor, binary) = match unit {
            "" => (1, false),
            "k" | "K" => (1_000, false),
            "M" => (1_000_000, false),
            "G" => (1_000_000_000, false),
            "Ki" | "ki" => (1 << 10, true),
            "Mi" => (1 << 20, true),
            "Gi" => (1 << 30, true),
            _ => return None,
        };
        Some(Self {
            bytes: amount.checked_mul(factor)?,
            binary,
        })
    }

    /// 按上限能达到的最大单位换算大小与上限。
    fn describe(&self, size: u64) -> (String, String, &'static str) {
        let (coef, suffixes) = if self.binary {
            (1024u64, ["bytes", "KiB", "MiB", "GiB"])
        } else {
            (1000u64, ["bytes", "kB", "MB", "GB"])
        };
        let mut unit = 0;
        let mut scale = 1u64;
        while unit < suffixes.len() - 1 && self.bytes >= scale * coef {
            scale *= coef;
            unit += 1;
        }
        let render = |value: u64| {
            let scaled = format!("{:.2}", value as f64 / scale as f64);
            scaled.trim_end_matches('0').trim_end_matches('.').to_string()
        };
        (render(size), render(self.bytes), suffixes[unit])
    }
}

/// 上传字段与单文件约束。
#[derive(Debug, Clone)]
pub struct UploadRules {
    pub field_name: String,
    pub max_size: FileSize,
    pub mime_types: Vec<String>,
    pub mime_types_message: String,
}

impl UploadRules {
    /// `files`、`files[]` 与 `files[3]` 都视为同一字段。
    fn accepts_field(&self, name: &str) -> bool {
        match name.strip_prefix(self.field_name.as_str()) {
            Some("") => true,
            Some(rest) => rest.starts_with('[') && rest.ends_with(']'),
            None => false,
        }
    }

    fn check(
        &self,
        original_name: &str,
        content_type: Option<&str>,
        content: &[u8],
        size: u64,
    ) -> Vec<String> {
        if original_name.trim().is_empty() || size == 0 {
            return vec![NO_FILE_MESSAGE.to_string()];
        }

        let mut messages = Vec::new();
        if size > self.max_size.bytes {
            let (size, limit, suffix) = self.max_size.describe(size);
            messages.push(format!(
                "The file is too large ({size} {suffix}). Allowed maximum size is {limit} {suffix}."
            ));
        }
        if !self.mime_allowed(&effective_mime(original_name, content_type, content)) {
            messages.push(self.mime_types_message.clone());
        }
        messages
    }

    fn mime_allowed(&self, mime: &str) -> bool {
        if self.mime_types.is_empty() {
            return true;
        }
        self.mime_types.iter().any(|allowed| {
            let allowed = allowed.trim().to_ascii_lowercase();
            match allowed.strip_suffix("/*") {
                Some(family) => mime
                    .split_once('/')
                    .is_some_and(|(kind, _)| kind == family),
                None => allowed == mime,
            }
        })
    }
}

/// 先按内容签名识别；无法识别时才用声明的类型，再按扩展名推断。
fn effective_mime(original_name: &str, content_type: Option<&str>, content: &[u8]) -> String {
    if let Some(kind) = infer::get(content) {
        return kind.mime_type().to_string();
    }
    let declared = content_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value != "application/octet-stream");
    declared.unwrap_or_else(|| {
        mime_guess::from_path(original_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string()
    })
}

/// 读取整个表单并校验所有文件，任何文件写盘前完成。
pub async fn collect_files(
    mut multipart: Multipart,
    rules: &UploadRules,
) -> Result<Vec<IncomingFile>, ApiError> {
    let mut errors = ErrorNode::default();
    let mut files = Vec::new();
    let mut index = 0usize;

    while let Some(mut field) = multipart.next_field().await? {
        if !field.name().is_some_and(|name| rules.accepts_field(name)) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);

        let mut buffer = Vec::new();
        let mut size: u64 = 0;
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if size <= rules.max_size.bytes {
                buffer.extend_from_slice(&chunk);
            }
        }

        let messages = rules.check(&original_name, content_type.as_deref(), &buffer, size);
        if messages.is_empty() {
            files.push(IncomingFile {
                original_name,
                content: Bytes::from(buffer),
                size,
            });
        } else {
            debug!(index, original_name, ?messages, "upload rejected");
            let node = errors
                .child_mut(&rules.field_name)
                .child_mut(&index.to_string());
            for message in messages {
                node.push(message);
            }
        }
        index += 1;
    }

    if index == 0 {
        errors.push(NO_FILE_MESSAGE);
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }
    Ok(files)
}
