//! 命令行参数、默认值与上传目标配置。

use clap::Parser;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::validation::{FileSize, UploadRules};

pub const DEFAULT_UPLOAD_DIR: &str = "var/upload";
pub const DEFAULT_FIELD_NAME: &str = "files";
pub const DEFAULT_FILE_MAX_SIZE: &str = "10M";
pub const DEFAULT_FILE_MIME_TYPES: &str = "image/jpeg,image/png,application/pdf";
pub const DEFAULT_FILE_MIME_TYPES_MESSAGE: &str = "Please upload an image or a PDF document.";
pub const DEFAULT_MAX_REQUEST_SIZE: u64 = 100 * 1024 * 1024;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 24 * 60 * 60;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;

/// 服务的命令行与环境变量配置。
#[derive(Parser, Debug)]
#[command(name = "filedrop", version, about = "Filedrop upload server")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        env = "FILEDROP_UPLOAD_DIR",
        default_value = DEFAULT_UPLOAD_DIR,
        help = "Default upload directory (files get anonymous unique names)"
    )]
    pub upload_dir: String,
    #[arg(
        long = "collection",
        env = "FILEDROP_COLLECTIONS",
        value_delimiter = ',',
        help = "Extra upload directory as NAME=DIR, stored under sanitized original names"
    )]
    pub collections: Vec<String>,
    #[arg(
        long,
        env = "FILEDROP_UPLOAD_URL",
        help = "File URL template containing {file}, or a route name"
    )]
    pub upload_url: Option<String>,
    #[arg(
        long,
        env = "FILEDROP_FIELD_NAME",
        default_value = DEFAULT_FIELD_NAME,
        help = "Multipart field carrying the files"
    )]
    pub field_name: String,
    #[arg(
        long,
        env = "FILEDROP_FILE_MAX_SIZE",
        default_value = DEFAULT_FILE_MAX_SIZE,
        help = "Max size per file (k/M/G decimal, Ki/Mi/Gi binary)"
    )]
    pub file_max_size: String,
    #[arg(
        long,
        env = "FILEDROP_FILE_MIME_TYPES",
        value_delimiter = ',',
        default_value = DEFAULT_FILE_MIME_TYPES,
        help = "Comma separated allowed MIME types (type/* allowed)"
    )]
    pub file_mime_types: Vec<String>,
    #[arg(
        long,
        env = "FILEDROP_FILE_MIME_TYPES_MESSAGE",
        default_value = DEFAULT_FILE_MIME_TYPES_MESSAGE,
        help = "Message returned for a rejected MIME type"
    )]
    pub file_mime_types_message: String,
    #[arg(
        short = 'b',
        long,
        env = "FILEDROP_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "FILEDROP_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "FILEDROP_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "FILEDROP_MAX_REQUEST_SIZE",
        default_value_t = DEFAULT_MAX_REQUEST_SIZE,
        help = "Max upload request body in bytes"
    )]
    pub max_request_size: u64,
    #[arg(
        long,
        env = "FILEDROP_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Age in seconds after which abandoned staging files are removed (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
}

/// 响应中文件 URL 的生成方式。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlSetting {
    Template(String),
    Route(String),
}

/// 校验后的上传配置。
#[derive(Debug)]
pub struct UploadSettings {
    pub upload_dir: PathBuf,
    pub collections: Vec<(String, PathBuf)>,
    pub upload_url: Option<UrlSetting>,
    pub rules: UploadRules,
}

impl Args {
    /// 校验并整理上传相关配置；任何错误都在启动时终止。
    pub fn upload_settings(&self) -> Result<UploadSettings, ConfigError> {
        let upload_dir = absolute_dir(&self.upload_dir)?;

        let mut collections: Vec<(String, PathBuf)> = Vec::new();
        for spec in self.collections.iter().filter(|spec| !spec.trim().is_empty()) {
            let (name, dir) = parse_collection(spec)?;
            if collections.iter().any(|(existing, _)| *existing == name) {
                return Err(ConfigError::DuplicateCollection(name));
            }
            collections.push((name, absolute_dir(&dir)?));
        }

        let upload_url = self
            .upload_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| {
                if value.contains("{file}") {
                    UrlSetting::Template(value.to_string())
                } else {
                    UrlSetting::Route(value.to_string())
                }
            });

        let max_size = FileSize::parse(&self.file_max_size)
            .ok_or_else(|| ConfigError::InvalidSize(self.file_max_size.clone()))?;
        let field_name = self.field_name.trim().to_string();
        if field_name.is_empty() {
            return Err(ConfigError::EmptyFieldName);
        }

        Ok(UploadSettings {
            upload_dir,
            collections,
            upload_url,
            rules: UploadRules {
                field_name,
                max_size,
                mime_types: self
                    .file_mime_types
                    .iter()
                    .map(|mime| mime.trim().to_string())
                    .filter(|mime| !mime.is_empty())
                    .collect(),
                mime_types_message: self.file_mime_types_message.clone(),
            },
        })
    }
}

fn absolute_dir(value: &str) -> Result<PathBuf, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::MissingUploadDir);
    }
    std::path::absolute(Path::new(value))
        .map_err(|err| ConfigError::UnusableDir(value.to_string(), err.to_string()))
}

/// 解析 `NAME=DIR`，名称只允许 `[A-Za-z0-9_-]`。
fn parse_collection(spec: &str) -> Result<(String, String), ConfigError> {
    let (name, dir) = spec
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidCollection(spec.to_string()))?;
    let name = name.trim();
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_name || dir.trim().is_empty() {
        return Err(ConfigError::InvalidCollection(spec.to_string()));
    }
    Ok((name.to_string(), dir.trim().to_string()))
}

#[derive(Debug)]
pub enum ConfigError {
    MissingUploadDir,
    UnusableDir(String, String),
    InvalidCollection(String),
    DuplicateCollection(String),
    InvalidSize(String),
    EmptyFieldName,
    UnknownRoute(String),
    UnresolvedRoute(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingUploadDir => f.write_str("upload dir is not set"),
            ConfigError::UnusableDir(dir, reason) => {
                write!(f, "upload dir {dir:?} is unusable: {reason}")
            }
            ConfigError::InvalidCollection(spec) => {
                write!(f, "invalid collection {spec:?}, expected NAME=DIR")
            }
            ConfigError::DuplicateCollection(name) => write!(f, "duplicate collection {name:?}"),
            ConfigError::InvalidSize(value) => write!(f, "invalid file size {value:?}"),
            ConfigError::EmptyFieldName => f.write_str("field name is empty"),
            ConfigError::UnknownRoute(route) => write!(f, "unknown route {route:?}"),
            ConfigError::UnresolvedRoute(route) => {
                write!(f, "route {route:?} needs parameters this target cannot provide")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
