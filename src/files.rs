//! 上传、读取/列表与删除处理器，按请求方法分发。

use axum::Json;
use axum::body::Body as AxumBody;
use axum::extract::{Extension, FromRequest, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::{ConfigError, UploadSettings, UrlSetting};
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::storage::StorageError;
use crate::upload::{UploadTarget, store_files};
use crate::url::{COLLECTION_FILE_ROUTE, DEFAULT_FILE_ROUTE, RouteTable, UrlBuilder};
use crate::validation::{UploadRules, collect_files};

const INLINE_EXTENSIONS: [&str; 5] = ["gif", "jpg", "jpeg", "png", "pdf"];

/// 上传目标及其校验规则。
#[derive(Debug)]
pub struct UploadHandler {
    target: UploadTarget,
    rules: UploadRules,
}

/// 默认目录与各命名集合的处理器。
#[derive(Debug)]
pub struct Targets {
    default: UploadHandler,
    collections: HashMap<String, UploadHandler>,
}

impl Targets {
    pub fn from_settings(
        settings: &UploadSettings,
        routes: Arc<RouteTable>,
    ) -> Result<Self, ConfigError> {
        let default_url = url_builder(
            settings.upload_url.as_ref(),
            &routes,
            DEFAULT_FILE_ROUTE,
            Vec::new(),
        )?;
        let default = UploadHandler {
            target: UploadTarget::new(
                settings.upload_dir.clone(),
                &settings.upload_dir,
                default_url,
            ),
            rules: settings.rules.clone(),
        };

        let mut collections = HashMap::new();
        for (name, dir) in &settings.collections {
            let url = url_builder(
                settings.upload_url.as_ref(),
                &routes,
                COLLECTION_FILE_ROUTE,
                vec![("collection".into(), name.clone())],
            )?;
            collections.insert(
                name.clone(),
                UploadHandler {
                    target: UploadTarget::new(dir.clone(), &settings.upload_dir, url),
                    rules: settings.rules.clone(),
                },
            );
        }

        Ok(Self {
            default,
            collections,
        })
    }

    /// 所有受管目录（默认目录在前）。
    pub fn directories(&self) -> Vec<PathBuf> {
        std::iter::once(&self.default)
            .chain(self.collections.values())
            .map(|handler| handler.target.directory().to_path_buf())
            .collect()
    }

    fn collection(&self, name: &str) -> Result<&UploadHandler, ApiError> {
        self.collections.get(name).ok_or(ApiError::NotFound)
    }
}

fn url_builder(
    setting: Option<&UrlSetting>,
    routes: &Arc<RouteTable>,
    fallback_route: &str,
    params: Vec<(String, String)>,
) -> Result<UrlBuilder, ConfigError> {
    match setting {
        Some(UrlSetting::Template(template)) => Ok(UrlBuilder::template(template)),
        Some(UrlSetting::Route(route)) => UrlBuilder::named(routes.clone(), route, params),
        None => UrlBuilder::named(routes.clone(), fallback_route, params),
    }
}

#[derive(Serialize)]
pub(crate) struct ListedFile {
    filename: String,
    url: String,
}

/// `/api/upload`
pub async fn default_root(
    Extension(targets): Extension<Arc<Targets>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    dispatch(&targets.default, None, request).await
}

/// `/api/upload/{file}`
pub async fn default_entry(
    Path(file): Path<String>,
    Extension(targets): Extension<Arc<Targets>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    dispatch(&targets.default, Some(&file), request).await
}

/// `/api/collections/{collection}`
pub async fn collection_root(
    Path(collection): Path<String>,
    Extension(targets): Extension<Arc<Targets>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    dispatch(targets.collection(&collection)?, None, request).await
}

/// `/api/collections/{collection}/{file}`
pub async fn collection_entry(
    Path((collection, file)): Path<(String, String)>,
    Extension(targets): Extension<Arc<Targets>>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    dispatch(targets.collection(&collection)?, Some(&file), request).await
}

async fn dispatch(
    handler: &UploadHandler,
    file: Option<&str>,
    request: Request<AxumBody>,
) -> Result<Response, ApiError> {
    let method = request.method().clone();
    match (method, file) {
        (Method::POST, None) => upload(handler, request).await,
        (Method::GET, _) => retrieve(handler, file, request.headers()).await,
        (Method::DELETE, _) => delete(handler, file).await,
        (method, _) => {
            debug!(%method, "method not allowed");
            Err(ApiError::MethodNotAllowed)
        }
    }
}

/// 校验整个表单后按顺序保存文件。
async fn upload(handler: &UploadHandler, request: Request<AxumBody>) -> Result<Response, ApiError> {
    let multipart = Multipart::from_request(request, &())
        .await
        .map_err(|err| ApiError::BadRequest(err.body_text()))?;
    let files = collect_files(multipart, &handler.rules).await?;
    let uploaded = store_files(&handler.target, files).await?;
    info!(
        dir = ?handler.target.directory(),
        count = uploaded.len(),
        "upload complete"
    );
    Ok(Json(uploaded).into_response())
}

/// 目录返回文件列表，文件返回内容。
async fn retrieve(
    handler: &UploadHandler,
    file: Option<&str>,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let storage = handler.target.storage();
    let path = match file {
        Some(name) => storage.resolve(name, false).await?,
        None => storage.resolve_root().await?,
    };
    let metadata = fs::metadata(&path).await.map_err(StorageError::from)?;

    if metadata.is_dir() {
        let entries: Vec<ListedFile> = storage
            .list_files(&path)
            .await?
            .into_iter()
            .map(|filename| ListedFile {
                url: handler.target.url_for(&path.join(&filename)),
                filename,
            })
            .collect();
        info!(dir = ?path, count = entries.len(), "list files");
        return Ok(Json(entries).into_response());
    }

    serve_file(&path, &metadata, request_headers).await
}

async fn serve_file(
    path: &FsPath,
    metadata: &Metadata,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let mut response_headers = HeaderMap::new();
    let etag = etag_from_metadata(metadata);
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    if is_not_modified(request_headers, &etag) {
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    response_headers.insert(header::CONTENT_TYPE, header_value(mime.essence_str())?);
    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&metadata.len().to_string())?,
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&name))?,
    );

    let file = File::open(path).await.map_err(StorageError::from)?;
    info!(file = %name, size = metadata.len(), "serve file");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 删除单个文件；目录与缺失项都视为不存在。
async fn delete(handler: &UploadHandler, file: Option<&str>) -> Result<Response, ApiError> {
    let name = file.ok_or(ApiError::NotFound)?;
    let storage = handler.target.storage();
    let path = storage.resolve(name, true).await?;
    storage.remove(&path).await?;
    info!(file = name, dir = ?storage.root_path(), "delete file");
    Ok(Json(serde_json::json!({})).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("响应头构建失败".into()))
}

/// 图片与 PDF 内联显示，其它类型强制下载。仅为展示提示。
fn is_inline(name: &str) -> bool {
    name.rsplit_once('.').is_some_and(|(_, ext)| {
        INLINE_EXTENSIONS
            .iter()
            .any(|candidate| ext.eq_ignore_ascii_case(candidate))
    })
}

fn content_disposition(name: &str) -> String {
    let kind = if is_inline(name) { "inline" } else { "attachment" };
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' | '%' | '/' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    if fallback == name {
        format!("{kind}; filename=\"{name}\"")
    } else {
        format!(
            "{kind}; filename=\"{fallback}\"; filename*=UTF-8''{}",
            urlencoding::encode(name)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::tests::{multipart_request, rules};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tempfile::tempdir;

    fn make_targets() -> (tempfile::TempDir, Arc<Targets>) {
        let temp = tempdir().expect("tempdir");
        let settings = UploadSettings {
            upload_dir: temp.path().join("upload"),
            collections: vec![("docs".into(), temp.path().join("docs"))],
            upload_url: None,
            rules: rules(),
        };
        let targets = Targets::from_settings(&settings, Arc::new(RouteTable::standard()))
            .expect("targets");
        (temp, Arc::new(targets))
    }

    fn respond(result: Result<Response, ApiError>) -> Response {
        result.unwrap_or_else(IntoResponse::into_response)
    }

    fn empty_request(method: &str) -> Request<AxumBody> {
        Request::builder()
            .method(method)
            .uri("/")
            .body(AxumBody::empty())
            .expect("request")
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).expect("json body")
    }

    async fn upload_to_docs(targets: &Arc<Targets>, filename: &str, content: &[u8]) -> Response {
        let request = multipart_request(
            "/api/collections/docs",
            &[("files[]", filename, "image/png", content)],
        );
        respond(collection_root(Path("docs".into()), Extension(targets.clone()), request).await)
    }

    #[tokio::test]
    async fn collection_upload_twice_adds_counter_suffix() {
        let (_temp, targets) = make_targets();

        let first = upload_to_docs(&targets, "photo.png", b"one").await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(
            body_json(first).await,
            json!([{
                "filename": "photo.png",
                "original_filename": "photo.png",
                "url": "/api/collections/docs/photo.png"
            }])
        );

        let second = upload_to_docs(&targets, "photo.png", b"two").await;
        assert_eq!(
            body_json(second).await,
            json!([{
                "filename": "photo_1.png",
                "original_filename": "photo.png",
                "url": "/api/collections/docs/photo_1.png"
            }])
        );
    }

    #[tokio::test]
    async fn default_root_upload_uses_anonymous_names() {
        let (temp, targets) = make_targets();
        let request = multipart_request(
            "/api/upload",
            &[
                ("files", "photo.png", "image/png", b"a"),
                ("files", "photo.png", "image/png", b"b"),
            ],
        );
        let response = respond(default_root(Extension(targets), request).await);
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let entries = body.as_array().expect("array");
        assert_eq!(entries.len(), 2);
        let first = entries[0]["filename"].as_str().expect("filename");
        let second = entries[1]["filename"].as_str().expect("filename");
        assert_ne!(first, second);
        assert_ne!(first, "photo.png");
        assert_eq!(entries[0]["original_filename"], "photo.png");
        assert_eq!(entries[0]["url"], format!("/api/upload/{first}"));
        assert!(temp.path().join("upload").join(first).is_file());
    }

    #[tokio::test]
    async fn invalid_upload_returns_nested_errors_and_stores_nothing() {
        let (temp, targets) = make_targets();
        let request = multipart_request(
            "/api/collections/docs",
            &[
                ("files", "ok.png", "image/png", b"fine"),
                ("files", "notes.txt", "text/plain", b"text"),
            ],
        );
        let response =
            respond(collection_root(Path("docs".into()), Extension(targets), request).await);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"files": {"1": ["Please upload an image or a PDF document."]}})
        );
        assert!(!temp.path().join("docs").join("ok.png").exists());
    }

    #[tokio::test]
    async fn declared_image_with_executable_bytes_is_rejected() {
        let (temp, targets) = make_targets();
        let response = upload_to_docs(&targets, "evil.png", b"MZ\x90\x00exe").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            json!({"files": {"0": ["Please upload an image or a PDF document."]}})
        );
        assert!(!temp.path().join("docs").join("evil.png").exists());
    }

    #[tokio::test]
    async fn listing_returns_immediate_files_only() {
        let (temp, targets) = make_targets();
        upload_to_docs(&targets, "a.png", b"a").await;
        upload_to_docs(&targets, "b.png", b"b").await;
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(docs.join("nested")).expect("mkdir");
        std::fs::write(docs.join("nested").join("deep.png"), b"d").expect("write");

        let response = respond(
            collection_root(
                Path("docs".into()),
                Extension(targets),
                empty_request("GET"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        let mut entries = body_json(response)
            .await
            .as_array()
            .expect("array")
            .clone();
        entries.sort_by_key(|entry| entry["filename"].as_str().unwrap_or_default().to_string());
        assert_eq!(
            entries,
            vec![
                json!({"filename": "a.png", "url": "/api/collections/docs/a.png"}),
                json!({"filename": "b.png", "url": "/api/collections/docs/b.png"}),
            ]
        );
    }

    #[tokio::test]
    async fn listing_missing_root_is_not_found() {
        let (_temp, targets) = make_targets();
        let response = respond(default_root(Extension(targets), empty_request("GET")).await);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn serves_files_with_disposition_and_cache_headers() {
        let (temp, targets) = make_targets();
        upload_to_docs(&targets, "photo.png", b"png-bytes").await;
        std::fs::write(temp.path().join("docs").join("notes.txt"), b"hello").expect("write");

        let response = respond(
            collection_entry(
                Path(("docs".into(), "photo.png".into())),
                Extension(targets.clone()),
                empty_request("GET"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"photo.png\""
        );
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let etag = response.headers()[header::ETAG].clone();
        assert_eq!(body_bytes(response).await, b"png-bytes");

        let response = respond(
            collection_entry(
                Path(("docs".into(), "notes.txt".into())),
                Extension(targets.clone()),
                empty_request("GET"),
            )
            .await,
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"notes.txt\""
        );

        let mut request = empty_request("GET");
        request.headers_mut().insert(header::IF_NONE_MATCH, etag);
        let response = respond(
            collection_entry(
                Path(("docs".into(), "photo.png".into())),
                Extension(targets),
                request,
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn traversal_and_unknown_names_are_not_found() {
        let (temp, targets) = make_targets();
        std::fs::create_dir_all(temp.path().join("docs")).expect("mkdir");
        std::fs::write(temp.path().join("secret.txt"), b"secret").expect("write");

        for name in ["../secret.txt", "missing.png", ".."] {
            let response = respond(
                collection_entry(
                    Path(("docs".into(), name.into())),
                    Extension(targets.clone()),
                    empty_request("GET"),
                )
                .await,
            );
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{name}");
        }

        let response = respond(
            collection_root(
                Path("nope".into()),
                Extension(targets),
                empty_request("GET"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listed_name_with_inner_dots_can_be_fetched() {
        let (temp, targets) = make_targets();
        let docs = temp.path().join("docs");
        std::fs::create_dir_all(&docs).expect("mkdir");
        std::fs::write(docs.join("v1..2.png"), b"dots").expect("write");

        let response = respond(
            collection_root(
                Path("docs".into()),
                Extension(targets.clone()),
                empty_request("GET"),
            )
            .await,
        );
        assert_eq!(
            body_json(response).await,
            json!([{"filename": "v1..2.png", "url": "/api/collections/docs/v1..2.png"}])
        );

        let response = respond(
            collection_entry(
                Path(("docs".into(), "v1..2.png".into())),
                Extension(targets),
                empty_request("GET"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"dots");
    }

    #[tokio::test]
    async fn delete_removes_file_and_reports_missing() {
        let (temp, targets) = make_targets();
        upload_to_docs(&targets, "photo.png", b"x").await;

        let response = respond(
            collection_entry(
                Path(("docs".into(), "photo.png".into())),
                Extension(targets.clone()),
                empty_request("DELETE"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({}));
        assert!(!temp.path().join("docs").join("photo.png").exists());

        let response = respond(
            collection_entry(
                Path(("docs".into(), "photo.png".into())),
                Extension(targets.clone()),
                empty_request("DELETE"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = respond(
            collection_root(
                Path("docs".into()),
                Extension(targets),
                empty_request("DELETE"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_refuses_directories() {
        let (temp, targets) = make_targets();
        std::fs::create_dir_all(temp.path().join("docs").join("nested")).expect("mkdir");

        let response = respond(
            collection_entry(
                Path(("docs".into(), "nested".into())),
                Extension(targets),
                empty_request("DELETE"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(temp.path().join("docs").join("nested").is_dir());
    }

    #[tokio::test]
    async fn unsupported_methods_are_rejected() {
        let (_temp, targets) = make_targets();
        let response = respond(default_root(Extension(targets.clone()), empty_request("PUT")).await);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = respond(
            default_entry(
                Path("photo.png".into()),
                Extension(targets),
                empty_request("POST"),
            )
            .await,
        );
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn disposition_follows_extension() {
        assert!(is_inline("a.PNG"));
        assert!(is_inline("scan.JpEg"));
        assert!(is_inline("doc.pdf"));
        assert!(!is_inline("photo.png.exe"));
        assert!(!is_inline("README"));
        assert_eq!(
            content_disposition("résumé.pdf"),
            "inline; filename=\"r_sum_.pdf\"; filename*=UTF-8''r%C3%A9sum%C3%A9.pdf"
        );
    }

    #[test]
    fn custom_route_must_fit_every_target() {
        let temp = tempdir().expect("tempdir");
        let settings = UploadSettings {
            upload_dir: temp.path().join("upload"),
            collections: Vec::new(),
            upload_url: Some(UrlSetting::Route(COLLECTION_FILE_ROUTE.into())),
            rules: rules(),
        };
        let result = Targets::from_settings(&settings, Arc::new(RouteTable::standard()));
        assert!(matches!(result, Err(ConfigError::UnresolvedRoute(_))));
    }
}
