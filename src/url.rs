//! 文件 URL 生成：直接函数或按路由名生成。

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigError;

pub const DEFAULT_FILE_ROUTE: &str = "upload_file";
pub const COLLECTION_FILE_ROUTE: &str = "collection_file";

/// 路由名到路径模板（含 `{param}` 占位符）的映射。
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, String>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 服务自身暴露的文件路由。
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.insert(DEFAULT_FILE_ROUTE, "/api/upload/{file}");
        table.insert(COLLECTION_FILE_ROUTE, "/api/collections/{collection}/{file}");
        table
    }

    pub fn insert(&mut self, name: &str, template: &str) {
        self.routes.insert(name.to_string(), template.to_string());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// 替换模板中的参数，参数值做 URL 编码；缺少参数时返回 `None`。
    pub fn generate(&self, name: &str, params: &[(String, String)]) -> Option<String> {
        let mut url = self.routes.get(name)?.clone();
        for (key, value) in params {
            url = url.replace(&format!("{{{key}}}"), &urlencoding::encode(value));
        }
        if url.contains('{') {
            return None;
        }
        Some(url)
    }
}

type DirectFn = dyn Fn(&Path) -> String + Send + Sync;

/// 生成已存文件的访问 URL。
#[derive(Clone, Default)]
pub enum UrlBuilder {
    #[default]
    None,
    Direct(Arc<DirectFn>),
    Named {
        routes: Arc<RouteTable>,
        route: String,
        params: Vec<(String, String)>,
    },
}

impl UrlBuilder {
    pub fn direct(build: impl Fn(&Path) -> String + Send + Sync + 'static) -> Self {
        UrlBuilder::Direct(Arc::new(build))
    }

    /// `{file}` 占位符替换为编码后的文件名。
    pub fn template(template: &str) -> Self {
        let template = template.to_string();
        Self::direct(move |path| {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy())
                .unwrap_or_default();
            template.replace("{file}", &urlencoding::encode(&name))
        })
    }

    /// 绑定路由名与固定参数；路由必须存在且参数齐全。
    pub fn named(
        routes: Arc<RouteTable>,
        route: &str,
        params: Vec<(String, String)>,
    ) -> Result<Self, ConfigError> {
        if !routes.contains(route) {
            return Err(ConfigError::UnknownRoute(route.to_string()));
        }
        let mut probe = params.clone();
        probe.push(("file".into(), "probe".into()));
        if routes.generate(route, &probe).is_none() {
            return Err(ConfigError::UnresolvedRoute(route.to_string()));
        }
        Ok(UrlBuilder::Named {
            routes,
            route: route.to_string(),
            params,
        })
    }

    pub fn build(&self, path: &Path) -> String {
        match self {
            UrlBuilder::None => String::new(),
            UrlBuilder::Direct(build) => build(path),
            UrlBuilder::Named {
                routes,
                route,
                params,
            } => {
                let file = path
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_default();
                let mut params = params.clone();
                params.push(("file".into(), file));
                routes.generate(route, &params).unwrap_or_default()
            }
        }
    }
}

impl fmt::Debug for UrlBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlBuilder::None => f.write_str("None"),
            UrlBuilder::Direct(_) => f.write_str("Direct(..)"),
            UrlBuilder::Named { route, params, .. } => f
                .debug_struct("Named")
                .field("route", route)
                .field("params", params)
                .finish(),
        }
    }
}
