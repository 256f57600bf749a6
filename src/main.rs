//! Filedrop server binary.
//!
//! Accepts multipart uploads into a default directory and any number of
//! named collections, then serves, lists and deletes the stored files. The
//! main entry point validates configuration, builds the Axum router and
//! starts the HTTP listener.

mod atomic;
mod background;
mod config;
mod error;
mod etag;
mod files;
mod http;
mod logging;
mod naming;
mod sanitize;
mod storage;
mod upload;
mod url;
mod validation;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::any;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::files::Targets;
use crate::http::build_cors_layer;
use crate::url::RouteTable;

/// Starts the Filedrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let settings = args
        .upload_settings()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let routes = Arc::new(RouteTable::standard());
    let targets = Arc::new(
        Targets::from_settings(&settings, routes)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?,
    );
    for dir in targets.directories() {
        tokio::fs::create_dir_all(&dir).await?;
        info!(dir = ?dir, "upload directory ready");
    }
    let staging_dirs = targets.directories();
    let staging_ttl = Duration::from_secs(args.staging_ttl_secs);
    let body_limit = usize::try_from(args.max_request_size).unwrap_or(usize::MAX);

    let mut app = Router::new()
        .route("/api/upload", any(files::default_root))
        .route("/api/upload/{file}", any(files::default_entry))
        .route("/api/collections/{collection}", any(files::collection_root))
        .route(
            "/api/collections/{collection}/{file}",
            any(files::collection_entry),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(targets));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(staging_dirs, staging_ttl);
    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
