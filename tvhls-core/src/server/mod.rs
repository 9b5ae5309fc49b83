//! HTTP edge: channel listing, relay route, live manifests and static files.

mod error;

use std::future::{Future, IntoFuture};
use std::io;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogSource, ChannelRecord};
use crate::config::TvhlsConfig;
use crate::relay::{UpstreamRelay, DEFAULT_CONTENT_TYPE};
use crate::segments::{SegmentStore, Sweeper};
use crate::session::{SessionManager, SessionSummary};
use crate::transcoder::{SystemTranscoderLauncher, TranscoderLauncher};

pub use error::{ApiError, ApiResult, ServerError};

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const MANIFEST_SUFFIX: &str = ".m3u8";

#[derive(Debug, Clone)]
pub struct AppState {
    pub sessions: Arc<SessionManager>,
    pub relay: UpstreamRelay,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>, relay: UpstreamRelay) -> Self {
        Self { sessions, relay }
    }

    fn catalog(&self) -> &CatalogSource {
        self.sessions.catalog()
    }
}

/// Builds the full router. Segments are served from `hls_dir` under `/hls`,
/// anything unmatched falls through to `public_dir`.
pub fn router(state: AppState, hls_dir: &Path, public_dir: &Path) -> Router {
    Router::new()
        .route("/api/channels", get(list_channels))
        .route("/api/sessions", get(list_sessions))
        .route("/proxy", get(proxy))
        .route("/live/{file}", get(live_manifest))
        .nest_service("/hls", ServeDir::new(hls_dir))
        .fallback_service(ServeDir::new(public_dir))
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn list_channels(State(state): State<AppState>) -> ApiResult<Json<Vec<ChannelRecord>>> {
    let records = state.catalog().load().await.map_err(|err| {
        warn!(error = %err, "catalog read failed");
        ApiError::internal("catalog unavailable")
    })?;
    Ok(Json(records))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.sessions().await)
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    url: Option<String>,
}

async fn proxy(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> ApiResult<Response> {
    let url = query
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing url query parameter"))?;

    let stream = state.relay.open(&url).await?;

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&stream.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    headers.insert(CONTENT_TYPE, content_type);
    if let Some(length) = stream.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }
    Ok((StatusCode::OK, headers, Body::from_stream(stream.body)).into_response())
}

async fn live_manifest(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
) -> ApiResult<Response> {
    let Some(channel_id) = file.strip_suffix(MANIFEST_SUFFIX) else {
        return Err(ApiError::not_found(format!("{file} is not a manifest")));
    };

    let playlist = state.sessions.open_channel(channel_id).await?;
    let body = tokio::fs::read(&playlist).await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ApiError::not_found(format!("manifest for channel {channel_id} disappeared"))
        } else {
            warn!(channel_id, path = %playlist.display(), error = %err, "manifest read failed");
            ApiError::internal("failed to read manifest")
        }
    })?;

    Ok((
        [
            (CONTENT_TYPE, MANIFEST_CONTENT_TYPE),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Range"),
    );
    headers.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range"),
    );
    response
}

/// Runs the server on the configured address until ctrl-c, then stops every
/// session and background task.
pub async fn serve(config: TvhlsConfig) -> Result<(), ServerError> {
    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    serve_with_listener(config, listener, shutdown_signal()).await
}

pub async fn serve_with_listener<F>(
    config: TvhlsConfig,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    serve_with_launcher(config, listener, Arc::new(SystemTranscoderLauncher), shutdown).await
}

/// Serves until `shutdown` resolves. Sessions are stopped before connections
/// drain, since every transcoder holds a relay stream open; whatever is still
/// connected after `server.drain_timeout_seconds` is abandoned.
pub async fn serve_with_launcher<F>(
    config: TvhlsConfig,
    listener: TcpListener,
    launcher: Arc<dyn TranscoderLauncher>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = SegmentStore::new(config.hls_dir());
    tokio::fs::create_dir_all(store.root())
        .await
        .map_err(|source| ServerError::OutputDir {
            path: store.root().to_path_buf(),
            source,
        })?;

    let relay = UpstreamRelay::new(&config.relay, config.server.relay_base_url())?;
    let manager = Arc::new(SessionManager::new(
        CatalogSource::new(config.catalog_path()),
        relay.clone(),
        store.clone(),
        launcher,
        config.transcoder.clone(),
        config.sessions.clone(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let sweeper = Sweeper::new(
        store.clone(),
        config.sweeper.interval(),
        config.sweeper.retention(),
    );
    let sweeper_task = tokio::spawn(sweeper.run(stop_rx.clone()));
    let reaper_task = tokio::spawn(Arc::clone(&manager).run_idle_reaper(stop_rx));

    let app = router(
        AppState::new(Arc::clone(&manager), relay),
        store.root(),
        &config.public_dir(),
    );

    match listener.local_addr() {
        Ok(local) => info!(address = %local, hls_dir = %store.root().display(), "tvhls listening"),
        Err(err) => debug!(error = %err, "listener has no local address"),
    }

    let (draining_tx, draining_rx) = oneshot::channel();
    let teardown = {
        let manager = Arc::clone(&manager);
        let stop_tx = Arc::clone(&stop_tx);
        async move {
            shutdown.await;
            info!("shutting down");
            stop_tx.send_replace(true);
            manager.shutdown().await;
            let _ = draining_tx.send(());
        }
    };
    let drain_timeout = config.server.drain_timeout();
    let drain_deadline = async move {
        if draining_rx.await.is_ok() {
            tokio::time::sleep(drain_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(teardown)
        .into_future();
    let served = tokio::select! {
        result = server => result.map_err(ServerError::Serve),
        _ = drain_deadline => {
            warn!(?drain_timeout, "connections still open after drain timeout, closing");
            Ok(())
        }
    };

    // Covers the server failing before the shutdown signal ever fired.
    stop_tx.send_replace(true);
    manager.shutdown().await;
    let _ = tokio::join!(sweeper_task, reaper_task);
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
