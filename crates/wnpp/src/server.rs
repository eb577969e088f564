use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tracing::{error, info, warn};
use wnpp_core::config::ListingSettings;
use wnpp_core::feed::{DEFAULT_MAX_ENTRIES, FeedQuery, news_entries, render_feed};
use wnpp_core::html::render_front_page;
use wnpp_core::listing::{FrontPageQuery, RequestError, load_front_page};
use wnpp_core::static_files::{
    StaticFile, favicon_path, read_static_file, resolve_static_path, security_txt_path,
};
use wnpp_core::store;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub db_path: PathBuf,
    pub static_dir: PathBuf,
    pub listing: ListingSettings,
}

#[derive(Clone)]
pub struct AppState {
    settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(settings: ServerSettings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[derive(Debug)]
enum AppError {
    BadRequest(RequestError),
    NotFound,
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(error) => {
                warn!("bad request: {error}");
                (StatusCode::BAD_REQUEST, format!("Bad Request: {error}\n")).into_response()
            }
            Self::NotFound => (StatusCode::NOT_FOUND, "Not Found\n").into_response(),
            Self::Internal(error) => {
                error!("request failed: {error:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n").into_response()
            }
        }
    }
}

async fn run_blocking<T, F>(job: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|error| AppError::Internal(anyhow!(error)))?
        .map_err(AppError::Internal)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(front_page_handler))
        .route("/news.php5", get(news_feed_handler))
        .route("/security.txt", get(security_txt_handler))
        .route("/.well-known/security.txt", get(security_txt_handler))
        .route("/static/*path", get(static_file_handler))
        .route("/:file", get(favicon_handler))
        .with_state(state)
}

fn request_url(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|path_and_query| path_and_query.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string())
}

async fn front_page_handler(State(state): State<AppState>, uri: Uri) -> Result<Html<String>, AppError> {
    let query = FrontPageQuery::from_raw_query(uri.query()).map_err(AppError::BadRequest)?;
    let request_url = request_url(&uri);
    let settings = state.settings.clone();
    let html = run_blocking(move || {
        let connection = store::open_connection(&settings.db_path)?;
        let page = load_front_page(&connection, &query, settings.listing)?;
        render_front_page(&page, &query, &request_url, store::unix_timestamp()?)
    })
    .await?;
    Ok(Html(html))
}

async fn news_feed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AppError> {
    let query = FeedQuery::from_raw_query(uri.query()).map_err(AppError::Internal)?;
    let feed_url = absolute_url(&headers, &uri);
    let settings = state.settings.clone();
    let xml = run_blocking(move || {
        let connection = store::open_connection(&settings.db_path)?;
        let entries = news_entries(&connection, query.data_set, DEFAULT_MAX_ENTRIES)?;
        Ok(render_feed(&entries, query, &feed_url, store::unix_timestamp()?))
    })
    .await?;
    Ok((
        [(CONTENT_TYPE, HeaderValue::from_static("application/rss+xml; charset=utf-8"))],
        xml,
    )
        .into_response())
}

fn absolute_url(headers: &HeaderMap, uri: &Uri) -> String {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|value| matches!(*value, "http" | "https"))
        .unwrap_or("http");
    format!("{scheme}://{host}{}", request_url(uri))
}

async fn serve_file(path: Option<PathBuf>) -> Result<Response, AppError> {
    let Some(path) = path else {
        return Err(AppError::NotFound);
    };
    let file = run_blocking(move || read_static_file(&path)).await?;
    match file {
        Some(StaticFile { content_type, body }) => Ok((
            [(CONTENT_TYPE, HeaderValue::from_static(content_type))],
            body,
        )
            .into_response()),
        None => Err(AppError::NotFound),
    }
}

async fn security_txt_handler(State(state): State<AppState>) -> Result<Response, AppError> {
    serve_file(Some(security_txt_path(&state.settings.static_dir))).await
}

async fn static_file_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    serve_file(resolve_static_path(&state.settings.static_dir, &path)).await
}

async fn favicon_handler(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<Response, AppError> {
    serve_file(favicon_path(&state.settings.static_dir, &file)).await
}

pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!("wnpp listening on http://{local_addr}");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .context("server failed")
}

async fn wait_for_shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {error}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
