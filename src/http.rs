//! HTTP surface: one fallback handler serving every path.
//!
//! - `GET /{dataset}/{filename}` returns the stored bytes
//! - `DELETE /{dataset}` drops the dataset from the cache
//!
//! Errors are rendered as small HTML pages unless the query string asks for a
//! canned image for that status, e.g. `?404=transparent`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::dataset::DatasetCache;
use crate::lookup::{self, LookupError};
use crate::Error;

/// Set to `negative-hit` on 404s answered from the negative cache.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-tilecask-cache");

static BLACK_PNG: &[u8] = include_bytes!("../assets/black.png");
static WHITE_PNG: &[u8] = include_bytes!("../assets/white.png");
static TRANSPARENT_PNG: &[u8] = include_bytes!("../assets/transparent.png");

/// Images a client can ask for in place of an error page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CannedImage {
    Black,
    White,
    Transparent,
}

impl CannedImage {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "black" => Some(CannedImage::Black),
            "white" => Some(CannedImage::White),
            "transparent" => Some(CannedImage::Transparent),
            _ => None,
        }
    }

    pub fn png(self) -> &'static [u8] {
        match self {
            CannedImage::Black => BLACK_PNG,
            CannedImage::White => WHITE_PNG,
            CannedImage::Transparent => TRANSPARENT_PNG,
        }
    }

    /// The image requested for `status` by a `?<status>=<name>` parameter.
    pub fn requested(query: Option<&str>, status: StatusCode) -> Option<Self> {
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == status.as_str())
            .and_then(|(_, name)| Self::from_name(name))
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<DatasetCache>,
}

impl AppState {
    pub fn new(cache: Arc<DatasetCache>) -> Self {
        Self { cache }
    }
}

pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(state)
        .layer(TimeoutLayer::new(config.request_timeout))
        .layer(TraceLayer::new_for_http())
}

async fn handle(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let query = uri.query();
    let target = match urlencoding::decode(uri.path()) {
        Ok(target) => target.into_owned(),
        Err(_) => {
            let err = LookupError::BadRequest(format!("Request path is not valid UTF-8: {}", uri.path()));
            return error_response(&err, query);
        }
    };

    let result = match method {
        Method::GET => get(state.cache, target).await,
        Method::DELETE => delete(state.cache, target).await,
        other => Err(LookupError::UnsupportedMethod(format!(
            "HTTP method not supported: {}",
            other
        ))),
    };

    match result {
        Ok(response) => response,
        Err(err) => error_response(&err, query),
    }
}

async fn get(cache: Arc<DatasetCache>, target: String) -> Result<Response, LookupError> {
    let found = tokio::task::spawn_blocking(move || lookup::lookup(&cache, &target))
        .await
        .map_err(join_error)??;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, found.content_type)],
        found.body,
    )
        .into_response())
}

async fn delete(cache: Arc<DatasetCache>, target: String) -> Result<Response, LookupError> {
    let removed = tokio::task::spawn_blocking(move || lookup::invalidate(&cache, &target))
        .await
        .map_err(join_error)??;

    let body = if removed { "invalidated\n" } else { "not cached\n" };
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

fn join_error(e: tokio::task::JoinError) -> LookupError {
    LookupError::internal(
        "Lookup task failed",
        Error::InvalidOperation(e.to_string()),
    )
}

fn error_response(err: &LookupError, query: Option<&str>) -> Response {
    let status = err.status();
    let message = match err {
        LookupError::Internal { message, source } => {
            tracing::error!(error = %source, "{}", message);
            "Internal server error"
        }
        other => {
            tracing::debug!(status = status.as_u16(), "{}", other.message());
            other.message()
        }
    };

    let mut response = match CannedImage::requested(query, status) {
        Some(image) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            image.png(),
        )
            .into_response(),
        None => (
            status,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            error_page(status, message),
        )
            .into_response(),
    };

    if err.is_cached_miss() {
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("negative-hit"));
    }
    response
}

fn error_page(status: StatusCode, message: &str) -> String {
    let code = status.as_u16();
    format!(
        "<html><head><title>Error {code}</title></head><body><h2>Error {code}</h2><p><b>{}</b></p></body></html>\n",
        escape_html(message)
    )
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}
