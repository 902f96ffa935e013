//! Turns a request target into a dataset lookup.
//!
//! ```text
//! PARSE_TARGET ──► CACHE_LOOKUP ──► FANOUT_SCAN ──► RESPOND
//!      │                │                │
//!      └── BadRequest   ├── NotFound     └── NotFound (recorded)
//!                       ├── NotFound (cached)
//!                       └── Internal
//! ```

use axum::http::StatusCode;

use crate::dataset::{DatasetCache, Outcome};
use crate::Error;

/// A successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Found {
    pub dataset: String,
    pub filename: String,
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

#[derive(Debug)]
pub enum LookupError {
    /// The target could not be parsed into a dataset and a filename.
    BadRequest(String),
    /// `cached` is set when the miss was answered from the negative cache.
    NotFound { message: String, cached: bool },
    UnsupportedMethod(String),
    /// Storage failure. `message` is safe to show to clients; `source` is not.
    Internal { message: String, source: Error },
}

impl LookupError {
    pub fn status(&self) -> StatusCode {
        match self {
            LookupError::BadRequest(_) => StatusCode::NOT_ACCEPTABLE,
            LookupError::NotFound { .. } => StatusCode::NOT_FOUND,
            LookupError::UnsupportedMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            LookupError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message for the client.
    pub fn message(&self) -> &str {
        match self {
            LookupError::BadRequest(message)
            | LookupError::NotFound { message, .. }
            | LookupError::UnsupportedMethod(message)
            | LookupError::Internal { message, .. } => message,
        }
    }

    /// True for a miss answered without any shard I/O.
    pub fn is_cached_miss(&self) -> bool {
        matches!(self, LookupError::NotFound { cached: true, .. })
    }

    pub(crate) fn internal(message: impl Into<String>, source: Error) -> Self {
        LookupError::Internal {
            message: message.into(),
            source,
        }
    }
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::Internal { message, source } => write!(f, "{}: {}", message, source),
            other => write!(f, "{}", other.message()),
        }
    }
}

impl std::error::Error for LookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LookupError::Internal { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Splits `target` at its last `/` into `(dataset, filename)`.
///
/// Both halves must be non-empty; the dataset keeps its leading `/`.
pub fn split_target(target: &str) -> Option<(&str, &str)> {
    let idx = target.rfind('/')?;
    if idx < 1 || idx == target.len() - 1 {
        return None;
    }
    Some((&target[..idx], &target[idx + 1..]))
}

/// Cache key for a dataset path: a single leading `/`, no empty segments and
/// no trailing `/`, so `/tiles//2024/` and `/tiles/2024` name one dataset.
/// `None` when no segment is left.
pub fn canonical_dataset(path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }
    Some(format!("/{}", segments.join("/")))
}

fn has_relative_segments(path: &str) -> bool {
    path.split('/').any(|segment| segment == "." || segment == "..")
}

/// Content type for a filename, from its extension.
pub fn mime_type(filename: &str) -> &'static str {
    mime_guess::from_path(filename)
        .first_raw()
        .unwrap_or("application/octet-stream")
}

/// Looks up `target` (`/dataset/path/filename`) in the cache.
pub fn lookup(cache: &DatasetCache, target: &str) -> Result<Found, LookupError> {
    let split_error = || {
        LookupError::BadRequest(format!(
            "Error splitting target into dataset and filename: {}",
            target
        ))
    };
    let (dataset_path, filename) = split_target(target).ok_or_else(split_error)?;
    if has_relative_segments(target) {
        return Err(LookupError::BadRequest(format!(
            "Relative path segments are not allowed: {}",
            target
        )));
    }
    let dataset_name = canonical_dataset(dataset_path).ok_or_else(split_error)?;

    let dataset = cache.get_or_load(&dataset_name).map_err(|e| {
        if e.is_not_found() {
            LookupError::NotFound {
                message: format!("Dataset directory does not exist: {}", dataset_name),
                cached: false,
            }
        } else {
            LookupError::internal(format!("Could not open dataset: {}", dataset_name), e)
        }
    })?;

    let outcome = dataset.find(filename).map_err(|e| {
        LookupError::internal(
            format!(
                "Error looking up dataset={} filename={}",
                dataset_name, filename
            ),
            e,
        )
    })?;

    match outcome {
        Outcome::Found(body) => Ok(Found {
            dataset: dataset_name,
            filename: filename.to_string(),
            body,
            content_type: mime_type(filename),
        }),
        Outcome::Missing { cached } => Err(LookupError::NotFound {
            message: format!(
                "File was not found in any shard{}: dataset={} filename={}",
                if cached { " (cached 404)" } else { "" },
                dataset_name,
                filename
            ),
            cached,
        }),
    }
}

/// Drops the cached entry for the dataset at `target`. Files are never
/// touched. Returns whether the dataset was cached.
pub fn invalidate(cache: &DatasetCache, target: &str) -> Result<bool, LookupError> {
    let not_a_dataset = || LookupError::BadRequest(format!("Not a dataset path: {}", target));
    if !target.starts_with('/') || has_relative_segments(target) {
        return Err(not_a_dataset());
    }
    let dataset = canonical_dataset(target).ok_or_else(not_a_dataset)?;

    let removed = cache
        .invalidate(&dataset)
        .map_err(|e| LookupError::internal(format!("Could not invalidate dataset: {}", dataset), e))?;
    tracing::info!(dataset = %dataset, cached = removed, "Invalidated dataset");
    Ok(removed)
}
