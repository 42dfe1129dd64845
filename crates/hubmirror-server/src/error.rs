//! Request-level errors and their HTTP surfacing.
//!
//! Clients of the hub API key off `x-error-code`; status codes mirror the
//! upstream hub's quirks (an unknown repository is a 401, not a 404).

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use hubmirror_cache::{CacheFileError, EnvelopeError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("repository not found")]
    RepoNotFound,
    #[error("page not found")]
    PageNotFound,
    #[error("revision not found")]
    RevisionNotFound,
    #[error("entry not found")]
    EntryNotFound,
    #[error("invalid range: {0}")]
    BadRange(String),
    #[error("upstream timed out")]
    ProxyTimeout,
    #[error("invalid data from upstream: {0}")]
    ProxyInvalidData(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::RepoNotFound => StatusCode::UNAUTHORIZED,
            ApiError::PageNotFound
            | ApiError::RevisionNotFound
            | ApiError::EntryNotFound => StatusCode::NOT_FOUND,
            ApiError::BadRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::ProxyTimeout
            | ApiError::ProxyInvalidData(_)
            | ApiError::Internal(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::RepoNotFound | ApiError::PageNotFound => "RepoNotFound",
            ApiError::RevisionNotFound => "RevisionNotFound",
            ApiError::EntryNotFound => "EntryNotFound",
            ApiError::BadRange(_) => "BadRange",
            ApiError::ProxyTimeout => "ProxyTimeout",
            ApiError::ProxyInvalidData(_) | ApiError::Internal(_) => "ProxyInvalidData",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::RepoNotFound => "Repository not found".to_string(),
            ApiError::PageNotFound => {
                "Sorry, we can't find the page you are looking for.".to_string()
            }
            ApiError::RevisionNotFound => "Revision not found".to_string(),
            ApiError::EntryNotFound => "Entry not found".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Internal(_) | ApiError::ProxyInvalidData(_)) {
            tracing::warn!(error = %self, "request failed");
        }
        // The hub's page-not-found reply carries only the error headers;
        // every other variant gets a JSON body.
        let mut response = if matches!(self, ApiError::PageNotFound) {
            self.status().into_response()
        } else {
            let body = serde_json::json!({ "error": self.message() }).to_string();
            let mut response = (self.status(), body).into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        };
        let headers = response.headers_mut();
        if let Ok(code) = HeaderValue::from_str(self.code()) {
            headers.insert("x-error-code", code);
        }
        if let Ok(message) = HeaderValue::from_str(&self.message()) {
            headers.insert("x-error-message", message);
        }
        response
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ApiError::ProxyTimeout
        } else {
            ApiError::ProxyInvalidData(err.to_string())
        }
    }
}

impl From<CacheFileError> for ApiError {
    fn from(err: CacheFileError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<EnvelopeError> for ApiError {
    fn from(err: EnvelopeError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
