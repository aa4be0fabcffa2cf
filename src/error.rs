//! Error taxonomy and HTTP responses
//!
//! Orchestration callers get structured JSON payloads; the proxy, which runs
//! ahead of that machinery, answers with plain-text bodies.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Platform error taxonomy
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required input was missing or malformed
    #[error("{0}")]
    Validation(String),

    /// No deployment record for the given id or subdomain
    #[error("{0}")]
    NotFound(String),

    /// A container-runtime call failed
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// A new revision never passed its health probes; the old revision is untouched
    #[error("revision failed health checks after {attempts} attempts")]
    HealthCheck { attempts: u32 },

    /// Port allocation gave up after the configured attempt cap
    #[error("no free port in {start}..{end} after {attempts} attempts")]
    ResourceExhausted { attempts: u32, start: u16, end: u16 },

    /// A bounded poll exhausted its attempt budget
    #[error("gave up after {attempts} attempts at {interval:?} intervals")]
    PollTimeout { attempts: u32, interval: Duration },

    /// Edge vhost registration failed
    #[error("edge registration failed: {0}")]
    Edge(String),

    /// Store or other internal failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// HTTP status this error maps to when surfaced to an API caller
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Runtime(_)
            | Error::HealthCheck { .. }
            | Error::ResourceExhausted { .. }
            | Error::PollTimeout { .. }
            | Error::Edge(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Runtime(_) => "RUNTIME_ERROR",
            Error::HealthCheck { .. } => "HEALTH_CHECK_FAILURE",
            Error::ResourceExhausted { .. } => "RESOURCE_EXHAUSTED",
            Error::PollTimeout { .. } => "POLL_TIMEOUT",
            Error::Edge(_) => "EDGE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Structured error payload for the orchestration API surface
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub status: u16,
}

impl ErrorBody {
    pub fn from_error(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            status: err.status_code().as_u16(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code,
                self.message.replace('"', "\\\""),
                self.status
            )
        })
    }
}

/// Plain-text response used by the resolver/proxy
pub fn text_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static headers")
}
