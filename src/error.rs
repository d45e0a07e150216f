//! Error types and JSON error responses for the orchestrator

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the reconciliation pipeline and its collaborators.
///
/// Fatal-class errors (`Filesystem`, `MetaParse`, `ConfigRender`) abort the
/// current reconciliation pass; the remaining kinds are per-instance or
/// advisory and are handled inline by the stage that hits them.
#[derive(Debug, Error)]
pub enum Error {
    /// Unreadable directory, meta file, or template file
    #[error("filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The meta file exists but does not parse
    #[error("invalid meta file {path}: {source}")]
    MetaParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// No free port left in the configured range
    #[error("port range {min}..={max} exhausted")]
    PortRangeExhausted { min: u16, max: u16 },

    /// Worker process could not be launched
    #[error("failed to spawn worker for '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A template referenced a key missing from its descriptor
    #[error("template references unknown key '{key}'")]
    ConfigRender { key: String },

    /// The reverse proxy could not be signalled to reload (non-fatal)
    #[error("proxy reload failed: {0}")]
    ProxyReload(#[source] io::Error),

    /// A command targeted a version with no live process
    #[error("no running process for version '{0}'")]
    NoProcess(String),

    /// The worker command line in the configuration is malformed
    #[error("invalid worker command '{command}': {reason}")]
    WorkerCommand { command: String, reason: String },
}

impl Error {
    /// Shorthand for wrapping an io error with the path it occurred on
    pub fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Filesystem {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Helper to create a JSON response - infallible with valid StatusCode
pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Create the 500 error body the admin API returns for handler failures
pub fn json_error_response(err: impl std::fmt::Display) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": err.to_string() });
    json_response(StatusCode::INTERNAL_SERVER_ERROR, body.to_string())
}
