//! Error types flowing through the dispatch pipeline.
//!
//! Handlers and middlewares return [`Error`]. The terminator ([`finally`]) maps whatever
//! comes out of the pipeline onto an HTTP status:
//! - [`StatusError`] carries its own code
//! - io `NotFound` and `PermissionDenied` become 404 and 403
//! - everything else becomes 500

use crate::context::{Context, TEXT_PLAIN};
use http::{HeaderValue, StatusCode};
use std::fmt::Display;
use std::io;
use thiserror::Error;
use tracing::error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error tagged with an HTTP status code.
///
/// Codes without a canonical reason phrase are replaced by `418 I'm a teapot`, so the
/// code carried by a `StatusError` is always one the terminator can render.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{text}")]
pub struct StatusError {
    code: StatusCode,
    text: String,
}

impl StatusError {
    pub fn new(code: u16, msg: impl Display) -> Self {
        let code = known_or_teapot(code);
        // known_or_teapot guarantees a canonical reason
        let reason = code.canonical_reason().unwrap_or_default().to_lowercase();
        Self { code, text: format!("{reason}: {msg}") }
    }

    #[inline]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn bad_request(msg: impl Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST.as_u16(), msg)
    }

    pub fn unauthorized(msg: impl Display) -> Self {
        Self::new(StatusCode::UNAUTHORIZED.as_u16(), msg)
    }

    pub fn forbidden(msg: impl Display) -> Self {
        Self::new(StatusCode::FORBIDDEN.as_u16(), msg)
    }

    pub fn not_found(msg: impl Display) -> Self {
        Self::new(StatusCode::NOT_FOUND.as_u16(), msg)
    }

    pub fn method_not_allowed(msg: impl Display) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED.as_u16(), msg)
    }

    pub fn request_timeout(msg: impl Display) -> Self {
        Self::new(StatusCode::REQUEST_TIMEOUT.as_u16(), msg)
    }

    pub fn payload_too_large(msg: impl Display) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE.as_u16(), msg)
    }

    pub fn too_many_requests(msg: impl Display) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS.as_u16(), msg)
    }

    pub fn internal(msg: impl Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), msg)
    }
}

fn known_or_teapot(code: u16) -> StatusCode {
    match StatusCode::from_u16(code) {
        Ok(code) if code.canonical_reason().is_some() => code,
        _ => StatusCode::IM_A_TEAPOT,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(BoxError),
}

impl Error {
    pub fn other<E: Into<BoxError>>(e: E) -> Self {
        Self::Other(e.into())
    }

    /// The status the terminator renders for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Status(e) => e.code(),
            Self::Io { source } => match source.kind() {
                io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true for `StatusError{NotFound}` and for io "file does not exist".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Status(e) => e.code() == StatusCode::NOT_FOUND,
            Self::Io { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn as_status(&self) -> Option<&StatusError> {
        match self {
            Self::Status(e) => Some(e),
            _ => None,
        }
    }
}

/// Writes the error response for the outcome of a pipeline.
///
/// `Ok` means a handler already wrote the response. If something has been written the
/// error response is dropped, the first writer wins.
pub(crate) fn finally(ctx: &Context, result: Result<()>) {
    let Err(err) = result else {
        return;
    };

    let code = known_or_teapot(err.status().as_u16());
    if code.is_server_error() {
        error!(method = %ctx.method(), path = ctx.path(), cause = %err, "request failed");
    }

    let text = code.canonical_reason().unwrap_or_default();
    ctx.set_header(http::header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    ctx.write(code, TEXT_PLAIN, text.to_owned());
}
