//! Error taxonomy for the connection engine.
//!
//! Protocol errors ([`BadRequest`]) carry the status code sent back to the
//! client. Everything the engine can fail with is folded into [`HttpError`].

use thiserror::Error;

use crate::http::cancel::AbortReason;
use crate::http::response::StatusCode;

/// Longest slice of offending input echoed back in a diagnostic.
const MAX_DIAGNOSTIC_LEN: usize = 128;

/// A request the engine refuses to process.
///
/// Each variant maps to one status code via [`BadRequest::status_code`] and
/// renders a stable message, so callers can tell limit violations apart by
/// text alone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BadRequest {
    #[error("Request line too long.")]
    RequestLineTooLong,
    #[error("Invalid request line: '{0}'")]
    InvalidRequestLine(String),
    #[error("Invalid request target: '{0}'")]
    InvalidRequestTarget(String),
    #[error("Method not allowed.")]
    MethodNotAllowed { allow: String },
    #[error("Unrecognized HTTP version: '{0}'")]
    UnrecognizedHttpVersion(String),
    #[error("Invalid request header: '{0}'")]
    InvalidRequestHeader(String),
    #[error("Request contains too many headers.")]
    TooManyHeaders,
    #[error("Request headers exceed max total size.")]
    HeadersExceedMaxTotalSize,
    #[error("Request is missing Host header.")]
    MissingHostHeader,
    #[error("Multiple Host headers.")]
    MultipleHostHeaders,
    #[error("Invalid Host header: '{0}'")]
    InvalidHostHeader(String),
    #[error("Invalid content length: {0}")]
    InvalidContentLength(String),
    #[error("Multiple Content-Length headers.")]
    MultipleContentLengths,
    #[error("{0} request contains no Content-Length or Transfer-Encoding header.")]
    LengthRequired(String),
    #[error("The message body length cannot be determined because the final transfer coding was set to '{0}' instead of 'chunked'.")]
    FinalTransferCodingNotChunked(String),
    #[error("Bad chunk size data.")]
    BadChunkSizeData,
    #[error("Bad chunk suffix.")]
    BadChunkSuffix,
    #[error("Chunked request incomplete.")]
    ChunkedRequestIncomplete,
    #[error("Unexpected end of request content.")]
    UnexpectedEndOfRequestContent,
    #[error("Request body too large.")]
    RequestBodyTooLarge,
}

impl BadRequest {
    /// Status code of the response sent for this rejection.
    pub fn status_code(&self) -> StatusCode {
        match self {
            BadRequest::RequestLineTooLong => StatusCode::URI_TOO_LONG,
            BadRequest::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            BadRequest::UnrecognizedHttpVersion(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            BadRequest::TooManyHeaders | BadRequest::HeadersExceedMaxTotalSize => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            BadRequest::LengthRequired(_) => StatusCode::LENGTH_REQUIRED,
            BadRequest::RequestBodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Value of the `Allow` header for 405 rejections.
    pub fn allow(&self) -> Option<&str> {
        match self {
            BadRequest::MethodNotAllowed { allow } => Some(allow),
            _ => None,
        }
    }
}

/// Any failure surfaced by the engine.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    BadRequest(#[from] BadRequest),
    /// Contract violation by the calling code, e.g. mutating a started response.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection aborted: {0}")]
    ConnectionAborted(AbortReason),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        HttpError::InvalidOperation(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        HttpError::InvalidArgument(msg.into())
    }

    pub fn as_bad_request(&self) -> Option<&BadRequest> {
        match self {
            HttpError::BadRequest(e) => Some(e),
            _ => None,
        }
    }
}

/// Renders raw input for an error message, escaping non-printable bytes.
pub(crate) fn diagnostic(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_DIAGNOSTIC_LEN);
    bytes[..end].escape_ascii().to_string()
}
