use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::http::error::HttpError;
use crate::http::headers::HeaderMap;

/// Version written on every status line. HTTP/1.0 clients are answered
/// with an HTTP/1.1 status line and close-delimited framing.
pub const HTTP_VERSION: &str = "HTTP/1.1";

/// An HTTP status code.
///
/// Any value in `100..=999` can be represented; the well-known ones have
/// named constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const SWITCHING_PROTOCOLS: StatusCode = StatusCode(101);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const LENGTH_REQUIRED: StatusCode = StatusCode(411);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const URI_TOO_LONG: StatusCode = StatusCode(414);
    pub const REQUEST_HEADER_FIELDS_TOO_LARGE: StatusCode = StatusCode(431);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const HTTP_VERSION_NOT_SUPPORTED: StatusCode = StatusCode(505);

    /// # Example
    ///
    /// ```
    /// # use keel::http::response::StatusCode;
    /// assert_eq!(StatusCode::from_u16(404).unwrap(), StatusCode::NOT_FOUND);
    /// assert!(StatusCode::from_u16(42).is_err());
    /// ```
    pub fn from_u16(code: u16) -> Result<Self, HttpError> {
        if !(100..=999).contains(&code) {
            return Err(HttpError::invalid_argument(format!(
                "status code {} is outside 100..=999",
                code
            )));
        }
        Ok(StatusCode(code))
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard reason phrase, or `""` for unknown codes.
    ///
    /// # Example
    ///
    /// ```
    /// # use keel::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode::URI_TOO_LONG.reason_phrase(), "URI Too Long");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            409 => "Conflict",
            411 => "Length Required",
            413 => "Payload Too Large",
            414 => "URI Too Long",
            415 => "Unsupported Media Type",
            431 => "Request Header Fields Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }

    /// Informational responses, 204 and 304 never carry a body.
    pub fn allows_body(&self) -> bool {
        !(self.0 < 200 || self.0 == 204 || self.0 == 304)
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::OK
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializes a status line and header block, blank line included.
///
/// `reason` overrides the standard phrase when set.
pub fn write_head(buf: &mut BytesMut, status: StatusCode, reason: Option<&str>, headers: &HeaderMap) {
    let reason = reason.unwrap_or_else(|| status.reason_phrase());
    buf.reserve(HTTP_VERSION.len() + reason.len() + headers.byte_size() + 8);

    buf.put_slice(HTTP_VERSION.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in headers.iter() {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
}
