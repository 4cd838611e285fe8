use std::fmt;

use crate::http::error::{BadRequest, diagnostic};

/// HTTP request methods.
///
/// Well-known methods get their own variant; any other token is kept
/// verbatim in `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Loop-back test
    TRACE,
    /// Any other token
    Custom(String),
}

impl Method {
    /// Parses one of the well-known HTTP methods.
    ///
    /// # Example
    ///
    /// ```
    /// # use keel::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    /// Parses a method token as it appears on the wire. Returns `None` when
    /// the token is empty or contains a non-token byte.
    pub fn from_token(token: &[u8]) -> Option<Self> {
        if token.is_empty() || !token.iter().all(|&b| is_token_char(b)) {
            return None;
        }
        // Token characters are ASCII.
        let s = std::str::from_utf8(token).ok()?;
        Some(Self::from_str(s).unwrap_or_else(|| Method::Custom(s.to_string())))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
            Method::Custom(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed first line of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    /// Target exactly as received.
    pub raw_target: String,
    /// Percent-decoded path with dot segments removed. Empty for
    /// authority-form and asterisk-form targets.
    pub path: String,
    /// Query including the leading `?`, or empty.
    pub query: String,
    pub version: HttpVersion,
    /// `host[:port]` of an absolute-form target. The port is left out when
    /// it is the scheme default.
    pub authority: Option<String>,
    /// Scheme default port of an absolute-form target that omitted its port
    /// or spelled out the default.
    pub default_port: Option<u16>,
}

impl RequestLine {
    /// Interprets `target` in the form implied by `method`.
    pub fn from_parts(method: Method, target: &str, version: HttpVersion) -> Result<Self, BadRequest> {
        let mut line = RequestLine {
            method,
            raw_target: target.to_string(),
            path: String::new(),
            query: String::new(),
            version,
            authority: None,
            default_port: None,
        };

        if line.method == Method::CONNECT {
            if target.is_empty() || target.starts_with('/') || !is_valid_host(target) {
                return Err(BadRequest::InvalidRequestTarget(diagnostic(target.as_bytes())));
            }
            line.authority = Some(target.to_string());
            return Ok(line);
        }

        if target.starts_with('/') {
            let (path, query) = split_query(target);
            line.path = remove_dot_segments(&decode_path(path)?);
            line.query = query.to_string();
            return Ok(line);
        }

        if target == "*" {
            if line.method != Method::OPTIONS {
                return Err(BadRequest::MethodNotAllowed {
                    allow: Method::OPTIONS.to_string(),
                });
            }
            return Ok(line);
        }

        let url = url::Url::parse(target)
            .map_err(|_| BadRequest::InvalidRequestTarget(diagnostic(target.as_bytes())))?;
        let host = url
            .host_str()
            .ok_or_else(|| BadRequest::InvalidRequestTarget(diagnostic(target.as_bytes())))?;
        line.authority = Some(match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        });
        if url.port().is_none() {
            line.default_port = url.port_or_known_default();
        }
        line.path = remove_dot_segments(&decode_path(url.path())?);
        line.query = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
        Ok(line)
    }
}

fn split_query(target: &str) -> (&str, &str) {
    match target.find('?') {
        Some(i) => target.split_at(i),
        None => (target, ""),
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes a path.
///
/// `%2F` stays encoded so decoding never changes the segment structure.
/// An encoded NUL is rejected. If the decoded bytes are not UTF-8 the raw
/// path is returned unchanged.
pub fn decode_path(raw: &str) -> Result<String, BadRequest> {
    let bytes = raw.as_bytes();
    if !bytes.contains(&b'%') {
        return Ok(raw.to_string());
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi << 4 | lo;
                if decoded == 0 {
                    return Err(BadRequest::InvalidRequestTarget(diagnostic(bytes)));
                }
                if decoded == b'/' {
                    out.extend_from_slice(&bytes[i..i + 3]);
                } else {
                    out.push(decoded);
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    Ok(String::from_utf8(out).unwrap_or_else(|_| raw.to_string()))
}

/// Removes `.` and `..` segments from an absolute path.
///
/// A pure string rewrite: `..` never climbs above the root.
pub fn remove_dot_segments(path: &str) -> String {
    if !path.contains('.') {
        return path.to_string();
    }
    let Some(rest) = path.strip_prefix('/') else {
        return path.to_string();
    };

    let segments: Vec<&str> = rest.split('/').collect();
    let last = segments.len() - 1;
    let mut output: Vec<&str> = Vec::with_capacity(segments.len());
    for (i, segment) in segments.into_iter().enumerate() {
        match segment {
            "." => {
                if i == last {
                    output.push("");
                }
            }
            ".." => {
                output.pop();
                if i == last {
                    output.push("");
                }
            }
            other => output.push(other),
        }
    }

    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    normalized.push_str(&output.join("/"));
    normalized
}

/// RFC 7230 `tchar`.
pub fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Whether `host` is an acceptable `Host` header or authority value:
/// a reg-name, IPv4 or bracketed IPv6 literal with an optional numeric
/// port. The empty string is accepted.
pub fn is_valid_host(host: &str) -> bool {
    if host.is_empty() {
        return true;
    }

    let (name, port) = if let Some(rest) = host.strip_prefix('[') {
        let Some(close) = rest.find(']') else {
            return false;
        };
        let literal = &rest[..close];
        if literal.is_empty()
            || !literal
                .bytes()
                .all(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.')
        {
            return false;
        }
        let after = &rest[close + 1..];
        match after.strip_prefix(':') {
            Some(port) => ("", Some(port)),
            None if after.is_empty() => ("", None),
            None => return false,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) => (name, Some(port)),
            None => (host, None),
        }
    };

    if let Some(port) = port {
        if !port.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }

    name.bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=%".contains(&b))
}
