//! Incremental HTTP/1.x request-head parser.
//!
//! Both entry points take a [`SequenceReader`] over the unconsumed input and
//! advance it past whatever they commit. `Ok(None)` / `Ok(false)` means more
//! bytes are needed; `Err` means the bytes present are invalid.

use crate::http::error::{BadRequest, HttpError, diagnostic};
use crate::http::headers::HeaderMap;
use crate::http::reader::SequenceReader;
use crate::http::request::{HttpVersion, Method, RequestLine, is_token_char};

/// Remaining allowance for the header block (and trailers) of one request.
///
/// Only bytes of committed lines are charged, so re-parsing a partially
/// received block never counts the same bytes twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBudget {
    pub remaining_bytes: usize,
    pub remaining_count: usize,
}

impl HeaderBudget {
    pub fn new(max_total_size: usize, max_count: usize) -> Self {
        Self {
            remaining_bytes: max_total_size,
            remaining_count: max_count,
        }
    }
}

/// Parses `method SP request-target SP HTTP-version CRLF`.
///
/// The whole line including its CRLF may not exceed `max_line_size` bytes.
pub fn parse_request_line<B: AsRef<[u8]>>(
    reader: &mut SequenceReader<'_, B>,
    max_line_size: usize,
) -> Result<Option<RequestLine>, BadRequest> {
    let mut probe = reader.clone();
    let Some(line) = probe.try_read_to(b"\n") else {
        if reader.remaining() >= max_line_size {
            return Err(BadRequest::RequestLineTooLong);
        }
        return Ok(None);
    };

    if line.len() + 1 > max_line_size {
        return Err(BadRequest::RequestLineTooLong);
    }
    let Some(line) = line.strip_suffix(b"\r") else {
        return Err(BadRequest::InvalidRequestLine(diagnostic(&line)));
    };

    let request_line = parse_line(line)?;
    *reader = probe;
    Ok(Some(request_line))
}

fn parse_line(line: &[u8]) -> Result<RequestLine, BadRequest> {
    let invalid = || BadRequest::InvalidRequestLine(diagnostic(line));

    let method_end = line.iter().position(|&b| b == b' ').ok_or_else(invalid)?;
    let method = Method::from_token(&line[..method_end]).ok_or_else(invalid)?;

    let rest = &line[method_end + 1..];
    let target_end = rest.iter().position(|&b| b == b' ').ok_or_else(invalid)?;
    let target = &rest[..target_end];
    if target.is_empty() {
        return Err(invalid());
    }
    if target.contains(&0) {
        return Err(BadRequest::InvalidRequestTarget(diagnostic(target)));
    }
    if target.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(invalid());
    }
    let target = std::str::from_utf8(target)
        .map_err(|_| BadRequest::InvalidRequestTarget(diagnostic(target)))?;

    let version = match &rest[target_end + 1..] {
        b"HTTP/1.1" => HttpVersion::Http11,
        b"HTTP/1.0" => HttpVersion::Http10,
        other if other.starts_with(b"HTTP/") && !other.contains(&b' ') => {
            return Err(BadRequest::UnrecognizedHttpVersion(diagnostic(other)));
        }
        _ => return Err(invalid()),
    };

    RequestLine::from_parts(method, target, version)
}

/// Commits complete header lines into `headers` until the empty line.
///
/// Returns `Ok(true)` once the terminating CRLF has been consumed. Used
/// unchanged for chunked trailers.
pub fn parse_headers<B: AsRef<[u8]>>(
    reader: &mut SequenceReader<'_, B>,
    headers: &mut HeaderMap,
    budget: &mut HeaderBudget,
) -> Result<bool, HttpError> {
    loop {
        if reader.is_next(b"\r\n") {
            if budget.remaining_bytes < 2 {
                return Err(BadRequest::HeadersExceedMaxTotalSize.into());
            }
            budget.remaining_bytes -= 2;
            reader.advance(2);
            return Ok(true);
        }

        let mut probe = reader.clone();
        let Some(line) = probe.try_read_to(b"\n") else {
            let pending = reader.remaining();
            if pending > 0 && pending >= budget.remaining_bytes {
                return Err(BadRequest::HeadersExceedMaxTotalSize.into());
            }
            return Ok(false);
        };

        let line_size = line.len() + 1;
        if line_size > budget.remaining_bytes {
            return Err(BadRequest::HeadersExceedMaxTotalSize.into());
        }
        let Some(content) = line.strip_suffix(b"\r") else {
            return Err(invalid_header(&line));
        };
        if budget.remaining_count == 0 {
            return Err(BadRequest::TooManyHeaders.into());
        }

        let (name, value) = split_header_line(content)?;
        budget.remaining_bytes -= line_size;
        budget.remaining_count -= 1;
        headers.append(name, value);
        *reader = probe;
    }
}

fn invalid_header(line: &[u8]) -> HttpError {
    let mut shown = line.to_vec();
    shown.push(b'\n');
    BadRequest::InvalidRequestHeader(diagnostic(&shown)).into()
}

fn split_header_line(line: &[u8]) -> Result<(String, String), HttpError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| invalid_header_crlf(line))?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
        return Err(invalid_header_crlf(line));
    }

    let value = trim_ows(&line[colon + 1..]);
    if value.iter().any(|&b| (b < b' ' && b != b'\t') || b == 0x7f) {
        return Err(invalid_header_crlf(line));
    }
    let value = std::str::from_utf8(value).map_err(|_| {
        HttpError::invalid_operation(format!(
            "Invalid characters in the value of header '{}'.",
            String::from_utf8_lossy(name)
        ))
    })?;

    // Token characters are ASCII.
    let name = String::from_utf8_lossy(name).into_owned();
    Ok((name, value.to_string()))
}

fn invalid_header_crlf(line: &[u8]) -> HttpError {
    let mut shown = line.to_vec();
    shown.extend_from_slice(b"\r\n");
    BadRequest::InvalidRequestHeader(diagnostic(&shown)).into()
}

/// Trim optional whitespace (OWS: SP / HTAB) from both ends.
fn trim_ows(buf: &[u8]) -> &[u8] {
    let start = buf.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(buf.len());
    let end = buf.iter().rposition(|&b| b != b' ' && b != b'\t').map(|i| i + 1).unwrap_or(start);
    &buf[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_line_bytes(input: &[u8], max: usize) -> Result<Option<RequestLine>, BadRequest> {
        let segments = [input];
        let mut reader = SequenceReader::new(&segments);
        parse_request_line(&mut reader, max)
    }

    #[test]
    fn parse_simple_get() {
        let line = parse_line_bytes(b"GET /a/b?x=1 HTTP/1.1\r\n", 8192).unwrap().unwrap();
        assert_eq!(line.method, Method::GET);
        assert_eq!(line.path, "/a/b");
        assert_eq!(line.query, "?x=1");
        assert_eq!(line.raw_target, "/a/b?x=1");
        assert_eq!(line.version, HttpVersion::Http11);
    }

    #[test]
    fn bare_lf_is_rejected() {
        let err = parse_line_bytes(b"GET / HTTP/1.1\n", 8192).unwrap_err();
        assert!(matches!(err, BadRequest::InvalidRequestLine(_)));
    }

    #[test]
    fn trim_ows_cases() {
        assert_eq!(trim_ows(b"  hello  "), b"hello");
        assert_eq!(trim_ows(b"\thello\t"), b"hello");
        assert_eq!(trim_ows(b"   "), b"");
        assert_eq!(trim_ows(b""), b"");
    }

    #[test]
    fn header_budget_charges_only_committed_lines() {
        let mut headers = HeaderMap::new();
        let mut budget = HeaderBudget::new(1024, 10);

        let first: [&[u8]; 1] = [b"A: 1\r\nB: "];
        let mut reader = SequenceReader::new(&first);
        assert!(!parse_headers(&mut reader, &mut headers, &mut budget).unwrap());
        assert_eq!(reader.consumed(), 6);
        assert_eq!(budget.remaining_bytes, 1024 - 6);
        assert_eq!(budget.remaining_count, 9);
    }
}
