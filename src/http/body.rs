//! Request body framing.
//!
//! Chosen once per request from the parsed headers, then fed the unconsumed
//! input on every read. Chunked bodies carry their own small state machine:
//!
//! ```text
//! Prefix --size>0--> Data --0 left--> Suffix --CRLF--> Prefix
//!   |
//!   +--size=0--> Trailers --blank line--> Complete
//! ```

use crate::http::error::{BadRequest, HttpError};
use crate::http::headers::HeaderMap;
use crate::http::parser::{HeaderBudget, parse_headers};
use crate::http::reader::SequenceReader;
use crate::http::request::{HttpVersion, Method};

/// Longest chunk-size line (size, extensions and CRLF) accepted.
const MAX_CHUNK_PREFIX_LEN: usize = 1024;

/// Header the conflicting `Content-Length` value is moved to when
/// `Transfer-Encoding` decides the framing.
pub const DIAGNOSTIC_CONTENT_LENGTH: &str = "X-Content-Length";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    Prefix,
    Data { remaining: u64 },
    Suffix,
    Trailers,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    FixedLength { remaining: u64 },
    Chunked(ChunkedState),
}

#[derive(Debug, Clone)]
pub struct MessageBody {
    framing: BodyFraming,
    declared: Option<u64>,
    total_read: u64,
    max_size: Option<u64>,
    started: bool,
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::none()
    }
}

impl MessageBody {
    pub fn none() -> Self {
        Self {
            framing: BodyFraming::None,
            declared: None,
            total_read: 0,
            max_size: None,
            started: false,
        }
    }

    pub fn fixed(length: u64) -> Self {
        if length == 0 {
            return Self::none();
        }
        Self {
            framing: BodyFraming::FixedLength { remaining: length },
            declared: Some(length),
            ..Self::none()
        }
    }

    pub fn chunked() -> Self {
        Self {
            framing: BodyFraming::Chunked(ChunkedState::Prefix),
            ..Self::none()
        }
    }

    /// Picks the framing for a request and normalizes the framing headers.
    ///
    /// `Transfer-Encoding` takes precedence: any `Content-Length` is removed
    /// and its value kept under [`DIAGNOSTIC_CONTENT_LENGTH`].
    pub fn for_request(
        headers: &mut HeaderMap,
        method: &Method,
        version: HttpVersion,
    ) -> Result<Self, BadRequest> {
        if headers.contains("Transfer-Encoding") {
            if let Some(lengths) = headers.remove("Content-Length") {
                headers.insert(DIAGNOSTIC_CONTENT_LENGTH, lengths.join(", "));
            }
            let final_coding = headers.last_token("Transfer-Encoding").unwrap_or("");
            if !final_coding.eq_ignore_ascii_case("chunked") {
                let value = headers.get_joined("Transfer-Encoding").unwrap_or_default();
                return Err(BadRequest::FinalTransferCodingNotChunked(value));
            }
            return Ok(Self::chunked());
        }

        if let Some(length) = content_length(headers)? {
            return Ok(Self::fixed(length));
        }

        if version == HttpVersion::Http10 && matches!(method, Method::POST | Method::PUT) {
            return Err(BadRequest::LengthRequired(method.to_string()));
        }
        Ok(Self::none())
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Length announced by `Content-Length`, if that framed the body.
    pub fn declared_length(&self) -> Option<u64> {
        self.declared
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.framing, BodyFraming::Chunked(_))
    }

    pub fn is_complete(&self) -> bool {
        match self.framing {
            BodyFraming::None => true,
            BodyFraming::FixedLength { remaining } => remaining == 0,
            BodyFraming::Chunked(state) => state == ChunkedState::Complete,
        }
    }

    /// Whether a read has already been attempted.
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    pub fn max_size(&self) -> Option<u64> {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: Option<u64>) -> Result<(), HttpError> {
        if self.started {
            return Err(HttpError::invalid_operation(
                "The maximum request body size cannot be modified after the app has already started reading from the request body.",
            ));
        }
        self.max_size = max_size;
        Ok(())
    }

    /// Error to report when the transport ends before the body does.
    pub fn incomplete_error(&self) -> BadRequest {
        if self.is_chunked() {
            BadRequest::ChunkedRequestIncomplete
        } else {
            BadRequest::UnexpectedEndOfRequestContent
        }
    }

    /// Decodes as much body as `reader` and `dst` allow.
    ///
    /// Returns the payload bytes copied into `dst`. `Ok(0)` with
    /// [`is_complete`](Self::is_complete) still false means more input is
    /// needed. Framing bytes are consumed from `reader` even when no payload
    /// is produced, so a chunked body completes as soon as its terminator
    /// has arrived.
    pub fn read<B: AsRef<[u8]>>(
        &mut self,
        reader: &mut SequenceReader<'_, B>,
        dst: &mut [u8],
        trailers: &mut HeaderMap,
        budget: &mut HeaderBudget,
    ) -> Result<usize, HttpError> {
        if !self.started {
            self.started = true;
            if let (Some(declared), Some(max)) = (self.declared, self.max_size) {
                if declared > max {
                    return Err(BadRequest::RequestBodyTooLarge.into());
                }
            }
        }

        match self.framing {
            BodyFraming::None => Ok(0),
            BodyFraming::FixedLength { remaining } => {
                let want = remaining.min(dst.len() as u64) as usize;
                let n = reader.read_into(&mut dst[..want]);
                self.framing = BodyFraming::FixedLength {
                    remaining: remaining - n as u64,
                };
                self.total_read += n as u64;
                Ok(n)
            }
            BodyFraming::Chunked(_) => self.read_chunked(reader, dst, trailers, budget),
        }
    }

    fn read_chunked<B: AsRef<[u8]>>(
        &mut self,
        reader: &mut SequenceReader<'_, B>,
        dst: &mut [u8],
        trailers: &mut HeaderMap,
        budget: &mut HeaderBudget,
    ) -> Result<usize, HttpError> {
        let mut copied = 0;
        loop {
            let BodyFraming::Chunked(state) = self.framing else {
                return Ok(copied);
            };
            let next = match state {
                ChunkedState::Prefix => {
                    let Some(size) = read_chunk_prefix(reader)? else {
                        return Ok(copied);
                    };
                    if size == 0 {
                        ChunkedState::Trailers
                    } else {
                        let total = self.total_read.saturating_add(size);
                        if self.max_size.is_some_and(|max| total > max) {
                            return Err(BadRequest::RequestBodyTooLarge.into());
                        }
                        ChunkedState::Data { remaining: size }
                    }
                }
                ChunkedState::Data { remaining } => {
                    let want = remaining.min((dst.len() - copied) as u64) as usize;
                    if want == 0 {
                        return Ok(copied);
                    }
                    let n = reader.read_into(&mut dst[copied..copied + want]);
                    if n == 0 {
                        return Ok(copied);
                    }
                    copied += n;
                    self.total_read += n as u64;
                    match remaining - n as u64 {
                        0 => ChunkedState::Suffix,
                        left => ChunkedState::Data { remaining: left },
                    }
                }
                ChunkedState::Suffix => {
                    if reader.remaining() < 2 {
                        return Ok(copied);
                    }
                    if !reader.is_next(b"\r\n") {
                        return Err(BadRequest::BadChunkSuffix.into());
                    }
                    reader.advance(2);
                    ChunkedState::Prefix
                }
                ChunkedState::Trailers => {
                    if !parse_headers(reader, trailers, budget)? {
                        return Ok(copied);
                    }
                    ChunkedState::Complete
                }
                ChunkedState::Complete => return Ok(copied),
            };
            self.framing = BodyFraming::Chunked(next);
        }
    }
}

/// Parses `chunk-size [; ext] CRLF`. Extensions are ignored.
fn read_chunk_prefix<B: AsRef<[u8]>>(
    reader: &mut SequenceReader<'_, B>,
) -> Result<Option<u64>, BadRequest> {
    let mut probe = reader.clone();
    let Some(line) = probe.try_read_to(b"\n") else {
        if reader.remaining() >= MAX_CHUNK_PREFIX_LEN {
            return Err(BadRequest::BadChunkSizeData);
        }
        return Ok(None);
    };
    if line.len() + 1 > MAX_CHUNK_PREFIX_LEN {
        return Err(BadRequest::BadChunkSizeData);
    }
    let line = line.strip_suffix(b"\r").ok_or(BadRequest::BadChunkSizeData)?;

    let digits_end = line.iter().position(|&b| b == b';').unwrap_or(line.len());
    let digits = line[..digits_end]
        .strip_suffix(b" ")
        .unwrap_or(&line[..digits_end]);
    // 16 hex digits fill a u64.
    if digits.is_empty() || digits.len() > 16 {
        return Err(BadRequest::BadChunkSizeData);
    }
    let mut size: u64 = 0;
    for &b in digits {
        let digit = (b as char).to_digit(16).ok_or(BadRequest::BadChunkSizeData)?;
        size = (size << 4) | u64::from(digit);
    }

    *reader = probe;
    Ok(Some(size))
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, BadRequest> {
    let mut length = None;
    for value in headers.get_all("Content-Length") {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BadRequest::InvalidContentLength(value.to_string()));
        }
        let parsed: u64 = value
            .parse()
            .map_err(|_| BadRequest::InvalidContentLength(value.to_string()))?;
        match length {
            Some(previous) if previous != parsed => return Err(BadRequest::MultipleContentLengths),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}
