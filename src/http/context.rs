//! Per-connection request/response state.
//!
//! One [`HttpContext`] lives as long as its connection and is reset between
//! pipelined requests. The serving task is its only writer. Applications
//! see it through the accessors below; the engine drives it through the
//! crate-internal lifecycle methods.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::http::body::MessageBody;
use crate::http::cancel::{AbortReason, CancellationSource, CancellationToken};
use crate::http::error::{BadRequest, HttpError};
use crate::http::features::Features;
use crate::http::headers::HeaderMap;
use crate::http::input::Input;
use crate::http::limits::Limits;
use crate::http::parser::{HeaderBudget, parse_headers, parse_request_line};
use crate::http::pool::MemoryPool;
use crate::http::request::{HttpVersion, Method, is_valid_host};
use crate::http::response::{StatusCode, write_head};
use crate::http::timeout::{MinDataRate, TimeoutControl, TimeoutReason};
use crate::http::writer::{FlushResult, OutputProducer, TransportControl};

/// Interim response sent before the first body read of an
/// `Expect: 100-continue` request.
const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Size of the scratch buffer used to drain unread request bodies.
const DRAIN_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    ReadingStartLine,
    ReadingHeaders,
    RequestReady,
    ResponseInProgress,
    ResponseComplete,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFraming {
    /// Headers not yet written.
    Unknown,
    /// HEAD or a status without a body.
    NoBody,
    ContentLength(u64),
    Chunked,
    /// Body runs until the connection closes.
    CloseDelimited,
}

type OnStarting = Box<dyn FnOnce(&mut HeaderMap) + Send>;
type OnCompleted = Box<dyn FnOnce() + Send>;

pub struct HttpContext {
    connection_id: String,
    request_count: u64,
    trace_identifier: String,
    limits: Arc<Limits>,
    state: ConnectionState,
    remote_addr: Option<SocketAddr>,

    scheme: String,
    method: Method,
    raw_target: String,
    path: String,
    query: String,
    authority: Option<String>,
    default_port: Option<u16>,
    version: HttpVersion,
    request_headers: HeaderMap,
    request_trailers: HeaderMap,
    header_budget: HeaderBudget,
    body: MessageBody,
    expect_continue: bool,
    body_drains: u32,
    keep_alive: bool,
    rejection: Option<BadRequest>,

    status: StatusCode,
    reason_phrase: Option<String>,
    response_headers: HeaderMap,
    response_started: bool,
    response_framing: ResponseFraming,
    response_bytes: u64,
    on_starting: Vec<OnStarting>,
    on_completed: Vec<OnCompleted>,

    min_request_body_data_rate: Option<MinDataRate>,
    min_response_data_rate: Option<MinDataRate>,
    features: Features,

    input: Input,
    output: OutputProducer,
    timeout: TimeoutControl,
    abort: CancellationSource,
    abort_token: CancellationToken,
}

impl HttpContext {
    pub fn new(
        connection_id: impl Into<String>,
        reader: Box<dyn AsyncRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
        pool: MemoryPool,
        limits: Arc<Limits>,
    ) -> Self {
        let abort = CancellationSource::new();
        let abort_token = abort.token();
        let timeout = TimeoutControl::new(abort.clone());
        let output = OutputProducer::new(writer).with_abort_token(abort_token.clone());
        let header_budget = HeaderBudget::new(
            limits.max_request_headers_total_size,
            limits.max_request_header_count,
        );

        Self {
            connection_id: connection_id.into(),
            request_count: 0,
            trace_identifier: String::new(),
            state: ConnectionState::Idle,
            remote_addr: None,
            scheme: "http".to_string(),
            method: Method::GET,
            raw_target: String::new(),
            path: String::new(),
            query: String::new(),
            authority: None,
            default_port: None,
            version: HttpVersion::Http11,
            request_headers: HeaderMap::new(),
            request_trailers: HeaderMap::new(),
            header_budget,
            body: MessageBody::none(),
            expect_continue: false,
            body_drains: 0,
            keep_alive: true,
            rejection: None,
            status: StatusCode::OK,
            reason_phrase: None,
            response_headers: HeaderMap::new(),
            response_started: false,
            response_framing: ResponseFraming::Unknown,
            response_bytes: 0,
            on_starting: Vec::new(),
            on_completed: Vec::new(),
            min_request_body_data_rate: limits.min_request_body_data_rate,
            min_response_data_rate: limits.min_response_data_rate,
            features: Features::new(),
            input: Input::new(reader, pool),
            output,
            timeout,
            abort,
            abort_token,
            limits,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// `{connection id}:{request counter as eight hex digits}`.
    pub fn trace_identifier(&self) -> &str {
        &self.trace_identifier
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        self.remote_addr = addr;
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        self.scheme = scheme.into();
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn raw_target(&self) -> &str {
        &self.raw_target
    }

    /// Percent-decoded path with dot segments removed.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query string including its leading `?`, or empty.
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Authority of an absolute-form or authority-form target.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn request_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.request_headers
    }

    /// Trailers of a chunked body. Empty until the body has been read to
    /// the end.
    pub fn request_trailers(&self) -> &HeaderMap {
        &self.request_trailers
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut Features {
        &mut self.features
    }

    /// Fires when the connection is aborted, whoever aborts it.
    pub fn request_aborted(&self) -> CancellationToken {
        self.abort_token.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_token.is_cancelled()
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_token.reason()
    }

    pub fn timeout_control(&self) -> &TimeoutControl {
        &self.timeout
    }

    /// Whether the connection will be reused after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The protocol error recorded for the current request, if any.
    pub fn rejection(&self) -> Option<&BadRequest> {
        self.rejection.as_ref()
    }

    /// Request bodies the engine had to drain on this connection because
    /// the application left them unread.
    pub fn body_drains(&self) -> u32 {
        self.body_drains
    }

    pub fn min_request_body_data_rate(&self) -> Option<MinDataRate> {
        self.min_request_body_data_rate
    }

    /// Overrides the request body rate for the current request.
    pub fn set_min_request_body_data_rate(&mut self, rate: Option<MinDataRate>) {
        self.min_request_body_data_rate = rate;
    }

    pub fn min_response_data_rate(&self) -> Option<MinDataRate> {
        self.min_response_data_rate
    }

    /// Overrides the response rate for the current request.
    pub fn set_min_response_data_rate(&mut self, rate: Option<MinDataRate>) {
        self.min_response_data_rate = rate;
        self.output.set_min_data_rate(self.timeout.clone(), rate);
    }

    pub fn max_request_body_size(&self) -> Option<u64> {
        self.body.max_size()
    }

    /// Fails once the body has started being read.
    pub fn set_max_request_body_size(&mut self, max: Option<u64>) -> Result<(), HttpError> {
        self.body.set_max_size(max)
    }

    pub fn set_transport_control(&mut self, control: Arc<dyn TransportControl>) {
        self.output.set_transport_control(control);
    }

    pub fn output(&mut self) -> &mut OutputProducer {
        &mut self.output
    }

    /// Restores the per-request state to its defaults. Header maps keep
    /// their allocations and the input keeps any pipelined bytes.
    pub fn reset(&mut self) {
        self.request_count += 1;
        self.trace_identifier = format!("{}:{:08X}", self.connection_id, self.request_count);
        self.state = ConnectionState::Idle;

        self.scheme.clear();
        self.scheme.push_str("http");
        self.method = Method::GET;
        self.raw_target.clear();
        self.path.clear();
        self.query.clear();
        self.authority = None;
        self.default_port = None;
        self.version = HttpVersion::Http11;
        self.request_headers.clear();
        self.request_trailers.clear();
        self.header_budget = self.fresh_budget();
        self.body = MessageBody::none();
        self.expect_continue = false;
        self.keep_alive = true;
        self.rejection = None;

        self.status = StatusCode::OK;
        self.reason_phrase = None;
        self.response_headers.clear();
        self.response_started = false;
        self.response_framing = ResponseFraming::Unknown;
        self.response_bytes = 0;
        self.on_starting.clear();
        self.on_completed.clear();
        self.features.clear();

        self.min_request_body_data_rate = self.limits.min_request_body_data_rate;
        self.min_response_data_rate = self.limits.min_response_data_rate;
        self.output
            .set_min_data_rate(self.timeout.clone(), self.min_response_data_rate);
        self.timeout.reset();
        self.timeout
            .reset_timeout(self.limits.keep_alive_timeout, TimeoutReason::KeepAlive);
    }

    fn fresh_budget(&self) -> HeaderBudget {
        HeaderBudget::new(
            self.limits.max_request_headers_total_size,
            self.limits.max_request_header_count,
        )
    }

    fn aborted_error(&self) -> HttpError {
        HttpError::ConnectionAborted(
            self.abort_token
                .reason()
                .unwrap_or(AbortReason::ApplicationAbort),
        )
    }

    /// Reads until a full request head is parsed and validated.
    ///
    /// Returns `Ok(false)` when the peer closed the connection cleanly
    /// between requests.
    pub async fn read_request_head(&mut self) -> Result<bool, HttpError> {
        self.state = ConnectionState::ReadingStartLine;
        let token = self.abort_token.clone();
        let mut parse = self.input.has_unexamined();

        loop {
            if parse {
                if self.timeout.armed() == Some(TimeoutReason::KeepAlive) {
                    self.timeout.reset_timeout(
                        self.limits.request_headers_timeout,
                        TimeoutReason::RequestHeaders,
                    );
                }
                if self.try_parse_head()? {
                    self.timeout.cancel_timeout();
                    self.on_head_parsed()?;
                    return Ok(true);
                }
            }

            let n = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.aborted_error()),
                n = self.input.fill() => n?,
            };
            if n == 0 {
                if self.input.buffered() == 0 && self.state == ConnectionState::ReadingStartLine {
                    return Ok(false);
                }
                return Err(BadRequest::UnexpectedEndOfRequestContent.into());
            }
            parse = true;
        }
    }

    /// Parses as much of the head as is buffered. Committed lines are
    /// released from the input; a partial line is marked examined.
    fn try_parse_head(&mut self) -> Result<bool, HttpError> {
        let mut reader = self.input.reader();

        if self.state == ConnectionState::ReadingStartLine {
            if let Some(line) = parse_request_line(&mut reader, self.limits.max_request_line_size)? {
                self.method = line.method;
                self.raw_target = line.raw_target;
                self.path = line.path;
                self.query = line.query;
                self.version = line.version;
                self.authority = line.authority;
                self.default_port = line.default_port;
                self.state = ConnectionState::ReadingHeaders;
            }
        }

        let mut complete = false;
        if self.state == ConnectionState::ReadingHeaders {
            complete = parse_headers(&mut reader, &mut self.request_headers, &mut self.header_budget)?;
        }

        let consumed = reader.consumed();
        let examined = if complete { consumed } else { reader.len() };
        self.input.advance_to(consumed, examined);
        Ok(complete)
    }

    fn on_head_parsed(&mut self) -> Result<(), HttpError> {
        self.validate_host()?;

        let mut body = MessageBody::for_request(&mut self.request_headers, &self.method, self.version)?;
        body.set_max_size(self.limits.max_request_body_size)?;
        self.body = body;

        let close = self.request_headers.contains_token("Connection", "close");
        self.keep_alive = match self.version {
            HttpVersion::Http11 => !close,
            HttpVersion::Http10 => {
                !close && self.request_headers.contains_token("Connection", "keep-alive")
            }
        };

        self.expect_continue = self.version == HttpVersion::Http11
            && !self.body.is_complete()
            && self
                .request_headers
                .get("Expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

        // Trailers get a budget of their own.
        self.header_budget = self.fresh_budget();
        self.state = ConnectionState::RequestReady;

        debug!(
            connection_id = %self.connection_id,
            trace_id = %self.trace_identifier,
            method = %self.method,
            path = %self.path,
            version = %self.version,
            "request head parsed"
        );
        Ok(())
    }

    fn validate_host(&self) -> Result<(), BadRequest> {
        let mut hosts = self.request_headers.get_all("Host");
        let Some(host) = hosts.next() else {
            if self.version == HttpVersion::Http10 {
                return Ok(());
            }
            return Err(BadRequest::MissingHostHeader);
        };
        if hosts.next().is_some() {
            return Err(BadRequest::MultipleHostHeaders);
        }
        if !is_valid_host(host) {
            return Err(BadRequest::InvalidHostHeader(host.to_string()));
        }
        if let Some(authority) = &self.authority {
            let with_default_port = self
                .default_port
                .is_some_and(|port| host.eq_ignore_ascii_case(&format!("{}:{}", authority, port)));
            if !authority.eq_ignore_ascii_case(host) && !with_default_port {
                return Err(BadRequest::InvalidHostHeader(host.to_string()));
            }
        }
        Ok(())
    }

    /// Reads request body bytes into `buf`. `Ok(0)` means the body is done.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        if self.is_aborted() {
            return Err(self.aborted_error());
        }
        if buf.is_empty() || self.body.is_complete() {
            return Ok(0);
        }

        if self.expect_continue {
            self.expect_continue = false;
            if !self.response_started {
                self.output.write(CONTINUE_RESPONSE).await;
                self.output.flush().await;
            }
        }
        if !self.body.is_started() {
            if let Some(rate) = self.min_request_body_data_rate {
                self.timeout.start_timing_reads(rate);
            }
        }

        let token = self.abort_token.clone();
        loop {
            let mut reader = self.input.reader();
            let read = self.body.read(
                &mut reader,
                buf,
                &mut self.request_trailers,
                &mut self.header_budget,
            );
            let consumed = reader.consumed();
            let available = reader.len();
            let n = match read {
                Ok(n) => n,
                Err(e) => return Err(self.record_body_error(e)),
            };

            let complete = self.body.is_complete();
            let examined = if n == 0 && !complete { available } else { consumed };
            self.input.advance_to(consumed, examined);

            if complete {
                self.timeout.stop_timing_reads();
            }
            if n > 0 {
                self.timeout.bytes_read(n);
                return Ok(n);
            }
            if complete {
                return Ok(0);
            }

            self.timeout.resume_timing_reads();
            let filled = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                n = self.input.fill() => Some(n),
            };
            self.timeout.pause_timing_reads();

            match filled {
                None => return Err(self.aborted_error()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(0)) => {
                    let err = self.body.incomplete_error();
                    return Err(self.record_body_error(err.into()));
                }
                Some(Ok(_)) => {}
            }
        }
    }

    fn record_body_error(&mut self, err: HttpError) -> HttpError {
        if let Some(bad) = err.as_bad_request() {
            self.rejection = Some(bad.clone());
            self.keep_alive = false;
        }
        err
    }

    pub async fn read_body_to_end(&mut self) -> Result<Vec<u8>, HttpError> {
        let mut body = Vec::new();
        let mut chunk = [0u8; DRAIN_BUFFER_SIZE];
        loop {
            let n = self.read_body(&mut chunk).await?;
            if n == 0 {
                return Ok(body);
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    /// Discards whatever the application left unread so the next request
    /// starts at the right position.
    pub async fn consume_body(&mut self) -> Result<(), HttpError> {
        if self.body.is_complete() {
            return Ok(());
        }
        if self.expect_continue {
            self.keep_alive = false;
            return Ok(());
        }
        self.body_drains += 1;
        let mut scratch = [0u8; DRAIN_BUFFER_SIZE];
        while self.read_body(&mut scratch).await? > 0 {}
        Ok(())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), HttpError> {
        self.ensure_not_started("StatusCode")?;
        self.status = status;
        Ok(())
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        self.reason_phrase.as_deref()
    }

    pub fn set_reason_phrase(&mut self, reason: impl Into<String>) -> Result<(), HttpError> {
        self.ensure_not_started("ReasonPhrase")?;
        self.reason_phrase = Some(reason.into());
        Ok(())
    }

    /// Whether the first response byte has been produced.
    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_headers_mut(&mut self) -> Result<&mut HeaderMap, HttpError> {
        self.ensure_not_started("Headers")?;
        Ok(&mut self.response_headers)
    }

    /// Runs `callback` just before the response head is written.
    /// Callbacks run in reverse registration order.
    pub fn on_starting<F>(&mut self, callback: F) -> Result<(), HttpError>
    where
        F: FnOnce(&mut HeaderMap) + Send + 'static,
    {
        self.ensure_not_started("OnStarting")?;
        self.on_starting.push(Box::new(callback));
        Ok(())
    }

    /// Runs `callback` once the response has been completed.
    pub fn on_completed<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_completed.push(Box::new(callback));
    }

    fn ensure_not_started(&self, what: &str) -> Result<(), HttpError> {
        if self.response_started {
            return Err(HttpError::invalid_operation(format!(
                "{} cannot be set because the response has already started.",
                what
            )));
        }
        Ok(())
    }

    fn can_have_body(&self) -> bool {
        self.method != Method::HEAD && self.status.allows_body()
    }

    /// Writes a response body chunk, starting the response if needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<FlushResult, HttpError> {
        if !data.is_empty() && !self.can_have_body() {
            return Err(HttpError::invalid_operation(format!(
                "Writing to the response body is invalid for {} responses with status code {}.",
                self.method, self.status
            )));
        }
        self.produce_start(false).await?;
        if data.is_empty() || self.output.is_completed() {
            return Ok(FlushResult {
                is_completed: self.output.is_completed(),
                is_canceled: false,
            });
        }

        let result = match self.response_framing {
            ResponseFraming::ContentLength(length) => {
                let total = self.response_bytes + data.len() as u64;
                if total > length {
                    return Err(HttpError::invalid_operation(format!(
                        "Response Content-Length mismatch: too many bytes written ({} of {}).",
                        total, length
                    )));
                }
                self.output.write(data).await
            }
            ResponseFraming::Chunked => {
                let mut chunk = BytesMut::with_capacity(data.len() + 20);
                chunk.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
                chunk.put_slice(data);
                chunk.put_slice(b"\r\n");
                self.output.write(&chunk).await
            }
            ResponseFraming::CloseDelimited => self.output.write(data).await,
            ResponseFraming::NoBody | ResponseFraming::Unknown => FlushResult::default(),
        };
        self.response_bytes += data.len() as u64;
        Ok(result)
    }

    /// Starts the response if needed and pushes everything staged to the
    /// transport.
    pub async fn flush(&mut self) -> Result<FlushResult, HttpError> {
        self.produce_start(false).await?;
        Ok(self.output.flush().await)
    }

    /// Writes the response head now, without any body.
    pub async fn start_response(&mut self) -> Result<FlushResult, HttpError> {
        self.flush().await
    }

    /// Picks the body framing, runs `OnStarting` callbacks and stages the
    /// response head. `finishing` is set when the application is done and
    /// wrote nothing.
    async fn produce_start(&mut self, finishing: bool) -> Result<(), HttpError> {
        if self.response_started {
            return Ok(());
        }
        while let Some(callback) = self.on_starting.pop() {
            callback(&mut self.response_headers);
        }

        self.response_framing = self.choose_framing(finishing)?;

        // A client still waiting for 100 Continue may never send the body.
        if self.expect_continue || self.response_headers.contains_token("Connection", "close") {
            self.keep_alive = false;
        }
        if !self.keep_alive {
            if !self.response_headers.contains_token("Connection", "close") {
                self.response_headers.insert("Connection", "close");
            }
        } else if self.version == HttpVersion::Http10 {
            self.response_headers.insert("Connection", "keep-alive");
        }

        let mut head = BytesMut::new();
        write_head(
            &mut head,
            self.status,
            self.reason_phrase.as_deref(),
            &self.response_headers,
        );
        self.response_started = true;
        self.state = ConnectionState::ResponseInProgress;
        debug!(
            connection_id = %self.connection_id,
            trace_id = %self.trace_identifier,
            status = self.status.as_u16(),
            "response started"
        );
        self.output.write(&head).await;
        Ok(())
    }

    fn choose_framing(&mut self, finishing: bool) -> Result<ResponseFraming, HttpError> {
        let headers = &mut self.response_headers;

        if !self.status.allows_body() || self.method == Method::HEAD {
            if headers.contains_token("Transfer-Encoding", "chunked")
                || (!self.status.allows_body() && headers.contains("Transfer-Encoding"))
            {
                return Err(HttpError::invalid_operation(format!(
                    "Setting the header 'Transfer-Encoding' is not allowed for {} responses with status code {}.",
                    self.method, self.status
                )));
            }
            if finishing && self.status.allows_body() && !headers.contains("Content-Length") {
                headers.insert("Content-Length", "0");
            }
            return Ok(ResponseFraming::NoBody);
        }

        if let Some(value) = headers.get("Content-Length") {
            let length = value.trim().parse::<u64>().map_err(|_| {
                HttpError::invalid_operation(format!("Invalid Content-Length response header: '{}'", value))
            })?;
            return Ok(ResponseFraming::ContentLength(length));
        }

        if headers.contains("Transfer-Encoding") {
            if headers.contains_token("Transfer-Encoding", "chunked") {
                return Ok(ResponseFraming::Chunked);
            }
            self.keep_alive = false;
            return Ok(ResponseFraming::CloseDelimited);
        }

        if finishing {
            headers.insert("Content-Length", "0");
            return Ok(ResponseFraming::ContentLength(0));
        }
        if self.version == HttpVersion::Http11 {
            headers.insert("Transfer-Encoding", "chunked");
            return Ok(ResponseFraming::Chunked);
        }
        self.keep_alive = false;
        Ok(ResponseFraming::CloseDelimited)
    }

    /// Finishes the response: writes the head if nothing was written, the
    /// final chunk for chunked bodies, and flushes. A body shorter than its
    /// declared Content-Length aborts the connection.
    pub async fn complete_response(&mut self) -> Result<(), HttpError> {
        if self.is_aborted() {
            return Ok(());
        }
        self.produce_start(true).await?;

        match self.response_framing {
            ResponseFraming::Chunked => {
                self.output.write(b"0\r\n\r\n").await;
            }
            ResponseFraming::ContentLength(length) if self.response_bytes < length => {
                warn!(
                    connection_id = %self.connection_id,
                    trace_id = %self.trace_identifier,
                    written = self.response_bytes,
                    declared = length,
                    "response shorter than its Content-Length"
                );
                self.abort_with(AbortReason::ResponseLengthMismatch);
                return Ok(());
            }
            _ => {}
        }

        if self.output.flush().await.is_completed {
            self.keep_alive = false;
        }
        self.state = ConnectionState::ResponseComplete;
        Ok(())
    }

    /// Runs the `OnCompleted` callbacks, most recent first.
    pub fn fire_on_completed(&mut self) {
        while let Some(callback) = self.on_completed.pop() {
            callback();
        }
    }

    /// Replaces an unstarted response with a bodiless `status` response.
    pub fn reset_response(&mut self, status: StatusCode) {
        if self.response_started {
            return;
        }
        self.status = status;
        self.reason_phrase = None;
        self.response_headers.clear();
        self.on_starting.clear();
    }

    /// Answers a malformed request and marks the connection for closing.
    /// If the response already started the connection is aborted instead.
    pub async fn reject(&mut self, error: &BadRequest) {
        warn!(
            connection_id = %self.connection_id,
            trace_id = %self.trace_identifier,
            status = error.status_code().as_u16(),
            %error,
            "rejecting request"
        );
        self.rejection = Some(error.clone());
        self.keep_alive = false;

        if self.response_started {
            self.abort_with(AbortReason::BadRequest(error.to_string()));
            return;
        }

        self.reset_response(error.status_code());
        self.response_headers.insert("Content-Length", "0");
        if let Some(allow) = error.allow() {
            self.response_headers.insert("Allow", allow);
        }
        if let Err(e) = self.produce_start(true).await {
            debug!(error = %e, "failed to write error response");
            return;
        }
        self.output.flush().await;
        self.state = ConnectionState::ResponseComplete;
    }

    /// Aborts the connection on behalf of the application.
    pub fn abort(&mut self) {
        self.abort_with(AbortReason::ApplicationAbort);
    }

    /// Fires the abort signal and hard-closes the transport. The first
    /// reason wins; repeated calls reach the transport only once.
    pub fn abort_with(&mut self, reason: AbortReason) {
        if self.abort.cancel(reason.clone()) {
            warn!(
                connection_id = %self.connection_id,
                trace_id = %self.trace_identifier,
                %reason,
                "connection aborted"
            );
        }
        let reason = self.abort_token.reason().unwrap_or(reason);
        self.keep_alive = false;
        self.output.abort(reason);
        self.state = ConnectionState::Closed;
    }

    /// Releases pooled input and shuts the output down gracefully.
    pub async fn dispose(&mut self) {
        self.input.release();
        self.timeout.reset();
        self.output.dispose().await;
        self.state = ConnectionState::Closed;
    }
}

impl fmt::Debug for HttpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpContext")
            .field("trace_identifier", &self.trace_identifier)
            .field("state", &self.state)
            .field("method", &self.method)
            .field("raw_target", &self.raw_target)
            .field("status", &self.status)
            .field("response_started", &self.response_started)
            .finish()
    }
}
