//! The request relay engine.
//!
//! Accepts a decoded chat-completions call, checks an upstream connection
//! out of the pool, forwards the payload, and returns the response either
//! buffered (full body collected, copied verbatim) or streamed (SSE frames
//! pumped to the client as the upstream produces them). Exactly one terminal
//! [`RequestRecord`] is appended to the ledger per call, whatever happens;
//! the `RecordGuard` enforces this even when the client goes away and the
//! handler future is dropped mid-flight.
//!
//! The streaming pump is pull-based: the client's `poll_next` drives
//! upstream reads, so a slow client throttles upstream consumption without
//! any internal buffering beyond the current frame.

use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::ledger::{Ledger, RequestRecord};
use crate::proxy::service::paths;
use crate::proxy::sse::SseDecoder;
use crate::proxy::types::{ChatCompletionRequest, ErrorKind, RelayError, RelayResult, RequestId};
use crate::proxy::upstream::{UpstreamConnection, UpstreamPool};
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::Request;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{timeout, Instant, Sleep};

/// Tunables for the relay, fixed at startup.
#[derive(Clone, Copy, Debug)]
pub struct RelaySettings {
    /// Total budget for a buffered exchange (and for streaming headers).
    pub request_timeout: Duration,
    /// Maximum silence between upstream chunks of a stream.
    pub idle_read_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            idle_read_timeout: Duration::from_secs(30),
        }
    }
}

/// Tracks one in-flight request and guarantees its terminal record is
/// appended to the ledger exactly once.
///
/// Deliberate outcomes call [`RecordGuard::finish`]; if the guard is dropped
/// unfinished the handler future was cancelled, which only happens when the
/// client disconnected, and that outcome is recorded instead.
pub struct RecordGuard {
    ledger: Arc<Ledger>,
    record: Option<RequestRecord>,
    headers_flushed: bool,
}

impl RecordGuard {
    pub fn begin(ledger: Arc<Ledger>, method: &Method, path: &str, bytes_in: usize) -> Self {
        let record = RequestRecord {
            id: RequestId::new(),
            method: method.to_string(),
            path: path.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status_code: None,
            upstream_latency_ms: 0,
            byte_count_in: bytes_in as u64,
            byte_count_out: 0,
            streaming: false,
            error_kind: None,
        };
        Self {
            ledger,
            record: Some(record),
            headers_flushed: false,
        }
    }

    pub fn set_streaming(&mut self, streaming: bool) {
        if let Some(record) = self.record.as_mut() {
            record.streaming = streaming;
        }
    }

    /// The 200 response line has gone out; a later failure can no longer
    /// change the status the client saw.
    pub fn mark_headers_flushed(&mut self) {
        self.headers_flushed = true;
    }

    pub fn set_upstream_latency(&mut self, elapsed: Duration) {
        if let Some(record) = self.record.as_mut() {
            record.upstream_latency_ms = elapsed.as_millis() as u64;
        }
    }

    pub fn add_bytes_out(&mut self, count: usize) {
        if let Some(record) = self.record.as_mut() {
            record.byte_count_out += count as u64;
        }
    }

    /// Append the terminal record. Subsequent calls are no-ops.
    pub fn finish(&mut self, status_code: Option<u16>, error_kind: Option<ErrorKind>) {
        if let Some(mut record) = self.record.take() {
            record.finished_at = Some(Utc::now());
            record.status_code = status_code;
            record.error_kind = error_kind;
            self.ledger.record(record);
        }
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if self.record.is_some() {
            let status = if self.headers_flushed { Some(200) } else { None };
            tracing::debug!("client disconnected before the relay completed");
            self.finish(status, Some(ErrorKind::ClientDisconnected));
        }
    }
}

enum ExchangeError {
    Retryable(RelayError),
    Fatal(RelayError),
}

impl ExchangeError {
    fn into_inner(self) -> RelayError {
        match self {
            Self::Retryable(e) | Self::Fatal(e) => e,
        }
    }
}

/// The relay engine. Cheap to clone; all shared state is behind `Arc`s so a
/// test can hand it a private pool and ledger.
#[derive(Clone)]
pub struct RelayEngine {
    pool: Arc<UpstreamPool>,
    ledger: Arc<Ledger>,
    settings: RelaySettings,
}

impl RelayEngine {
    pub fn new(pool: Arc<UpstreamPool>, ledger: Arc<Ledger>, settings: RelaySettings) -> Self {
        Self {
            pool,
            ledger,
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Relay one chat-completions call end to end.
    pub async fn relay_chat(&self, headers: HeaderMap, body: Bytes) -> Response {
        let mut guard = RecordGuard::begin(
            Arc::clone(&self.ledger),
            &Method::POST,
            paths::CHAT_COMPLETIONS,
            body.len(),
        );

        let request = match ChatCompletionRequest::parse(&body) {
            Ok(request) => request,
            Err(error) => return self.reject(guard, error),
        };
        let streaming = request.wants_stream();
        guard.set_streaming(streaming);

        tracing::info!(model = %request.model, streaming, "relaying chat completion");

        let started = Instant::now();
        let (connection, response) = match self.exchange(&headers, &body).await {
            Ok(pair) => pair,
            Err(error) => return self.reject(guard, error),
        };
        guard.set_upstream_latency(started.elapsed());

        let status = response.status();
        if streaming && status == StatusCode::OK {
            self.stream_response(guard, connection, response)
        } else {
            self.buffer_response(guard, connection, response, started)
                .await
        }
    }

    /// Checkout + send, with one fast retry on a fresh connection when the
    /// upstream was unreachable before any response bytes arrived.
    async fn exchange(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> RelayResult<(UpstreamConnection, hyper::Response<Incoming>)> {
        let mut retried = false;
        loop {
            match self.try_exchange(headers, body).await {
                Ok(pair) => return Ok(pair),
                Err(ExchangeError::Retryable(error)) if !retried => {
                    retried = true;
                    tracing::warn!(error = %error, "upstream unavailable, retrying once with a fresh connection");
                }
                Err(error) => return Err(error.into_inner()),
            }
        }
    }

    async fn try_exchange(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<(UpstreamConnection, hyper::Response<Incoming>), ExchangeError> {
        let mut connection = self
            .pool
            .checkout()
            .await
            .map_err(|e| match &e {
                RelayError::UpstreamUnavailable(_) => ExchangeError::Retryable(e),
                _ => ExchangeError::Fatal(e),
            })?;

        let request = self
            .build_upstream_request(headers, body)
            .map_err(ExchangeError::Fatal)?;

        let response = timeout(self.settings.request_timeout, connection.send(request))
            .await
            .map_err(|_| {
                ExchangeError::Fatal(RelayError::UpstreamUnavailable(
                    "upstream did not respond within the request timeout".to_string(),
                ))
            })?
            .map_err(|e| {
                // Refused/reset before a response line counts as unavailable
                // and is worth one retry on a fresh connection.
                ExchangeError::Retryable(RelayError::UpstreamUnavailable(format!(
                    "upstream request failed: {e}"
                )))
            })?;

        Ok((connection, response))
    }

    fn build_upstream_request(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> RelayResult<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(paths::CHAT_COMPLETIONS)
            .header(header::HOST, self.pool.authority())
            .header(header::CONTENT_TYPE, "application/json");

        // The caller's credentials pass through untouched.
        if let Some(authorization) = headers.get(header::AUTHORIZATION) {
            builder = builder.header(header::AUTHORIZATION, authorization.clone());
        }

        builder
            .body(Full::new(body.clone()))
            .map_err(|e| RelayError::ClientRequest(format!("unforwardable request: {e}")))
    }

    /// Buffered mode: collect the whole upstream body, copy status and body
    /// verbatim, pool the (fully drained) connection.
    async fn buffer_response(
        &self,
        mut guard: RecordGuard,
        connection: UpstreamConnection,
        response: hyper::Response<Incoming>,
        started: Instant,
    ) -> Response {
        let (parts, body) = response.into_parts();

        let collected = match timeout(self.settings.request_timeout, body.collect()).await {
            Ok(Ok(collected)) => collected.to_bytes(),
            Ok(Err(e)) => {
                return self.reject(
                    guard,
                    RelayError::UpstreamUnavailable(format!(
                        "reading upstream response failed: {e}"
                    )),
                );
            }
            Err(_) => {
                return self.reject(
                    guard,
                    RelayError::UpstreamUnavailable(
                        "upstream response timed out mid-body".to_string(),
                    ),
                );
            }
        };

        guard.set_upstream_latency(started.elapsed());
        guard.add_bytes_out(collected.len());
        let error_kind = parts
            .status
            .is_client_error()
            .then_some(ErrorKind::ClientRequestError);
        guard.finish(Some(parts.status.as_u16()), error_kind);

        // collect() drained the body, so the connection is clean.
        self.pool.check_in(connection);

        let mut builder = Response::builder().status(parts.status);
        if let Some(content_type) = parts.headers.get(header::CONTENT_TYPE) {
            builder = builder.header(header::CONTENT_TYPE, content_type.clone());
        }
        builder
            .body(Body::from(collected))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// Streaming mode: hand the upstream body to the pump and flush headers.
    fn stream_response(
        &self,
        mut guard: RecordGuard,
        connection: UpstreamConnection,
        response: hyper::Response<Incoming>,
    ) -> Response {
        guard.mark_headers_flushed();

        let pump = SsePump::new(
            response.into_body(),
            guard,
            connection,
            Arc::clone(&self.pool),
            self.settings.idle_read_timeout,
        );

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(pump))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    /// Record a failure and convert it into the standard error surface.
    fn reject(&self, mut guard: RecordGuard, error: RelayError) -> Response {
        tracing::warn!(error = %error, kind = %error.kind(), "relay failed");
        guard.finish(Some(error.status_code().as_u16()), Some(error.kind()));
        error.to_response()
    }
}

/// Best-effort frame telling a streaming client the upstream went away.
fn upstream_drop_frame() -> Bytes {
    Bytes::from_static(
        b"data: {\"error\":{\"message\":\"upstream connection lost before stream completion\",\"type\":\"upstream_error\"}}\n\n",
    )
}

enum PumpState {
    /// Forwarding frames from the upstream.
    Streaming,
    /// `[DONE]` was forwarded; waiting for upstream EOF to prove the
    /// connection clean before pooling it.
    Draining,
    /// Everything finalized; next poll ends the stream.
    Closing,
}

pin_project! {
    /// Pull-based pump from the upstream SSE body to the client.
    ///
    /// Owns the upstream connection for the life of the stream. The
    /// connection returns to the pool only after a `[DONE]`-terminated
    /// stream reaches EOF with nothing trailing. Every other exit drops it.
    struct SsePump {
        #[pin]
        body: Incoming,
        #[pin]
        idle: Sleep,
        decoder: SseDecoder,
        guard: RecordGuard,
        connection: Option<UpstreamConnection>,
        pool: Arc<UpstreamPool>,
        idle_timeout: Duration,
        state: PumpState,
    }
}

impl SsePump {
    fn new(
        body: Incoming,
        guard: RecordGuard,
        connection: UpstreamConnection,
        pool: Arc<UpstreamPool>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            body,
            idle: tokio::time::sleep(idle_timeout),
            decoder: SseDecoder::new(),
            guard,
            connection: Some(connection),
            pool,
            idle_timeout,
            state: PumpState::Streaming,
        }
    }
}

impl Stream for SsePump {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match this.state {
                PumpState::Closing => return Poll::Ready(None),

                PumpState::Draining => match this.body.as_mut().poll_frame(cx) {
                    Poll::Ready(None) => {
                        // Clean EOF after the sentinel: the connection is
                        // provably reusable.
                        *this.state = PumpState::Closing;
                        if let Some(connection) = this.connection.take() {
                            if this.decoder.is_clean() {
                                this.pool.check_in(connection);
                            }
                        }
                        return Poll::Ready(None);
                    }
                    Poll::Ready(Some(_)) => {
                        // Data or an error after [DONE]: not reusable.
                        *this.state = PumpState::Closing;
                        this.connection.take();
                        return Poll::Ready(None);
                    }
                    Poll::Pending => match this.idle.as_mut().poll(cx) {
                        Poll::Ready(()) => {
                            *this.state = PumpState::Closing;
                            this.connection.take();
                            return Poll::Ready(None);
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                },

                PumpState::Streaming => match this.body.as_mut().poll_frame(cx) {
                    Poll::Ready(Some(Ok(frame))) => {
                        let Ok(data) = frame.into_data() else {
                            // Trailers carry nothing we forward.
                            continue;
                        };
                        this.idle
                            .as_mut()
                            .reset(Instant::now() + *this.idle_timeout);

                        let frames = this.decoder.push(&data);
                        if this.decoder.is_terminal() {
                            let out = concat_frames(frames);
                            this.guard.add_bytes_out(out.len());
                            this.guard.finish(Some(200), None);
                            *this.state = PumpState::Draining;
                            return Poll::Ready(Some(Ok(out)));
                        }
                        if frames.is_empty() {
                            // Partial line or dropped frame; read on.
                            continue;
                        }
                        let out = concat_frames(frames);
                        this.guard.add_bytes_out(out.len());
                        return Poll::Ready(Some(Ok(out)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        tracing::warn!(error = %e, "upstream dropped mid-stream");
                        return Poll::Ready(Some(Ok(fail_stream(
                            this.guard,
                            this.connection,
                            this.state,
                        ))));
                    }
                    Poll::Ready(None) => {
                        tracing::warn!("upstream closed before the terminal frame");
                        return Poll::Ready(Some(Ok(fail_stream(
                            this.guard,
                            this.connection,
                            this.state,
                        ))));
                    }
                    Poll::Pending => match this.idle.as_mut().poll(cx) {
                        Poll::Ready(()) => {
                            tracing::warn!("upstream idle-read timeout mid-stream");
                            return Poll::Ready(Some(Ok(fail_stream(
                                this.guard,
                                this.connection,
                                this.state,
                            ))));
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                },
            }
        }
    }
}

/// Terminate a broken stream: record `UpstreamDropped` (the 200 already
/// went out), discard the connection, and hand back a best-effort error
/// frame for the client.
fn fail_stream(
    guard: &mut RecordGuard,
    connection: &mut Option<UpstreamConnection>,
    state: &mut PumpState,
) -> Bytes {
    let frame = upstream_drop_frame();
    guard.add_bytes_out(frame.len());
    guard.finish(Some(200), Some(ErrorKind::UpstreamDropped));
    connection.take();
    *state = PumpState::Closing;
    frame
}

fn concat_frames(frames: Vec<Bytes>) -> Bytes {
    if frames.len() == 1 {
        return frames.into_iter().next().expect("one frame");
    }
    let mut out = Vec::with_capacity(frames.iter().map(Bytes::len).sum());
    for frame in frames {
        out.extend_from_slice(&frame);
    }
    Bytes::from(out)
}
