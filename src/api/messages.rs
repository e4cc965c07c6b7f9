//! `POST /v1/messages`: the dispatch pipeline.
//!
//! Gates run first (permission, model restriction), then the request is
//! translated, an upstream account is resolved, and the call is dispatched
//! either as a single exchange or as a reframed SSE session.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use smallvec::SmallVec;

use crate::accounts::{parse_reset_hint, UpstreamAccount};
use crate::auth::KeyGrant;
use crate::error::GatewayError;
use crate::protocol::anthropic::{MessagesRequest, StreamEvent};
use crate::protocol::openai::{ChatRequest, ChatResponse, StreamChunk, StreamOptions};
use crate::state::AppState;
use crate::stream::sse::{encode_stream_event, sniff_usage, FramePayload, SseReframer};
use crate::translate::request::convert_request;
use crate::translate::response::convert_response;
use crate::translate::stream::StreamTranslator;
use crate::util::{new_message_id, session_hash};

pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: http::HeaderMap,
    body: Bytes,
) -> Response {
    match handle(state, &headers, &body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(
    state: Arc<AppState>,
    headers: &http::HeaderMap,
    body: &Bytes,
) -> Result<Response, GatewayError> {
    let grant = state.authenticate(headers)?;

    let request: MessagesRequest = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid request body: {err}")))?;

    if !grant.allows_openai() {
        return Err(GatewayError::PermissionDenied(
            "API key lacks the openai permission".to_string(),
        ));
    }
    if !grant.allows_model(&request.model) {
        return Err(GatewayError::ModelRestricted(format!(
            "model '{}' is not permitted for this API key",
            request.model
        )));
    }

    let mut upstream_request = convert_request(&request);
    let session = session_hash(body);
    let account = resolve_account(&state, &grant, session, &request.model)?;

    tracing::debug!(
        key = %grant.id,
        account = %account.id,
        model = %request.model,
        stream = upstream_request.stream,
        "dispatching upstream"
    );

    if upstream_request.stream {
        // Ask the upstream to attach the terminal usage block.
        upstream_request.stream_options = Some(StreamOptions {
            include_usage: true,
        });
        dispatch_stream(state, grant, account, upstream_request, request.model, session).await
    } else {
        dispatch_non_stream(state, grant, account, upstream_request, request.model, session).await
    }
}

/// Resolve credentials, refetching by id once when the selector returned
/// redacted material.
fn resolve_account(
    state: &AppState,
    grant: &KeyGrant,
    session: u64,
    model: &str,
) -> Result<UpstreamAccount, GatewayError> {
    let account = state.accounts.select(&grant.id, session, model)?;
    if account.credentials_usable() {
        return Ok(account);
    }
    tracing::debug!(account = %account.id, "selected account has redacted credentials; refetching");
    match state.accounts.get_by_id(&account.id) {
        Some(refetched) if refetched.credentials_usable() => Ok(refetched),
        _ => Err(GatewayError::MisconfiguredAccount(format!(
            "account '{}' has no usable credentials",
            account.id
        ))),
    }
}

// ---------------------------------------------------------------------------
// Non-streaming dispatch
// ---------------------------------------------------------------------------

async fn dispatch_non_stream(
    state: Arc<AppState>,
    grant: Arc<KeyGrant>,
    account: UpstreamAccount,
    upstream_request: ChatRequest,
    model: String,
    session: u64,
) -> Result<Response, GatewayError> {
    let reply = state.upstream.send(&account.credentials, &upstream_request).await?;

    if reply.status >= 400 {
        let body = String::from_utf8_lossy(&reply.body).into_owned();
        if reply.status == 429 {
            state.rate_limits.mark_rate_limited(
                &account.id,
                account.kind,
                session,
                parse_reset_hint(&body),
            );
        }
        return Err(GatewayError::Upstream {
            status: reply.status,
            body,
        });
    }

    let parsed: ChatResponse = serde_json::from_slice(&reply.body)
        .map_err(|err| GatewayError::Parse(format!("upstream body is not valid JSON: {err}")))?;
    let converted = convert_response(parsed, &model, new_message_id())?;

    state.usage.record(
        &grant.id,
        &account.id,
        &model,
        converted.usage.input_tokens,
        converted.usage.output_tokens,
    );
    clear_rate_limit(&state, &account);

    Ok((http::StatusCode::OK, axum::Json(converted)).into_response())
}

fn clear_rate_limit(state: &AppState, account: &UpstreamAccount) {
    if state.rate_limits.is_rate_limited(&account.id) {
        state.rate_limits.remove_rate_limit(&account.id, account.kind);
    }
}

// ---------------------------------------------------------------------------
// Streaming dispatch
// ---------------------------------------------------------------------------

async fn dispatch_stream(
    state: Arc<AppState>,
    grant: Arc<KeyGrant>,
    account: UpstreamAccount,
    upstream_request: ChatRequest,
    model: String,
    session: u64,
) -> Result<Response, GatewayError> {
    let response = state
        .upstream
        .open_stream(&account.credentials, &upstream_request)
        .await?;

    let status = response.status().as_u16();
    if status >= 400 {
        let body = response.bytes().await.map_err(|err| {
            GatewayError::Transport(format!("Failed to read upstream error body: {err}"))
        })?;
        let body = String::from_utf8_lossy(&body).into_owned();
        if status == 429 {
            state.rate_limits.mark_rate_limited(
                &account.id,
                account.kind,
                session,
                parse_reset_hint(&body),
            );
        }
        return Err(GatewayError::Upstream { status, body });
    }

    let session_id = new_message_id();
    let pump = StreamPump::new(
        StreamTranslator::new(session_id, model.clone()),
        StreamCompletion {
            state: Arc::clone(&state),
            grant,
            account,
            model,
        },
    );

    let upstream = Box::pin(response.bytes_stream());
    let output = futures_util::stream::unfold(
        (upstream, pump, PendingFrames::new(), false),
        |(mut upstream, mut pump, mut pending, mut finished)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((frame, (upstream, pump, pending, finished)));
                }
                if finished {
                    return None;
                }
                match upstream.as_mut().next().await {
                    Some(Ok(chunk)) => {
                        pump.feed(&chunk, &mut pending);
                        if pump.terminated() {
                            finished = true;
                        }
                    }
                    Some(Err(err)) => {
                        // Mid-stream failure: end the downstream stream
                        // without a synthesized message_stop.
                        tracing::warn!(error = %err, "upstream stream failed mid-flight");
                        return None;
                    }
                    None => {
                        pump.finish(&mut pending);
                        finished = true;
                    }
                }
            }
        },
    );

    let body = Body::from_stream(output.map(Ok::<Bytes, Infallible>));
    Ok(sse_response(body))
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    // Disable buffering in intermediary proxies; deltas must flush promptly.
    headers.insert(
        http::header::HeaderName::from_static("x-accel-buffering"),
        http::HeaderValue::from_static("no"),
    );
    response
}

/// Ordered queue of encoded downstream frames awaiting the writer.
struct PendingFrames {
    frames: SmallVec<[Bytes; 8]>,
    head: usize,
}

impl PendingFrames {
    fn new() -> Self {
        Self {
            frames: SmallVec::new(),
            head: 0,
        }
    }

    fn push(&mut self, frame: Bytes) {
        self.frames.push(frame);
    }

    fn pop_front(&mut self) -> Option<Bytes> {
        if self.head >= self.frames.len() {
            return None;
        }
        let frame = std::mem::take(&mut self.frames[self.head]);
        self.head += 1;
        if self.head == self.frames.len() {
            self.frames.clear();
            self.head = 0;
        }
        Some(frame)
    }
}

/// Side effects owed when a session closes cleanly.
struct StreamCompletion {
    state: Arc<AppState>,
    grant: Arc<KeyGrant>,
    account: UpstreamAccount,
    model: String,
}

/// Drives upstream bytes through the reframer and translator, producing
/// encoded downstream frames.
struct StreamPump {
    reframer: SseReframer,
    translator: StreamTranslator,
    terminated: bool,
    completion: Option<StreamCompletion>,
}

impl StreamPump {
    fn new(translator: StreamTranslator, completion: StreamCompletion) -> Self {
        Self {
            reframer: SseReframer::new(),
            translator,
            terminated: false,
            completion: Some(completion),
        }
    }

    fn terminated(&self) -> bool {
        self.terminated
    }

    fn feed(&mut self, chunk: &[u8], pending: &mut PendingFrames) {
        let mut payloads = Vec::new();
        self.reframer.feed(chunk, &mut payloads);
        for payload in payloads {
            self.process_payload(payload, pending);
            if self.terminated {
                break;
            }
        }
    }

    /// Upstream EOF: flush the reframer tail and synthesize the terminal
    /// `message_stop` when the upstream never sent `[DONE]`.
    fn finish(&mut self, pending: &mut PendingFrames) {
        if self.terminated {
            return;
        }
        let mut tail = Vec::new();
        self.reframer.finish(&mut tail);
        for payload in tail {
            self.process_payload(payload, pending);
            if self.terminated {
                return;
            }
        }
        let mut events = Vec::new();
        self.translator.finish_stream(&mut events);
        Self::push_events(&events, pending);
        self.complete();
    }

    fn process_payload(&mut self, payload: FramePayload, pending: &mut PendingFrames) {
        match payload {
            FramePayload::Done => {
                let mut events = Vec::new();
                self.translator.finish_stream(&mut events);
                Self::push_events(&events, pending);
                self.terminated = true;
                self.complete();
            }
            FramePayload::Data(data) => {
                if let Some(usage) = sniff_usage(&data) {
                    self.translator.observe_usage(&usage);
                }
                let Ok(chunk) = serde_json::from_str::<StreamChunk>(&data) else {
                    tracing::debug!("skipping unparseable SSE data line");
                    return;
                };
                let mut events = Vec::new();
                self.translator.translate_chunk(&chunk, &mut events);
                Self::push_events(&events, pending);
            }
        }
    }

    fn push_events(events: &[StreamEvent], pending: &mut PendingFrames) {
        for event in events {
            pending.push(encode_stream_event(event));
        }
    }

    fn complete(&mut self) {
        let Some(completion) = self.completion.take() else {
            return;
        };
        let (input_tokens, output_tokens) = self.translator.usage();
        completion.state.usage.record(
            &completion.grant.id,
            &completion.account.id,
            &completion.model,
            input_tokens,
            output_tokens,
        );
        clear_rate_limit(&completion.state, &completion.account);
    }
}
