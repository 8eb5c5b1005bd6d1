use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Response};
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::cache::{CachedResponse, ResultCache};
use crate::config::STREAM_RESULT_TTL;
use crate::error::RelayError;
use crate::logging::{RequestLogEntry, log_request, now_ms};
use crate::metrics::RelayMetrics;
use crate::usage::{self, UsageMetrics, usage_from_value};

/// SSE comment written to the client between upstream chunks to defeat
/// idle-connection timeouts.
const HEARTBEAT: &[u8] = b": ping\n\n";

/// mpsc-backed response body; the relay task owns the sender and learns about
/// a client disconnect from the first failed send.
pub(super) struct RelayBodyStream {
    rx: mpsc::Receiver<Result<Bytes, std::io::Error>>,
}

impl RelayBodyStream {
    pub(super) fn new(rx: mpsc::Receiver<Result<Bytes, std::io::Error>>) -> Self {
        Self { rx }
    }
}

impl Stream for RelayBodyStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        Pin::new(&mut this.rx).poll_recv(cx)
    }
}

/// Incremental SSE chat-completion-chunk consumer. Fed every upstream chunk
/// while relaying (for token accounting); after `mark_disconnect()` the text
/// accumulated so far is fenced off, so the cached recovery response contains
/// exactly the content the client never received.
#[derive(Default)]
pub(super) struct SseAggregator {
    buf: Vec<u8>,
    scan_pos: usize,
    envelope: Option<Value>,
    content: String,
    chunks_after_mark: u64,
    cache_from: usize,
    marked: bool,
    usage: Option<UsageMetrics>,
}

impl SseAggregator {
    pub(super) fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.scan();
    }

    /// Line-cursor scan over the buffered bytes; only complete lines are
    /// consumed, so a JSON payload split across network chunks parses once
    /// its trailing newline arrives.
    fn scan(&mut self) {
        let mut i = self.scan_pos.min(self.buf.len());

        while i < self.buf.len() {
            let Some(rel_end) = self.buf[i..].iter().position(|b| *b == b'\n') else {
                break;
            };
            let end = i + rel_end;
            let mut line = &self.buf[i..end];
            i = end.saturating_add(1);

            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            const DATA_PREFIX: &[u8] = b"data:";
            if !line.starts_with(DATA_PREFIX) {
                continue;
            }
            let mut payload = &line[DATA_PREFIX.len()..];
            while !payload.is_empty() && payload[0].is_ascii_whitespace() {
                payload = &payload[1..];
            }
            if payload.is_empty() || payload == b"[DONE]" {
                continue;
            }

            match serde_json::from_slice::<Value>(payload) {
                Ok(v) => {
                    if self.marked {
                        self.chunks_after_mark += 1;
                    }
                    if let Some(u) = v.get("usage").filter(|u| u.is_object()) {
                        self.usage = Some(usage_from_value(u));
                    }
                    if let Some(text) = v
                        .pointer("/choices/0/delta/content")
                        .and_then(|c| c.as_str())
                    {
                        self.content.push_str(text);
                    }
                    if self.envelope.is_none() {
                        self.envelope = Some(v);
                    }
                }
                Err(e) => {
                    debug!("{}", RelayError::MalformedChunk(e.to_string()));
                }
            }
        }

        self.scan_pos = i;
    }

    /// Called at the moment of client disconnect, before the undelivered
    /// chunk in hand is fed. Content before this point reached the client.
    pub(super) fn mark_disconnect(&mut self) {
        self.cache_from = self.content.len();
        self.chunks_after_mark = 0;
        self.marked = true;
    }

    pub(super) fn content(&self) -> &str {
        &self.content
    }

    pub(super) fn usage(&self) -> Option<&UsageMetrics> {
        self.usage.as_ref()
    }

    /// Synthesizes the non-streaming recovery response: the first chunk's
    /// envelope with its choices replaced by one assistant message holding
    /// the undelivered text. `None` when no valid chunk arrived after the
    /// disconnect point.
    pub(super) fn into_aggregate_response(self) -> Option<Value> {
        if self.chunks_after_mark == 0 {
            return None;
        }
        let mut envelope = self.envelope?;
        let recovered = &self.content[self.cache_from..];
        envelope["choices"] = json!([{
            "index": 0,
            "finish_reason": "stop",
            "message": {"role": "assistant", "content": recovered},
        }]);
        Some(envelope)
    }
}

pub(super) struct StreamContext {
    pub(super) request_id: String,
    pub(super) method: String,
    pub(super) path: String,
    pub(super) model: Option<String>,
    pub(super) prompt_tokens: i64,
    pub(super) started: Instant,
    pub(super) heartbeat: Duration,
    pub(super) cache: Arc<ResultCache>,
    pub(super) metrics: Arc<RelayMetrics>,
}

/// Builds the streaming client response and spawns the relay task that
/// drives it. The upstream byte stream has a single active consumer at all
/// times: the relay loop first, then (after a client disconnect) the
/// aggregation drain.
pub(super) fn relay_sse_response(
    resp: reqwest::Response,
    resp_headers_filtered: HeaderMap,
    ctx: StreamContext,
) -> Response<Body> {
    let status = resp.status();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    let request_id = ctx.request_id.clone();
    tokio::spawn(drive_relay(resp, tx, ctx));

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers_filtered.iter() {
        builder = builder.header(name, value);
    }
    if resp_headers_filtered.get("content-type").is_none() {
        builder = builder.header("content-type", "text/event-stream");
    }
    builder = builder.header("x-request-id", request_id);
    builder
        .body(Body::from_stream(RelayBodyStream::new(rx)))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn drive_relay(
    resp: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    ctx: StreamContext,
) {
    let status = resp.status().as_u16();
    let mut upstream = resp.bytes_stream();
    let mut agg = SseAggregator::default();

    let mut heartbeat = interval_at(Instant::now() + ctx.heartbeat, ctx.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut client_gone = false;

    loop {
        tokio::select! {
            item = upstream.next() => match item {
                Some(Ok(chunk)) => {
                    if tx.send(Ok(chunk.clone())).await.is_err() {
                        // First write to a closed client: stop relaying and
                        // divert the chunk in hand into the aggregator.
                        agg.mark_disconnect();
                        agg.feed(&chunk);
                        client_gone = true;
                        break;
                    }
                    agg.feed(&chunk);
                }
                Some(Err(e)) => {
                    warn!(
                        "upstream stream error for {} {}: {e}",
                        ctx.method, ctx.path
                    );
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    break;
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if tx.send(Ok(Bytes::from_static(HEARTBEAT))).await.is_err() {
                    agg.mark_disconnect();
                    client_gone = true;
                    break;
                }
            }
        }
    }

    if client_gone {
        drop(tx);
        info!(
            "client disconnected mid-stream; aggregating remainder (request_id={})",
            ctx.request_id
        );
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => agg.feed(&chunk),
                Err(e) => {
                    warn!(
                        "upstream stream error while aggregating {}: {e}",
                        ctx.request_id
                    );
                    break;
                }
            }
        }
    }

    finalize(agg, ctx, status, client_gone).await;
}

async fn finalize(agg: SseAggregator, ctx: StreamContext, status: u16, client_gone: bool) {
    let duration_ms = ctx.started.elapsed().as_millis() as u64;

    // Best-effort accounting: the upstream's own usage object wins when the
    // final chunk carried one, otherwise fall back to the chars/4 estimate.
    let turn_usage = match agg.usage() {
        Some(u) => u.clone(),
        None => {
            let completion = usage::estimate_tokens(agg.content());
            UsageMetrics {
                prompt_tokens: ctx.prompt_tokens,
                completion_tokens: completion,
                total_tokens: ctx.prompt_tokens + completion,
            }
        }
    };
    ctx.metrics.on_turn_complete(
        turn_usage.prompt_tokens,
        turn_usage.completion_tokens,
        duration_ms,
    );

    let mut cache_note = None;
    if client_gone {
        match agg.into_aggregate_response() {
            Some(value) => {
                let body = serde_json::to_vec(&value).unwrap_or_default();
                ctx.cache
                    .put(
                        ctx.request_id.clone(),
                        CachedResponse {
                            status: 200,
                            headers: vec![(
                                "content-type".to_string(),
                                "application/json".to_string(),
                            )],
                            body,
                        },
                        STREAM_RESULT_TTL,
                    )
                    .await;
                ctx.metrics.record_cached_response();
                cache_note = Some("recovered");
                info!(
                    "aggregated response cached for one-shot retrieval (request_id={})",
                    ctx.request_id
                );
            }
            None => {
                info!(
                    "no undelivered chunks to aggregate for request {}; nothing cached",
                    ctx.request_id
                );
            }
        }
    }

    log_request(&RequestLogEntry {
        timestamp_ms: now_ms(),
        method: &ctx.method,
        path: &ctx.path,
        status_code: status,
        duration_ms,
        request_id: &ctx.request_id,
        stream: true,
        model: ctx.model.clone(),
        cache: cache_note,
        usage: Some(turn_usage),
        http_debug: None,
    });
}
