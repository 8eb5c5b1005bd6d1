use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes, to_bytes};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use axum::routing::{any, get};
use axum::{Json, Router};
use reqwest::{Client, Url};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CachedResponse, ResultCache};
use crate::config::{
    DEDUP_TTL, HEARTBEAT_INTERVAL, INACTIVITY_TIMEOUT, MODEL_LIST_TTL, RelayConfig,
};
use crate::error::RelayError;
use crate::logging::{
    HttpDebugLog, RequestLogEntry, log_request, make_body_preview, now_ms,
    should_include_http_debug,
};
use crate::metrics::RelayMetrics;
use crate::usage::{self, UsageMetrics};

mod retry;
mod stream;
#[cfg(test)]
mod tests;

/// Request bodies above this size are rejected before any upstream work.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const MODEL_LIST_KEY: &str = "models";

pub struct RelayService {
    config: RelayConfig,
    client: Client,
    /// Aggregated stream results, keyed by request id, one-shot retrieval.
    results: Arc<ResultCache>,
    /// Non-streaming replay cache, keyed by request fingerprint.
    dedup: Arc<ResultCache>,
    /// Single-entry micro-cache for the upstream model list.
    model_list: Arc<ResultCache>,
    pub metrics: Arc<RelayMetrics>,
    shutdown: watch::Receiver<bool>,
}

impl RelayService {
    pub fn new(
        config: RelayConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Self>, RelayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;
        let metrics = RelayMetrics::new(
            INACTIVITY_TIMEOUT,
            config.cost_input_per_m,
            config.cost_output_per_m,
        );
        metrics.spawn_idle_watchdog();
        Ok(Arc::new(Self {
            config,
            client,
            results: ResultCache::new(),
            dedup: ResultCache::new(),
            model_list: ResultCache::new(),
            metrics,
            shutdown,
        }))
    }
}

pub fn router(service: Arc<RelayService>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/_metrics", get(handle_metrics))
        .route("/v1/models", get(handle_models))
        .route("/v1/results/{request_id}", get(handle_result))
        // Only the versioned API surface is proxied; anything else 404s here
        // instead of reaching the upstream.
        .route("/v1/{*path}", any(handle_relay))
        .with_state(service)
}

async fn handle_health() -> Json<Value> {
    Json(json!({"ok": true, "ts": now_ms(), "version": env!("CARGO_PKG_VERSION")}))
}

async fn handle_metrics(State(svc): State<Arc<RelayService>>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&svc, &headers) {
        return resp;
    }
    match serde_json::to_vec(&svc.metrics.snapshot()) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("metrics serialization failed: {e}"),
        ),
    }
}

/// One-shot retrieval of a response that finished after its client went away.
async fn handle_result(
    State(svc): State<Arc<RelayService>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    svc.metrics.on_request();
    if let Err(resp) = check_auth(&svc, &headers) {
        return resp;
    }
    match svc.results.take(&request_id).await {
        Some(entry) => {
            svc.metrics.record_cache_hit();
            info!("delivered recovered result for request {request_id}");
            cached_to_response(entry, &request_id)
        }
        None => json_error(
            StatusCode::NOT_FOUND,
            "no stored result for this request id (expired or already retrieved)",
        ),
    }
}

/// `/v1/models` with a short-TTL micro-cache; when the upstream is down the
/// alias table doubles as a minimal offline model list.
async fn handle_models(State(svc): State<Arc<RelayService>>, headers: HeaderMap) -> Response {
    svc.metrics.on_request();
    if let Err(resp) = check_auth(&svc, &headers) {
        return resp;
    }
    let request_id = Uuid::new_v4().to_string();
    if let Some(entry) = svc.model_list.get(MODEL_LIST_KEY).await {
        svc.metrics.record_cache_hit();
        return cached_to_response(entry, &request_id);
    }

    let target = format!("{}/models", svc.config.upstream_base);
    let outcome = match Url::parse(&target) {
        Ok(url) => {
            retry::send_with_retry(
                svc.client.clone(),
                Method::GET,
                url,
                upstream_auth_headers(&svc.config.upstream_key),
                Bytes::new(),
                svc.shutdown.clone(),
                svc.config.retry.clone(),
                Arc::clone(&svc.metrics),
            )
            .await
        }
        Err(e) => Err(RelayError::Upstream(format!("invalid url {target}: {e}"))),
    };

    match outcome {
        Ok(resp) if resp.status().is_success() => {
            let resp_headers = headers_to_pairs(&filter_response_headers(resp.headers()));
            match resp.bytes().await {
                Ok(body) => {
                    svc.metrics.record_proxied();
                    let entry = CachedResponse {
                        status: 200,
                        headers: resp_headers,
                        body: body.to_vec(),
                    };
                    svc.model_list
                        .put(MODEL_LIST_KEY.to_string(), entry.clone(), MODEL_LIST_TTL)
                        .await;
                    cached_to_response(entry, &request_id)
                }
                Err(e) => {
                    warn!("model list body read failed: {e}");
                    alias_model_list(&svc, &request_id)
                }
            }
        }
        Ok(resp) => {
            warn!("model list fetch returned {}", resp.status());
            alias_model_list(&svc, &request_id)
        }
        Err(e) => {
            warn!("model list fetch failed: {e}");
            alias_model_list(&svc, &request_id)
        }
    }
}

fn alias_model_list(svc: &RelayService, request_id: &str) -> Response {
    let mut ids: BTreeSet<&str> = svc
        .config
        .model_aliases
        .keys()
        .map(String::as_str)
        .collect();
    ids.extend(svc.config.model_aliases.values().map(String::as_str));
    let data: Vec<Value> = ids
        .into_iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "relay"}))
        .collect();
    let body = serde_json::to_vec(&json!({"object": "list", "data": data})).unwrap_or_default();
    cached_to_response(
        CachedResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body,
        },
        request_id,
    )
}

struct ProxyJob {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    request_id: String,
    path: String,
    client_uri: String,
    model: Option<String>,
    prompt_tokens: i64,
    fingerprint: Option<String>,
}

/// The catch-all relay: rewrites the body, then either streams the upstream
/// response through or proxies it as a buffered JSON exchange.
async fn handle_relay(State(svc): State<Arc<RelayService>>, req: Request) -> Response {
    svc.metrics.on_request();
    let (parts, body) = req.into_parts();
    if let Err(resp) = check_auth(&svc, &parts.headers) {
        return resp;
    }

    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let client_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let body_bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return json_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"),
    };

    let request_id = Uuid::new_v4().to_string();

    // Model alias rewrite and default-user injection apply only when the body
    // is a JSON object; anything else forwards byte-for-byte.
    let mut model = None;
    let mut streaming = accepts_event_stream(&parts.headers);
    let mut prompt_tokens = 0;
    let mut rewritten = false;
    let outbound: Bytes = match serde_json::from_slice::<Value>(&body_bytes) {
        Ok(mut v) if v.is_object() => {
            if let Some(name) = v.get("model").and_then(|m| m.as_str()) {
                let resolved = svc.config.resolve_model(name).to_string();
                if resolved != name {
                    info!("model alias {name} -> {resolved}");
                }
                model = Some(resolved.clone());
                v["model"] = Value::String(resolved);
            }
            if v.get("user").is_none() {
                v["user"] = Value::String(svc.config.default_user.clone());
            }
            if let Some(s) = v.get("stream").and_then(|s| s.as_bool()) {
                streaming = s;
            }
            prompt_tokens = usage::estimate_prompt_tokens(&v);
            rewritten = true;
            match serde_json::to_vec(&v) {
                Ok(out) => Bytes::from(out),
                Err(_) => body_bytes.clone(),
            }
        }
        _ => body_bytes.clone(),
    };

    let target = build_target(&svc.config.upstream_base, &client_uri);
    let url = match Url::parse(&target) {
        Ok(u) => u,
        Err(e) => {
            return json_error(
                StatusCode::BAD_GATEWAY,
                &format!("invalid upstream url: {e}"),
            );
        }
    };
    let headers_out = filter_request_headers(&parts.headers, &svc.config.upstream_key, rewritten);

    if streaming {
        return relay_streaming(
            svc, method, url, target, headers_out, outbound, request_id, path, client_uri, model,
            prompt_tokens,
        )
        .await;
    }

    // Replay window for identical chat-completion posts. Method and URI are
    // part of the key so distinct endpoints never collide.
    let fingerprint = if method == Method::POST && rewritten {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(client_uri.as_bytes());
        hasher.update(&outbound);
        Some(format!("{:x}", hasher.finalize()))
    } else {
        None
    };

    if let Some(fp) = &fingerprint
        && let Some(entry) = svc.dedup.get(fp).await
    {
        svc.metrics.record_cache_hit();
        log_request(&RequestLogEntry {
            timestamp_ms: now_ms(),
            method: method.as_str(),
            path: &path,
            status_code: entry.status,
            duration_ms: 0,
            request_id: &request_id,
            stream: false,
            model,
            cache: Some("hit"),
            usage: None,
            http_debug: None,
        });
        return cached_to_response(entry, &request_id);
    }

    let job = ProxyJob {
        method,
        url,
        headers: headers_out,
        body: outbound,
        request_id,
        path,
        client_uri,
        model,
        prompt_tokens,
        fingerprint,
    };

    // Spawned so a client disconnect cannot abort the upstream exchange; the
    // finished response still lands in the dedup cache for a replay.
    let handle = tokio::spawn(proxy_json(Arc::clone(&svc), job));
    match handle.await {
        Ok(resp) => resp,
        Err(e) => json_error(StatusCode::BAD_GATEWAY, &format!("proxy task failed: {e}")),
    }
}

#[allow(clippy::too_many_arguments)]
async fn relay_streaming(
    svc: Arc<RelayService>,
    method: Method,
    url: Url,
    target: String,
    headers_out: HeaderMap,
    outbound: Bytes,
    request_id: String,
    path: String,
    client_uri: String,
    model: Option<String>,
    prompt_tokens: i64,
) -> Response {
    let started = Instant::now();
    let resp = match retry::send_with_retry(
        svc.client.clone(),
        method.clone(),
        url,
        headers_out,
        outbound.clone(),
        svc.shutdown.clone(),
        svc.config.retry.clone(),
        Arc::clone(&svc.metrics),
    )
    .await
    {
        Ok(resp) => resp,
        Err(e) => {
            return upstream_failure(
                &method, &path, &client_uri, &target, &outbound, &request_id, started, true, e,
            );
        }
    };

    if !resp.status().is_success() {
        // Upstream rejected the request outright; pass its answer through
        // buffered instead of opening an event stream.
        return buffered_passthrough(
            &svc, resp, &method, &path, &client_uri, &target, &outbound, &request_id, started,
            model, true,
        )
        .await
        .response;
    }

    svc.metrics.record_proxied();
    let resp_headers = filter_response_headers(resp.headers());
    stream::relay_sse_response(
        resp,
        resp_headers,
        stream::StreamContext {
            request_id,
            method: method.to_string(),
            path,
            model,
            prompt_tokens,
            started,
            heartbeat: HEARTBEAT_INTERVAL,
            cache: Arc::clone(&svc.results),
            metrics: Arc::clone(&svc.metrics),
        },
    )
}

async fn proxy_json(svc: Arc<RelayService>, job: ProxyJob) -> Response {
    let started = Instant::now();
    let target = job.url.to_string();
    let resp = match retry::send_with_retry(
        svc.client.clone(),
        job.method.clone(),
        job.url.clone(),
        job.headers.clone(),
        job.body.clone(),
        svc.shutdown.clone(),
        svc.config.retry.clone(),
        Arc::clone(&svc.metrics),
    )
    .await
    {
        Ok(resp) => resp,
        Err(e) => {
            return upstream_failure(
                &job.method,
                &job.path,
                &job.client_uri,
                &target,
                &job.body,
                &job.request_id,
                started,
                false,
                e,
            );
        }
    };

    let outcome = buffered_passthrough(
        &svc,
        resp,
        &job.method,
        &job.path,
        &job.client_uri,
        &target,
        &job.body,
        &job.request_id,
        started,
        job.model.clone(),
        false,
    )
    .await;

    // Every successful exchange counts as a turn; token counts stay zero when
    // the body had nothing to attribute them from.
    let duration_ms = started.elapsed().as_millis() as u64;
    match &outcome.usage {
        Some(u) => {
            let prompt = if u.prompt_tokens > 0 {
                u.prompt_tokens
            } else {
                job.prompt_tokens
            };
            svc.metrics
                .on_turn_complete(prompt, u.completion_tokens, duration_ms);
        }
        None if outcome.entry.is_some() => {
            svc.metrics
                .on_turn_complete(job.prompt_tokens, 0, duration_ms);
        }
        None => {}
    }
    if let (Some(fp), Some(entry)) = (&job.fingerprint, outcome.entry) {
        svc.dedup.put(fp.clone(), entry, DEDUP_TTL).await;
    }
    outcome.response
}

/// Reads the upstream response fully, records metrics and the request log,
/// and converts it into a client response.
#[allow(clippy::too_many_arguments)]
async fn buffered_passthrough(
    svc: &RelayService,
    resp: reqwest::Response,
    method: &Method,
    path: &str,
    client_uri: &str,
    target: &str,
    request_body: &Bytes,
    request_id: &str,
    started: Instant,
    model: Option<String>,
    was_stream_request: bool,
) -> PassthroughOutcome {
    let status = resp.status().as_u16();
    let resp_headers = filter_response_headers(resp.headers());
    let content_type = resp_headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let body = match resp.bytes().await {
        Ok(b) => b,
        Err(e) => {
            return PassthroughOutcome {
                response: upstream_failure(
                    method,
                    path,
                    client_uri,
                    target,
                    request_body,
                    request_id,
                    started,
                    was_stream_request,
                    RelayError::Upstream(format!("body read failed: {e}")),
                ),
                entry: None,
                usage: None,
            };
        }
    };
    svc.metrics.record_proxied();

    let success = (200..300).contains(&status);
    let mut turn_usage = None;
    if success && let Ok(v) = serde_json::from_slice::<Value>(&body) {
        turn_usage = usage::extract_usage_from_json(&v).or_else(|| {
            usage::extract_completion_text(&v).map(|text| {
                let completion = usage::estimate_tokens(text);
                // prompt estimate only applies to chat bodies we rewrote
                UsageMetrics {
                    prompt_tokens: 0,
                    completion_tokens: completion,
                    total_tokens: completion,
                }
            })
        });
    }
    if !success {
        svc.metrics
            .record_error(&format!("upstream status {status} for {path}"));
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let http_debug = should_include_http_debug(status).then(|| {
        let opt = crate::logging::http_debug_options();
        HttpDebugLog {
            client_uri: client_uri.to_string(),
            target_url: target.to_string(),
            request_body: Some(make_body_preview(
                request_body,
                Some("application/json"),
                opt.max_body_bytes,
            )),
            response_headers: opt
                .include_headers
                .then(|| headers_to_pairs(&resp_headers)),
            response_body: Some(make_body_preview(
                &body,
                content_type.as_deref(),
                opt.max_body_bytes,
            )),
            upstream_error: None,
        }
    });
    log_request(&RequestLogEntry {
        timestamp_ms: now_ms(),
        method: method.as_str(),
        path,
        status_code: status,
        duration_ms,
        request_id,
        stream: was_stream_request,
        model,
        cache: None,
        usage: turn_usage.clone(),
        http_debug,
    });

    let entry = CachedResponse {
        status,
        headers: headers_to_pairs(&resp_headers),
        body: body.to_vec(),
    };
    PassthroughOutcome {
        response: cached_to_response(entry.clone(), request_id),
        entry: success.then_some(entry),
        usage: turn_usage,
    }
}

struct PassthroughOutcome {
    response: Response,
    /// Present only for 2xx responses, ready for the dedup cache.
    entry: Option<CachedResponse>,
    usage: Option<UsageMetrics>,
}

#[allow(clippy::too_many_arguments)]
fn upstream_failure(
    method: &Method,
    path: &str,
    client_uri: &str,
    target: &str,
    request_body: &Bytes,
    request_id: &str,
    started: Instant,
    was_stream_request: bool,
    err: RelayError,
) -> Response {
    let msg = err.to_string();
    let http_debug = should_include_http_debug(502).then(|| {
        let opt = crate::logging::http_debug_options();
        HttpDebugLog {
            client_uri: client_uri.to_string(),
            target_url: target.to_string(),
            request_body: Some(make_body_preview(
                request_body,
                Some("application/json"),
                opt.max_body_bytes,
            )),
            response_headers: None,
            response_body: None,
            upstream_error: Some(msg.clone()),
        }
    });
    log_request(&RequestLogEntry {
        timestamp_ms: now_ms(),
        method: method.as_str(),
        path,
        status_code: 502,
        duration_ms: started.elapsed().as_millis() as u64,
        request_id,
        stream: was_stream_request,
        model: None,
        cache: None,
        usage: None,
        http_debug,
    });
    json_error(StatusCode::BAD_GATEWAY, &msg)
}

fn check_auth(svc: &RelayService, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = svc.config.proxy_token.as_deref() else {
        return Ok(());
    };
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let relay_token = headers.get("x-relay-token").and_then(|v| v.to_str().ok());
    if bearer == Some(expected) || relay_token == Some(expected) {
        Ok(())
    } else {
        Err(json_error(
            StatusCode::UNAUTHORIZED,
            "invalid or missing relay token",
        ))
    }
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

/// Joins the upstream base with the client path, collapsing a duplicated
/// `/v1` so clients configured with either base form work unchanged.
fn build_target(base: &str, path_and_query: &str) -> String {
    let mut path = path_and_query;
    if base.ends_with("/v1")
        && let Some(rest) = path.strip_prefix("/v1")
        && (rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'))
    {
        path = if rest.is_empty() { "/" } else { rest };
    }
    format!("{base}{path}")
}

/// Client headers minus hop-by-hop and credential headers; the upstream key
/// always replaces whatever authorization the client sent.
fn filter_request_headers(headers: &HeaderMap, upstream_key: &str, rewritten: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let skip = matches!(
            name.as_str(),
            "host"
                | "content-length"
                | "connection"
                | "transfer-encoding"
                | "accept-encoding"
                | "authorization"
                | "proxy-authorization"
                | "x-relay-token"
        );
        if !skip {
            out.append(name.clone(), value.clone());
        }
    }
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {upstream_key}")) {
        out.insert(header::AUTHORIZATION, v);
    }
    if rewritten {
        out.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    out
}

fn upstream_auth_headers(upstream_key: &str) -> HeaderMap {
    let mut out = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&format!("Bearer {upstream_key}")) {
        out.insert(header::AUTHORIZATION, v);
    }
    out
}

fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        let skip = matches!(
            name.as_str(),
            "transfer-encoding" | "connection" | "content-length" | "keep-alive"
        );
        if !skip {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn cached_to_response(entry: CachedResponse, request_id: &str) -> Response {
    let mut builder =
        Response::builder().status(StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK));
    for (name, value) in &entry.headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            builder = builder.header(n, v);
        }
    }
    builder = builder.header("x-request-id", request_id);
    builder
        .body(Body::from(entry.body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn json_error(status: StatusCode, message: &str) -> Response {
    let body = serde_json::to_vec(&json!({
        "error": {"message": message, "type": "relay_error"}
    }))
    .unwrap_or_default();
    json_response(status, body)
}
