use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use crate::config::{RelayConfig, RetryConfig};
use crate::proxy::stream::RelayBodyStream;
use crate::proxy::{RelayService, router};

fn spawn_axum_server(app: axum::Router) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    listener.set_nonblocking(true).expect("nonblocking");
    let listener = tokio::net::TcpListener::from_std(listener).expect("to tokio listener");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, handle)
}

fn make_config(upstream_base: &str, retry: RetryConfig) -> RelayConfig {
    RelayConfig {
        upstream_base: upstream_base.trim_end_matches('/').to_string(),
        upstream_key: "sk-test".to_string(),
        proxy_token: None,
        default_user: "chat-relay".to_string(),
        model_aliases: [("gpt-4".to_string(), "gpt-4o".to_string())]
            .into_iter()
            .collect(),
        retry,
        cost_input_per_m: 0.0,
        cost_output_per_m: 0.0,
    }
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        backoff_ms: 0,
        backoff_max_ms: 0,
        jitter_ms: 0,
    }
}

fn make_service(config: RelayConfig) -> Arc<RelayService> {
    let (_tx, rx) = watch::channel(false);
    RelayService::new(config, rx).expect("service")
}

fn sse_chunk(content: &str) -> Bytes {
    Bytes::from(format!(
        "data: {{\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
    ))
}

#[tokio::test]
async fn health_reports_ok_without_auth() {
    let cfg = make_config("http://127.0.0.1:1", fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["ok"], true);

    handle.abort();
}

#[tokio::test]
async fn relay_rewrites_model_alias_and_injects_user() {
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(|Json(v): Json<Value>| async move { Json(json!({ "echo": v })) }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.expect("json");
    assert_eq!(body["echo"]["model"], "gpt-4o");
    assert_eq!(body["echo"]["user"], "chat-relay");

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn retries_503_until_the_upstream_recovers() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            if h.fetch_add(1, Ordering::SeqCst) < 3 {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({ "err": "overloaded" })),
                )
            } else {
                (StatusCode::OK, Json(json!({ "ok": true })))
            }
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(8));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"m","messages":[]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn gives_up_with_502_after_max_attempts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "err": "still down" })),
            )
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(3));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"m","messages":[]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let body: Value = resp.json().await.expect("json");
    assert!(body["error"]["message"].is_string());

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn does_not_retry_a_400() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "err": "bad request" })),
            )
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(5));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"m","messages":[]}"#)
        .send()
        .await
        .expect("send");

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn identical_posts_within_the_window_hit_the_replay_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Json(json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4},
            }))
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let client = reqwest::Client::new();
    let body = r#"{"model":"m","messages":[{"role":"user","content":"same"}]}"#;
    let mut texts = Vec::new();
    for _ in 0..2 {
        let resp = client
            .post(format!("http://{addr}/v1/chat/completions"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("send");
        assert_eq!(resp.status(), StatusCode::OK);
        texts.push(resp.text().await.expect("text"));
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1, "second post must replay");
    assert_eq!(texts[0], texts[1]);

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn relay_token_is_required_when_configured() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "ok": true }))
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let mut cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    cfg.proxy_token = Some("secret".to_string());
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let client = reqwest::Client::new();
    let url = format!("http://{addr}/v1/chat/completions");
    let body = r#"{"model":"m","messages":[]}"#;

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "must not reach upstream");

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .header("x-relay-token", "secret")
        .body(body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .post(&url)
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret")
        .body(body)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn model_list_is_served_from_the_micro_cache() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/v1/models",
        get(move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "object": "list", "data": [{"id": "gpt-4o", "object": "model"}] }))
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .get(format!("http://{addr}/v1/models"))
            .send()
            .await
            .expect("send");
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = resp.json().await.expect("json");
        assert_eq!(body["data"][0]["id"], "gpt-4o");
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1);

    handle.abort();
    u_handle.abort();
}

/// A 2xx body without a usage object or chat choices still counts as a
/// session turn, with zeroed completion tokens.
#[tokio::test]
async fn turn_is_counted_even_without_usage_in_the_body() {
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(|| async { Json(json!({ "status": "accepted" })) }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);

    let snap: Value = client
        .get(format!("http://{addr}/_metrics"))
        .send()
        .await
        .expect("metrics")
        .json()
        .await
        .expect("json");
    assert_eq!(snap["session"]["turn_count"], 1);
    assert_eq!(snap["session"]["completion_tokens"], 0);

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn paths_outside_v1_are_not_proxied() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let upstream = axum::Router::new().route(
        "/{*path}",
        get(move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Json(json!({ "ok": true }))
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::get(format!("http://{addr}/admin"))
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "must not reach upstream");

    handle.abort();
    u_handle.abort();
}

#[tokio::test]
async fn unknown_result_id_is_a_404() {
    let cfg = make_config("http://127.0.0.1:1", fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let resp = reqwest::get(format!("http://{addr}/v1/results/no-such-id"))
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    handle.abort();
}

/// A client that drops mid-stream must still be able to fetch the rest of
/// the answer, exactly once, from `/v1/results/{request_id}`.
#[tokio::test]
async fn dropped_stream_is_recoverable_once_from_results() {
    // Upstream streams two chunks immediately, pauses, then finishes.
    let upstream = axum::Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
            tokio::spawn(async move {
                for part in ["A", "B"] {
                    let _ = tx.send(Ok(sse_chunk(part))).await;
                }
                tokio::time::sleep(Duration::from_millis(300)).await;
                for part in ["C", "D", "E"] {
                    let _ = tx.send(Ok(sse_chunk(part))).await;
                }
                let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(RelayBodyStream::new(rx)))
                .expect("response")
        }),
    );
    let (u_addr, u_handle) = spawn_axum_server(upstream);

    let cfg = make_config(&format!("http://{u_addr}"), fast_retry(1));
    let (addr, handle) = spawn_axum_server(router(make_service(cfg)));

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body(r#"{"model":"m","stream":true,"messages":[{"role":"user","content":"hi"}]}"#)
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), StatusCode::OK);
    let request_id = resp
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("x-request-id")
        .to_string();

    // Read until both leading chunks arrived, then hang up.
    let mut seen = String::new();
    let mut body = resp.bytes_stream();
    while !(seen.contains("\"A\"") && seen.contains("\"B\"")) {
        let chunk = body.next().await.expect("stream item").expect("chunk");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(body);

    // The relay keeps draining the upstream; poll until the remainder lands.
    let results_url = format!("http://{addr}/v1/results/{request_id}");
    let mut recovered = None;
    for _ in 0..30 {
        let resp = client.get(&results_url).send().await.expect("poll");
        if resp.status() == StatusCode::OK {
            recovered = Some(resp.json::<Value>().await.expect("json"));
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let recovered = recovered.expect("aggregated result never appeared");
    assert_eq!(recovered["choices"][0]["message"]["content"], "CDE");
    assert_eq!(recovered["choices"][0]["finish_reason"], "stop");

    // One-shot: the entry is consumed by the successful fetch.
    let resp = client.get(&results_url).send().await.expect("second fetch");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    handle.abort();
    u_handle.abort();
}
