use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Url};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;

pub(super) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// `min(base * 2^attempt, cap) + random(0..=jitter)`, with `attempt` counted
/// from zero.
pub(super) fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let shift = attempt.min(16);
    let exp = cfg.backoff_ms.saturating_mul(1u64 << shift);
    let capped = exp.min(cfg.backoff_max_ms);
    let jitter = if cfg.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=cfg.jitter_ms)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

/// Resolves when the cancel flag flips to true. A dropped sender means the
/// caller gave up its right to cancel, so this pends forever in that case.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Sleeps for `delay` unless cancelled mid-sleep; returns false on cancel.
async fn sleep_or_cancel(delay: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = sleep(delay) => true,
        _ = wait_cancelled(cancel) => false,
    }
}

/// The Retry/Backoff Executor: issues the upstream call up to
/// `cfg.max_attempts` times, backing off between attempts on retryable
/// statuses (429/500/502/503/504) and transport errors. Cancellation aborts
/// immediately, including mid-backoff, and is never retried.
pub(super) async fn send_with_retry(
    client: Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    mut cancel: watch::Receiver<bool>,
    cfg: RetryConfig,
    metrics: Arc<RelayMetrics>,
) -> Result<reqwest::Response, RelayError> {
    let max_attempts = cfg.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if *cancel.borrow() {
            return Err(RelayError::ClientCancelled);
        }

        let builder = client
            .request(method.clone(), url.clone())
            .headers(headers.clone())
            .body(body.clone());

        let result = tokio::select! {
            r = builder.send() => r,
            _ = wait_cancelled(&mut cancel) => return Err(RelayError::ClientCancelled),
        };

        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if !is_retryable_status(status) {
                    // 2xx, or a non-retryable failure passed through as-is.
                    return Ok(resp);
                }
                if attempt + 1 >= max_attempts {
                    let msg = format!(
                        "upstream still returning {status} after {max_attempts} attempts"
                    );
                    metrics.record_error(&msg);
                    return Err(RelayError::Upstream(msg));
                }
                metrics.record_retry();
                let delay = backoff_delay(&cfg, attempt);
                warn!(
                    "upstream returned {status} for {method} {url}, retrying in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt + 2,
                    max_attempts
                );
                if !sleep_or_cancel(delay, &mut cancel).await {
                    return Err(RelayError::ClientCancelled);
                }
            }
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    let msg =
                        format!("upstream transport error after {max_attempts} attempts: {e}");
                    metrics.record_error(&msg);
                    return Err(RelayError::Upstream(msg));
                }
                metrics.record_retry();
                let delay = backoff_delay(&cfg, attempt);
                warn!(
                    "upstream transport error for {method} {url}: {e}; retrying in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt + 2,
                    max_attempts
                );
                if !sleep_or_cancel(delay, &mut cancel).await {
                    return Err(RelayError::ClientCancelled);
                }
            }
        }
    }

    Err(RelayError::Upstream("retry attempts exhausted".to_string()))
}
