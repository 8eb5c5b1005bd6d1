use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::{Duration, Instant, interval};
use tracing::info;

use crate::usage::UsageMetrics;

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct SessionSnapshot {
    pub started_at_ms: u64,
    pub turn_count: u64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub api_duration_ms: u64,
    pub est_cost_usd: f64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_ms: u64,
    pub requests_seen: u64,
    pub requests_proxied: u64,
    pub cache_hits: u64,
    pub cached_responses: u64,
    pub retry_attempts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub session: SessionSnapshot,
}

#[derive(Debug, Default)]
struct SessionState {
    started_at_ms: u64,
    turn_count: u64,
    prompt_tokens: i64,
    completion_tokens: i64,
    api_duration_ms: u64,
    last_turn: Option<UsageMetrics>,
    last_activity: Option<Instant>,
}

/// Lifetime counters never reset; the session block rolls over whenever a
/// request arrives after `inactivity_timeout` of idleness (and once more at
/// shutdown). Counter updates never span an await.
pub struct RelayMetrics {
    started: Instant,
    inactivity_timeout: Duration,
    cost_input_per_m: f64,
    cost_output_per_m: f64,
    requests_seen: AtomicU64,
    requests_proxied: AtomicU64,
    cache_hits: AtomicU64,
    cached_responses: AtomicU64,
    retry_attempts: AtomicU64,
    last_error: Mutex<Option<String>>,
    session: Mutex<SessionState>,
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RelayMetrics {
    pub fn new(
        inactivity_timeout: Duration,
        cost_input_per_m: f64,
        cost_output_per_m: f64,
    ) -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            inactivity_timeout,
            cost_input_per_m,
            cost_output_per_m,
            requests_seen: AtomicU64::new(0),
            requests_proxied: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cached_responses: AtomicU64::new(0),
            retry_attempts: AtomicU64::new(0),
            last_error: Mutex::new(None),
            session: Mutex::new(SessionState::default()),
        })
    }

    /// Emits the session summary if the inactivity window elapses without any
    /// new request, so an abandoned session still gets summarized.
    pub fn spawn_idle_watchdog(self: &Arc<Self>) {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                let mut session = metrics.lock_session();
                let idle = session
                    .last_activity
                    .is_some_and(|t| t.elapsed() >= metrics.inactivity_timeout);
                if idle && session.turn_count > 0 {
                    metrics.summarize_and_reset(&mut session, "idle timeout");
                }
            }
        });
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, SessionState> {
        match self.session.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Called for every inbound request. Rolls the session over first when
    /// the idle gap reached the timeout, then counts the request as activity.
    pub fn on_request(&self) {
        self.requests_seen.fetch_add(1, Ordering::Relaxed);
        let mut session = self.lock_session();
        let expired = session
            .last_activity
            .is_some_and(|t| t.elapsed() >= self.inactivity_timeout);
        if expired && session.turn_count > 0 {
            self.summarize_and_reset(&mut session, "inactivity");
        }
        if session.started_at_ms == 0 {
            session.started_at_ms = unix_ms();
        }
        session.last_activity = Some(Instant::now());
    }

    /// Records a completed turn (best-effort token counts plus the time the
    /// upstream call took).
    pub fn on_turn_complete(&self, prompt_tokens: i64, completion_tokens: i64, duration_ms: u64) {
        let mut session = self.lock_session();
        session.turn_count += 1;
        session.prompt_tokens = session.prompt_tokens.saturating_add(prompt_tokens);
        session.completion_tokens = session.completion_tokens.saturating_add(completion_tokens);
        session.api_duration_ms = session.api_duration_ms.saturating_add(duration_ms);
        session.last_turn = Some(UsageMetrics {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        });
        session.last_activity = Some(Instant::now());
    }

    pub fn record_proxied(&self) {
        self.requests_proxied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cached_response(&self) {
        self.cached_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: &str) {
        let mut last = match self.last_error.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        *last = Some(err.to_string());
    }

    fn session_cost(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        prompt_tokens.max(0) as f64 / 1_000_000.0 * self.cost_input_per_m
            + completion_tokens.max(0) as f64 / 1_000_000.0 * self.cost_output_per_m
    }

    fn summarize_and_reset(&self, session: &mut SessionState, reason: &str) {
        let cost = self.session_cost(session.prompt_tokens, session.completion_tokens);
        let last = session.last_turn.clone().unwrap_or_default();
        info!(
            "session summary ({reason}): turns={} prompt_tokens={} completion_tokens={} \
             api_duration_ms={} est_cost_usd={:.4} last_turn_prompt={} last_turn_completion={}",
            session.turn_count,
            session.prompt_tokens,
            session.completion_tokens,
            session.api_duration_ms,
            cost,
            last.prompt_tokens,
            last.completion_tokens,
        );
        *session = SessionState::default();
    }

    /// Shutdown path: summarize whatever session is open, once.
    pub fn end_session(&self) {
        let mut session = self.lock_session();
        if session.turn_count > 0 {
            self.summarize_and_reset(&mut session, "shutdown");
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let session = self.lock_session();
        MetricsSnapshot {
            uptime_ms: self.started.elapsed().as_millis() as u64,
            requests_seen: self.requests_seen.load(Ordering::Relaxed),
            requests_proxied: self.requests_proxied.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cached_responses: self.cached_responses.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            last_error: match self.last_error.lock() {
                Ok(g) => g.clone(),
                Err(e) => e.into_inner().clone(),
            },
            session: SessionSnapshot {
                started_at_ms: session.started_at_ms,
                turn_count: session.turn_count,
                prompt_tokens: session.prompt_tokens,
                completion_tokens: session.completion_tokens,
                api_duration_ms: session.api_duration_ms,
                est_cost_usd: self.session_cost(session.prompt_tokens, session.completion_tokens),
            },
        }
    }
}
