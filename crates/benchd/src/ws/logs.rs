// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded in-process log ring (§6): a `tracing_subscriber::Layer` captures
//! every `tracing` event crate-wide and pushes it into a ring buffer, which
//! also accepts entries pushed directly from `POST /api/logs/ingest` (the
//! capture sidecar's own logs). The ring backs `logs.history` (sent once on
//! WS connect) and `logs.append` (streamed live), both filtered by channel
//! allowlist and level floor.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::app::AppHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            "fatal" | "critical" => Self::Fatal,
            _ => Self::Info,
        }
    }

    fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::TRACE | Level::DEBUG => Self::Debug,
            Level::INFO => Self::Info,
            Level::WARN => Self::Warn,
            Level::ERROR => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts_ms: u64,
    pub level: LogLevel,
    pub channel: String,
    pub message: String,
}

/// Bounded ring plus the filter config applied to both the stored history
/// and the live broadcast fan-out to WS clients.
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
    allowlist: Vec<String>,
    level_floor: LogLevel,
    redactor: Option<regex::Regex>,
    live_tx: broadcast::Sender<LogEntry>,
}

impl LogRing {
    pub fn new(capacity: usize, allowlist: Vec<String>, level_floor: LogLevel) -> Arc<Self> {
        Self::with_redactor(capacity, allowlist, level_floor, None)
    }

    /// Build a ring with an optional message redactor. An invalid pattern is
    /// logged and treated as no redactor, matching the documented
    /// parse-failure-falls-back-to-default convention for config.
    pub fn with_redactor(capacity: usize, allowlist: Vec<String>, level_floor: LogLevel, redact_pattern: Option<&str>) -> Arc<Self> {
        let redactor = redact_pattern.and_then(|p| match regex::Regex::new(p) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern = p, %err, "ignoring invalid LOG_REDACT_PATTERN");
                None
            }
        });
        let (live_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
            allowlist,
            level_floor,
            redactor,
            live_tx,
        })
    }

    fn passes(&self, entry: &LogEntry) -> bool {
        if entry.level < self.level_floor {
            return false;
        }
        self.allowlist.is_empty() || self.allowlist.iter().any(|c| c == &entry.channel)
    }

    pub async fn push(&self, mut entry: LogEntry) {
        if !self.passes(&entry) {
            return;
        }
        if let Some(re) = &self.redactor {
            entry.message = re.replace_all(&entry.message, "[redacted]").into_owned();
        }
        {
            let mut entries = self.entries.lock().await;
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        let _ = self.live_tx.send(entry);
    }

    pub async fn history(&self) -> Vec<LogEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.live_tx.subscribe()
    }
}

/// `tracing_subscriber::Layer` that mirrors every event into a [`LogRing`].
/// Field values are captured as a flattened `key=value` message; the event's
/// own `message` field (if present) is used verbatim.
pub struct LogRingLayer {
    ring: Arc<LogRing>,
}

impl LogRingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let entry = LogEntry {
            ts_ms: crate::state::now_ms(),
            level: LogLevel::from_tracing(event.metadata().level()),
            channel: event.metadata().target().to_owned(),
            message: visitor.message.unwrap_or_default(),
        };
        let ring = Arc::clone(&self.ring);
        tokio::spawn(async move { ring.push(entry).await });
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub ts: u64,
    pub level: String,
    pub channel: String,
    pub message: String,
}

/// `POST /api/logs/ingest` — bearer-token-gated (when `auth_token` is
/// configured); otherwise open. Constant-time comparison against timing
/// side-channels, matching the teacher's bearer-auth helper.
pub async fn ingest(State(app): State<Arc<AppHandle>>, headers: HeaderMap, Json(req): Json<IngestRequest>) -> impl IntoResponse {
    if let Some(expected) = app.config.auth_token.as_deref() {
        match headers.get("authorization").and_then(|v| v.to_str().ok()).and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) if constant_time_eq(token, expected) => {}
            _ => return StatusCode::UNAUTHORIZED.into_response(),
        }
    }
    app.logs
        .push(LogEntry { ts_ms: req.ts, level: LogLevel::parse(&req.level), channel: req.channel, message: req.message })
        .await;
    StatusCode::NO_CONTENT.into_response()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// `GET /api/health` — ambient, unauthenticated liveness probe.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_drops_oldest_past_capacity() {
        let ring = LogRing::new(2, Vec::new(), LogLevel::Debug);
        for i in 0..3 {
            ring.push(LogEntry { ts_ms: i, level: LogLevel::Info, channel: "discovery".into(), message: format!("m{i}") }).await;
        }
        let history = ring.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "m1");
    }

    #[tokio::test]
    async fn allowlist_filters_out_other_channels() {
        let ring = LogRing::new(10, vec!["mouse".into()], LogLevel::Debug);
        ring.push(LogEntry { ts_ms: 0, level: LogLevel::Info, channel: "printer".into(), message: "x".into() }).await;
        assert!(ring.history().await.is_empty());
    }

    #[tokio::test]
    async fn level_floor_drops_below_threshold() {
        let ring = LogRing::new(10, Vec::new(), LogLevel::Warn);
        ring.push(LogEntry { ts_ms: 0, level: LogLevel::Debug, channel: "discovery".into(), message: "x".into() }).await;
        ring.push(LogEntry { ts_ms: 0, level: LogLevel::Error, channel: "discovery".into(), message: "y".into() }).await;
        let history = ring.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "y");
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("abc", "ab"));
        assert!(constant_time_eq("secret", "secret"));
    }

    #[tokio::test]
    async fn redactor_masks_matching_substrings() {
        let ring = LogRing::with_redactor(10, Vec::new(), LogLevel::Debug, Some(r"token=\w+"));
        ring.push(LogEntry { ts_ms: 0, level: LogLevel::Info, channel: "sheets".into(), message: "auth token=abc123 ok".into() }).await;
        let history = ring.history().await;
        assert_eq!(history[0].message, "auth [redacted] ok");
    }

    #[tokio::test]
    async fn invalid_redact_pattern_is_ignored() {
        let ring = LogRing::with_redactor(10, Vec::new(), LogLevel::Debug, Some("("));
        ring.push(LogEntry { ts_ms: 0, level: LogLevel::Info, channel: "sheets".into(), message: "hello".into() }).await;
        assert_eq!(ring.history().await[0].message, "hello");
    }
}
