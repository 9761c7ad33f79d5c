// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed configuration for the orchestrator. Every field is a CLI flag with
//! an `env = "..."` fallback matching the environment variables named in the
//! design doc; numeric fields fall back to their documented default rather
//! than failing the process when the env var doesn't parse.

use std::time::Duration;

/// Top-level configuration, assembled from CLI flags and environment
/// variables via `clap`'s derive macro.
#[derive(Debug, Clone, clap::Parser)]
pub struct BenchConfig {
    /// Host to bind the HTTP/WebSocket listener on.
    #[arg(long, default_value = "0.0.0.0", env = "BENCHD_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8090, env = "BENCHD_PORT")]
    pub port: u16,

    /// Bearer token gating `/api/logs/ingest`. If unset, the endpoint is open.
    #[arg(long, env = "BENCHD_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Serial port rescan interval in milliseconds.
    #[arg(long, default_value_t = 2000, env = "DISCOVERY_RESCAN_MS")]
    pub discovery_rescan_ms: u64,

    /// Active-probe identify timeout in milliseconds.
    #[arg(long, default_value_t = 1500, env = "DISCOVERY_IDENTIFY_TIMEOUT_MS")]
    pub discovery_identify_timeout_ms: u64,

    /// Active-probe retry count before falling back to static scoring.
    #[arg(long, default_value_t = 2, env = "DISCOVERY_IDENTIFY_RETRIES")]
    pub discovery_identify_retries: u32,

    /// Baud rate used while actively probing an unidentified port.
    #[arg(long, default_value_t = 9600, env = "DISCOVERY_PROBE_BAUD")]
    pub discovery_probe_baud: u32,

    /// Snapshot retained for newly-connected WS clients (bounded log history).
    #[arg(long, default_value_t = true, env = "CLIENT_LOGS_SNAPSHOT")]
    pub client_logs_snapshot: bool,

    /// Capacity of the in-process bounded log ring.
    #[arg(long, default_value_t = 500, env = "CLIENT_LOGS_CAPACITY")]
    pub client_logs_capacity: usize,

    /// Optional regex applied to log messages before they're stored/streamed;
    /// matches are replaced with `[redacted]`. Invalid patterns are ignored
    /// (logged at warn) rather than failing startup.
    #[arg(long, env = "LOG_REDACT_PATTERN")]
    pub log_redact_pattern: Option<String>,

    /// Comma-separated list of log channels forwarded to WS clients. Empty = all.
    #[arg(long, default_value = "", env = "LOG_CHANNEL_ALLOWLIST")]
    pub log_channel_allowlist: String,

    /// Minimum log level forwarded to WS clients.
    #[arg(long, default_value = "info", env = "LOG_LEVEL_MIN")]
    pub log_level_min: String,

    /// WebSocket state-snapshot heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 1000, env = "WS_HEARTBEAT_MS")]
    pub ws_heartbeat_ms: u64,

    /// Bounded per-client outbound queue depth for the WS fan-out.
    #[arg(long, default_value_t = 256, env = "WS_CLIENT_QUEUE_DEPTH")]
    pub ws_client_queue_depth: usize,

    /// Bounded history retained per device slice (operationHistory / errorHistory).
    #[arg(long, default_value_t = 50, env = "DEVICE_HISTORY_LIMIT")]
    pub device_history_limit: usize,

    /// Per-device operation queue depth.
    #[arg(long, default_value_t = 32, env = "DEVICE_QUEUE_DEPTH")]
    pub device_queue_depth: usize,

    /// Printer job history retained.
    #[arg(long, default_value_t = 100, env = "SERIAL_PRINTER_HISTORY_LIMIT")]
    pub serial_printer_history_limit: usize,

    /// Printer idle-flush window in milliseconds.
    #[arg(long, default_value_t = 500, env = "SERIAL_PRINTER_IDLE_FLUSH_MS")]
    pub serial_printer_idle_flush_ms: u64,

    /// Base reconnect backoff delay in milliseconds, shared by all drivers
    /// unless a device-specific override is set.
    #[arg(long, default_value_t = 250, env = "RECONNECT_BASE_DELAY_MS")]
    pub reconnect_base_delay_ms: u64,

    /// Max reconnect backoff delay in milliseconds.
    #[arg(long, default_value_t = 15000, env = "RECONNECT_MAX_DELAY_MS")]
    pub reconnect_max_delay_ms: u64,

    /// Max reconnect attempts before a driver reports fatal (0 = unlimited).
    #[arg(long, default_value_t = 0, env = "RECONNECT_MAX_ATTEMPTS")]
    pub reconnect_max_attempts: u32,

    /// Atlona switch-controller reconnect base delay override (ms).
    #[arg(long, default_value_t = 250, env = "ATLONA_RECONNECT_BASE_MS")]
    pub atlona_reconnect_base_ms: u64,

    /// Atlona switch-controller reconnect max delay override (ms).
    #[arg(long, default_value_t = 15000, env = "ATLONA_RECONNECT_MAX_MS")]
    pub atlona_reconnect_max_ms: u64,

    /// Mouse driver tick rate in Hz.
    #[arg(long, default_value_t = 60, env = "MOUSE_TICK_HZ")]
    pub mouse_tick_hz: u32,

    /// Maximum per-axis delta flushed per mouse tick.
    #[arg(long, default_value_t = 127, env = "MOUSE_PER_TICK_MAX_DELTA")]
    pub mouse_per_tick_max_delta: i32,

    /// Host for the FFmpeg capture sidecar reverse-proxied at `/api/sidecar/stream`.
    #[arg(long, default_value = "127.0.0.1", env = "SIDECAR_HOST")]
    pub sidecar_host: String,

    /// Port for the capture sidecar.
    #[arg(long, default_value_t = 8091, env = "SIDECAR_PORT")]
    pub sidecar_port: u16,

    /// Sheets blocking-pool worker count.
    #[arg(long, default_value_t = 2, env = "SHEETS_BLOCKING_POOL_SIZE")]
    pub sheets_blocking_pool_size: usize,

    /// Sheets background-pool worker count.
    #[arg(long, default_value_t = 4, env = "SHEETS_BACKGROUND_POOL_SIZE")]
    pub sheets_background_pool_size: usize,

    /// Max pending tasks per sheets pool before `exec` rejects new work.
    #[arg(long, default_value_t = 64, env = "SHEETS_MAX_PENDING")]
    pub sheets_max_pending: usize,

    /// Per-task timeout for sheets workers in milliseconds.
    #[arg(long, default_value_t = 30000, env = "SHEETS_TASK_TIMEOUT_MS")]
    pub sheets_task_timeout_ms: u64,

    /// Sheets locking discipline: `none`, `serialize-all`, or `exclusive-barrier`.
    #[arg(long, default_value = "exclusive-barrier", env = "SHEETS_LOCK_MODE")]
    pub sheets_lock_mode: String,

    /// Sheets auth warmup strategy: `none`, `warmup`, or `strict`.
    #[arg(long, default_value = "warmup", env = "SHEETS_AUTH_STRATEGY")]
    pub sheets_auth_strategy: String,

    /// Path to the service-account credentials file broadcast to sheets
    /// workers on init. Absence is only fatal under `strict` auth.
    #[arg(long, env = "SHEETS_CREDENTIALS_PATH")]
    pub sheets_credentials_path: Option<String>,

    /// Broadcast to sheets workers on init; when set, `exec` calls log the
    /// request instead of touching the spreadsheet backend.
    #[arg(long, default_value_t = false, env = "SHEETS_DRY_RUN")]
    pub sheets_dry_run: bool,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long, default_value_t = false, env = "BENCHD_LOG_JSON")]
    pub log_json: bool,
}

impl BenchConfig {
    pub fn discovery_rescan_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_rescan_ms)
    }

    pub fn discovery_identify_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_identify_timeout_ms)
    }

    pub fn ws_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.ws_heartbeat_ms)
    }

    pub fn serial_printer_idle_flush(&self) -> Duration {
        Duration::from_millis(self.serial_printer_idle_flush_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn sheets_task_timeout(&self) -> Duration {
        Duration::from_millis(self.sheets_task_timeout_ms)
    }

    /// Parse the allowlist CSV into a list of channel names. Empty means "all".
    pub fn log_channel_allowlist(&self) -> Vec<String> {
        self.log_channel_allowlist
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// Parse a numeric environment variable, falling back to `default` on any
/// parse failure (missing var, empty string, or malformed number) rather
/// than failing process startup. `clap`'s `env` attribute already does this
/// for flags backed by `BenchConfig`; this helper exists for ad hoc numeric
/// envs read outside the derive (e.g. from library code without a `Config`
/// handle in scope).
pub fn env_u64_or(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_splits_and_trims_csv() {
        let mut config = default_test_config();
        config.log_channel_allowlist = " discovery, mouse ,".to_owned();
        assert_eq!(config.log_channel_allowlist(), vec!["discovery", "mouse"]);
    }

    #[test]
    fn empty_allowlist_is_empty_vec() {
        let config = default_test_config();
        assert!(config.log_channel_allowlist().is_empty());
    }

    #[test]
    fn malformed_numeric_env_falls_back_to_default() {
        // SAFETY scope note: tests run single-threaded per process in this
        // module; no other test reads this key.
        unsafe {
            std::env::set_var("BENCHD_TEST_NUMERIC", "not-a-number");
        }
        assert_eq!(env_u64_or("BENCHD_TEST_NUMERIC", 42), 42);
        unsafe {
            std::env::remove_var("BENCHD_TEST_NUMERIC");
        }
    }

    fn default_test_config() -> BenchConfig {
        BenchConfig {
            host: "0.0.0.0".to_owned(),
            port: 8090,
            auth_token: None,
            discovery_rescan_ms: 2000,
            discovery_identify_timeout_ms: 1500,
            discovery_identify_retries: 2,
            discovery_probe_baud: 9600,
            client_logs_snapshot: true,
            client_logs_capacity: 500,
            log_redact_pattern: None,
            log_channel_allowlist: String::new(),
            log_level_min: "info".to_owned(),
            ws_heartbeat_ms: 1000,
            ws_client_queue_depth: 256,
            device_history_limit: 50,
            device_queue_depth: 32,
            serial_printer_history_limit: 100,
            serial_printer_idle_flush_ms: 500,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 15000,
            reconnect_max_attempts: 0,
            atlona_reconnect_base_ms: 250,
            atlona_reconnect_max_ms: 15000,
            mouse_tick_hz: 60,
            mouse_per_tick_max_delta: 127,
            sidecar_host: "127.0.0.1".to_owned(),
            sidecar_port: 8091,
            sheets_blocking_pool_size: 2,
            sheets_background_pool_size: 4,
            sheets_max_pending: 64,
            sheets_task_timeout_ms: 30000,
            sheets_lock_mode: "exclusive-barrier".to_owned(),
            sheets_auth_strategy: "warmup".to_owned(),
            sheets_credentials_path: None,
            sheets_dry_run: false,
            log_json: false,
        }
    }
}
