// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-device driver (§4.2): one instance per device class, each owning
//! exactly one serial port, a lifecycle state machine, a bounded FIFO
//! operation queue, and a reconnect-with-backoff loop. The state machine and
//! identification handshake are common (this module); the wire protocol for
//! queued operations differs per device, so each concrete driver below
//! drives its own connect/identify/serve loop rather than going through one
//! shared callback-heavy runtime.

pub mod atlona;
pub mod backoff;
pub mod cfimager;
pub mod frontpanel;
pub mod keyboard;
pub mod mouse;
pub mod operation;
pub mod power_meter;
pub mod printer;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::serial_io::SerialHandle;
use crate::state::Phase;

/// Events a driver's run loop reports to the adapter task so it can update
/// `AppState` and publish bus messages. Concrete drivers extend this with
/// their own device-specific payload via [`DriverEvent::Custom`].
#[derive(Debug, Clone)]
pub enum DriverEvent {
    PhaseChanged(Phase),
    /// Emitted by [`operation::OperationQueueHandle::enqueue`] the moment an
    /// operation is admitted, carrying the queue's depth right after
    /// admission so the adapter can mirror it onto `DeviceSlice::queue_depth`
    /// without reaching back into the queue itself.
    OperationQueued { id: String, queue_depth: usize },
    OperationStarted { id: String },
    OperationCompleted { id: String, result: serde_json::Value },
    OperationFailed { id: String, reason: String },
    OperationCancelled { id: String, reason: String },
    Error { message: String },
    FatalError { attempts: u32, message: String },
    /// Device-specific telemetry (mouse accumulator flush, printer job,
    /// front-panel pin change, power-meter sample, ...), carried as JSON for
    /// the adapter to interpret against the right state slice.
    Custom(serde_json::Value),
}

/// Configuration common to every driver instance, independent of device
/// kind.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub device_id: String,
    pub path: String,
    pub baud_rate: u32,
    pub identify_write: String,
    pub identify_complete_write: String,
    pub identify_token: String,
    pub identify_timeout: Duration,
    pub eol: String,
    pub queue_max_depth: usize,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
}

/// Write `identify_write`, read lines (skipping `debug:`/`done:` noise)
/// until `identify_token` is seen or the deadline elapses, then write
/// `identify_complete_write`. Shared by every driver's identifying state.
pub async fn identify(handle: &mut SerialHandle, config: &DriverConfig) -> Result<()> {
    handle.write_line(&config.identify_write, &config.eol).await?;
    let deadline = tokio::time::Instant::now() + config.identify_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(crate::error::OrchestratorError::Timeout(config.identify_timeout));
        }
        let line = handle.read_line_raw(remaining).await?;
        let trimmed = line.trim();
        if trimmed.starts_with("debug:") || trimmed.starts_with("done:") {
            continue;
        }
        if trimmed.eq_ignore_ascii_case(&config.identify_token) {
            handle.write_line(&config.identify_complete_write, &config.eol).await?;
            return Ok(());
        }
        return Err(crate::error::OrchestratorError::Protocol(format!(
            "unexpected identify token {trimmed:?}"
        )));
    }
}

/// Sleep for the backoff's next delay, reporting `phase=error` first. `Ok`
/// if the caller should retry the connect loop, `Err` (as a fatal event
/// already sent) if attempts are exhausted.
pub async fn backoff_or_fatal(
    backoff: &mut backoff::Backoff,
    stop: &tokio_util::sync::CancellationToken,
    events_tx: &mpsc::Sender<DriverEvent>,
    message: &str,
) -> bool {
    let _ = events_tx.send(DriverEvent::PhaseChanged(Phase::Error)).await;
    match backoff.next_delay() {
        Some(delay) => {
            tokio::select! {
                _ = stop.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        }
        None => {
            let _ = events_tx
                .send(DriverEvent::FatalError { attempts: backoff.attempt(), message: message.to_owned() })
                .await;
            false
        }
    }
}

/// `true` if this bus event is a front-panel power-off transition — the
/// host-power-off trigger that cancels queued mouse/keyboard operations. A
/// closed channel (`None`) is not power-off; the select arm just re-awaits.
pub fn is_power_off(event: Option<crate::bus::BusEvent>) -> bool {
    match event {
        Some(event) if event.topic == "frontpanel.power.changed" => {
            event.payload.get("state").and_then(|v| v.as_bool()) == Some(false)
        }
        _ => false,
    }
}

/// Report the terminal event for a finished operation and resolve its
/// reply channel. Shared by every concrete driver's operation-serving loop.
pub async fn finish_operation(
    op: operation::Operation,
    outcome: operation::Outcome,
    events_tx: &mpsc::Sender<DriverEvent>,
) {
    let id = op.id.clone();
    match &outcome {
        operation::Outcome::Completed(value) => {
            let _ = events_tx
                .send(DriverEvent::OperationCompleted { id, result: value.clone() })
                .await;
        }
        operation::Outcome::Failed(reason) => {
            let _ = events_tx.send(DriverEvent::OperationFailed { id, reason: reason.clone() }).await;
        }
        operation::Outcome::Cancelled(reason) => {
            let _ = events_tx.send(DriverEvent::OperationCancelled { id, reason: reason.clone() }).await;
        }
    }
    op.resolve(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn power_event(state: serde_json::Value) -> crate::bus::BusEvent {
        crate::bus::BusEvent {
            topic: "frontpanel.power.changed".to_owned(),
            id: "evt-1".to_owned(),
            seq: 1,
            ts_ms: 0,
            source: "front-panel".to_owned(),
            schema_version: 1,
            attributes: crate::bus::Attributes::new(),
            payload: serde_json::json!({"state": state}),
        }
    }

    #[test]
    fn is_power_off_true_only_for_false_state_on_power_topic() {
        assert!(is_power_off(Some(power_event(serde_json::Value::Bool(false)))));
        assert!(!is_power_off(Some(power_event(serde_json::Value::Bool(true)))));
        assert!(!is_power_off(None));
    }

    #[test]
    fn is_power_off_ignores_other_topics() {
        let mut event = power_event(serde_json::Value::Bool(false));
        event.topic = "frontpanel.hdd.changed".to_owned();
        assert!(!is_power_off(Some(event)));
    }
}
