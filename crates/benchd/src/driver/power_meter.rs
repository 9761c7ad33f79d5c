// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Power-meter driver. Read-only streaming telemetry (voltage/current/watts
//! samples on a fixed cadence from the firmware) plus an optional `zero`
//! (tare) operation through the generic FIFO; reconnect/backoff contract is
//! identical to the other drivers.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::serial_io::SerialHandle;

use super::backoff::Backoff;
use super::operation::{Operation, OperationQueue, Outcome};
use super::{backoff_or_fatal, finish_operation, identify, DriverConfig, DriverEvent};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Sample {
    pub voltage: f64,
    pub current: f64,
    pub watts: f64,
}

fn parse_sample(line: &str) -> Option<Sample> {
    // Wire format: "SAMPLE v,i,w"
    let rest = line.strip_prefix("SAMPLE ")?;
    let mut parts = rest.split(',');
    let voltage: f64 = parts.next()?.trim().parse().ok()?;
    let current: f64 = parts.next()?.trim().parse().ok()?;
    let watts: f64 = parts.next()?.trim().parse().ok()?;
    Some(Sample { voltage, current, watts })
}

pub async fn run(
    config: DriverConfig,
    mut queue: OperationQueue,
    stop: CancellationToken,
    events_tx: mpsc::Sender<DriverEvent>,
) {
    let mut backoff = Backoff::new(config.reconnect_base_delay, config.reconnect_max_delay, config.reconnect_max_attempts);

    loop {
        if stop.is_cancelled() {
            return;
        }

        let _ = events_tx.send(DriverEvent::PhaseChanged(crate::state::Phase::Connecting)).await;
        let handle = tokio::select! {
            _ = stop.cancelled() => return,
            result = SerialHandle::open(config.path.clone(), config.baud_rate, config.identify_timeout) => result,
        };
        let mut handle = match handle {
            Ok(h) => h,
            Err(err) => {
                let _ = events_tx.send(DriverEvent::Error { message: err.to_string() }).await;
                if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &err.to_string()).await {
                    return;
                }
                continue;
            }
        };

        let _ = events_tx.send(DriverEvent::PhaseChanged(crate::state::Phase::Identifying)).await;
        if let Err(err) = identify(&mut handle, &config).await {
            let _ = events_tx.send(DriverEvent::Error { message: err.to_string() }).await;
            queue.drain_cancelled("identify-failed");
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &err.to_string()).await {
                return;
            }
            continue;
        }
        backoff.reset();
        let _ = events_tx.send(DriverEvent::PhaseChanged(crate::state::Phase::Ready)).await;

        let disconnect_reason = 'serve: loop {
            tokio::select! {
                _ = stop.cancelled() => break 'serve None,
                line = handle.read_line_raw(config.identify_timeout) => {
                    match line {
                        Ok(line) => {
                            if let Some(sample) = parse_sample(line.trim()) {
                                let payload = serde_json::to_value(sample).unwrap_or(serde_json::Value::Null);
                                let _ = events_tx.send(DriverEvent::Custom(serde_json::json!({"sample": payload}))).await;
                            }
                        }
                        Err(crate::error::OrchestratorError::Timeout(_)) => continue,
                        Err(err) => break 'serve Some(err.to_string()),
                    }
                }
                op = queue.dequeue() => {
                    let Some(op) = op else { break 'serve None };
                    if let Some(reason) = serve_op(&mut handle, op, &config, &events_tx).await {
                        break 'serve Some(reason);
                    }
                }
            }
        };

        queue.drain_cancelled("disconnected");
        if let Some(reason) = disconnect_reason {
            let _ = events_tx.send(DriverEvent::Error { message: reason.clone() }).await;
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &reason).await {
                return;
            }
        }
    }
}

async fn serve_op(
    handle: &mut SerialHandle,
    op: Operation,
    config: &DriverConfig,
    events_tx: &mpsc::Sender<DriverEvent>,
) -> Option<String> {
    if op.cancel.check("host-power-off").is_err() {
        finish_operation(op, Outcome::Cancelled("host-power-off".to_owned()), events_tx).await;
        return None;
    }
    if op.kind != "power-meter.zero" {
        let kind = op.kind.clone();
        finish_operation(op, Outcome::Failed(format!("unknown power-meter op {kind:?}")), events_tx).await;
        return None;
    }
    match handle.write_line("ZERO", &config.eol).await {
        Ok(()) => {
            finish_operation(op, Outcome::Completed(serde_json::Value::Null), events_tx).await;
            None
        }
        Err(err) => {
            let reason = err.to_string();
            finish_operation(op, Outcome::Failed(reason.clone()), events_tx).await;
            Some(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_sample_line() {
        let sample = parse_sample("SAMPLE 120.1,0.5,60.05").expect("sample");
        assert_eq!(sample.voltage, 120.1);
        assert_eq!(sample.current, 0.5);
        assert_eq!(sample.watts, 60.05);
    }

    #[test]
    fn rejects_malformed_sample_line() {
        assert!(parse_sample("NOT A SAMPLE").is_none());
        assert!(parse_sample("SAMPLE 1,2").is_none());
    }
}
