// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PS/2 keyboard driver (§4.2). Unlike the mouse, every input is a discrete
//! operation (`press`, `release`, `tap`) and goes through the generic FIFO
//! like any other device — no movement accumulator to manage.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::serial_io::SerialHandle;

use super::backoff::Backoff;
use super::operation::{Operation, OperationQueue, Outcome};
use super::{backoff_or_fatal, finish_operation, identify, DriverConfig, DriverEvent};

pub async fn run(
    config: DriverConfig,
    mut queue: OperationQueue,
    stop: CancellationToken,
    events_tx: mpsc::Sender<DriverEvent>,
    mut power_off_rx: mpsc::Receiver<crate::bus::BusEvent>,
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
                event = power_off_rx.recv() => {
                    if super::is_power_off(event) {
                        queue.drain_cancelled("host-power-off");
                    }
                }
                op = queue.dequeue() => {
                    let Some(op) = op else { break 'serve None };
                    if let Some(reason) = serve_one(&mut handle, op, &config, &events_tx).await {
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

/// Serve one queued key operation. Returns `Some(reason)` if a wire error
/// broke the connection and the outer loop should reconnect.
async fn serve_one(
    handle: &mut SerialHandle,
    op: Operation,
    config: &DriverConfig,
    events_tx: &mpsc::Sender<DriverEvent>,
) -> Option<String> {
    if op.cancel.check("host-power-off").is_err() {
        finish_operation(op, Outcome::Cancelled("host-power-off".to_owned()), events_tx).await;
        return None;
    }

    let line = match key_line(&op.kind, &op.payload) {
        Some(line) => line,
        None => {
            let kind = op.kind.clone();
            finish_operation(op, Outcome::Failed(format!("unknown key op kind {kind:?}")), events_tx).await;
            return None;
        }
    };

    match handle.write_line(&line, &config.eol).await {
        Ok(()) => {
            let kind = op.kind.clone();
            finish_operation(op, Outcome::Completed(serde_json::json!({"kind": kind})), events_tx).await;
            None
        }
        Err(err) => {
            let reason = err.to_string();
            finish_operation(op, Outcome::Failed(reason.clone()), events_tx).await;
            Some(reason)
        }
    }
}

fn key_line(kind: &str, payload: &serde_json::Value) -> Option<String> {
    let key = payload.get("key")?.as_str()?;
    match kind {
        "keyboard.press" => Some(format!("KEY_DOWN {key}")),
        "keyboard.release" => Some(format!("KEY_UP {key}")),
        "keyboard.tap" => Some(format!("KEY_TAP {key}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_line_maps_known_kinds() {
        let payload = serde_json::json!({"key": "A"});
        assert_eq!(key_line("keyboard.press", &payload), Some("KEY_DOWN A".to_owned()));
        assert_eq!(key_line("keyboard.tap", &payload), Some("KEY_TAP A".to_owned()));
        assert_eq!(key_line("keyboard.unknown", &payload), None);
    }
}
