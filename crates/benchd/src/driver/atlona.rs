// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atlona switch-controller driver (§4.2). `hold N` / `release N` commands
//! per switch id, queued through the generic FIFO; the adapter translates
//! completions into per-switch `isHeld` flags.

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

async fn serve_one(
    handle: &mut crate::serial_io::SerialHandle,
    op: Operation,
    config: &DriverConfig,
    events_tx: &mpsc::Sender<DriverEvent>,
) -> Option<String> {
    if op.cancel.check("host-power-off").is_err() {
        finish_operation(op, Outcome::Cancelled("host-power-off".to_owned()), events_tx).await;
        return None;
    }

    let switch_id = op.payload.get("switchId").and_then(|v| v.as_u64());
    let line = match (op.kind.as_str(), switch_id) {
        ("atlona.hold", Some(id)) => Some(format!("hold {id}")),
        ("atlona.release", Some(id)) => Some(format!("release {id}")),
        _ => None,
    };

    let Some(line) = line else {
        let kind = op.kind.clone();
        finish_operation(op, Outcome::Failed(format!("invalid atlona op {kind:?}")), events_tx).await;
        return None;
    };

    match handle.write_line(&line, &config.eol).await {
        Ok(()) => {
            let result = serde_json::json!({"switchId": switch_id, "held": op.kind == "atlona.hold"});
            finish_operation(op, Outcome::Completed(result), events_tx).await;
            None
        }
        Err(err) => {
            let reason = err.to_string();
            finish_operation(op, Outcome::Failed(reason.clone()), events_tx).await;
            Some(reason)
        }
    }
}
