// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CompactFlash imager driver (§4.2). Structured filesystem-style commands
//! (`changeDir`, `createFolder`, `rename`, `move`, `delete`, `readImage`,
//! `writeImage`, `search`) go through the generic FIFO; each command writes
//! one line and reads back one JSON response line.

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

fn command_line(kind: &str, payload: &serde_json::Value) -> Option<String> {
    let get = |key: &str| payload.get(key).and_then(|v| v.as_str()).unwrap_or_default();
    match kind {
        "cfimager.changeDir" => Some(format!("CD {}", get("path"))),
        "cfimager.createFolder" => Some(format!("MKDIR {}", get("path"))),
        "cfimager.rename" => Some(format!("RENAME {} {}", get("from"), get("to"))),
        "cfimager.move" => Some(format!("MOVE {} {}", get("from"), get("to"))),
        "cfimager.delete" => Some(format!("DELETE {}", get("path"))),
        "cfimager.readImage" => Some(format!("READIMG {}", get("path"))),
        "cfimager.writeImage" => Some(format!("WRITEIMG {}", get("path"))),
        "cfimager.search" => Some(format!("SEARCH {}", get("query"))),
        _ => None,
    }
}

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

    let Some(line) = command_line(&op.kind, &op.payload) else {
        let kind = op.kind.clone();
        finish_operation(op, Outcome::Failed(format!("unknown cfimager op {kind:?}")), events_tx).await;
        return None;
    };

    if let Err(err) = handle.write_line(&line, &config.eol).await {
        let reason = err.to_string();
        finish_operation(op, Outcome::Failed(reason.clone()), events_tx).await;
        return Some(reason);
    }

    match handle.read_line_raw(config.identify_timeout).await {
        Ok(response) => {
            let parsed = serde_json::from_str(response.trim())
                .unwrap_or_else(|_| serde_json::json!({"raw": response.trim()}));
            finish_operation(op, Outcome::Completed(parsed), events_tx).await;
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
    fn command_line_maps_every_documented_operation() {
        let payload = serde_json::json!({"path": "/a", "from": "/a", "to": "/b", "query": "q"});
        for kind in [
            "cfimager.changeDir",
            "cfimager.createFolder",
            "cfimager.rename",
            "cfimager.move",
            "cfimager.delete",
            "cfimager.readImage",
            "cfimager.writeImage",
            "cfimager.search",
        ] {
            assert!(command_line(kind, &payload).is_some(), "missing mapping for {kind}");
        }
        assert!(command_line("cfimager.unknown", &payload).is_none());
    }
}
