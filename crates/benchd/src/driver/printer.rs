// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial printer driver (§4.2). Byte-oriented: there's no line protocol to
//! speak, just an idle timer that defines job boundaries. `idle_flush`
//! silence after the last received byte finalizes the buffered job; if the
//! port closes mid-job, whatever is buffered is finalized rather than
//! dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::serial_io::SerialHandle;

use super::backoff::Backoff;
use super::{backoff_or_fatal, identify, DriverConfig, DriverEvent};

/// A finalized job, ready for the adapter to append to `recentJobs`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PrinterJob {
    pub raw: String,
    pub preview: String,
}

fn finalize_job(buffer: &mut Vec<u8>) -> Option<PrinterJob> {
    if buffer.is_empty() {
        return None;
    }
    let raw = String::from_utf8_lossy(buffer).into_owned();
    let preview: String = raw.chars().take(80).collect();
    buffer.clear();
    Some(PrinterJob { raw, preview })
}

pub async fn run(config: DriverConfig, idle_flush: Duration, stop: CancellationToken, events_tx: mpsc::Sender<DriverEvent>) {
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
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &err.to_string()).await {
                return;
            }
            continue;
        }
        backoff.reset();
        let _ = events_tx.send(DriverEvent::PhaseChanged(crate::state::Phase::Ready)).await;

        let mut buffer = Vec::new();
        let disconnect_reason = loop {
            tokio::select! {
                _ = stop.cancelled() => break None,
                line = handle.read_line_raw(idle_flush) => {
                    match line {
                        Ok(line) => buffer.extend_from_slice(line.as_bytes()),
                        Err(crate::error::OrchestratorError::Timeout(_)) => {
                            if let Some(job) = finalize_job(&mut buffer) {
                                emit_job(&events_tx, job).await;
                            }
                        }
                        Err(err) => break Some(err.to_string()),
                    }
                }
            }
        };

        if let Some(job) = finalize_job(&mut buffer) {
            emit_job(&events_tx, job).await;
        }
        if let Some(reason) = disconnect_reason {
            let _ = events_tx.send(DriverEvent::Error { message: reason.clone() }).await;
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &reason).await {
                return;
            }
        }
    }
}

async fn emit_job(events_tx: &mpsc::Sender<DriverEvent>, job: PrinterJob) {
    let payload = serde_json::to_value(&job).unwrap_or(serde_json::Value::Null);
    let _ = events_tx.send(DriverEvent::Custom(serde_json::json!({"jobCompleted": payload}))).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_job_returns_none_on_empty_buffer() {
        let mut buffer = Vec::new();
        assert!(finalize_job(&mut buffer).is_none());
    }

    #[test]
    fn finalize_job_captures_raw_bytes_and_clears_buffer() {
        let mut buffer = b"HELLO\n".to_vec();
        let job = finalize_job(&mut buffer).expect("job present");
        assert_eq!(job.raw, "HELLO\n");
        assert!(buffer.is_empty());
    }
}
