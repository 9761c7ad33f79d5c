// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Front-panel driver (§4.2). Read-only: firmware pushes `POWER_LED_ON`,
//! `POWER_LED_OFF`, `HDD_ACTIVE_ON`, `HDD_ACTIVE_OFF` lines unsolicited; the
//! driver has no operation queue of its own and simply reports pin changes
//! to the adapter, which publishes `frontpanel.power.changed` on the bus.
//! On disconnect both pins fail closed to `unknown`.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::serial_io::SerialHandle;

use super::backoff::Backoff;
use super::{backoff_or_fatal, identify, DriverConfig, DriverEvent};

fn pin_event(pin: &str, state: Option<bool>) -> DriverEvent {
    let value = match state {
        Some(true) => serde_json::Value::Bool(true),
        Some(false) => serde_json::Value::Bool(false),
        None => serde_json::Value::String("unknown".to_owned()),
    };
    DriverEvent::Custom(serde_json::json!({"pin": pin, "state": value}))
}

pub async fn run(config: DriverConfig, stop: CancellationToken, events_tx: mpsc::Sender<DriverEvent>) {
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
                fail_closed(&events_tx).await;
                if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &err.to_string()).await {
                    return;
                }
                continue;
            }
        };

        let _ = events_tx.send(DriverEvent::PhaseChanged(crate::state::Phase::Identifying)).await;
        if let Err(err) = identify(&mut handle, &config).await {
            fail_closed(&events_tx).await;
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &err.to_string()).await {
                return;
            }
            continue;
        }
        backoff.reset();
        let _ = events_tx.send(DriverEvent::PhaseChanged(crate::state::Phase::Ready)).await;

        let disconnect_reason = loop {
            tokio::select! {
                _ = stop.cancelled() => break None,
                line = handle.read_line_raw(config.identify_timeout) => {
                    match line {
                        Ok(line) => {
                            if let Some(event) = classify_line(line.trim()) {
                                let _ = events_tx.send(event).await;
                            }
                        }
                        Err(crate::error::OrchestratorError::Timeout(_)) => continue,
                        Err(err) => break Some(err.to_string()),
                    }
                }
            }
        };

        fail_closed(&events_tx).await;
        if let Some(reason) = disconnect_reason {
            let _ = events_tx.send(DriverEvent::Error { message: reason.clone() }).await;
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &reason).await {
                return;
            }
        }
    }
}

async fn fail_closed(events_tx: &mpsc::Sender<DriverEvent>) {
    let _ = events_tx.send(pin_event("power", None)).await;
    let _ = events_tx.send(pin_event("hdd", None)).await;
}

fn classify_line(line: &str) -> Option<DriverEvent> {
    match line {
        "POWER_LED_ON" => Some(pin_event("power", Some(true))),
        "POWER_LED_OFF" => Some(pin_event("power", Some(false))),
        "HDD_ACTIVE_ON" => Some(pin_event("hdd", Some(true))),
        "HDD_ACTIVE_OFF" => Some(pin_event("hdd", Some(false))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_lines() {
        assert!(matches!(classify_line("POWER_LED_OFF"), Some(DriverEvent::Custom(_))));
        assert!(classify_line("GARBAGE").is_none());
    }
}
