// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device-event adapters: one task per device, translating that device's
//! `DriverEvent` stream into `StateStore` commits and bus publishes. Each
//! adapter owns exactly one slice of `AppState`; none of them talk to each
//! other directly (cross-device effects, e.g. front-panel power-off
//! cancelling queued mouse operations, are wired at the call site in
//! `lib.rs` via the operation-queue handles, not here).

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bus::{Attributes, Bus};
use crate::driver::DriverEvent;
use crate::state::store::StateStore;
use crate::state::{now_ms, DeviceSlice, ErrorRecord, OperationRecord, Phase, SliceKey};

/// Apply the variants common to every driver onto `slice`. Returns the
/// payload of a `DriverEvent::Custom` for the caller to interpret against
/// its own slice shape; every other variant is fully handled here.
fn apply_common(slice: &mut DeviceSlice, event: &DriverEvent, history_limit: usize) -> Option<serde_json::Value> {
    let now = now_ms();
    slice.updated_at_ms = now;
    match event {
        DriverEvent::PhaseChanged(phase) => {
            slice.phase = *phase;
            slice.identified = *phase == Phase::Ready;
            if *phase != Phase::Ready {
                slice.busy = false;
                slice.current_op = None;
            }
            None
        }
        DriverEvent::OperationQueued { queue_depth, .. } => {
            slice.queue_depth = *queue_depth;
            None
        }
        DriverEvent::OperationStarted { id } => {
            slice.busy = true;
            slice.current_op = Some(id.clone());
            slice.queue_depth = slice.queue_depth.saturating_sub(1);
            None
        }
        DriverEvent::OperationCompleted { id, .. } => {
            finish_op(slice, id, "completed", None, history_limit);
            None
        }
        DriverEvent::OperationFailed { id, reason } => {
            finish_op(slice, id, "failed", Some(reason.clone()), history_limit);
            push_error(slice, reason.clone(), "protocol", history_limit);
            None
        }
        DriverEvent::OperationCancelled { id, reason } => {
            finish_op(slice, id, "cancelled", Some(reason.clone()), history_limit);
            None
        }
        DriverEvent::Error { message } => {
            slice.last_error = Some(message.clone());
            push_error(slice, message.clone(), "recoverable", history_limit);
            None
        }
        DriverEvent::FatalError { attempts, message } => {
            slice.phase = Phase::Error;
            slice.last_error = Some(format!("fatal after {attempts} attempts: {message}"));
            push_error(slice, message.clone(), "fatal", history_limit);
            None
        }
        DriverEvent::Custom(payload) => Some(payload.clone()),
    }
}

fn finish_op(slice: &mut DeviceSlice, id: &str, outcome: &str, detail: Option<String>, history_limit: usize) {
    if slice.current_op.as_deref() == Some(id) {
        slice.busy = false;
        slice.current_op = None;
    }
    slice.operation_history.set_cap(history_limit.max(1));
    let now = now_ms();
    slice.operation_history.push(OperationRecord {
        id: id.to_owned(),
        kind: id.to_owned(),
        requested_by: None,
        queued_at_ms: now,
        finished_at_ms: now,
        outcome: outcome.to_owned(),
        detail,
    });
}

fn push_error(slice: &mut DeviceSlice, message: String, category: &str, history_limit: usize) {
    slice.error_history.set_cap(history_limit.max(1));
    slice.error_history.push(ErrorRecord { message, category: category.to_owned(), at_ms: now_ms() });
}

async fn publish_phase_or_error(bus: &Bus, source: &str, event: &DriverEvent) {
    match event {
        DriverEvent::FatalError { attempts, message } => {
            let _ = bus
                .publish(
                    &format!("{source}.error.fatal"),
                    source,
                    Attributes::new(),
                    serde_json::json!({"attempts": attempts, "message": message}),
                )
                .await;
        }
        DriverEvent::Error { message } => {
            let _ = bus
                .publish(&format!("{source}.error"), source, Attributes::new(), serde_json::json!({"message": message}))
                .await;
        }
        _ => {}
    }
}

/// Power meter: read-only telemetry plus an optional `zero` operation. The
/// custom `sample` payload is published straight to the bus; it has no
/// dedicated state-slice fields (streamed, not retained).
pub async fn run_power_meter_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "power-meter", &event).await;
        let custom = {
            let mut custom = None;
            state
                .set(SliceKey::PowerMeter, |app| {
                    custom = apply_common(&mut app.power_meter, &event, history_limit);
                })
                .await;
            custom
        };
        if let Some(payload) = custom {
            if let Some(sample) = payload.get("sample") {
                let _ = bus.publish("power-meter.sample", "power-meter", Attributes::new(), sample.clone()).await;
            }
        }
    }
}

/// Serial printer: byte-oriented jobs, finalized on idle timeout or
/// disconnect. Completed jobs append to the bounded `recentJobs` history.
pub async fn run_printer_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
    job_history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "serial-printer", &event).await;
        let custom = {
            let mut custom = None;
            state
                .set(SliceKey::SerialPrinter, |app| {
                    custom = apply_common(&mut app.serial_printer.base, &event, history_limit);
                })
                .await;
            custom
        };
        let Some(payload) = custom else { continue };
        let Some(job) = payload.get("jobCompleted") else { continue };
        let raw = job.get("raw").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
        let preview = job.get("preview").and_then(|v| v.as_str()).unwrap_or_default().to_owned();
        let now = now_ms();
        let record = crate::state::PrinterJob {
            id: uuid::Uuid::new_v4().to_string(),
            created_at_ms: now,
            completed_at_ms: now,
            raw,
            preview,
        };
        state
            .set(SliceKey::SerialPrinter, |app| {
                app.serial_printer.recent_jobs.set_cap(job_history_limit.max(1));
                app.serial_printer.total_jobs += 1;
                app.serial_printer.recent_jobs.push(record.clone());
            })
            .await;
        let _ = bus
            .publish(
                "serial-printer.job.completed",
                "serial-printer",
                Attributes::new(),
                serde_json::json!({"preview": record.preview}),
            )
            .await;
    }
}

/// Atlona switch controller: queued `hold`/`release` ops per switch id. On
/// completion the adapter derives the per-switch `held` flag from the
/// operation kind embedded in the driver's completion result.
pub async fn run_atlona_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "atlona", &event).await;
        let held_update = if let DriverEvent::OperationCompleted { result, .. } = &event {
            let switch_id = result.get("switchId").and_then(|v| v.as_u64()).map(|v| v as u32);
            let held = result.get("held").and_then(|v| v.as_bool());
            switch_id.zip(held)
        } else {
            None
        };
        state
            .set(SliceKey::AtlonaController, |app| {
                apply_common(&mut app.atlona_controller.base, &event, history_limit);
                if let Some((switch_id, held)) = held_update {
                    app.atlona_controller.held.insert(switch_id, held);
                }
            })
            .await;
        if let Some((switch_id, held)) = held_update {
            let _ = bus
                .publish(
                    "atlona.switch.changed",
                    "atlona",
                    Attributes::new(),
                    serde_json::json!({"switchId": switch_id, "held": held}),
                )
                .await;
        }
    }
}

/// PS/2 keyboard: discrete press/release/tap ops, no device-specific state
/// beyond the common `DeviceSlice` fields.
pub async fn run_keyboard_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "ps2-keyboard", &event).await;
        state
            .set(SliceKey::Ps2Keyboard, |app| {
                apply_common(&mut app.ps2_keyboard, &event, history_limit);
            })
            .await;
    }
}

/// PS/2 mouse: movement never reaches this adapter (it bypasses the
/// operation queue entirely inside the driver), only button ops and
/// lifecycle/error events do.
pub async fn run_mouse_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "ps2-mouse", &event).await;
        state
            .set(SliceKey::Ps2Mouse, |app| {
                apply_common(&mut app.ps2_mouse.base, &event, history_limit);
            })
            .await;
    }
}

/// Front panel: read-only pin telemetry. Publishes `frontpanel.power.changed`
/// whenever the power-sense pin transitions, which `lib.rs` subscribes to in
/// order to cancel in-flight mouse work on power-off.
pub async fn run_frontpanel_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "front-panel", &event).await;
        let custom = {
            let mut custom = None;
            state
                .set(SliceKey::FrontPanel, |app| {
                    custom = apply_common(&mut app.front_panel.base, &event, history_limit);
                })
                .await;
            custom
        };
        let Some(payload) = custom else { continue };
        let Some(pin) = payload.get("pin").and_then(|v| v.as_str()) else { continue };
        let state_value = payload.get("state").cloned().unwrap_or(serde_json::Value::Null);
        let as_bool = state_value.as_bool();
        state
            .set(SliceKey::FrontPanel, |app| match pin {
                "power" => app.front_panel.power_sense = as_bool,
                "hdd" => app.front_panel.hdd_active = as_bool,
                _ => {}
            })
            .await;
        let topic = match pin {
            "power" => "frontpanel.power.changed",
            "hdd" => "frontpanel.hdd.changed",
            _ => continue,
        };
        let _ = bus.publish(topic, "front-panel", Attributes::new(), serde_json::json!({"state": state_value})).await;
    }
}

/// CompactFlash imager: structured filesystem commands. `readImage`/`search`
/// completions may carry directory listings, which refresh `cwd`/`entries`.
pub async fn run_cfimager_adapter(
    state: Arc<StateStore>,
    bus: Bus,
    mut events_rx: mpsc::Receiver<DriverEvent>,
    history_limit: usize,
) {
    while let Some(event) = events_rx.recv().await {
        publish_phase_or_error(&bus, "cf-imager", &event).await;
        let listing = if let DriverEvent::OperationCompleted { result, .. } = &event {
            result.get("entries").and_then(|v| v.as_array()).cloned()
        } else {
            None
        };
        let cwd = if let DriverEvent::OperationCompleted { result, .. } = &event {
            result.get("cwd").and_then(|v| v.as_str()).map(str::to_owned)
        } else {
            None
        };
        state
            .set(SliceKey::CfImager, |app| {
                apply_common(&mut app.cf_imager.base, &event, history_limit);
                if let Some(cwd) = &cwd {
                    app.cf_imager.cwd = cwd.clone();
                }
                if let Some(entries) = &listing {
                    app.cf_imager.entries = entries
                        .iter()
                        .map(|e| crate::state::CfImagerEntry {
                            name: e.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_owned(),
                            is_dir: e.get("isDir").and_then(|v| v.as_bool()).unwrap_or(false),
                            size_bytes: e.get("sizeBytes").and_then(|v| v.as_u64()).unwrap_or(0),
                        })
                        .collect();
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    fn slice() -> DeviceSlice {
        DeviceSlice::default()
    }

    #[test]
    fn phase_change_to_non_ready_clears_busy_and_current_op() {
        let mut s = slice();
        s.busy = true;
        s.current_op = Some("op-1".into());
        apply_common(&mut s, &DriverEvent::PhaseChanged(Phase::Connecting), 10);
        assert!(!s.busy);
        assert!(s.current_op.is_none());
        assert!(!s.identified);
    }

    #[test]
    fn operation_completed_clears_current_op_and_records_history() {
        let mut s = slice();
        s.current_op = Some("op-1".into());
        s.busy = true;
        apply_common(
            &mut s,
            &DriverEvent::OperationCompleted { id: "op-1".into(), result: serde_json::Value::Null },
            10,
        );
        assert!(s.current_op.is_none());
        assert!(!s.busy);
        assert_eq!(s.operation_history.len(), 1);
    }

    #[test]
    fn operation_queued_sets_depth_and_started_decrements_it() {
        let mut s = slice();
        apply_common(&mut s, &DriverEvent::OperationQueued { id: "op-1".into(), queue_depth: 2 }, 10);
        assert_eq!(s.queue_depth, 2);
        apply_common(&mut s, &DriverEvent::OperationStarted { id: "op-1".into() }, 10);
        assert_eq!(s.queue_depth, 1);
    }

    #[test]
    fn fatal_error_sets_phase_error_and_records_error_history() {
        let mut s = slice();
        apply_common(&mut s, &DriverEvent::FatalError { attempts: 5, message: "gave up".into() }, 10);
        assert_eq!(s.phase, Phase::Error);
        assert_eq!(s.error_history.len(), 1);
    }

    #[test]
    fn custom_event_payload_is_returned_for_caller_interpretation() {
        let mut s = slice();
        let payload = apply_common(&mut s, &DriverEvent::Custom(serde_json::json!({"pin": "power"})), 10);
        assert_eq!(payload.unwrap()["pin"], "power");
    }
}
