// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound `<device>.command` frame routing (§6): resolves the device prefix
//! to the matching queue/channel in [`crate::app::DeviceHandles`] and either
//! enqueues an [`crate::driver::operation::Operation`] or, for mouse motion,
//! sends a [`crate::driver::mouse::MouseCommand`] directly. Unknown devices
//! or malformed payloads are logged and reported back as `ack{ok:false}`;
//! they never close the socket.

use std::sync::Arc;

use crate::app::{AppHandle, HandleSlot};
use crate::driver::mouse::MouseCommand;
use crate::driver::operation::OperationQueueHandle;
use crate::state::MouseMode;

/// Route one inbound `<device>.command` frame. `kind` is the frame's `type`
/// field with the `.command` suffix stripped (e.g. `mouse`, `atlona`).
/// Returns `true` if the command was accepted for execution.
pub async fn route(app: &Arc<AppHandle>, device: &str, payload: serde_json::Value) -> bool {
    match device {
        "power-meter" => route_queued(&app.devices.power_meter, "power-meter", payload).await,
        "atlona" => route_queued(&app.devices.atlona_controller, "atlona", payload).await,
        "keyboard" => route_queued(&app.devices.ps2_keyboard, "keyboard", payload).await,
        "cfimager" => route_queued(&app.devices.cf_imager, "cfimager", payload).await,
        "mouse" => route_mouse(app, payload).await,
        other => {
            tracing::warn!(device = other, "ws: unknown device command");
            false
        }
    }
}

async fn route_queued(slot: &HandleSlot<OperationQueueHandle>, device: &str, payload: serde_json::Value) -> bool {
    let guard = slot.read().await;
    let Some(handle) = guard.as_ref() else {
        tracing::warn!(device, "ws: command for device with no active driver");
        return false;
    };
    let Some(action) = payload.get("action").and_then(|v| v.as_str()) else {
        tracing::warn!(device, "ws: command missing \"action\"");
        return false;
    };
    let kind = format!("{device}.{action}");
    match handle.enqueue(kind, None, payload) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(device, %err, "ws: enqueue failed");
            false
        }
    }
}

async fn route_mouse(app: &Arc<AppHandle>, payload: serde_json::Value) -> bool {
    let Some(action) = payload.get("action").and_then(|v| v.as_str()) else {
        tracing::warn!("ws: mouse command missing \"action\"");
        return false;
    };
    match action {
        "moveRelative" => {
            let (dx, dy) = (num(&payload, "dx"), num(&payload, "dy"));
            send_mouse(app, MouseCommand::MoveRelative { dx, dy }).await
        }
        "moveAbsolute" => {
            let (x, y) = (num(&payload, "x"), num(&payload, "y"));
            send_mouse(app, MouseCommand::MoveAbsolute { x, y }).await
        }
        "setMode" => match payload.get("mode").and_then(|v| v.as_str()) {
            Some("absolute") => send_mouse(app, MouseCommand::SetMode(MouseMode::Absolute)).await,
            Some("relative-gain") => send_mouse(app, MouseCommand::SetMode(MouseMode::RelativeGain)).await,
            Some("relative-accel") => send_mouse(app, MouseCommand::SetMode(MouseMode::RelativeAccel)).await,
            _ => {
                tracing::warn!("ws: mouse setMode with unknown mode");
                false
            }
        },
        "button" => route_mouse_button(&app.devices.ps2_mouse, payload).await,
        other => {
            tracing::warn!(action = other, "ws: unknown mouse command action");
            false
        }
    }
}

/// Mouse button ops carry a nested `kind` (`press`/`release`/`click`)
/// distinct from the envelope's own `action: "button"`, since the driver's
/// op-kind namespace is `mouse.button.<kind>`.
async fn route_mouse_button(slot: &HandleSlot<OperationQueueHandle>, payload: serde_json::Value) -> bool {
    let guard = slot.read().await;
    let Some(handle) = guard.as_ref() else {
        tracing::warn!("ws: mouse button command with no active driver");
        return false;
    };
    let Some(kind) = payload.get("kind").and_then(|v| v.as_str()) else {
        tracing::warn!("ws: mouse button command missing \"kind\"");
        return false;
    };
    let op_kind = format!("mouse.button.{kind}");
    match handle.enqueue(op_kind, None, payload.clone()) {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(%err, "ws: mouse button enqueue failed");
            false
        }
    }
}

fn num(payload: &serde_json::Value, key: &str) -> f64 {
    payload.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

async fn send_mouse(app: &Arc<AppHandle>, cmd: MouseCommand) -> bool {
    let guard = app.devices.mouse_commands.read().await;
    match guard.as_ref() {
        Some(tx) => tx.send(cmd).await.is_ok(),
        None => {
            tracing::warn!("ws: mouse command with no active driver");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::*;
    use crate::driver::operation::OperationQueue;

    fn filled_slot(queue: &OperationQueue) -> HandleSlot<OperationQueueHandle> {
        Arc::new(RwLock::new(Some(queue.handle())))
    }

    fn empty_slot() -> HandleSlot<OperationQueueHandle> {
        Arc::new(RwLock::new(None))
    }

    #[tokio::test]
    async fn queued_command_without_action_is_rejected() {
        let queue = OperationQueue::new(4);
        assert!(!route_queued(&filled_slot(&queue), "atlona", serde_json::json!({})).await);
    }

    #[tokio::test]
    async fn queued_command_with_action_enqueues() {
        let queue = OperationQueue::new(4);
        assert!(route_queued(&filled_slot(&queue), "atlona", serde_json::json!({"action": "hold", "switchId": 3})).await);
    }

    #[tokio::test]
    async fn queued_command_with_no_driver_is_rejected() {
        assert!(!route_queued(&empty_slot(), "atlona", serde_json::json!({"action": "hold"})).await);
    }

    #[test]
    fn num_defaults_to_zero_for_missing_or_non_numeric_field() {
        assert_eq!(num(&serde_json::json!({}), "dx"), 0.0);
        assert_eq!(num(&serde_json::json!({"dx": "nope"}), "dx"), 0.0);
        assert_eq!(num(&serde_json::json!({"dx": 4.5}), "dx"), 4.5);
    }
}
