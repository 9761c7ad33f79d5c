// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PS/2 mouse driver (§4.2). Movement bypasses the operation queue entirely:
//! absolute/relative inputs update an accumulator that a cooperative tick
//! loop flushes at most once per tick, capped at `per_tick_max_delta` per
//! axis, as a single `MOVE dx,dy` line.

use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::serial_io::SerialHandle;
use crate::state::MouseMode;

use super::backoff::Backoff;
use super::operation::OperationQueue;
use super::{backoff_or_fatal, finish_operation, identify, DriverConfig, DriverEvent};

#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub tick_hz: u32,
    pub per_tick_max_delta: i64,
    pub accel_base: f64,
    pub accel_max: f64,
    pub accel_vel_max: f64,
    pub absolute_grid: (u32, u32),
}

/// Pending motion not yet flushed to the wire, plus the accel tracker's last
/// move timestamp (for the velocity estimate in `relative-accel` mode).
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    pending_dx: f64,
    pending_dy: f64,
    current_x: f64,
    current_y: f64,
    last_move_at: Option<Instant>,
}

impl Accumulator {
    fn reset(&mut self) {
        self.pending_dx = 0.0;
        self.pending_dy = 0.0;
        self.last_move_at = None;
    }
}

/// Inbound mouse commands. Movement variants mutate the accumulator
/// directly and never touch the operation queue; button variants are
/// queued like any other device operation.
pub enum MouseCommand {
    MoveRelative { dx: f64, dy: f64 },
    MoveAbsolute { x: f64, y: f64 },
    SetMode(MouseMode),
}

struct MotionState {
    mode: MouseMode,
    gain: f64,
    tuning: Tuning,
    accumulator: Accumulator,
}

impl MotionState {
    fn apply_relative(&mut self, dx: f64, dy: f64) {
        let now = Instant::now();
        let gain = match self.mode {
            MouseMode::Absolute => return,
            MouseMode::RelativeGain => self.gain,
            MouseMode::RelativeAccel => {
                let dt = self
                    .accumulator
                    .last_move_at
                    .map(|t| now.duration_since(t).as_secs_f64())
                    .filter(|dt| *dt > 0.0)
                    .unwrap_or(1.0 / self.tuning.tick_hz.max(1) as f64);
                let magnitude = (dx * dx + dy * dy).sqrt();
                let vel = magnitude / dt;
                let clamped = (vel / self.tuning.accel_vel_max.max(f64::EPSILON)).clamp(0.0, 1.0);
                (self.tuning.accel_base + (self.tuning.accel_max - self.tuning.accel_base) * clamped).round()
            }
        };
        self.accumulator.pending_dx += dx * gain;
        self.accumulator.pending_dy += dy * gain;
        self.accumulator.last_move_at = Some(now);
    }

    fn apply_absolute(&mut self, x: f64, y: f64) {
        let (grid_w, grid_h) = self.tuning.absolute_grid;
        let target_x = x.clamp(0.0, 1.0) * grid_w as f64;
        let target_y = y.clamp(0.0, 1.0) * grid_h as f64;
        self.accumulator.pending_dx = target_x - self.accumulator.current_x;
        self.accumulator.pending_dy = target_y - self.accumulator.current_y;
        self.accumulator.last_move_at = Some(Instant::now());
    }

    /// Pop at most `per_tick_max_delta` per axis from the pending motion,
    /// updating the tracked current position. Returns `None` if there is
    /// nothing to flush this tick.
    fn flush_tick(&mut self) -> Option<(i64, i64)> {
        let max = self.tuning.per_tick_max_delta as f64;
        let dx = self.accumulator.pending_dx.clamp(-max, max);
        let dy = self.accumulator.pending_dy.clamp(-max, max);
        if dx == 0.0 && dy == 0.0 {
            return None;
        }
        self.accumulator.pending_dx -= dx;
        self.accumulator.pending_dy -= dy;
        self.accumulator.current_x += dx;
        self.accumulator.current_y += dy;
        Some((dx.round() as i64, dy.round() as i64))
    }
}

/// Run the mouse driver's full connect/identify/serve lifecycle. Reconnects
/// with backoff on wire errors; on every disconnect, the accumulator resets
/// and any queued button ops drain as `cancelled`.
pub async fn run(
    config: DriverConfig,
    tuning: Tuning,
    initial_mode: MouseMode,
    initial_gain: f64,
    mut commands_rx: mpsc::Receiver<MouseCommand>,
    mut queue: OperationQueue,
    stop: CancellationToken,
    events_tx: mpsc::Sender<DriverEvent>,
    mut power_off_rx: mpsc::Receiver<crate::bus::BusEvent>,
) {
    let motion = Mutex::new(MotionState {
        mode: initial_mode,
        gain: initial_gain,
        tuning,
        accumulator: Accumulator::default(),
    });
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
        motion.lock().await.accumulator.reset();

        let tick_period = Duration::from_secs_f64(1.0 / tuning.tick_hz.max(1) as f64);
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let disconnect_reason = 'serve: loop {
            tokio::select! {
                _ = stop.cancelled() => break 'serve None,
                event = power_off_rx.recv() => {
                    if super::is_power_off(event) {
                        motion.lock().await.accumulator.reset();
                        queue.drain_cancelled("host-power-off");
                    }
                }
                _ = ticker.tick() => {
                    let flushed = motion.lock().await.flush_tick();
                    if let Some((dx, dy)) = flushed {
                        let line = format!("MOVE {dx},{dy}");
                        if let Err(err) = handle.write_line(&line, &config.eol).await {
                            break 'serve Some(err.to_string());
                        }
                    }
                }
                cmd = commands_rx.recv() => {
                    match cmd {
                        Some(MouseCommand::MoveRelative { dx, dy }) => motion.lock().await.apply_relative(dx, dy),
                        Some(MouseCommand::MoveAbsolute { x, y }) => motion.lock().await.apply_absolute(x, y),
                        Some(MouseCommand::SetMode(mode)) => motion.lock().await.mode = mode,
                        None => break 'serve None,
                    }
                }
                op = queue.dequeue() => {
                    let Some(op) = op else { break 'serve None };
                    let cancel = op.cancel.clone();
                    let kind = op.kind.clone();
                    let line = button_line(&kind, &op.payload);
                    let outcome = match (line, cancel.check("host-power-off")) {
                        (_, Err(_)) => super::operation::Outcome::Cancelled("host-power-off".to_owned()),
                        (Some(line), Ok(())) => match handle.write_line(&line, &config.eol).await {
                            Ok(()) => super::operation::Outcome::Completed(serde_json::json!({"kind": kind})),
                            Err(err) => super::operation::Outcome::Failed(err.to_string()),
                        },
                        (None, Ok(())) => super::operation::Outcome::Failed(format!("unknown mouse op kind {kind:?}")),
                    };
                    finish_operation(op, outcome, &events_tx).await;
                }
            }
        };

        motion.lock().await.accumulator.reset();
        queue.drain_cancelled("disconnected");
        if let Some(reason) = disconnect_reason {
            let _ = events_tx.send(DriverEvent::Error { message: reason.clone() }).await;
            if !backoff_or_fatal(&mut backoff, &stop, &events_tx, &reason).await {
                return;
            }
        }
    }
}

fn button_line(kind: &str, payload: &serde_json::Value) -> Option<String> {
    let button = payload.get("button")?.as_str()?;
    match kind {
        "mouse.button.press" => Some(format!("BTN_DOWN {button}")),
        "mouse.button.release" => Some(format!("BTN_UP {button}")),
        "mouse.button.click" => Some(format!("BTN_CLICK {button}")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> Tuning {
        Tuning { tick_hz: 60, per_tick_max_delta: 255, accel_base: 1.0, accel_max: 8.0, accel_vel_max: 2000.0, absolute_grid: (32767, 32767) }
    }

    #[test]
    fn relative_gain_scales_and_flushes_in_one_tick() {
        let mut state = MotionState {
            mode: MouseMode::RelativeGain,
            gain: 10.0,
            tuning: tuning(),
            accumulator: Accumulator::default(),
        };
        state.apply_relative(3.0, -2.0);
        let flushed = state.flush_tick();
        assert_eq!(flushed, Some((30, -20)));
        assert_eq!(state.flush_tick(), None);
    }

    #[test]
    fn flush_respects_per_tick_max_delta() {
        let mut small_tuning = tuning();
        small_tuning.per_tick_max_delta = 10;
        let mut state = MotionState {
            mode: MouseMode::RelativeGain,
            gain: 1.0,
            tuning: small_tuning,
            accumulator: Accumulator::default(),
        };
        state.apply_relative(100.0, 0.0);
        assert_eq!(state.flush_tick(), Some((10, 0)));
        assert_eq!(state.flush_tick(), Some((10, 0)));
    }

    #[test]
    fn absolute_mode_targets_grid_position() {
        let mut state = MotionState {
            mode: MouseMode::Absolute,
            gain: 1.0,
            tuning: Tuning { absolute_grid: (100, 100), per_tick_max_delta: 1000, ..tuning() },
            accumulator: Accumulator::default(),
        };
        state.apply_absolute(0.5, 0.5);
        assert_eq!(state.flush_tick(), Some((50, 50)));
    }
}
