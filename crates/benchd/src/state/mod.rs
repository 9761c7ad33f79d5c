// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The authoritative application state: a single versioned `AppState`
//! mutated only through [`store::StateStore`], plus the per-device slice
//! shapes every driver adapter writes into.

pub mod store;

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

pub use store::StateStore;

/// Root application state. One instance lives for the process lifetime and
/// is replaced wholesale (atomic swap) on every commit — see [`StateStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    pub version: u64,
    pub meta: Meta,
    pub layout: serde_json::Value,
    pub server_config: serde_json::Value,
    pub power_meter: DeviceSlice,
    pub serial_printer: PrinterSlice,
    pub atlona_controller: AtlonaSlice,
    pub ps2_keyboard: DeviceSlice,
    pub ps2_mouse: MouseSlice,
    pub front_panel: FrontPanelSlice,
    pub cf_imager: CfImagerSlice,
    pub sidecar: DeviceSlice,
}

impl AppState {
    /// The empty, just-started state at `version = 0`. The first real commit
    /// bumps this to `version = 1`.
    pub fn initial() -> Self {
        Self {
            version: 0,
            meta: Meta { started_at_ms: now_ms(), status: "starting".to_owned() },
            layout: serde_json::Value::Null,
            server_config: serde_json::Value::Null,
            power_meter: DeviceSlice::default(),
            serial_printer: PrinterSlice::default(),
            atlona_controller: AtlonaSlice::default(),
            ps2_keyboard: DeviceSlice::default(),
            ps2_mouse: MouseSlice::default(),
            front_panel: FrontPanelSlice::default(),
            cf_imager: CfImagerSlice::default(),
            sidecar: DeviceSlice::default(),
        }
    }

    /// Apply the configured history caps to every slice's bounded history.
    /// `DeviceSlice::default()` leaves them at cap 0 (self-correcting to 1
    /// on first push), so this must run once before the store starts
    /// serving adapters.
    pub fn with_history_caps(mut self, device_limit: usize, printer_limit: usize) -> Self {
        for slice in [
            &mut self.power_meter,
            &mut self.serial_printer.base,
            &mut self.atlona_controller.base,
            &mut self.ps2_keyboard,
            &mut self.ps2_mouse.base,
            &mut self.front_panel.base,
            &mut self.cf_imager.base,
            &mut self.sidecar,
        ] {
            slice.operation_history.set_cap(device_limit);
            slice.error_history.set_cap(device_limit);
        }
        self.serial_printer.recent_jobs.set_cap(printer_limit);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub started_at_ms: u64,
    pub status: String,
}

/// Lifecycle phase shared by every device slice, mirroring the driver state
/// machine in the design doc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Error,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// A completed or terminal operation, retained in the bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub kind: String,
    pub requested_by: Option<String>,
    pub queued_at_ms: u64,
    pub finished_at_ms: u64,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A recorded error, retained in the bounded `errorHistory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub category: String,
    pub at_ms: u64,
}

/// Fixed-capacity history used for `operationHistory` / `errorHistory` /
/// printer `recentJobs`. Oldest entries are dropped once `cap` is exceeded —
/// a structured analogue of the teacher's byte-oriented ring buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    #[serde(skip)]
    cap: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(cap: usize) -> Self {
        Self { entries: VecDeque::with_capacity(cap.min(256)), cap: cap.max(1) }
    }

    pub fn push(&mut self, item: T) {
        if self.cap == 0 {
            self.cap = 1;
        }
        while self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-cap a history built through `Default` (cap 0), trimming any excess
    /// from the front. Used once at startup to apply the configured limits.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap.max(1);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }
}

/// Semantic fields shared across every device driver's slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSlice {
    pub phase: Phase,
    pub identified: bool,
    pub device_id: Option<String>,
    pub device_path: Option<String>,
    pub baud_rate: Option<u32>,
    pub busy: bool,
    pub queue_depth: usize,
    pub current_op: Option<String>,
    pub operation_history: BoundedHistory<OperationRecord>,
    pub last_error: Option<String>,
    pub error_history: BoundedHistory<ErrorRecord>,
    pub updated_at_ms: u64,
}

/// Mouse movement mode (see §4.2 for the gain/accel formulas).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MouseMode {
    Absolute,
    RelativeGain,
    RelativeAccel,
}

impl Default for MouseMode {
    fn default() -> Self {
        Self::RelativeGain
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MouseSlice {
    #[serde(flatten)]
    pub base: DeviceSlice,
    pub mode: MouseMode,
    pub gain: f64,
    pub accel_base: f64,
    pub accel_max: f64,
    pub accel_vel_max: f64,
    pub absolute_grid: (u32, u32),
    pub buttons_down: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontPanelSlice {
    #[serde(flatten)]
    pub base: DeviceSlice,
    /// `None` means unknown (fail-closed on disconnect).
    pub power_sense: Option<bool>,
    pub hdd_active: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterJob {
    pub id: String,
    pub created_at_ms: u64,
    pub completed_at_ms: u64,
    pub raw: String,
    pub preview: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrinterSlice {
    #[serde(flatten)]
    pub base: DeviceSlice,
    pub total_jobs: u64,
    pub recent_jobs: BoundedHistory<PrinterJob>,
    pub current_job: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AtlonaSlice {
    #[serde(flatten)]
    pub base: DeviceSlice,
    /// Switch id -> held state.
    pub held: std::collections::BTreeMap<u32, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfImagerEntry {
    pub name: String,
    pub is_dir: bool,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CfImagerSlice {
    #[serde(flatten)]
    pub base: DeviceSlice,
    pub cwd: String,
    pub entries: Vec<CfImagerEntry>,
    pub disk_free_bytes: u64,
}

/// Current epoch milliseconds, used to stamp every state mutation.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identifies which top-level slice of `AppState` a mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceKey {
    Meta,
    Layout,
    ServerConfig,
    PowerMeter,
    SerialPrinter,
    AtlonaController,
    Ps2Keyboard,
    Ps2Mouse,
    FrontPanel,
    CfImager,
    Sidecar,
}

impl SliceKey {
    /// The JSON-Patch path prefix for this slice, e.g. `/ps2Mouse`.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            Self::Meta => "/meta",
            Self::Layout => "/layout",
            Self::ServerConfig => "/serverConfig",
            Self::PowerMeter => "/powerMeter",
            Self::SerialPrinter => "/serialPrinter",
            Self::AtlonaController => "/atlonaController",
            Self::Ps2Keyboard => "/ps2Keyboard",
            Self::Ps2Mouse => "/ps2Mouse",
            Self::FrontPanel => "/frontPanel",
            Self::CfImager => "/cfImager",
            Self::Sidecar => "/sidecar",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_history_drops_oldest_past_capacity() {
        let mut history: BoundedHistory<u32> = BoundedHistory::new(3);
        for i in 0..5 {
            history.push(i);
        }
        let collected: Vec<_> = history.iter().copied().collect();
        assert_eq!(collected, vec![2, 3, 4]);
    }

    #[test]
    fn initial_state_starts_at_version_zero() {
        let state = AppState::initial();
        assert_eq!(state.version, 0);
        assert_eq!(state.ps2_mouse.base.phase, Phase::Disconnected);
    }
}
