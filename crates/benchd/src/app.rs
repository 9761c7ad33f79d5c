// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared application handle, analogous to the teacher's `MuxState`: the one
//! object every HTTP/WS handler and background task holds an `Arc` to.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::BenchConfig;
use crate::driver::mouse::MouseCommand;
use crate::driver::operation::OperationQueueHandle;
use crate::sheets::SheetsHost;
use crate::state::store::StateStore;
use crate::ws::logs::LogRing;

/// A handle slot that starts empty and is filled in once, the first time
/// discovery identifies that device class. `Arc`-shared so the WS layer and
/// the discovery supervisor observe the same slot without `AppHandle` itself
/// needing to be rebuilt.
pub type HandleSlot<T> = Arc<RwLock<Option<T>>>;

fn empty_slot<T>() -> HandleSlot<T> {
    Arc::new(RwLock::new(None))
}

/// Submission-side handles for every device's operation queue, plus the
/// mouse's out-of-band movement channel. Empty until discovery identifies
/// the corresponding device (no port matched yet) or for drivers that don't
/// expose a queue at all (front-panel, serial-printer are read-only/byte-oriented).
#[derive(Clone)]
pub struct DeviceHandles {
    pub power_meter: HandleSlot<OperationQueueHandle>,
    pub atlona_controller: HandleSlot<OperationQueueHandle>,
    pub ps2_keyboard: HandleSlot<OperationQueueHandle>,
    pub ps2_mouse: HandleSlot<OperationQueueHandle>,
    pub mouse_commands: HandleSlot<tokio::sync::mpsc::Sender<MouseCommand>>,
    pub cf_imager: HandleSlot<OperationQueueHandle>,
}

impl Default for DeviceHandles {
    fn default() -> Self {
        Self {
            power_meter: empty_slot(),
            atlona_controller: empty_slot(),
            ps2_keyboard: empty_slot(),
            ps2_mouse: empty_slot(),
            mouse_commands: empty_slot(),
            cf_imager: empty_slot(),
        }
    }
}

/// The process-wide shared state. Cheap to clone (everything inside is
/// already `Arc`/`Clone`); handlers take `State<Arc<AppHandle>>`.
pub struct AppHandle {
    pub config: BenchConfig,
    pub state: Arc<StateStore>,
    pub bus: Bus,
    pub devices: DeviceHandles,
    pub logs: Arc<LogRing>,
    pub sheets: Arc<SheetsHost>,
    pub http: reqwest::Client,
    pub shutdown: CancellationToken,
}
