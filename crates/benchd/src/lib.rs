// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Benchd: hardware-benchmarking orchestrator. Attaches to a fleet of
//! USB-serial devices, coalesces their events into one authoritative state
//! store, and serves that state (plus a reverse command channel) to browser
//! dashboards over WebSockets.

pub mod adapter;
pub mod app;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod serial_io;
pub mod sheets;
pub mod state;
pub mod ws;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::app::{AppHandle, DeviceHandles};
use crate::bus::{AttrFilter, Bus, BusEvent, SchemaRegistry, TopicPattern};
use crate::config::BenchConfig;
use crate::discovery::matcher::SerialMatcher;
use crate::discovery::{DeviceEvent, DiscoveryService, Identification};
use crate::driver::mouse::{MouseCommand, Tuning};
use crate::driver::operation::OperationQueue;
use crate::driver::DriverConfig;
use crate::sheets::{SheetsConfig, SheetsHost};
use crate::state::store::StateStore;
use crate::state::{AppState, MouseMode};
use crate::ws::logs::LogRing;

/// Run the orchestrator until shutdown. Binds the HTTP/WS listener, starts
/// serial discovery, and spawns one driver+adapter pair per device class as
/// discovery identifies it. `logs` is the same ring `main.rs` wired into the
/// tracing subscriber, so `logs.history`/`logs.append`/`POST /api/logs/ingest`
/// and every `tracing::info!`/`warn!`/`error!` call share one backing store.
pub async fn run(config: BenchConfig, logs: Arc<LogRing>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let mut schema = SchemaRegistry::new(vec![TopicPattern::parse("frontpanel.power.changed")?]);
    schema.register(
        TopicPattern::parse("frontpanel.power.changed")?,
        1,
        Arc::new(|payload: &serde_json::Value| {
            if payload.get("state").is_some() {
                Ok(())
            } else {
                Err("missing \"state\" field".to_owned())
            }
        }),
    );
    let bus = Bus::new(schema);

    let state = StateStore::with_initial(
        AppState::initial().with_history_caps(config.device_history_limit, config.serial_printer_history_limit),
    );

    // The front-panel power-off transition cancels in-flight work on both the
    // mouse and the keyboard; each gets its own subscription so a slow
    // consumer on one never starves the other.
    let (_, mouse_power_off_rx) = bus
        .subscribe("mouse-power-off", TopicPattern::parse("frontpanel.power.changed")?, AttrFilter::default(), 16, None)
        .await;
    let (_, keyboard_power_off_rx) = bus
        .subscribe("keyboard-power-off", TopicPattern::parse("frontpanel.power.changed")?, AttrFilter::default(), 16, None)
        .await;

    let sheets = SheetsHost::start(SheetsConfig::from_bench_config(&config)).await?;
    tokio::spawn({
        let sheets = Arc::clone(&sheets);
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            sheets.shutdown().await;
        }
    });

    let app = Arc::new(AppHandle {
        config: config.clone(),
        state: Arc::clone(&state),
        bus: bus.clone(),
        devices: DeviceHandles::default(),
        logs: Arc::clone(&logs),
        sheets: Arc::clone(&sheets),
        http: reqwest::Client::new(),
        shutdown: shutdown.clone(),
    });

    let (discovery_tx, discovery_rx) = mpsc::channel::<DeviceEvent>(64);
    let _discovery = DiscoveryService::start(
        default_matchers(),
        config.discovery_rescan_interval(),
        config.discovery_identify_timeout(),
        config.discovery_identify_retries,
        config.discovery_probe_baud,
        discovery_tx,
    )?;

    tokio::spawn(run_supervisor(Arc::clone(&app), discovery_rx, mouse_power_off_rx, keyboard_power_off_rx));

    tracing::info!(%addr, "benchd listening");
    let router = ws::build_router(app);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

/// Default device matcher table. The distilled design leaves concrete
/// vendor/product IDs and identification tokens as hardware-specific detail;
/// this table is a representative default (see DESIGN.md) and is the only
/// place a deployment would edit to point at real hardware.
fn default_matchers() -> Vec<SerialMatcher> {
    vec![
        matcher("power-meter", 0x0403, 0x6001, 9600),
        matcher("atlona", 0x10c4, 0xea60, 57600),
        matcher("keyboard", 0x1a86, 0x7523, 9600),
        matcher("mouse", 0x2341, 0x0043, 9600),
        matcher("cfimager", 0x0483, 0x5740, 115200),
        matcher("front-panel", 0x16c0, 0x0483, 9600),
        matcher("serial-printer", 0x0483, 0xa223, 19200),
    ]
}

fn matcher(kind: &str, vendor_id: u16, product_id: u16, baud_rate: u32) -> SerialMatcher {
    SerialMatcher {
        kind: kind.to_owned(),
        identification_string: Some(identify_token_for(kind).to_owned()),
        vendor_id: Some(vendor_id),
        product_id: Some(product_id),
        serial_number: None,
        path_regex: None,
        baud_rate,
        identify_required: true,
        keep_open_on_static: false,
    }
}

fn identify_token_for(kind: &str) -> &'static str {
    match kind {
        "power-meter" => "PM",
        "atlona" => "AC",
        "keyboard" => "KB",
        "mouse" => "MS",
        "cfimager" => "CF",
        "front-panel" => "FP",
        "serial-printer" => "PR",
        _ => "",
    }
}

fn driver_config(id: &Identification, config: &BenchConfig, reconnect_base: Duration, reconnect_max: Duration) -> DriverConfig {
    DriverConfig {
        device_id: id.device_id.clone(),
        path: id.path.clone(),
        baud_rate: id.baud_rate,
        identify_write: "identify".to_owned(),
        identify_complete_write: "identify_complete".to_owned(),
        identify_token: identify_token_for(&id.kind).to_owned(),
        identify_timeout: config.discovery_identify_timeout(),
        eol: "\r\n".to_owned(),
        queue_max_depth: config.device_queue_depth,
        reconnect_base_delay: reconnect_base,
        reconnect_max_delay: reconnect_max,
        reconnect_max_attempts: config.reconnect_max_attempts,
    }
}

/// Consumes discovery events for the life of the process, spawning one
/// driver+adapter pair per device kind the first time it is identified.
/// Re-identification of an already-running kind is ignored: the driver owns
/// its path and reconnects on its own.
async fn run_supervisor(
    app: Arc<AppHandle>,
    mut events_rx: mpsc::Receiver<DeviceEvent>,
    mouse_power_off_rx: mpsc::Receiver<BusEvent>,
    keyboard_power_off_rx: mpsc::Receiver<BusEvent>,
) {
    let mut started: HashSet<String> = HashSet::new();
    let mut mouse_power_off_rx = Some(mouse_power_off_rx);
    let mut keyboard_power_off_rx = Some(keyboard_power_off_rx);

    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => return,
            event = events_rx.recv() => {
                let Some(event) = event else { return };
                match event {
                    DeviceEvent::Identifying { path } => tracing::debug!(path, "discovery: identifying"),
                    DeviceEvent::Lost { device_id } => tracing::info!(device_id, "discovery: device lost"),
                    DeviceEvent::Error { path, message } => tracing::warn!(?path, message, "discovery: error"),
                    DeviceEvent::Identified(id) => {
                        if !started.insert(id.kind.clone()) {
                            tracing::debug!(kind = %id.kind, "discovery: kind already running, ignoring re-identification");
                            continue;
                        }
                        spawn_for(&app, id, &mut mouse_power_off_rx, &mut keyboard_power_off_rx).await;
                    }
                }
            }
        }
    }
}

async fn spawn_for(
    app: &Arc<AppHandle>,
    id: Identification,
    mouse_power_off_rx: &mut Option<mpsc::Receiver<BusEvent>>,
    keyboard_power_off_rx: &mut Option<mpsc::Receiver<BusEvent>>,
) {
    let kind = id.kind.clone();
    match kind.as_str() {
        "power-meter" => spawn_power_meter(app, id).await,
        "atlona" => spawn_atlona(app, id).await,
        "cfimager" => spawn_cfimager(app, id).await,
        "front-panel" => spawn_front_panel(app, id).await,
        "serial-printer" => spawn_printer(app, id).await,
        "keyboard" => match keyboard_power_off_rx.take() {
            Some(rx) => spawn_keyboard(app, id, rx).await,
            None => tracing::error!("discovery: keyboard power-off channel already consumed"),
        },
        "mouse" => match mouse_power_off_rx.take() {
            Some(rx) => spawn_mouse(app, id, rx).await,
            None => tracing::error!("discovery: mouse power-off channel already consumed"),
        },
        other => tracing::warn!(kind = other, "discovery: identified unknown device kind"),
    }
}

async fn spawn_power_meter(app: &Arc<AppHandle>, id: Identification) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(64);
    let queue = OperationQueue::with_events(config.device_queue_depth, Some(events_tx.clone()));
    *app.devices.power_meter.write().await = Some(queue.handle());
    let driver_config = driver_config(&id, config, config.reconnect_base_delay(), config.reconnect_max_delay());
    tokio::spawn(driver::power_meter::run(driver_config, queue, app.shutdown.clone(), events_tx));
    tokio::spawn(adapter::run_power_meter_adapter(Arc::clone(&app.state), app.bus.clone(), events_rx, config.device_history_limit));
}

async fn spawn_atlona(app: &Arc<AppHandle>, id: Identification) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(64);
    let queue = OperationQueue::with_events(config.device_queue_depth, Some(events_tx.clone()));
    *app.devices.atlona_controller.write().await = Some(queue.handle());
    let reconnect_base = Duration::from_millis(config.atlona_reconnect_base_ms);
    let reconnect_max = Duration::from_millis(config.atlona_reconnect_max_ms);
    let driver_config = driver_config(&id, config, reconnect_base, reconnect_max);
    tokio::spawn(driver::atlona::run(driver_config, queue, app.shutdown.clone(), events_tx));
    tokio::spawn(adapter::run_atlona_adapter(Arc::clone(&app.state), app.bus.clone(), events_rx, config.device_history_limit));
}

async fn spawn_keyboard(app: &Arc<AppHandle>, id: Identification, power_off_rx: mpsc::Receiver<BusEvent>) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(64);
    let queue = OperationQueue::with_events(config.device_queue_depth, Some(events_tx.clone()));
    *app.devices.ps2_keyboard.write().await = Some(queue.handle());
    let driver_config = driver_config(&id, config, config.reconnect_base_delay(), config.reconnect_max_delay());
    tokio::spawn(driver::keyboard::run(driver_config, queue, app.shutdown.clone(), events_tx, power_off_rx));
    tokio::spawn(adapter::run_keyboard_adapter(Arc::clone(&app.state), app.bus.clone(), events_rx, config.device_history_limit));
}

async fn spawn_mouse(app: &Arc<AppHandle>, id: Identification, power_off_rx: mpsc::Receiver<BusEvent>) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(64);
    let queue = OperationQueue::with_events(config.device_queue_depth, Some(events_tx.clone()));
    *app.devices.ps2_mouse.write().await = Some(queue.handle());
    let (commands_tx, commands_rx) = mpsc::channel::<MouseCommand>(32);
    *app.devices.mouse_commands.write().await = Some(commands_tx);
    let driver_config = driver_config(&id, config, config.reconnect_base_delay(), config.reconnect_max_delay());
    let tuning = Tuning {
        tick_hz: config.mouse_tick_hz,
        per_tick_max_delta: config.mouse_per_tick_max_delta as i64,
        accel_base: 1.0,
        accel_max: 8.0,
        accel_vel_max: 2000.0,
        absolute_grid: (32767, 32767),
    };
    tokio::spawn(driver::mouse::run(
        driver_config,
        tuning,
        MouseMode::default(),
        1.0,
        commands_rx,
        queue,
        app.shutdown.clone(),
        events_tx,
        power_off_rx,
    ));
    tokio::spawn(adapter::run_mouse_adapter(Arc::clone(&app.state), app.bus.clone(), events_rx, config.device_history_limit));
}

async fn spawn_cfimager(app: &Arc<AppHandle>, id: Identification) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(64);
    let queue = OperationQueue::with_events(config.device_queue_depth, Some(events_tx.clone()));
    *app.devices.cf_imager.write().await = Some(queue.handle());
    let driver_config = driver_config(&id, config, config.reconnect_base_delay(), config.reconnect_max_delay());
    tokio::spawn(driver::cfimager::run(driver_config, queue, app.shutdown.clone(), events_tx));
    tokio::spawn(adapter::run_cfimager_adapter(Arc::clone(&app.state), app.bus.clone(), events_rx, config.device_history_limit));
}

async fn spawn_front_panel(app: &Arc<AppHandle>, id: Identification) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(32);
    let driver_config = driver_config(&id, config, config.reconnect_base_delay(), config.reconnect_max_delay());
    tokio::spawn(driver::frontpanel::run(driver_config, app.shutdown.clone(), events_tx));
    tokio::spawn(adapter::run_frontpanel_adapter(Arc::clone(&app.state), app.bus.clone(), events_rx, config.device_history_limit));
}

async fn spawn_printer(app: &Arc<AppHandle>, id: Identification) {
    let config = &app.config;
    let (events_tx, events_rx) = mpsc::channel(32);
    let driver_config = driver_config(&id, config, config.reconnect_base_delay(), config.reconnect_max_delay());
    tokio::spawn(driver::printer::run(driver_config, config.serial_printer_idle_flush(), app.shutdown.clone(), events_tx));
    tokio::spawn(adapter::run_printer_adapter(
        Arc::clone(&app.state),
        app.bus.clone(),
        events_rx,
        config.device_history_limit,
        config.serial_printer_history_limit,
    ));
}
