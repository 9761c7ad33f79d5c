// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial Discovery & Ownership Arbiter (§4.1). Runs as a single cancellable
//! background task: each rescan tick re-enumerates ports, drops ports that
//! vanished, and classifies newly-seen ports against the configured matcher
//! list, emitting [`DeviceEvent`]s for the rest of the system to act on.

pub mod matcher;
pub mod probe;

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::serial_io::SerialHandle;
use matcher::{best_static_match, PortInfo, SerialMatcher};

/// A successful identification, ready for a driver to take over.
#[derive(Debug)]
pub struct Identification {
    pub device_id: String,
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub kind: String,
    pub baud_rate: u32,
    /// Present only for `keepOpenOnStatic` matches: discovery retained the
    /// FD rather than closing it, and hands it directly to the driver.
    pub retained_handle: Option<SerialHandle>,
}

#[derive(Debug)]
pub enum DeviceEvent {
    Identifying { path: String },
    Identified(Identification),
    Lost { device_id: String },
    Error { path: Option<String>, message: String },
}

/// Handle to the background discovery task. Dropping this does not stop the
/// task; call [`Self::stop`] explicitly.
pub struct DiscoveryService {
    cancel: CancellationToken,
}

impl DiscoveryService {
    /// Validate `matchers` and spawn the rescan loop. Non-blocking: the
    /// first scan runs asynchronously inside the spawned task.
    pub fn start(
        matchers: Vec<SerialMatcher>,
        rescan_interval: Duration,
        identify_timeout: Duration,
        identify_retries: u32,
        default_probe_baud: u32,
        events_tx: mpsc::Sender<DeviceEvent>,
    ) -> Result<Self> {
        for m in &matchers {
            m.validate()?;
        }
        let cancel = CancellationToken::new();
        tokio::spawn(run(
            matchers,
            rescan_interval,
            identify_timeout,
            identify_retries,
            default_probe_baud,
            events_tx,
            cancel.clone(),
        ));
        Ok(Self { cancel })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

async fn enumerate_ports() -> Vec<PortInfo> {
    tokio::task::spawn_blocking(|| {
        serialport::available_ports()
            .map(|ports| ports.into_iter().map(to_port_info).collect())
            .unwrap_or_default()
    })
    .await
    .unwrap_or_default()
}

fn to_port_info(info: serialport::SerialPortInfo) -> PortInfo {
    let (vendor_id, product_id, serial_number) = match info.port_type {
        serialport::SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid), usb.serial_number),
        _ => (None, None, None),
    };
    PortInfo { path: info.port_name, vendor_id, product_id, serial_number }
}

async fn run(
    matchers: Vec<SerialMatcher>,
    rescan_interval: Duration,
    identify_timeout: Duration,
    identify_retries: u32,
    default_probe_baud: u32,
    events_tx: mpsc::Sender<DeviceEvent>,
    cancel: CancellationToken,
) {
    let mut claimed: HashMap<String, String> = HashMap::new();
    let mut next_device_seq: u64 = 0;
    let mut interval = tokio::time::interval(rescan_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let present = enumerate_ports().await;
        let present_paths: std::collections::HashSet<&str> =
            present.iter().map(|p| p.path.as_str()).collect();

        let vanished: Vec<(String, String)> = claimed
            .iter()
            .filter(|(path, _)| !present_paths.contains(path.as_str()))
            .map(|(path, id)| (path.clone(), id.clone()))
            .collect();
        for (path, device_id) in vanished {
            claimed.remove(&path);
            tracing::debug!(path, device_id, "discovery: port vanished");
            let _ = events_tx.send(DeviceEvent::Lost { device_id }).await;
        }

        for port in &present {
            if claimed.contains_key(&port.path) {
                continue;
            }
            classify_one(
                port,
                &matchers,
                identify_timeout,
                identify_retries,
                default_probe_baud,
                &events_tx,
                &mut claimed,
                &mut next_device_seq,
            )
            .await;
        }
    }

    for path in claimed.keys() {
        tracing::debug!(path, "discovery: stopping, releasing claimed port");
    }
}

#[allow(clippy::too_many_arguments)]
async fn classify_one(
    port: &PortInfo,
    matchers: &[SerialMatcher],
    identify_timeout: Duration,
    identify_retries: u32,
    default_probe_baud: u32,
    events_tx: &mpsc::Sender<DeviceEvent>,
    claimed: &mut HashMap<String, String>,
    next_device_seq: &mut u64,
) {
    let eligible: Vec<&SerialMatcher> = matchers.iter().filter(|m| m.is_eligible(port)).collect();
    if eligible.is_empty() {
        return;
    }

    let exact_static = eligible.iter().find(|m| m.is_exact_static_match(port));
    if let Some(matcher) = exact_static {
        finalize(port, matcher, None, claimed, next_device_seq, events_tx).await;
        return;
    }

    let active: Vec<(usize, &SerialMatcher)> = matchers
        .iter()
        .enumerate()
        .filter(|(_, m)| m.is_eligible(port) && m.is_active_candidate())
        .collect();

    if !active.is_empty() {
        let _ = events_tx.send(DeviceEvent::Identifying { path: port.path.clone() }).await;
        match probe::probe(&port.path, &active, default_probe_baud, identify_timeout, identify_retries).await {
            Ok(Some(identified)) => {
                let matcher = &matchers[identified.matcher_index];
                finalize(port, matcher, None, claimed, next_device_seq, events_tx).await;
                return;
            }
            Ok(None) => {
                tracing::debug!(path = %port.path, "discovery: active probe found no match");
            }
            Err(err) => {
                let _ = events_tx
                    .send(DeviceEvent::Error { path: Some(port.path.clone()), message: err.to_string() })
                    .await;
            }
        }
    }

    let static_candidates: Vec<&SerialMatcher> =
        eligible.iter().filter(|m| !m.identify_required).copied().collect();
    if let Some(matcher) = best_static_match(&static_candidates, port) {
        let handle = if matcher.keep_open_on_static {
            match SerialHandle::open(port.path.clone(), matcher.baud_rate, identify_timeout).await {
                Ok(h) => Some(h),
                Err(err) => {
                    let _ = events_tx
                        .send(DeviceEvent::Error { path: Some(port.path.clone()), message: err.to_string() })
                        .await;
                    None
                }
            }
        } else {
            None
        };
        finalize(port, matcher, handle, claimed, next_device_seq, events_tx).await;
    }
}

async fn finalize(
    port: &PortInfo,
    matcher: &SerialMatcher,
    retained_handle: Option<SerialHandle>,
    claimed: &mut HashMap<String, String>,
    next_device_seq: &mut u64,
    events_tx: &mpsc::Sender<DeviceEvent>,
) {
    *next_device_seq += 1;
    let device_id = format!("{}-{}", matcher.kind, next_device_seq);
    claimed.insert(port.path.clone(), device_id.clone());
    let identification = Identification {
        device_id,
        path: port.path.clone(),
        vendor_id: port.vendor_id,
        product_id: port.product_id,
        kind: matcher.kind.clone(),
        baud_rate: matcher.baud_rate,
        retained_handle,
    };
    let _ = events_tx.send(DeviceEvent::Identified(identification)).await;
}

#[cfg(test)]
mod tests {
    use super::matcher::PortInfo as TestPortInfo;
    use super::*;

    fn matcher(kind: &str, vid: u16, pid: u16) -> SerialMatcher {
        SerialMatcher {
            kind: kind.to_owned(),
            identification_string: None,
            vendor_id: Some(vid),
            product_id: Some(pid),
            serial_number: None,
            path_regex: None,
            baud_rate: 9600,
            identify_required: false,
            keep_open_on_static: false,
        }
    }

    #[tokio::test]
    async fn classify_one_emits_identified_for_exact_static_match() {
        let matchers = vec![matcher("power-meter", 0x1234, 0x5678)];
        let (tx, mut rx) = mpsc::channel(8);
        let mut claimed = HashMap::new();
        let mut seq = 0;
        let port = TestPortInfo {
            path: "/dev/ttyUSB0".into(),
            vendor_id: Some(0x1234),
            product_id: Some(0x5678),
            serial_number: None,
        };
        classify_one(
            &port,
            &matchers,
            Duration::from_millis(50),
            0,
            9600,
            &tx,
            &mut claimed,
            &mut seq,
        )
        .await;
        let event = rx.recv().await.expect("expected an event");
        assert!(matches!(event, DeviceEvent::Identified(_)));
        assert!(claimed.contains_key("/dev/ttyUSB0"));
    }

    #[tokio::test]
    async fn classify_one_skips_ineligible_port() {
        let matchers = vec![matcher("power-meter", 0x1234, 0x5678)];
        let (tx, mut rx) = mpsc::channel(8);
        let mut claimed = HashMap::new();
        let mut seq = 0;
        let port = TestPortInfo {
            path: "/dev/ttyUSB1".into(),
            vendor_id: Some(0x0001),
            product_id: Some(0x0002),
            serial_number: None,
        };
        classify_one(
            &port,
            &matchers,
            Duration::from_millis(50),
            0,
            9600,
            &tx,
            &mut claimed,
            &mut seq,
        )
        .await;
        assert!(claimed.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
