// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-connection WebSocket handler (§4.5/§6). On connect: `welcome`, a full
//! `state.snapshot`, and (if enabled) `logs.history`. Thereafter: `state.patch`
//! and `state.snapshot` on every commit, a 1Hz heartbeat resending the
//! snapshot, and `logs.append` as the log ring fans out. Inbound frames are
//! `hello`/`ping`/`subscribe`/`<device>.command`; malformed JSON is ignored
//! and per-socket write failures just end that connection, matching the
//! teacher's `handle_ws` loop.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::app::AppHandle;
use crate::state::now_ms;
use crate::ws::command;
use crate::ws::logs::LogEntry;

/// `GET /ws` — WebSocket upgrade, no per-connection auth (the orchestrator is
/// assumed to run behind a trusted bench network; `BENCHD_AUTH_TOKEN` only
/// gates the log-ingest endpoint per §6).
pub async fn ws_handler(State(app): State<Arc<AppHandle>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, app))
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum OutboundFrame {
    Welcome {
        server_time: u64,
    },
    #[serde(rename = "state.snapshot")]
    StateSnapshot { state_version: u64, data: serde_json::Value },
    #[serde(rename = "state.patch")]
    StatePatch { from_version: u64, to_version: u64, patch: serde_json::Value },
    #[serde(rename = "logs.history")]
    LogsHistory { entries: Vec<LogEntry> },
    #[serde(rename = "logs.append")]
    LogsAppend { entry: LogEntry },
    Pong {
        ts: u64,
    },
    Ack {
        ok: bool,
    },
}

/// Generic inbound envelope; `payload`/`topics` default to empty so `hello`
/// and `ping` frames (which carry neither) still deserialize.
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    #[allow(dead_code)]
    topics: Vec<String>,
}

async fn handle_ws(socket: WebSocket, app: Arc<AppHandle>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut patches = app.state.subscribe_patches();
    let mut snapshots = app.state.subscribe_snapshots();
    let mut log_rx = app.logs.subscribe();
    let mut heartbeat = tokio::time::interval(app.config.ws_heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    if send_json(&mut ws_tx, &OutboundFrame::Welcome { server_time: now_ms() }).await.is_err() {
        return;
    }
    let snap = app.state.peek().await;
    if send_json(&mut ws_tx, &OutboundFrame::StateSnapshot { state_version: snap.version, data: to_json(&*snap) })
        .await
        .is_err()
    {
        return;
    }
    if app.config.client_logs_snapshot {
        let entries = app.logs.history().await;
        if send_json(&mut ws_tx, &OutboundFrame::LogsHistory { entries }).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => break,

            _ = heartbeat.tick() => {
                let snap = app.state.peek().await;
                if send_json(&mut ws_tx, &OutboundFrame::StateSnapshot { state_version: snap.version, data: to_json(&*snap) }).await.is_err() {
                    break;
                }
            }

            event = snapshots.recv() => {
                match event {
                    Ok(event) => {
                        let frame = OutboundFrame::StateSnapshot { state_version: event.version, data: to_json(&*event.state) };
                        if send_json(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            event = patches.recv() => {
                match event {
                    Ok(event) => {
                        let frame = OutboundFrame::StatePatch {
                            from_version: event.from_version,
                            to_version: event.to_version,
                            patch: to_json(&event.patch),
                        };
                        if send_json(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            entry = log_rx.recv() => {
                match entry {
                    Ok(entry) => {
                        if send_json(&mut ws_tx, &OutboundFrame::LogsAppend { entry }).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_inbound(&app, &mut ws_tx, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn handle_inbound(
    app: &Arc<AppHandle>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    text: &str,
) -> Result<(), ()> {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        return Ok(());
    };
    match frame.kind.as_str() {
        "hello" => send_json(ws_tx, &OutboundFrame::Ack { ok: true }).await,
        "ping" => send_json(ws_tx, &OutboundFrame::Pong { ts: now_ms() }).await,
        "subscribe" => Ok(()),
        other => {
            let ok = command::route(app, other.trim_end_matches(".command"), frame.payload).await;
            send_json(ws_tx, &OutboundFrame::Ack { ok }).await
        }
    }
}

async fn send_json(ws_tx: &mut SplitSink<WebSocket, Message>, frame: &OutboundFrame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    ws_tx.send(Message::Text(text.into())).await.map_err(|_| ())
}

fn to_json<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
