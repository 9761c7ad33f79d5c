// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `benchd` binary and exercise
//! its HTTP and WebSocket transport with no serial hardware attached.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use benchd_specs::BenchdProcess;

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn http_health() -> anyhow::Result<()> {
    let benchd = BenchdProcess::start()?;
    benchd.wait_healthy(TIMEOUT).await?;

    let resp: serde_json::Value = reqwest::get(format!("{}/api/health", benchd.base_url())).await?.json().await?;
    assert_eq!(resp["status"], "ok");
    assert!(resp["version"].is_string());

    Ok(())
}

#[tokio::test]
async fn http_logs_ingest_open_without_auth_token() -> anyhow::Result<()> {
    let benchd = BenchdProcess::start()?;
    benchd.wait_healthy(TIMEOUT).await?;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/logs/ingest", benchd.base_url()))
        .json(&serde_json::json!({ "ts": 0, "level": "info", "channel": "sidecar", "message": "hello" }))
        .send()
        .await?;
    assert_eq!(resp.status().as_u16(), 204);

    Ok(())
}

#[tokio::test]
async fn ws_connect_sends_welcome_then_snapshot() -> anyhow::Result<()> {
    let benchd = BenchdProcess::start()?;
    benchd.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(benchd.ws_url()).await?;

    let welcome = next_json(&mut ws).await?;
    assert_eq!(welcome["type"], "welcome");
    assert!(welcome["serverTime"].is_number());

    let snapshot = next_json(&mut ws).await?;
    assert_eq!(snapshot["type"], "state.snapshot");
    assert!(snapshot["data"].is_object());

    Ok(())
}

#[tokio::test]
async fn ws_ping_pong() -> anyhow::Result<()> {
    let benchd = BenchdProcess::start()?;
    benchd.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(benchd.ws_url()).await?;
    drain_startup_frames(&mut ws).await?;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await?;
    let pong = next_json(&mut ws).await?;
    assert_eq!(pong["type"], "pong");

    Ok(())
}

#[tokio::test]
async fn ws_command_for_unattached_device_acks_false_without_closing() -> anyhow::Result<()> {
    let benchd = BenchdProcess::start()?;
    benchd.wait_healthy(TIMEOUT).await?;

    let (mut ws, _) = tokio_tungstenite::connect_async(benchd.ws_url()).await?;
    drain_startup_frames(&mut ws).await?;

    ws.send(Message::Text(r#"{"type":"atlona.command","payload":{"action":"hold","switchId":1}}"#.into())).await?;
    let ack = next_json(&mut ws).await?;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["ok"], false);

    // the socket must still be alive after a rejected command
    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await?;
    let pong = next_json(&mut ws).await?;
    assert_eq!(pong["type"], "pong");

    Ok(())
}

async fn next_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> anyhow::Result<serde_json::Value> {
    let msg = tokio::time::timeout(TIMEOUT, ws.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("ws stream ended"))??;
    match msg {
        Message::Text(text) => Ok(serde_json::from_str(&text)?),
        other => anyhow::bail!("expected text ws message, got: {other:?}"),
    }
}

/// Skip the fixed `welcome`/`state.snapshot`/`logs.history` sequence sent on
/// connect so tests that only care about a later frame don't have to name
/// each one.
async fn drain_startup_frames(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> anyhow::Result<()> {
    for _ in 0..3 {
        next_json(ws).await?;
    }
    Ok(())
}
