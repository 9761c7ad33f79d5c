// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded FIFO operation queue shared by every driver (§4.2). At most one
//! operation is active at a time; enqueue past `max_depth` fails immediately
//! with `queue-full`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};

use crate::driver::DriverEvent;
use crate::error::{OrchestratorError, Result};

/// Outcome reported back to whoever enqueued the operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled(String),
}

/// Lifecycle stages the adapter observes for every queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// A flag an in-flight operation must poll at its suspension points
/// (writes, sleeps) to honor a cancellation request.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` if the flag is set, otherwise `Ok(())`;
    /// convenient at every suspension point inside an operation body.
    pub fn check(&self, reason: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(OrchestratorError::cancelled(reason))
        } else {
            Ok(())
        }
    }
}

/// One queued unit of work: an opaque kind/payload, a place to report the
/// outcome, and a cancel flag the driver sets once dequeued.
pub struct Operation {
    pub id: String,
    pub kind: String,
    pub requested_by: Option<String>,
    pub payload: serde_json::Value,
    pub cancel: CancelFlag,
    reply: oneshot::Sender<Outcome>,
}

impl Operation {
    pub fn resolve(self, outcome: Outcome) {
        let _ = self.reply.send(outcome);
    }
}

/// A bounded FIFO queue. `enqueue` fails fast with `queue-full` when the
/// channel is already at capacity; `dequeue` drives the single active-op
/// discipline from the driver's run loop.
pub struct OperationQueue {
    tx: mpsc::Sender<Operation>,
    rx: mpsc::Receiver<Operation>,
    max_depth: usize,
    depth: Arc<std::sync::atomic::AtomicUsize>,
    events_tx: Option<mpsc::Sender<DriverEvent>>,
}

impl OperationQueue {
    pub fn new(max_depth: usize) -> Self {
        Self::with_events(max_depth, None)
    }

    /// Like [`Self::new`], but `enqueue` also reports an
    /// [`DriverEvent::OperationQueued`] on `events_tx` for every admitted
    /// operation.
    pub fn with_events(max_depth: usize, events_tx: Option<mpsc::Sender<DriverEvent>>) -> Self {
        let (tx, rx) = mpsc::channel(max_depth.max(1));
        Self { tx, rx, max_depth, depth: Arc::new(std::sync::atomic::AtomicUsize::new(0)), events_tx }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> OperationQueueHandle {
        OperationQueueHandle {
            tx: self.tx.clone(),
            max_depth: self.max_depth,
            depth: Arc::clone(&self.depth),
            events_tx: self.events_tx.clone(),
        }
    }

    /// Pull the next operation, marking it dequeued (depth accounting).
    pub async fn dequeue(&mut self) -> Option<Operation> {
        let op = self.rx.recv().await;
        if op.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        op
    }

    /// Drain and fail every still-queued operation with `cancelled`; used by
    /// `cancelAll` and on disconnect.
    pub fn drain_cancelled(&mut self, reason: &str) {
        while let Ok(op) = self.rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            op.resolve(Outcome::Cancelled(reason.to_owned()));
        }
    }
}

/// Cloneable submission side of an [`OperationQueue`].
#[derive(Clone)]
pub struct OperationQueueHandle {
    tx: mpsc::Sender<Operation>,
    max_depth: usize,
    depth: Arc<std::sync::atomic::AtomicUsize>,
    events_tx: Option<mpsc::Sender<DriverEvent>>,
}

impl OperationQueueHandle {
    /// Enqueue `kind`/`payload`, returning a cancel flag (to allow external
    /// cancellation) and a future that resolves to the outcome. Reports
    /// [`DriverEvent::OperationQueued`] on success so `DeviceSlice::queue_depth`
    /// tracks admitted-but-not-yet-started operations.
    pub fn enqueue(
        &self,
        kind: impl Into<String>,
        requested_by: Option<String>,
        payload: serde_json::Value,
    ) -> Result<(CancelFlag, oneshot::Receiver<Outcome>)> {
        if self.depth.load(Ordering::SeqCst) >= self.max_depth {
            return Err(OrchestratorError::queue_full(self.max_depth, self.max_depth));
        }
        let cancel = CancelFlag::new();
        let (reply_tx, reply_rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string();
        let op = Operation {
            id: id.clone(),
            kind: kind.into(),
            requested_by,
            payload,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        let queue_depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.try_send(op).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestratorError::queue_full(self.max_depth, self.max_depth));
        }
        if let Some(events_tx) = &self.events_tx {
            let _ = events_tx.try_send(DriverEvent::OperationQueued { id, queue_depth });
        }
        Ok((cancel, reply_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_past_max_depth_fails_fast() -> anyhow::Result<()> {
        let queue = OperationQueue::new(1);
        let handle = queue.handle();
        let (_c1, _r1) = handle.enqueue("press", None, serde_json::Value::Null)?;
        let second = handle.enqueue("press", None, serde_json::Value::Null);
        assert!(matches!(second, Err(OrchestratorError::QueueFull { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn dequeue_decrements_depth() -> anyhow::Result<()> {
        let mut queue = OperationQueue::new(4);
        let handle = queue.handle();
        let (_c, _r) = handle.enqueue("press", None, serde_json::Value::Null)?;
        assert_eq!(handle.depth.load(std::sync::atomic::Ordering::SeqCst), 1);
        let op = queue.dequeue().await.expect("operation present");
        assert_eq!(op.kind, "press");
        assert_eq!(handle.depth.load(std::sync::atomic::Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cancel_flag_observed_by_operation_body() -> anyhow::Result<()> {
        let queue = OperationQueue::new(4);
        let handle = queue.handle();
        let (cancel, _rx) = handle.enqueue("press", None, serde_json::Value::Null)?;
        assert!(cancel.check("test").is_ok());
        cancel.cancel();
        assert!(cancel.check("test").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn enqueue_reports_operation_queued_event_with_depth() -> anyhow::Result<()> {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let queue = OperationQueue::with_events(4, Some(events_tx));
        let handle = queue.handle();
        let (_cancel, _rx) = handle.enqueue("press", None, serde_json::Value::Null)?;
        match events_rx.recv().await {
            Some(DriverEvent::OperationQueued { queue_depth, .. }) => assert_eq!(queue_depth, 1),
            other => panic!("expected OperationQueued, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn drain_cancelled_resolves_all_queued_ops() -> anyhow::Result<()> {
        let mut queue = OperationQueue::new(4);
        let handle = queue.handle();
        let (_c1, r1) = handle.enqueue("press", None, serde_json::Value::Null)?;
        let (_c2, r2) = handle.enqueue("press", None, serde_json::Value::Null)?;
        queue.drain_cancelled("host-power-off");
        assert_eq!(r1.await?, Outcome::Cancelled("host-power-off".to_owned()));
        assert_eq!(r2.await?, Outcome::Cancelled("host-power-off".to_owned()));
        Ok(())
    }
}
