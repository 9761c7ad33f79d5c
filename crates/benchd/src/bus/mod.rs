// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process topic pub/sub bus (§4.4). No internal locking: the bus runs as
//! a single `tokio::spawn`ed actor task reachable only through an
//! `mpsc::Sender<Command>` handle, matching the source's "single-threaded
//! ingress/egress" ordering guarantee.

pub mod schema;
pub mod topic;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub use schema::{SchemaRegistry, Validator};
pub use topic::TopicPattern;

/// Attribute values carried on a [`BusEvent`]. Restricted to the scalar
/// types the design doc allows for attribute filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

pub type Attributes = std::collections::BTreeMap<String, AttrValue>;

/// A frozen message circulated by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub id: String,
    pub seq: u64,
    pub ts_ms: u64,
    pub source: String,
    pub schema_version: u32,
    pub attributes: Attributes,
    pub payload: serde_json::Value,
}

/// Declarative subscription filter: topic pattern plus optional attribute
/// equality/existence constraints.
#[derive(Debug, Clone, Default)]
pub struct AttrFilter {
    pub equals: Attributes,
    pub exists: Vec<String>,
}

impl AttrFilter {
    fn matches(&self, attrs: &Attributes) -> bool {
        for (k, v) in &self.equals {
            if attrs.get(k) != Some(v) {
                return false;
            }
        }
        for k in &self.exists {
            if !attrs.contains_key(k) {
                return false;
            }
        }
        true
    }
}

/// Reason a subscriber was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledReason {
    Backpressure,
    Unsubscribed,
}

/// A subscriber is just a bounded queue plus a filter from the bus actor's
/// point of view. Callers that drain the queue themselves (via
/// [`Bus::subscribe`]) own their own handler loop, so a handler error there
/// can never affect the bus or other subscribers. Callers that hand the bus
/// a handler closure (via [`Bus::subscribe_with_handler`]) get that same
/// isolation from the bus's own drain task: a handler `Err` is reported as
/// `bus.handler.error` and passed to `on_error`, and the loop keeps draining.
struct Subscriber {
    name: String,
    pattern: TopicPattern,
    filter: AttrFilter,
    queue_tx: mpsc::Sender<BusEvent>,
    on_disabled: Option<Arc<dyn Fn(DisabledReason) + Send + Sync>>,
}

enum Command {
    Publish { event: BusEvent, ack: Option<oneshot::Sender<anyhow::Result<()>>> },
    Subscribe { sub: Subscriber, reply: oneshot::Sender<SubscriptionId> },
    Unsubscribe { id: SubscriptionId },
    Idle { reply: oneshot::Sender<()> },
}

pub type SubscriptionId = u64;

/// Handle to the bus actor. Cloneable; publishing/subscribing sends a
/// command over the actor's channel.
#[derive(Clone)]
pub struct Bus {
    cmd_tx: mpsc::Sender<Command>,
    seq_counters: Arc<std::sync::Mutex<HashMap<String, u64>>>,
    id_counter: Arc<AtomicU64>,
    schema: Arc<SchemaRegistry>,
}

/// Reserved namespace for internal meta-events (`bus.subscriber.disabled`,
/// `bus.message.rejected`, `bus.handler.error`, all published via
/// [`Bus::publish_meta`]). Publishes to `bus.*` from outside the bus module
/// are rejected.
const RESERVED_PREFIX: &str = "bus.";

impl Bus {
    pub fn new(schema: SchemaRegistry) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);
        let bus = Self {
            cmd_tx: cmd_tx.clone(),
            seq_counters: Arc::new(std::sync::Mutex::new(HashMap::new())),
            id_counter: Arc::new(AtomicU64::new(1)),
            schema: Arc::new(schema),
        };
        tokio::spawn(run_actor(cmd_rx, cmd_tx, Arc::clone(&bus.id_counter), Arc::clone(&bus.seq_counters)));
        bus
    }

    fn next_id(&self) -> String {
        let n = self.id_counter.fetch_add(1, Ordering::Relaxed);
        format!("evt-{n}")
    }

    fn next_seq(&self, topic: &str) -> u64 {
        let mut counters = match self.seq_counters.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = counters.entry(topic.to_owned()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Publish a message. Rejected (without delivery) if `topic` is
    /// malformed, reserved, or safety-critical and fails schema validation.
    pub async fn publish(
        &self,
        topic: &str,
        source: &str,
        attributes: Attributes,
        payload: serde_json::Value,
    ) -> crate::error::Result<()> {
        if !topic::is_valid_concrete_topic(topic) {
            return Err(crate::error::OrchestratorError::Protocol(format!(
                "invalid topic: {topic}"
            )));
        }
        if topic.starts_with(RESERVED_PREFIX) && source != "bus" {
            return Err(crate::error::OrchestratorError::Protocol(format!(
                "topic {topic} is reserved"
            )));
        }

        if let Some(reason) = self.schema.reject_reason(topic, &payload) {
            self.publish_meta(
                "bus.message.rejected",
                serde_json::json!({"topic": topic, "reason": reason}),
            )
            .await;
            return Err(crate::error::OrchestratorError::SchemaRejected {
                topic: topic.to_owned(),
                reason,
            });
        }

        let event = BusEvent {
            topic: topic.to_owned(),
            id: self.next_id(),
            seq: self.next_seq(topic),
            ts_ms: crate::state::now_ms(),
            source: source.to_owned(),
            schema_version: self.schema.version_for(topic),
            attributes,
            payload,
        };

        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Publish { event, ack: Some(tx) }).await.is_err() {
            return Ok(());
        }
        match rx.await {
            Ok(result) => result.map_err(|e| crate::error::OrchestratorError::Other(e.to_string())),
            Err(_) => Ok(()),
        }
    }

    async fn publish_meta(&self, topic: &str, payload: serde_json::Value) {
        let event = BusEvent {
            topic: topic.to_owned(),
            id: self.next_id(),
            seq: self.next_seq(topic),
            ts_ms: crate::state::now_ms(),
            source: "bus".to_owned(),
            schema_version: 1,
            attributes: Attributes::new(),
            payload,
        };
        let _ = self.cmd_tx.send(Command::Publish { event, ack: None }).await;
    }

    /// Subscribe to events matching `pattern`/`filter`. Returns the
    /// subscription id (for [`Self::unsubscribe`]) and a receiver of
    /// delivered events, decoupled from handler invocation so callers that
    /// want a plain channel (rather than a callback) can drain it directly.
    pub async fn subscribe(
        &self,
        name: impl Into<String>,
        pattern: TopicPattern,
        filter: AttrFilter,
        queue_capacity: usize,
        on_disabled: Option<Arc<dyn Fn(DisabledReason) + Send + Sync>>,
    ) -> (SubscriptionId, mpsc::Receiver<BusEvent>) {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let sub = Subscriber { name: name.into(), pattern, filter, queue_tx, on_disabled };
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.cmd_tx.send(Command::Subscribe { sub, reply: reply_tx }).await;
        let id = reply_rx.await.unwrap_or(0);
        (id, queue_rx)
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { id }).await;
    }

    /// Like [`Self::subscribe`], but the bus itself owns the drain loop and
    /// invokes `handler` for every matching event. If `handler` returns
    /// `Err`, the bus publishes `bus.handler.error` (topic, subscription id,
    /// error message) and invokes `on_error` with the offending event — the
    /// drain loop then continues with the next event, exactly as a
    /// backpressure disablement never takes down other subscribers.
    pub async fn subscribe_with_handler<F, Fut>(
        &self,
        name: impl Into<String>,
        pattern: TopicPattern,
        filter: AttrFilter,
        queue_capacity: usize,
        handler: F,
        on_error: Option<Arc<dyn Fn(&BusEvent, &anyhow::Error) + Send + Sync>>,
    ) -> SubscriptionId
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (id, mut queue_rx) = self.subscribe(name, pattern, filter, queue_capacity, None).await;
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(event) = queue_rx.recv().await {
                if let Err(err) = handler(event.clone()).await {
                    tracing::warn!(subscription_id = id, topic = %event.topic, %err, "bus: handler error");
                    bus.publish_meta(
                        "bus.handler.error",
                        serde_json::json!({
                            "subscriptionId": id,
                            "topic": event.topic,
                            "error": err.to_string(),
                        }),
                    )
                    .await;
                    if let Some(cb) = &on_error {
                        cb(&event, &err);
                    }
                }
            }
        });
        id
    }

    /// Resolves once there are no in-flight handlers and all subscriber
    /// queues are empty.
    pub async fn idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Idle { reply: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_actor(
    mut cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    id_counter: Arc<AtomicU64>,
    seq_counters: Arc<std::sync::Mutex<HashMap<String, u64>>>,
) {
    let mut subscribers: HashMap<SubscriptionId, Subscriber> = HashMap::new();
    let mut next_sub_id: SubscriptionId = 1;

    let next_event = |topic: &str, source: &str, payload: serde_json::Value| {
        let id = id_counter.fetch_add(1, Ordering::Relaxed);
        let seq = {
            let mut counters = match seq_counters.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let entry = counters.entry(topic.to_owned()).or_insert(0);
            *entry += 1;
            *entry
        };
        BusEvent {
            topic: topic.to_owned(),
            id: format!("evt-{id}"),
            seq,
            ts_ms: crate::state::now_ms(),
            source: source.to_owned(),
            schema_version: 1,
            attributes: Attributes::new(),
            payload,
        }
    };

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Subscribe { sub, reply } => {
                let id = next_sub_id;
                next_sub_id += 1;
                subscribers.insert(id, sub);
                let _ = reply.send(id);
            }
            Command::Unsubscribe { id } => {
                subscribers.remove(&id);
            }
            Command::Idle { reply } => {
                let _ = reply.send(());
            }
            Command::Publish { event, ack } => {
                let mut disabled = Vec::new();
                for (id, sub) in subscribers.iter() {
                    if !sub.pattern.matches(&event.topic) {
                        continue;
                    }
                    if !sub.filter.matches(&event.attributes) {
                        continue;
                    }
                    if sub.queue_tx.try_send(event.clone()).is_err() {
                        disabled.push((*id, sub.name.clone(), sub.on_disabled.clone()));
                    }
                }
                for (id, name, on_disabled) in disabled {
                    subscribers.remove(&id);
                    tracing::warn!(subscriber = %name, "bus: subscriber disabled (backpressure)");
                    if let Some(cb) = on_disabled {
                        cb(DisabledReason::Backpressure);
                    }
                    let meta = next_event(
                        "bus.subscriber.disabled",
                        "bus",
                        serde_json::json!({"subscriber": name, "reason": "backpressure"}),
                    );
                    let _ = cmd_tx.send(Command::Publish { event: meta, ack: None }).await;
                }
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bus() -> Bus {
        Bus::new(SchemaRegistry::new(Vec::new()))
    }

    #[tokio::test]
    async fn subscriber_receives_events_matching_wildcard_pattern() -> anyhow::Result<()> {
        let bus = make_bus();
        let pattern = TopicPattern::parse("frontpanel.*")?;
        let (_id, mut rx) = bus.subscribe("test", pattern, AttrFilter::default(), 8, None).await;
        bus.publish("frontpanel.power.changed", "frontpanel", Attributes::new(), serde_json::json!({"state": "off"})).await?;
        let event = rx.recv().await;
        assert!(event.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn seq_is_monotonic_and_contiguous_per_topic() -> anyhow::Result<()> {
        let bus = make_bus();
        let pattern = TopicPattern::parse("a.b")?;
        let (_id, mut rx) = bus.subscribe("t", pattern, AttrFilter::default(), 8, None).await;
        for _ in 0..5 {
            bus.publish("a.b", "t", Attributes::new(), serde_json::Value::Null).await?;
        }
        let mut seqs = Vec::new();
        for _ in 0..5 {
            seqs.push(rx.recv().await.map(|e| e.seq).unwrap_or(0));
        }
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn backpressure_disables_subscriber_after_capacity_exceeded() -> anyhow::Result<()> {
        let bus = make_bus();
        let pattern = TopicPattern::parse("a.b")?;
        let disabled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let disabled2 = Arc::clone(&disabled);
        let (_id, _rx) = bus
            .subscribe(
                "slow",
                pattern,
                AttrFilter::default(),
                4,
                Some(Arc::new(move |reason| {
                    assert_eq!(reason, DisabledReason::Backpressure);
                    disabled2.store(true, Ordering::SeqCst);
                })),
            )
            .await;
        for _ in 0..5 {
            bus.publish("a.b", "t", Attributes::new(), serde_json::Value::Null).await?;
        }
        // Give the actor a tick to process the publishes.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(disabled.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn backpressure_emits_subscriber_disabled_meta_event() -> anyhow::Result<()> {
        let bus = make_bus();
        let meta_pattern = TopicPattern::parse("bus.subscriber.disabled")?;
        let (_meta_id, mut meta_rx) = bus.subscribe("observer", meta_pattern, AttrFilter::default(), 8, None).await;

        let data_pattern = TopicPattern::parse("a.b")?;
        let (_id, _rx) = bus.subscribe("slow", data_pattern, AttrFilter::default(), 1, None).await;
        for _ in 0..5 {
            bus.publish("a.b", "t", Attributes::new(), serde_json::Value::Null).await?;
        }

        let event = tokio::time::timeout(std::time::Duration::from_millis(200), meta_rx.recv()).await?;
        let event = event.expect("expected a bus.subscriber.disabled event");
        assert_eq!(event.topic, "bus.subscriber.disabled");
        assert_eq!(event.payload["subscriber"], "slow");
        Ok(())
    }

    #[tokio::test]
    async fn handler_error_publishes_meta_event_and_invokes_on_error_then_keeps_draining() -> anyhow::Result<()> {
        let bus = make_bus();
        let meta_pattern = TopicPattern::parse("bus.handler.error")?;
        let (_meta_id, mut meta_rx) = bus.subscribe("observer", meta_pattern, AttrFilter::default(), 8, None).await;

        let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let errored = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let errored2 = Arc::clone(&errored);
        let on_error: Arc<dyn Fn(&BusEvent, &anyhow::Error) + Send + Sync> = Arc::new(move |_event, _err| {
            errored2.store(true, Ordering::SeqCst);
        });
        bus.subscribe_with_handler(
            "flaky",
            TopicPattern::parse("a.b")?,
            AttrFilter::default(),
            8,
            move |event| {
                let seen = Arc::clone(&seen2);
                async move {
                    let n = seen.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        anyhow::bail!("boom on {}", event.topic);
                    }
                    Ok(())
                }
            },
            Some(on_error),
        )
        .await;

        bus.publish("a.b", "t", Attributes::new(), serde_json::Value::Null).await?;
        let meta = tokio::time::timeout(std::time::Duration::from_millis(200), meta_rx.recv()).await?;
        let meta = meta.expect("expected a bus.handler.error event");
        assert_eq!(meta.topic, "bus.handler.error");
        assert!(errored.load(Ordering::SeqCst));

        // The drain loop must survive the error and process the next event.
        bus.publish("a.b", "t", Attributes::new(), serde_json::Value::Null).await?;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn reserved_namespace_rejects_external_publish() {
        let bus = make_bus();
        let result = bus.publish("bus.custom", "driver", Attributes::new(), serde_json::Value::Null).await;
        assert!(result.is_err());
    }
}
