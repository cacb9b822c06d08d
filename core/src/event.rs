// Event bus implementation
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// OpenTelemetry imports
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};

/// Delivery priority hint carried in event metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Metadata attached to every event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<EventPriority>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_manager_id: Option<String>,
}

/// Event envelope published on the bus.
///
/// Events are transient: nothing on the bus is durable, and subscribers
/// that fall behind lose events rather than stalling publishers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            data,
            metadata: EventMetadata {
                timestamp: Utc::now(),
                session_id: None,
                source: None,
                priority: None,
                tags: Vec::new(),
                event_manager_id: None,
            },
        }
    }

    /// Scope the event to a session; session-level subscribers for that id
    /// will receive it in addition to service-level subscribers.
    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.metadata.session_id = Some(session_id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.metadata.priority = Some(priority);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }
}

/// Event handler trait for push-style consumers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<()>;
}

/// Subscription information
#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    event_types: Vec<String>,
    sender: mpsc::Sender<Event>,
}

impl Subscription {
    fn matches(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

/// Event bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub dropped_events: u64,
    pub active_subscriptions: usize,
}

const SUBSCRIPTION_QUEUE_CAP: usize = 1024;

/// Dual-scope event bus.
///
/// Holds two subscription maps: a process-scoped service map and a
/// session-scoped map keyed by session id. Fan-out never blocks the
/// publisher; a subscriber whose queue is full loses the event.
pub struct EventBus {
    service_subs: DashMap<String, Subscription>,
    session_subs: DashMap<String, Vec<Subscription>>,
    stats: DashMap<&'static str, EventBusStats>,

    // OpenTelemetry metrics
    published_counter: Counter<u64>,
    delivered_counter: Counter<u64>,
    dropped_counter: Counter<u64>,
    publish_latency: Histogram<f64>,
}

impl EventBus {
    pub fn new() -> Self {
        let meter = global::meter("matrix.event_bus");

        let published_counter = meter
            .u64_counter("matrix.event_bus.published_total")
            .with_description("Total number of events published")
            .init();

        let delivered_counter = meter
            .u64_counter("matrix.event_bus.delivered_total")
            .with_description("Total number of events delivered to subscribers")
            .init();

        let dropped_counter = meter
            .u64_counter("matrix.event_bus.dropped_total")
            .with_description("Total number of events dropped")
            .init();

        let publish_latency = meter
            .f64_histogram("matrix.event_bus.publish_latency_ms")
            .with_description("Event publish latency in milliseconds")
            .init();

        Self {
            service_subs: DashMap::new(),
            session_subs: DashMap::new(),
            stats: DashMap::new(),
            published_counter,
            delivered_counter,
            dropped_counter,
            publish_latency,
        }
    }

    /// Publish an event. Service-level subscribers always see it; if the
    /// event carries a session id, that session's subscribers see it too.
    pub fn publish(&self, event: Event) -> usize {
        let start_time = Instant::now();
        debug!(target: "event_bus", event_id = %event.id, event_type = %event.event_type, "Publishing event");

        self.published_counter.add(
            1,
            &[KeyValue::new("event_type", event.event_type.clone())],
        );

        let mut delivered: u64 = 0;
        let mut dropped: u64 = 0;

        for entry in self.service_subs.iter() {
            let sub = entry.value();
            if !sub.matches(&event.event_type) {
                continue;
            }
            if sub.sender.try_send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
                warn!(target: "event_bus", subscription = %sub.id, "Dropped event for slow service subscriber");
            }
        }

        if let Some(session_id) = event.metadata.session_id.as_deref() {
            if let Some(subs) = self.session_subs.get(session_id) {
                for sub in subs.value() {
                    if !sub.matches(&event.event_type) {
                        continue;
                    }
                    if sub.sender.try_send(event.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dropped += 1;
                        warn!(target: "event_bus", subscription = %sub.id, session = %session_id, "Dropped event for slow session subscriber");
                    }
                }
            }
        }

        self.update_stats(|stats| {
            stats.total_published += 1;
            stats.total_delivered += delivered;
            stats.dropped_events += dropped;
        });

        if delivered > 0 {
            self.delivered_counter.add(
                delivered,
                &[KeyValue::new("event_type", event.event_type.clone())],
            );
        }
        if dropped > 0 {
            self.dropped_counter.add(
                dropped,
                &[
                    KeyValue::new("event_type", event.event_type.clone()),
                    KeyValue::new("reason", "queue_full"),
                ],
            );
        }

        let elapsed_ms = start_time.elapsed().as_secs_f64() * 1000.0;
        self.publish_latency.record(elapsed_ms, &[]);

        delivered as usize
    }

    /// Subscribe at service scope, with an optional event type filter
    /// (empty filter = everything).
    pub fn subscribe(&self, event_types: Vec<String>) -> (String, mpsc::Receiver<Event>) {
        let subscription_id = format!("svc_{}", uuid::Uuid::new_v4());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAP);

        self.service_subs.insert(
            subscription_id.clone(),
            Subscription {
                id: subscription_id.clone(),
                event_types,
                sender: tx,
            },
        );
        self.update_stats(|stats| stats.active_subscriptions += 1);

        debug!(target: "event_bus", subscription = %subscription_id, "Created service subscription");
        (subscription_id, rx)
    }

    /// Subscribe to events scoped to one session id.
    pub fn subscribe_session(
        &self,
        session_id: impl Into<String>,
        event_types: Vec<String>,
    ) -> (String, mpsc::Receiver<Event>) {
        let session_id = session_id.into();
        let subscription_id = format!("ses_{}_{}", session_id, uuid::Uuid::new_v4());
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAP);

        self.session_subs
            .entry(session_id)
            .or_default()
            .push(Subscription {
                id: subscription_id.clone(),
                event_types,
                sender: tx,
            });
        self.update_stats(|stats| stats.active_subscriptions += 1);

        (subscription_id, rx)
    }

    /// Remove a subscription from either map.
    pub fn unsubscribe(&self, subscription_id: &str) {
        let mut removed = self.service_subs.remove(subscription_id).is_some();
        if !removed {
            for mut entry in self.session_subs.iter_mut() {
                let before = entry.value().len();
                entry.value_mut().retain(|sub| sub.id != subscription_id);
                if entry.value().len() != before {
                    removed = true;
                    break;
                }
            }
        }
        if removed {
            self.update_stats(|stats| {
                stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
            });
        }
    }

    /// Drop all subscriptions for a session (called on disconnect).
    pub fn remove_session(&self, session_id: &str) {
        if let Some((_, subs)) = self.session_subs.remove(session_id) {
            self.update_stats(|stats| {
                stats.active_subscriptions =
                    stats.active_subscriptions.saturating_sub(subs.len());
            });
        }
    }

    /// Spawn a task that feeds every matching event to a handler.
    /// The handler runs off the publishing thread; its errors are logged.
    pub fn attach_handler(
        &self,
        event_types: Vec<String>,
        handler: Arc<dyn EventHandler>,
    ) -> String {
        let (id, mut rx) = self.subscribe(event_types);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler.handle(event).await {
                    warn!(target: "event_bus", error = %e, "Event handler failed");
                }
            }
        });
        id
    }

    pub fn stats(&self) -> EventBusStats {
        self.stats
            .get("bus")
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }

    pub fn shutdown(&self) {
        debug!(target: "event_bus", "Event bus shutting down");
        self.service_subs.clear();
        self.session_subs.clear();
    }

    fn update_stats<F: FnOnce(&mut EventBusStats)>(&self, f: F) {
        let mut entry = self.stats.entry("bus").or_default();
        f(entry.value_mut());
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
