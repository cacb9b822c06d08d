// Telemetry and observability
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::event::{Event, EventBus};

/// Initialize the tracing subscriber (EnvFilter + fmt layer).
///
/// `RUST_LOG` controls the filter; defaults to `info`. Safe to call once
/// per process; a second call returns an error from the subscriber, which
/// is swallowed so tests can call it freely.
pub fn init_telemetry() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    info!(target: "telemetry", "Telemetry initialized");
}

/// Bounded reservoir backing one histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistogramData {
    pub count: u64,
    pub sum: f64,
    values: Vec<f64>,
}

const HISTOGRAM_RESERVOIR: usize = 10_000;

impl HistogramData {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.values.len() >= HISTOGRAM_RESERVOIR {
            self.values.remove(0);
        }
        self.values.push(value);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn p99(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((sorted.len() as f64) * 0.99) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }
}

/// Point-in-time snapshot of all counters and histograms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramData>,
}

/// In-process metrics collector.
///
/// Consumes bus events into counters and histograms; nothing is exported
/// automatically. `snapshot()` feeds the render functions below.
pub struct MetricsCollector {
    counters: DashMap<String, u64>,
    histograms: DashMap<String, HistogramData>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            histograms: DashMap::new(),
        }
    }

    pub fn increment(&self, name: &str) {
        *self.counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn record(&self, name: &str, value: f64) {
        self.histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    /// Map one bus event onto the counter/histogram set.
    pub fn observe(&self, event: &Event) {
        let duration_ms = event
            .data
            .get("duration_ms")
            .and_then(|v| v.as_f64());

        match event.event_type.as_str() {
            "tool:executed" => {
                self.increment("toolExecutionCount");
                if let Some(ms) = duration_ms {
                    self.record("toolExecutionDuration", ms);
                }
            }
            "tool:failed" => {
                self.increment("toolExecutionCount");
                self.increment("toolExecutionErrorCount");
            }
            "llm:responseCompleted" => self.increment("llmResponseCount"),
            "llm:responseError" => self.increment("llmResponseErrorCount"),
            "llm:thinking" => self.increment("llmThinkingCount"),
            "memory:searchCompleted" => {
                self.increment("memorySearchCount");
                if let Some(ms) = duration_ms {
                    self.record("memorySearchDuration", ms);
                }
            }
            "memory:operationFailed" => self.increment("memoryOperationFailedCount"),
            "reflection:stored" => self.increment("reflectionStoredCount"),
            _ => debug!(target: "telemetry", event_type = %event.event_type, "Unmapped event type"),
        }
    }

    /// Subscribe to the bus and consume every event into this collector.
    /// The consumer task lives for the life of the receiver.
    pub fn attach(collector: &Arc<Self>, bus: &EventBus) {
        let (_, mut rx) = bus.subscribe(Vec::new());
        let collector = Arc::clone(collector);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                collector.observe(&event);
            }
        });
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v.value()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snap = MetricsSnapshot::default();
        for entry in self.counters.iter() {
            snap.counters.insert(entry.key().clone(), *entry.value());
        }
        for entry in self.histograms.iter() {
            snap.histograms
                .insert(entry.key().clone(), entry.value().clone());
        }
        snap
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// ==============================================================================
// Exporters
// ==============================================================================

/// Render a snapshot in Prometheus exposition format.
pub fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();
    for (name, value) in &snapshot.counters {
        let metric = prometheus_name(name);
        out.push_str(&format!("# TYPE matrix_{metric} counter\n"));
        out.push_str(&format!("matrix_{metric} {value}\n"));
    }
    for (name, hist) in &snapshot.histograms {
        let metric = prometheus_name(name);
        out.push_str(&format!("# TYPE matrix_{metric}_ms summary\n"));
        out.push_str(&format!("matrix_{metric}_ms_count {}\n", hist.count));
        out.push_str(&format!("matrix_{metric}_ms_sum {}\n", hist.sum));
        out.push_str(&format!(
            "matrix_{metric}_ms{{quantile=\"0.99\"}} {}\n",
            hist.p99()
        ));
    }
    out
}

/// Render a snapshot as a JSON value.
pub fn render_json(snapshot: &MetricsSnapshot) -> serde_json::Value {
    let histograms: BTreeMap<&String, serde_json::Value> = snapshot
        .histograms
        .iter()
        .map(|(name, hist)| {
            (
                name,
                serde_json::json!({
                    "count": hist.count,
                    "sum_ms": hist.sum,
                    "avg_ms": hist.avg(),
                    "p99_ms": hist.p99(),
                }),
            )
        })
        .collect();
    serde_json::json!({
        "counters": snapshot.counters,
        "histograms": histograms,
    })
}

fn prometheus_name(name: &str) -> String {
    // camelCase -> snake_case
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
