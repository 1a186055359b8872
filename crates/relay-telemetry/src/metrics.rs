use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Broadcast rounds started.
pub const ROUNDS_TOTAL: &str = "relay_rounds_total";
/// Envelopes handed to a peer connection.
pub const ENVELOPES_SENT_TOTAL: &str = "relay_envelopes_sent_total";
/// Envelope writes that failed and tore down a session.
pub const SEND_FAILURES_TOTAL: &str = "relay_send_failures_total";
/// Acks matched to an outstanding round.
pub const ACKS_TOTAL: &str = "relay_acks_total";
/// Rounds whose deadline passed without an ack.
pub const ACKS_MISSED_TOTAL: &str = "relay_acks_missed_total";
/// Sessions currently registered on the hub.
pub const CONNECTED_PEERS: &str = "relay_connected_peers";
/// Time from send to ack, in milliseconds.
pub const ACK_LATENCY_MS: &str = "relay_ack_latency_ms";

/// Observations kept per histogram; older ones are dropped first.
const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
}

/// Summary statistics over the retained histogram window.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Histogram {
    window: Mutex<VecDeque<f64>>,
}

impl Histogram {
    fn observe(&self, value: f64) {
        let mut window = self.window.lock();
        if window.len() == HISTOGRAM_WINDOW {
            let _ = window.pop_front();
        }
        window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let mut sorted: Vec<f64> = self.window.lock().iter().copied().collect();
        if sorted.is_empty() {
            return HistogramSummary::default();
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: sorted.iter().sum(),
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Series key: name plus labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }
}

/// Thread-safe in-process metrics store.
///
/// Nothing is exported; callers read values back or take a [`snapshot`].
///
/// [`snapshot`]: MetricsRecorder::snapshot
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    gauges: RwLock<HashMap<MetricKey, AtomicI64>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            let _ = c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        let _ = self
            .counters
            .write()
            .entry(key)
            .or_default()
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            g.store(value, Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .entry(key)
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.load(Ordering::Relaxed))
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms.write().entry(key).or_default().observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Current value of every series. Histograms report their p50.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let timestamp = Utc::now().to_rfc3339();
        let mut out = Vec::new();

        for (key, c) in self.counters.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: timestamp.clone(),
                name: key.name.clone(),
                value: c.load(Ordering::Relaxed) as f64,
                labels: key.labels.clone(),
                metric_type: MetricType::Counter,
            });
        }
        for (key, g) in self.gauges.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: timestamp.clone(),
                name: key.name.clone(),
                value: g.load(Ordering::Relaxed) as f64,
                labels: key.labels.clone(),
                metric_type: MetricType::Gauge,
            });
        }
        for (key, h) in self.histograms.read().iter() {
            out.push(MetricsSnapshot {
                timestamp: timestamp.clone(),
                name: key.name.clone(),
                value: h.summary().p50,
                labels: key.labels.clone(),
                metric_type: MetricType::Histogram,
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
