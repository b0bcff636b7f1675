use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram series for quantiles. Count and sum
/// cover every observation ever made.
pub const HISTOGRAM_WINDOW: usize = 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Histogram,
}

/// Point-in-time value of one metric series.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

/// Filter applied to [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    /// Series must carry every one of these label pairs.
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Reservoir {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    window: VecDeque<f64>,
}

impl Reservoir {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        if self.window.len() == HISTOGRAM_WINDOW {
            let _ = self.window.pop_front();
        }
        self.window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        if self.count == 0 {
            return HistogramSummary::default();
        }
        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let quantile = |q: f64| {
            let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
            sorted[idx]
        };
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            p50: quantile(0.50),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

/// Metric name plus labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: serde_json::Map<String, serde_json::Value> = self
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::to_string(&map).ok()
    }

    fn matches(&self, q: &MetricsQuery) -> bool {
        if q.name.as_deref().is_some_and(|n| n != self.name) {
            return false;
        }
        q.labels.as_ref().map_or(true, |wanted| {
            wanted
                .iter()
                .all(|(k, v)| self.labels.iter().any(|(lk, lv)| lk == k && lv == v))
        })
    }
}

/// Run `f` on the series for `key`, creating it on first use. The common
/// path only takes the read lock.
fn with_series<T: Default>(map: &RwLock<HashMap<SeriesKey, T>>, key: SeriesKey, f: impl FnOnce(&T)) {
    if let Some(series) = map.read().get(&key) {
        f(series);
        return;
    }
    let mut map = map.write();
    f(map.entry(key).or_default());
}

/// Thread-safe in-process metrics recorder shared by every component of a
/// node.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<SeriesKey, AtomicU64>>,
    histograms: RwLock<HashMap<SeriesKey, Mutex<Reservoir>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        with_series(&self.counters, SeriesKey::new(name, labels), |c| {
            let _ = c.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        with_series(&self.histograms, SeriesKey::new(name, labels), |h| {
            h.lock().observe(value);
        });
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .read()
            .get(&SeriesKey::new(name, labels))
            .map(|h| h.lock().summary())
            .unwrap_or_default()
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&SeriesKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Sum of a counter across every label combination.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Current value of every series matching the query, sorted by name then
    /// labels. Histograms report their p50.
    pub fn snapshot(&self, q: &MetricsQuery) -> Vec<MetricsSnapshot> {
        let now = Utc::now().to_rfc3339();
        let entry = |key: &SeriesKey, value: f64, metric_type: MetricType| MetricsSnapshot {
            timestamp: now.clone(),
            name: key.name.clone(),
            value,
            labels: key.labels_json(),
            metric_type,
        };

        let mut out: Vec<MetricsSnapshot> = self
            .counters
            .read()
            .iter()
            .filter(|(k, _)| k.matches(q))
            .map(|(k, c)| entry(k, c.load(Ordering::Relaxed) as f64, MetricType::Counter))
            .collect();
        out.extend(
            self.histograms
                .read()
                .iter()
                .filter(|(k, _)| k.matches(q))
                .map(|(k, h)| entry(k, h.lock().summary().p50, MetricType::Histogram)),
        );

        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_per_label_set() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("backplane_replays_total", &[("recipient", "all")], 1);
        recorder.counter_inc("backplane_replays_total", &[("recipient", "all")], 1);
        recorder.counter_inc("backplane_replays_total", &[("recipient", "group")], 1);

        assert_eq!(
            recorder.counter_get("backplane_replays_total", &[("recipient", "all")]),
            2
        );
        assert_eq!(
            recorder.counter_get("backplane_replays_total", &[("recipient", "user")]),
            0
        );
        assert_eq!(recorder.counter_total("backplane_replays_total"), 3);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("dropped", &[("reason", "self"), ("hub", "chat")], 1);
        recorder.counter_inc("dropped", &[("hub", "chat"), ("reason", "self")], 1);
        assert_eq!(
            recorder.counter_get("dropped", &[("hub", "chat"), ("reason", "self")]),
            2
        );
    }

    #[test]
    fn histogram_summary_tracks_extremes() {
        let recorder = MetricsRecorder::new();
        for v in 1..=100 {
            recorder.histogram_observe("backplane_replay_duration_ms", &[], v as f64);
        }

        let summary = recorder.histogram_summary("backplane_replay_duration_ms", &[]);
        assert_eq!(summary.count, 100);
        assert_eq!(summary.sum, 5050.0);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.p50, 51.0);
        assert_eq!(summary.p99, 100.0);
    }

    #[test]
    fn histogram_window_is_bounded() {
        let recorder = MetricsRecorder::new();
        for _ in 0..HISTOGRAM_WINDOW {
            recorder.histogram_observe("latency", &[], 1000.0);
        }
        for _ in 0..HISTOGRAM_WINDOW {
            recorder.histogram_observe("latency", &[], 1.0);
        }

        let summary = recorder.histogram_summary("latency", &[]);
        assert_eq!(summary.count, 2 * HISTOGRAM_WINDOW as u64);
        assert_eq!(summary.max, 1000.0);
        // Quantiles only see the most recent window.
        assert_eq!(summary.p99, 1.0);
    }

    #[test]
    fn missing_histogram_is_empty() {
        let summary = MetricsRecorder::new().histogram_summary("nonexistent", &[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.sum, 0.0);
    }

    #[test]
    fn snapshot_filters_by_name_and_labels() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("dropped", &[("reason", "self")], 3);
        recorder.counter_inc("dropped", &[("reason", "decode")], 1);
        recorder.histogram_observe("latency", &[], 4.0);

        assert_eq!(recorder.snapshot(&MetricsQuery::default()).len(), 3);

        let selfs = recorder.snapshot(&MetricsQuery {
            name: Some("dropped".into()),
            labels: Some(HashMap::from([("reason".to_string(), "self".to_string())])),
        });
        assert_eq!(selfs.len(), 1);
        assert_eq!(selfs[0].value, 3.0);
        assert_eq!(selfs[0].metric_type, MetricType::Counter);
        assert_eq!(selfs[0].labels.as_deref(), Some(r#"{"reason":"self"}"#));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let recorder = Arc::new(MetricsRecorder::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let r = recorder.clone();
                let _ = scope.spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("backplane_envelopes_received_total", &[], 1);
                    }
                });
            }
        });
        assert_eq!(recorder.counter_get("backplane_envelopes_received_total", &[]), 8000);
    }
}
