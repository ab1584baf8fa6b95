//! Metrics sink: counters, gauges, histograms with labels.
//!
//! Components report through the [`MetricsSink`] trait; the in-process
//! [`MetricsRegistry`] aggregates and renders Prometheus text exposition
//! for `GET /metrics`.

use std::collections::BTreeMap;
use std::sync::RwLock;

/// Destination for operational metrics. Invoked everywhere, owns nothing.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)], value: u64);
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)], _value: u64) {}
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
    fn observe_histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

/// In-process metrics aggregation.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<SeriesKey, u64>>,
    gauges: RwLock<BTreeMap<SeriesKey, f64>>,
    histograms: RwLock<BTreeMap<SeriesKey, Vec<f64>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn render(&self) -> String {
        if self.labels.is_empty() {
            self.name.clone()
        } else {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect();
            format!("{}{{{}}}", self.name, labels.join(","))
        }
    }
}

/// Summary statistics over a histogram series.
#[derive(Debug, Clone)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&SeriesKey::new(name, labels))
            .copied()
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&SeriesKey::new(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramStats> {
        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        histograms.get(&SeriesKey::new(name, labels)).map(|values| {
            let mut sorted = values.clone();
            // NaN-safe ordering
            sorted.sort_by(|a, b| a.total_cmp(b));
            HistogramStats {
                count: sorted.len() as u64,
                sum: sorted.iter().sum(),
                p50: percentile(&sorted, 0.50),
                p95: percentile(&sorted, 0.95),
                p99: percentile(&sorted, 0.99),
            }
        })
    }

    /// Render all series as Prometheus text exposition.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        for (key, value) in self.counters.read().unwrap_or_else(|e| e.into_inner()).iter() {
            out.push_str(&format!("# TYPE {} counter\n", key.name));
            out.push_str(&format!("{} {}\n", key.render(), value));
        }

        for (key, value) in self.gauges.read().unwrap_or_else(|e| e.into_inner()).iter() {
            out.push_str(&format!("# TYPE {} gauge\n", key.name));
            out.push_str(&format!("{} {}\n", key.render(), value));
        }

        let histograms = self.histograms.read().unwrap_or_else(|e| e.into_inner());
        for (key, values) in histograms.iter() {
            let mut sorted = values.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let sum: f64 = sorted.iter().sum();
            out.push_str(&format!("# TYPE {} histogram\n", key.name));
            out.push_str(&format!("{}_count {}\n", key.render(), sorted.len()));
            out.push_str(&format!("{}_sum {}\n", key.render(), sum));
            out.push_str(&format!("{}_p50 {}\n", key.render(), percentile(&sorted, 0.50)));
            out.push_str(&format!("{}_p95 {}\n", key.render(), percentile(&sorted, 0.95)));
            out.push_str(&format!("{}_p99 {}\n", key.render(), percentile(&sorted, 0.99)));
        }

        out
    }
}

impl MetricsSink for MetricsRegistry {
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let mut counters = self.counters.write().unwrap_or_else(|e| e.into_inner());
        *counters.entry(SeriesKey::new(name, labels)).or_insert(0) += value;
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut gauges = self.gauges.write().unwrap_or_else(|e| e.into_inner());
        gauges.insert(SeriesKey::new(name, labels), value);
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut histograms = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        histograms
            .entry(SeriesKey::new(name, labels))
            .or_default()
            .push(value);
    }
}
