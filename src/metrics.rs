//! Pipeline timing metrics.
//! Every activation stage records into a bounded window of recent samples;
//! summaries report p50/p95/p99 in microseconds.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// Started at a stage boundary; `finish` records the elapsed time.
/// Dropping an unfinished span records nothing, so failed stages stay out
/// of the histogram.
pub struct TimingSpan {
    metric: &'static str,
    started: Instant,
    sink: Arc<MetricsRegistry>,
}

impl TimingSpan {
    pub fn finish(self) -> f64 {
        let us = self.started.elapsed().as_micros() as f64;
        self.sink.record(self.metric, us);
        us
    }
}

/// The most recent `limit` samples of one metric.
struct Window {
    values: VecDeque<f64>,
    limit: usize,
}

impl Window {
    fn with_limit(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            values: VecDeque::with_capacity(limit),
            limit,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.limit {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    fn sorted(&self) -> Vec<f64> {
        let mut v: Vec<f64> = self.values.iter().copied().collect();
        v.sort_by(f64::total_cmp);
        v
    }
}

/// Nearest-rank percentile over an ascending slice.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => {
            let rank = ((p / 100.0) * (n - 1) as f64).round() as usize;
            sorted[rank.min(n - 1)]
        }
    }
}

pub struct MetricsRegistry {
    windows: Mutex<HashMap<&'static str, Window>>,
    window_len: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(window_len: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_len,
        }
    }

    pub fn record(&self, metric: &'static str, value_us: f64) {
        let len = self.window_len;
        self.windows
            .lock()
            .entry(metric)
            .or_insert_with(|| Window::with_limit(len))
            .push(value_us);
        debug!(metric, value_us, "metric_recorded");
    }

    pub fn span(self: &Arc<Self>, metric: &'static str) -> TimingSpan {
        TimingSpan {
            metric,
            started: Instant::now(),
            sink: Arc::clone(self),
        }
    }

    pub fn count(&self, metric: &str) -> usize {
        self.windows.lock().get(metric).map_or(0, |w| w.values.len())
    }

    /// `p` in 0-100, microseconds; 0 for an unknown metric.
    pub fn percentile(&self, metric: &str, p: f64) -> f64 {
        self.windows
            .lock()
            .get(metric)
            .map_or(0.0, |w| nearest_rank(&w.sorted(), p))
    }

    pub fn summary(&self) -> HashMap<String, MetricSummary> {
        let windows = self.windows.lock();
        let mut out = HashMap::with_capacity(windows.len());
        for (metric, window) in windows.iter() {
            let sorted = window.sorted();
            out.insert(
                metric.to_string(),
                MetricSummary {
                    p50_us: nearest_rank(&sorted, 50.0),
                    p95_us: nearest_rank(&sorted, 95.0),
                    p99_us: nearest_rank(&sorted, 99.0),
                    count: sorted.len(),
                },
            );
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub count: usize,
}

pub mod metric_names {
    pub const LOCATION_ACQUIRED: &str = "t_location_acquired";
    pub const ENRICHMENT_DONE: &str = "t_enrichment_done";
    pub const ALERT_SENT: &str = "t_alert_sent";
    pub const FOLLOWUP_SENT: &str = "t_followup_sent";
    pub const EVIDENCE_UPLOADED: &str = "t_evidence_uploaded";
    pub const TRIGGER_TO_ALERT: &str = "t_trigger_to_alert";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn percentiles_over_recorded_samples() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.record(metric_names::ALERT_SENT, v as f64);
        }
        assert_eq!(registry.percentile(metric_names::ALERT_SENT, 50.0), 51.0);
        assert_eq!(registry.percentile(metric_names::ALERT_SENT, 99.0), 99.0);
        assert_eq!(registry.count(metric_names::ALERT_SENT), 100);
        assert_eq!(registry.percentile("missing", 50.0), 0.0);
    }

    #[test]
    fn window_keeps_most_recent_samples() {
        let registry = MetricsRegistry::with_capacity(4);
        for v in [1.0, 2.0, 3.0, 4.0, 100.0, 100.0, 100.0, 100.0] {
            registry.record(metric_names::ENRICHMENT_DONE, v);
        }
        let summary = registry.summary();
        let s = &summary[metric_names::ENRICHMENT_DONE];
        assert_eq!(s.count, 4);
        assert_eq!(s.p50_us, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn span_records_on_finish_only() {
        let registry = Arc::new(MetricsRegistry::new());
        let span = registry.span(metric_names::LOCATION_ACQUIRED);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(span.finish(), 250_000.0);

        drop(registry.span(metric_names::LOCATION_ACQUIRED));
        assert_eq!(registry.count(metric_names::LOCATION_ACQUIRED), 1);
    }
}
