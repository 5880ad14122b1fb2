//! Metrics sink contract and its Prometheus implementation

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

pub const REQUESTS_TOTAL: &str = "lift_client_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "lift_client_request_duration_seconds";
pub const ERRORS_TOTAL: &str = "lift_client_errors_total";
pub const IN_FLIGHT: &str = "lift_client_in_flight";

/// Destination for client counters, histograms and gauges.
///
/// Labels are `(name, value)` pairs; a metric is always recorded with the same
/// label names.
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Prometheus-backed sink; metric vectors are registered on first use
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
    counters: Arc<Mutex<HashMap<String, CounterVec>>>,
    histograms: Arc<Mutex<HashMap<String, HistogramVec>>>,
    gauges: Arc<Mutex<HashMap<String, GaugeVec>>>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Register metrics into an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            counters: Arc::new(Mutex::new(HashMap::new())),
            histograms: Arc::new(Mutex::new(HashMap::new())),
            gauges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    fn register<M>(&self, name: &str, metric: prometheus::Result<M>) -> Option<M>
    where
        M: prometheus::core::Collector + Clone + 'static,
    {
        match metric.and_then(|m| self.registry.register(Box::new(m.clone())).map(|_| m)) {
            Ok(metric) => Some(metric),
            Err(e) => {
                warn!("Failed to register metric {}: {}", name, e);
                None
            }
        }
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn split_labels<'a>(labels: &'a [(&'a str, &'a str)]) -> (Vec<&'a str>, Vec<&'a str>) {
    labels.iter().copied().unzip()
}

impl MetricsSink for PrometheusMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let (names, values) = split_labels(labels);
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        if !counters.contains_key(name) {
            let created = CounterVec::new(Opts::new(name, name), &names);
            match self.register(name, created) {
                Some(vec) => {
                    counters.insert(name.to_string(), vec);
                }
                None => return,
            }
        }
        if let Some(counter) = counters
            .get(name)
            .and_then(|vec| vec.get_metric_with_label_values(&values).ok())
        {
            counter.inc();
        }
    }

    fn observe_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let (names, values) = split_labels(labels);
        let mut histograms = self.histograms.lock().unwrap_or_else(PoisonError::into_inner);
        if !histograms.contains_key(name) {
            let created = HistogramVec::new(HistogramOpts::new(name, name), &names);
            match self.register(name, created) {
                Some(vec) => {
                    histograms.insert(name.to_string(), vec);
                }
                None => return,
            }
        }
        if let Some(histogram) = histograms
            .get(name)
            .and_then(|vec| vec.get_metric_with_label_values(&values).ok())
        {
            histogram.observe(value);
        }
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let (names, values) = split_labels(labels);
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        if !gauges.contains_key(name) {
            let created = GaugeVec::new(Opts::new(name, name), &names);
            match self.register(name, created) {
                Some(vec) => {
                    gauges.insert(name.to_string(), vec);
                }
                None => return,
            }
        }
        if let Some(gauge) = gauges
            .get(name)
            .and_then(|vec| vec.get_metric_with_label_values(&values).ok())
        {
            gauge.set(value);
        }
    }
}
