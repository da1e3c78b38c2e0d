use crate::clock::{system_clock, SharedClock};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};

pub const DEFAULT_SERIES_CAPACITY: usize = 1000;

pub type Labels = BTreeMap<String, String>;

pub fn labels(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Aggregate {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl Aggregate {
    fn from_values(values: impl Iterator<Item = f64>) -> Self {
        let mut agg = Aggregate {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            ..Default::default()
        };
        for v in values {
            agg.count += 1;
            agg.sum += v;
            agg.min = agg.min.min(v);
            agg.max = agg.max.max(v);
        }
        if agg.count == 0 {
            return Aggregate::default();
        }
        agg.avg = agg.sum / agg.count as f64;
        agg
    }
}

/// Per-name time series, each capped to the most recent `capacity` points.
pub struct MetricsStore {
    series: RwLock<HashMap<String, VecDeque<Metric>>>,
    help: RwLock<HashMap<String, String>>,
    capacity: usize,
    clock: SharedClock,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, system_clock())
    }

    pub fn with_clock(capacity: usize, clock: SharedClock) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            help: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn record(&self, name: &str, value: f64, labels: Labels) -> Metric {
        let metric = Metric {
            name: name.to_string(),
            value,
            labels,
            timestamp: self.clock.now(),
        };

        let mut series = self.series.write();
        let points = series.entry(name.to_string()).or_default();
        points.push_back(metric.clone());
        while points.len() > self.capacity {
            points.pop_front();
        }

        metric
    }

    /// Help text used by the Prometheus exporter.
    pub fn describe(&self, name: &str, help: &str) {
        self.help.write().insert(name.to_string(), help.to_string());
    }

    pub fn help_for(&self, name: &str) -> Option<String> {
        self.help.read().get(name).cloned()
    }

    pub fn series(&self, name: &str) -> Vec<Metric> {
        self.series
            .read()
            .get(name)
            .map(|points| points.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Points of `name` with `from <= timestamp <= to`.
    pub fn range(&self, name: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Metric> {
        self.series
            .read()
            .get(name)
            .map(|points| {
                points
                    .iter()
                    .filter(|m| m.timestamp >= from && m.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Statistics over the points recorded within the last `interval`.
    pub fn aggregate(&self, name: &str, interval: Duration) -> Aggregate {
        let since = self.clock.now() - interval;
        let series = self.series.read();
        match series.get(name) {
            Some(points) => Aggregate::from_values(
                points
                    .iter()
                    .filter(|m| m.timestamp >= since)
                    .map(|m| m.value),
            ),
            None => Aggregate::default(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.series.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Most recent point per distinct label set, in label order.
    pub fn latest_by_labels(&self, name: &str) -> Vec<Metric> {
        let series = self.series.read();
        let Some(points) = series.get(name) else {
            return Vec::new();
        };

        let mut latest: BTreeMap<&Labels, &Metric> = BTreeMap::new();
        for point in points {
            latest.insert(&point.labels, point);
        }
        latest.into_values().cloned().collect()
    }

    /// Drop points older than `max_age` and any series left empty.
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = self.clock.now() - max_age;
        let mut removed = 0;
        let mut series = self.series.write();
        for points in series.values_mut() {
            let before = points.len();
            points.retain(|m| m.timestamp >= cutoff);
            removed += before - points.len();
        }
        series.retain(|_, points| !points.is_empty());
        removed
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY)
    }
}
