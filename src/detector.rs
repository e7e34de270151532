//! Rolling-window anomaly detection over per-metric streaming statistics.
//!
//! Each monitored [`Metric`] owns a bounded [`MetricWindow`] whose mean and
//! variance are maintained incrementally with Welford's add/remove updates.
//! A new sample is scored against the *baseline*: the window after its
//! oldest sample is evicted but before the new sample is admitted. The
//! sample therefore never dilutes its own z-score.
//!
//! Window state lives in a [`DetectorState`] owned by the caller and passed
//! into every detector call, so independent pipelines (and tests) never
//! share it. Scoring ([`AnomalyDetector::evaluate`]) is read-only; samples are
//! admitted separately ([`AnomalyDetector::admit`]) once the record they
//! came from is durably stored.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AnomalyEvent, DetectionRule, Metric, Severity, TelemetryPacket, ValidatedRecord};

/// Exact recomputation interval that bounds accumulated rounding drift.
const REFRESH_EVERY: u64 = 1_024;

/// Relative tolerance under which a spread or a deviation counts as zero.
const ZERO_TOLERANCE: f64 = 1e-9;

// ---

/// Count, mean and sum of squared deviations (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population variance; 0 for fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn push(&mut self, x: f64) {
        // ---
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Inverse of [`RunningStats::push`] for a sample known to be included.
    pub fn remove(&mut self, x: f64) {
        // ---
        if self.count <= 1 {
            *self = Self::default();
            return;
        }
        let delta = x - self.mean;
        let remaining = (self.count - 1) as f64;
        let mean = self.mean - delta / remaining;
        self.m2 = (self.m2 - delta * (x - mean)).max(0.0);
        self.mean = mean;
        self.count -= 1;
    }

    /// Two-pass exact statistics over `samples`.
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a f64> + Clone) -> Self {
        // ---
        let (count, sum) = samples
            .clone()
            .into_iter()
            .fold((0usize, 0.0), |(n, s), x| (n + 1, s + x));
        if count == 0 {
            return Self::default();
        }
        let mean = sum / count as f64;
        let m2 = samples.into_iter().map(|x| (x - mean).powi(2)).sum();
        Self { count, mean, m2 }
    }
}

/// Fixed-capacity history of one metric plus its running statistics.
#[derive(Debug, Clone)]
pub struct MetricWindow {
    capacity: usize,
    samples: VecDeque<f64>,
    stats: RunningStats,
    updates: u64,
}

impl MetricWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
            stats: RunningStats::default(),
            updates: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> RunningStats {
        self.stats
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    /// Statistics the next sample will be scored against.
    pub fn baseline(&self) -> RunningStats {
        // ---
        let mut stats = self.stats;
        if self.samples.len() == self.capacity {
            if let Some(&oldest) = self.samples.front() {
                stats.remove(oldest);
            }
        }
        stats
    }

    /// Window length once one more sample is admitted.
    fn len_after_push(&self) -> usize {
        (self.samples.len() + 1).min(self.capacity)
    }

    pub fn push(&mut self, x: f64) {
        // ---
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.stats.remove(oldest);
            }
        }
        self.samples.push_back(x);
        self.stats.push(x);

        self.updates += 1;
        if self.updates % REFRESH_EVERY == 0 {
            self.stats = RunningStats::from_samples(&self.samples);
        }
    }
}

// ---

/// Thresholds for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub window_size: usize,
    /// z-score magnitude above which a sample is anomalous.
    pub k: f64,
    /// Hard floor; a value below it is always anomalous.
    pub floor: Option<f64>,
    /// Hard ceiling; a value above it is always anomalous.
    pub ceiling: Option<f64>,
}

impl MetricThresholds {
    pub fn statistical(window_size: usize, k: f64) -> Self {
        Self {
            window_size,
            k,
            floor: None,
            ceiling: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Samples a window must hold (including the one being scored) before
    /// statistical detection starts.
    pub warm_up: usize,
    pub metrics: BTreeMap<Metric, MetricThresholds>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        // ---
        let window = 30;
        let k = 3.0;
        let mut metrics = BTreeMap::new();
        for metric in Metric::ALL {
            metrics.insert(metric, MetricThresholds::statistical(window, k));
        }
        if let Some(t) = metrics.get_mut(&Metric::BatteryMv) {
            t.floor = Some(6_000.0);
            t.ceiling = Some(8_400.0);
        }
        if let Some(t) = metrics.get_mut(&Metric::TempCenti) {
            t.floor = Some(-2_000.0);
            t.ceiling = Some(5_000.0);
        }
        Self { warm_up: 10, metrics }
    }
}

impl DetectorConfig {
    pub fn largest_window(&self) -> usize {
        self.metrics
            .values()
            .map(|t| t.window_size)
            .max()
            .unwrap_or(0)
    }
}

/// Per-metric windows. Process-lifetime state owned by the caller.
#[derive(Debug, Clone, Default)]
pub struct DetectorState {
    windows: BTreeMap<Metric, MetricWindow>,
}

impl DetectorState {
    pub fn window(&self, metric: Metric) -> Option<&MetricWindow> {
        self.windows.get(&metric)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Score `record` without changing `state`. At most one event per metric.
    pub fn evaluate(
        &self,
        state: &DetectorState,
        record: &ValidatedRecord,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyEvent> {
        // ---
        self.config
            .metrics
            .iter()
            .filter_map(|(&metric, thresholds)| {
                self.score(state.window(metric), metric, thresholds, &record.packet, now)
            })
            .collect()
    }

    /// Admit the monitored samples of `record` into their windows, creating
    /// windows on first use.
    pub fn admit(&self, state: &mut DetectorState, record: &ValidatedRecord) {
        // ---
        for (&metric, thresholds) in &self.config.metrics {
            state
                .windows
                .entry(metric)
                .or_insert_with(|| MetricWindow::new(thresholds.window_size))
                .push(metric.sample(&record.packet));
        }
    }

    /// [`evaluate`](Self::evaluate) followed by [`admit`](Self::admit).
    pub fn observe(
        &self,
        state: &mut DetectorState,
        record: &ValidatedRecord,
        now: DateTime<Utc>,
    ) -> Vec<AnomalyEvent> {
        let events = self.evaluate(state, record, now);
        self.admit(state, record);
        events
    }

    fn score(
        &self,
        window: Option<&MetricWindow>,
        metric: Metric,
        thresholds: &MetricThresholds,
        packet: &TelemetryPacket,
        now: DateTime<Utc>,
    ) -> Option<AnomalyEvent> {
        // ---
        let value = metric.sample(packet);
        let baseline = window.map(MetricWindow::baseline).unwrap_or_default();
        let event = |rule, severity, z_score| AnomalyEvent {
            metric,
            packet_id: packet.packet_id,
            value,
            mean: baseline.mean(),
            stddev: baseline.stddev(),
            z_score,
            threshold_k: thresholds.k,
            rule,
            severity,
            timestamp: packet.timestamp_ms,
            detected_at: now,
        };

        // Absolute limits win and ignore warm-up.
        if thresholds.floor.is_some_and(|floor| value < floor) {
            let z = z_of(value, &baseline);
            return Some(event(DetectionRule::AbsoluteFloor, Severity::Critical, z));
        }
        if thresholds.ceiling.is_some_and(|ceiling| value > ceiling) {
            let z = z_of(value, &baseline);
            return Some(event(DetectionRule::AbsoluteCeiling, Severity::Critical, z));
        }

        let len_after = window.map_or(1, MetricWindow::len_after_push);
        if len_after < self.config.warm_up || baseline.count() == 0 {
            return None;
        }

        let z = z_of(value, &baseline);
        let exceeded = match z {
            Some(z) => z.abs() > thresholds.k,
            // no spread in the baseline and the value differs from it
            None => true,
        };
        exceeded.then(|| event(DetectionRule::ZScore, Severity::Major, z))
    }
}

/// z-score against `baseline`; `None` when the baseline has no spread but
/// the value departs from its mean.
fn z_of(value: f64, baseline: &RunningStats) -> Option<f64> {
    // ---
    if baseline.count() == 0 {
        return Some(0.0);
    }
    let scale = baseline.mean().abs().max(1.0);
    let deviation = value - baseline.mean();
    let stddev = baseline.stddev();

    if stddev <= ZERO_TOLERANCE * scale {
        if deviation.abs() <= ZERO_TOLERANCE * scale {
            Some(0.0)
        } else {
            None
        }
    } else {
        Some(deviation / stddev)
    }
}
