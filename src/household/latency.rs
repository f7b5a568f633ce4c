use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

const HISTORY_WINDOW: Duration = Duration::from_secs(60);
const BASELINE_SAMPLES: usize = 10;
const HISTOGRAM_MAX_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    /// Classification of the bufferbloat impact from the latency increase
    /// over baseline.
    pub fn classify(increase_ms: f64) -> Self {
        if increase_ms < 10.0 {
            Self::None
        } else if increase_ms < 50.0 {
            Self::Mild
        } else if increase_ms < 200.0 {
            Self::Moderate
        } else {
            Self::Severe
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    rtt_ms: f64,
}

/// Per-session RTT bookkeeping for in-band ping/pong latency.
///
/// The ring keeps the last 60 s of samples; the baseline is the mean of the
/// first ten samples and latches permanently once set. Sequence numbers are
/// carried for tracing only; gaps are never interpreted as loss.
pub struct LatencyTracker {
    sequence: u64,
    total_pings: u64,
    history: VecDeque<Sample>,
    early: Vec<f64>,
    baseline_ms: f64,
    baseline_established: bool,
    current_ms: f64,
    min_ms: f64,
    max_ms: f64,
    avg_ms: f64,
    jitter_ms: f64,
    histogram: Option<Histogram<u64>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            total_pings: 0,
            history: VecDeque::new(),
            early: Vec::with_capacity(BASELINE_SAMPLES),
            baseline_ms: 0.0,
            baseline_established: false,
            current_ms: 0.0,
            min_ms: f64::INFINITY,
            max_ms: 0.0,
            avg_ms: 0.0,
            jitter_ms: 0.0,
            histogram: Histogram::new_with_bounds(1, HISTOGRAM_MAX_MS, 3).ok(),
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence = self.sequence.saturating_add(1);
        self.sequence
    }

    pub fn record(&mut self, rtt_ms: f64, now: Instant) {
        let rtt_ms = rtt_ms.max(0.0);
        self.current_ms = rtt_ms;
        self.total_pings = self.total_pings.saturating_add(1);
        self.min_ms = self.min_ms.min(rtt_ms);
        self.max_ms = self.max_ms.max(rtt_ms);

        self.history.push_back(Sample { at: now, rtt_ms });
        while let Some(front) = self.history.front() {
            if now.duration_since(front.at) > HISTORY_WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }

        let count = self.history.len();
        if count > 0 {
            let sum: f64 = self.history.iter().map(|sample| sample.rtt_ms).sum();
            self.avg_ms = sum / count as f64;
        }
        if count >= 2 {
            let mean = self.avg_ms;
            let variance: f64 = self
                .history
                .iter()
                .map(|sample| {
                    let diff = sample.rtt_ms - mean;
                    diff * diff
                })
                .sum::<f64>()
                / count as f64;
            self.jitter_ms = variance.sqrt();
        }

        if !self.baseline_established {
            self.early.push(rtt_ms);
            if self.early.len() >= BASELINE_SAMPLES {
                let sum: f64 = self.early.iter().sum();
                self.baseline_ms = sum / self.early.len() as f64;
                self.baseline_established = true;
            }
        }

        if let Some(histogram) = self.histogram.as_mut() {
            let clamped = (rtt_ms.round() as u64).clamp(1, HISTOGRAM_MAX_MS);
            drop(histogram.record(clamped));
        }
    }

    pub fn latency_increase(&self) -> f64 {
        if self.baseline_established && self.baseline_ms > 0.0 {
            self.current_ms - self.baseline_ms
        } else {
            0.0
        }
    }

    pub fn severity(&self) -> Severity {
        if self.baseline_established {
            Severity::classify(self.latency_increase())
        } else {
            Severity::None
        }
    }

    pub const fn baseline_established(&self) -> bool {
        self.baseline_established
    }

    fn percentile(&self, quantile: f64) -> u64 {
        self.histogram.as_ref().map_or(0, |histogram| {
            if histogram.is_empty() {
                0
            } else {
                histogram.value_at_quantile(quantile)
            }
        })
    }

    pub fn metrics(&self) -> LatencyMetrics {
        let min = if self.min_ms.is_finite() { self.min_ms } else { 0.0 };
        LatencyMetrics {
            baseline_latency: round1(self.baseline_ms),
            current_latency: round1(self.current_ms),
            min_latency: round1(min),
            max_latency: round1(self.max_ms),
            avg_latency: round1(self.avg_ms),
            latency_increase: round1(self.latency_increase()),
            jitter: round2(self.jitter_ms),
            bufferbloat_severity: self.severity(),
            baseline_established: self.baseline_established,
            total_pings: self.total_pings,
            ping_history_count: self.history.len(),
            p50_ms: self.percentile(0.50),
            p90_ms: self.percentile(0.90),
            p99_ms: self.percentile(0.99),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub baseline_latency: f64,
    pub current_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub avg_latency: f64,
    pub latency_increase: f64,
    pub jitter: f64,
    pub bufferbloat_severity: Severity,
    pub baseline_established: bool,
    pub total_pings: u64,
    pub ping_history_count: usize,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
