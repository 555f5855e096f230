// src/monitor.rs

//! Per-session load monitor: periodic ping/pong latency histogram and a
//! hysteresis-based overload flag (spec.md §4.8). Grounded on
//! `original_source/iocore/cluster/ClusterLoadMonitor.cc` (power-of-two
//! bucket binning, per SPEC_FULL.md's supplemented-features note) and
//! `spineldb::core::latency::LatencyMonitor`'s rolling-bucket shape.

use std::time::Duration;

use crate::config::LoadMonitorConfig;

/// Power-of-two latency histogram: bucket `i` covers `[2^i us, 2^(i+1) us)`,
/// sized from `LoadMonitorConfig::histogram_buckets`.
struct Histogram {
    buckets: Vec<u32>,
}

impl Histogram {
    fn new(bucket_count: usize) -> Self {
        Self { buckets: vec![0; bucket_count.max(1)] }
    }

    fn record(&mut self, latency: Duration) {
        let micros = latency.as_micros().max(1) as u64;
        let bucket = (63 - micros.leading_zeros()) as usize;
        let last = self.buckets.len() - 1;
        self.buckets[bucket.min(last)] += 1;
    }

    fn average_bucket(&self) -> Option<usize> {
        let total: u32 = self.buckets.iter().sum();
        if total == 0 {
            return None;
        }
        let weighted: u64 = self
            .buckets
            .iter()
            .enumerate()
            .map(|(i, &c)| i as u64 * c as u64)
            .sum();
        Some((weighted / total as u64) as usize)
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = 0);
    }
}

fn bucket_for(micros: u64, bucket_count: usize) -> usize {
    let micros = micros.max(1);
    ((63 - micros.leading_zeros()) as usize).min(bucket_count.saturating_sub(1))
}

/// Per-session ping/pong tracker that computes an `overloaded` boolean
/// using hysteresis: K consecutive high samples to enter, L consecutive
/// low samples to leave (spec.md §4.8).
pub struct LoadMonitor {
    config: LoadMonitorConfig,
    histogram: Histogram,
    history: Vec<Duration>,
    consecutive_over: usize,
    consecutive_under: usize,
    overloaded: bool,
    threshold_bucket: usize,
}

impl LoadMonitor {
    pub fn new(config: LoadMonitorConfig) -> Self {
        let threshold_bucket = bucket_for(config.overload_threshold_ms * 1000, config.histogram_buckets);
        Self {
            histogram: Histogram::new(config.histogram_buckets),
            history: Vec::new(),
            consecutive_over: 0,
            consecutive_under: 0,
            overloaded: false,
            threshold_bucket,
            config,
        }
    }

    pub fn ping_interval(&self) -> Duration {
        self.config.ping_interval
    }

    pub fn compute_interval(&self) -> Duration {
        self.config.compute_interval
    }

    pub fn record_round_trip(&mut self, latency: Duration) {
        self.histogram.record(latency);
    }

    /// Run every `compute_interval`: average the bins, append to the
    /// rolling history, and update `overloaded` (spec.md §4.8).
    pub fn compute_tick(&mut self) {
        let Some(avg_bucket) = self.histogram.average_bucket() else {
            self.histogram.reset();
            return;
        };

        self.history.push(Duration::from_micros(1u64 << avg_bucket));
        if self.history.len() > 64 {
            self.history.remove(0);
        }

        if avg_bucket >= self.threshold_bucket {
            self.consecutive_over += 1;
            self.consecutive_under = 0;
        } else {
            self.consecutive_under += 1;
            self.consecutive_over = 0;
        }

        if !self.overloaded && self.consecutive_over >= self.config.hysteresis_enter_count {
            self.overloaded = true;
        } else if self.overloaded && self.consecutive_under >= self.config.hysteresis_leave_count {
            self.overloaded = false;
        }

        self.histogram.reset();
    }

    pub fn overloaded(&self) -> bool {
        self.overloaded
    }

    pub fn history(&self) -> &[Duration] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(enter: usize, leave: usize) -> LoadMonitorConfig {
        LoadMonitorConfig {
            hysteresis_enter_count: enter,
            hysteresis_leave_count: leave,
            overload_threshold_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn stays_not_overloaded_below_threshold() {
        let mut monitor = LoadMonitor::new(config_with(2, 2));
        for _ in 0..5 {
            monitor.record_round_trip(Duration::from_micros(100));
            monitor.compute_tick();
        }
        assert!(!monitor.overloaded());
    }

    #[test]
    fn enters_overload_after_k_consecutive_high_samples() {
        let mut monitor = LoadMonitor::new(config_with(3, 3));
        for _ in 0..2 {
            monitor.record_round_trip(Duration::from_millis(50));
            monitor.compute_tick();
        }
        assert!(!monitor.overloaded());
        monitor.record_round_trip(Duration::from_millis(50));
        monitor.compute_tick();
        assert!(monitor.overloaded());
    }

    #[test]
    fn leaves_overload_after_l_consecutive_low_samples() {
        let mut monitor = LoadMonitor::new(config_with(1, 2));
        monitor.record_round_trip(Duration::from_millis(50));
        monitor.compute_tick();
        assert!(monitor.overloaded());

        monitor.record_round_trip(Duration::from_micros(100));
        monitor.compute_tick();
        assert!(monitor.overloaded(), "one low sample is not enough to leave");

        monitor.record_round_trip(Duration::from_micros(100));
        monitor.compute_tick();
        assert!(!monitor.overloaded());
    }

    #[test]
    fn empty_tick_does_not_reset_hysteresis_counters() {
        let mut monitor = LoadMonitor::new(config_with(2, 2));
        monitor.compute_tick();
        assert!(!monitor.overloaded());
        assert!(monitor.history().is_empty());
    }
}
