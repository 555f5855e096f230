// src/config.rs

//! Server-wide configuration: the cluster port and thread knobs, load
//! monitor hysteresis, and the admin reload timeout/check-interval records
//! from spec.md §6, plus the shared duration grammar both records use.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parses the `<count><unit>` duration grammar from spec.md §6.
///
/// Segments may be separated by whitespace; their durations are summed.
/// Accepted units: ns, us, ms, s/sec, m/min, h/hour, d/day, w/week.
/// `"0"` and the empty string both mean "disabled" and are represented as
/// `Duration::ZERO`; callers that treat zero as "disabled" (the reload
/// timeout) must check for it explicitly.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut chars = trimmed.chars().peekable();
    let mut saw_segment = false;

    while chars.peek().is_some() {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut num = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_digit() || *c == '.') {
            num.push(chars.next().unwrap());
        }
        if num.is_empty() {
            return Err(ClusterError::InvalidDuration(input.to_string()));
        }

        let mut unit = String::new();
        while chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            unit.push(chars.next().unwrap());
        }

        let count: f64 = num
            .parse()
            .map_err(|_| ClusterError::InvalidDuration(input.to_string()))?;

        let unit_secs: f64 = match unit.to_ascii_lowercase().as_str() {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
            "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
            "h" | "hour" | "hours" => 3600.0,
            "d" | "day" | "days" => 86_400.0,
            "w" | "week" | "weeks" => 604_800.0,
            other => return Err(ClusterError::InvalidDuration(format!("unknown unit '{other}'"))),
        };

        total += Duration::from_secs_f64(count * unit_secs);
        saw_segment = true;

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
    }

    if !saw_segment {
        return Err(ClusterError::InvalidDuration(input.to_string()));
    }
    Ok(total)
}

/// `serde` helper for fields stored as duration-grammar strings.
pub mod duration_grammar {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{}ms", d.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Hysteresis and probe tuning for the load monitor (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How often a ping-control message is sent to the peer.
    #[serde(default = "default_ping_interval", with = "duration_grammar")]
    pub ping_interval: Duration,
    /// How often the rolling average and overload flag are recomputed.
    #[serde(default = "default_compute_interval", with = "duration_grammar")]
    pub compute_interval: Duration,
    /// Round-trip threshold, in milliseconds, above which a sample counts
    /// toward entering overload.
    #[serde(default = "default_overload_threshold_ms")]
    pub overload_threshold_ms: u64,
    /// Consecutive samples above the threshold required to enter overload.
    #[serde(default = "default_hysteresis_k")]
    pub hysteresis_enter_count: usize,
    /// Consecutive samples below the threshold required to leave overload.
    #[serde(default = "default_hysteresis_l")]
    pub hysteresis_leave_count: usize,
    /// Number of buckets kept in the rolling latency histogram.
    #[serde(default = "default_histogram_buckets")]
    pub histogram_buckets: usize,
}

impl Default for LoadMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ping_interval: default_ping_interval(),
            compute_interval: default_compute_interval(),
            overload_threshold_ms: default_overload_threshold_ms(),
            hysteresis_enter_count: default_hysteresis_k(),
            hysteresis_leave_count: default_hysteresis_l(),
            histogram_buckets: default_histogram_buckets(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_compute_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_overload_threshold_ms() -> u64 {
    100
}
fn default_hysteresis_k() -> usize {
    3
}
fn default_hysteresis_l() -> usize {
    5
}
fn default_histogram_buckets() -> usize {
    16
}

/// `proxy.config.admin.reload.*` records from spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadConfig {
    /// `"0"` or empty disables the timeout entirely.
    #[serde(default = "default_reload_timeout", with = "duration_grammar")]
    pub timeout: Duration,
    /// Clamped to a 1s minimum regardless of the configured value.
    #[serde(default = "default_reload_check_interval", with = "duration_grammar")]
    pub check_interval: Duration,
}

impl ReloadConfig {
    pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

    /// The effective check interval, after the 1s floor from spec.md §8.
    pub fn effective_check_interval(&self) -> Duration {
        self.check_interval.max(Self::MIN_CHECK_INTERVAL)
    }

    /// `None` means the timeout is disabled (spec.md: `timeout=0`).
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(self.timeout)
        }
    }
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            timeout: default_reload_timeout(),
            check_interval: default_reload_check_interval(),
        }
    }
}

fn default_reload_timeout() -> Duration {
    Duration::from_secs(3600)
}
fn default_reload_check_interval() -> Duration {
    Duration::from_secs(2)
}

/// Cluster port, thread count and socket-level knobs from spec.md §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTransportConfig {
    #[serde(default = "default_cluster_port")]
    pub cluster_port: u16,
    #[serde(default = "default_cluster_threads")]
    pub cluster_threads: usize,
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Type-of-service byte applied to outbound packets on this link, if
    /// the platform socket layer (external to this crate) supports it.
    #[serde(default)]
    pub send_packet_tos: u8,
    #[serde(default)]
    pub recv_packet_mark: u8,
    /// When true, this node never serves as a cache backing store and only
    /// participates in the cluster to forward operations.
    #[serde(default)]
    pub rpc_only_mode: bool,
    /// Number of historical cluster configurations retained for
    /// `machine_at_depth` probing (spec.md §4.6).
    #[serde(default = "default_probe_depth")]
    pub max_probe_depth: usize,
    /// How long a retired topology generation is kept alive for in-flight
    /// probes before being freed (spec.md §4.6).
    #[serde(default = "default_config_settle", with = "duration_grammar")]
    pub config_settle_interval: Duration,
    #[serde(default)]
    pub load_monitor: LoadMonitorConfig,
}

impl Default for ClusterTransportConfig {
    fn default() -> Self {
        Self {
            cluster_port: default_cluster_port(),
            cluster_threads: default_cluster_threads(),
            send_buffer_size: default_send_buffer_size(),
            recv_buffer_size: default_recv_buffer_size(),
            send_packet_tos: 0,
            recv_packet_mark: 0,
            rpc_only_mode: false,
            max_probe_depth: default_probe_depth(),
            config_settle_interval: default_config_settle(),
            load_monitor: LoadMonitorConfig::default(),
        }
    }
}

fn default_cluster_port() -> u16 {
    8086
}
fn default_cluster_threads() -> usize {
    4
}
fn default_send_buffer_size() -> usize {
    1024 * 1024
}
fn default_recv_buffer_size() -> usize {
    1024 * 1024
}
fn default_probe_depth() -> usize {
    3
}
fn default_config_settle() -> Duration {
    Duration::from_secs(60)
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub cluster: ClusterTransportConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from a TOML file, falling back to defaults for
    /// any field not present on disk.
    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(ClusterError::from)?;
        toml::from_str(&text).map_err(|e| ClusterError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_segment() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn parses_multi_segment() {
        assert_eq!(
            parse_duration("1 hour 30min").unwrap(),
            Duration::from_secs(5400)
        );
    }

    #[test]
    fn zero_and_empty_disable() {
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("   ").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5xyz").is_err());
    }

    #[test]
    fn reload_config_defaults_match_spec() {
        let cfg = ReloadConfig::default();
        assert_eq!(cfg.timeout, Duration::from_secs(3600));
        assert_eq!(cfg.check_interval, Duration::from_secs(2));
    }

    #[test]
    fn check_interval_clamped_to_one_second() {
        let mut cfg = ReloadConfig::default();
        cfg.check_interval = Duration::from_millis(200);
        assert_eq!(cfg.effective_check_interval(), Duration::from_secs(1));
    }

    #[test]
    fn zero_timeout_disables() {
        let mut cfg = ReloadConfig::default();
        cfg.timeout = Duration::ZERO;
        assert_eq!(cfg.effective_timeout(), None);
    }
}
