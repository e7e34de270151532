//! Configuration loader for the telemetry ingestion service.
//!
//! This module centralizes all runtime configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). Every value is validated here, once, at
//! startup; nothing downstream re-checks configuration at runtime.
//!
use std::collections::BTreeSet;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::codec::ByteOrder;
use crate::detector::{DetectorConfig, MetricThresholds};
use crate::error::ConfigError;
use crate::models::Metric;
use crate::validator::FieldLimits;

/// Parse an optional environment variable with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        parse_var::<$ty>(&$lookup, $var_name)?.unwrap_or($default)
    };
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    // ---
    lookup(var)
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::Invalid {
            var: var.to_string(),
            reason: e.to_string(),
        })
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent
/// configuration snapshot for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Append-only packet stream written by the simulator.
    pub stream_path: PathBuf,

    /// Durable consumption offset into `stream_path`.
    pub cursor_path: PathBuf,

    /// SQLite connection string for the record store.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// JSON Lines anomaly event log.
    pub event_log_path: PathBuf,

    pub tick_interval: Duration,

    pub byte_order: ByteOrder,

    /// Bytes one resynchronization scan may skip before the tick gives up.
    pub resync_scan_bound: usize,

    /// Upper bound on stream bytes read per tick.
    pub max_batch_bytes: usize,

    /// Bind address of the read-only query API; disabled when `None`.
    pub http_addr: Option<SocketAddr>,

    pub limits: FieldLimits,

    pub detector: DetectorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stream_path: PathBuf::from("data/telemetry.bin"),
            cursor_path: PathBuf::from("data/last_offset.txt"),
            db_url: "sqlite://data/results.db".to_string(),
            db_pool_max: 5,
            event_log_path: PathBuf::from("data/ai_output.jsonl"),
            tick_interval: Duration::from_secs(60),
            byte_order: ByteOrder::Little,
            resync_scan_bound: 4_096,
            max_batch_bytes: 4 * 1024 * 1024,
            http_addr: None,
            limits: FieldLimits::default(),
            detector: DetectorConfig::default(),
        }
    }
}

/// Load configuration from the process environment.
///
/// Optional (defaults in parentheses):
/// - `STREAM_PATH` (`data/telemetry.bin`), `CURSOR_PATH` (`data/last_offset.txt`)
/// - `DATABASE_URL` (`sqlite://data/results.db`), `DB_POOL_MAX` (5)
/// - `EVENT_LOG_PATH` (`data/ai_output.jsonl`)
/// - `TICK_INTERVAL_MS` (60000), `BYTE_ORDER` (`little`)
/// - `RESYNC_SCAN_BOUND` (4096), `MAX_BATCH_BYTES` (4 MiB), `HTTP_ADDR` (unset)
/// - `WINDOW_SIZE` (30), `WARMUP_COUNT` (10), `Z_THRESHOLD` (3.0)
/// - `DETECTOR_METRICS` (all), comma separated metric names
/// - `WINDOW_SIZE_<M>`, `Z_THRESHOLD_<M>`, `FLOOR_<M>`, `CEILING_<M>` per metric
/// - `TIMESTAMP_MIN_MS`, `TIMESTAMP_MAX_MS` (unset)
///
/// Returns an error if any variable is malformed or the values are
/// inconsistent with each other.
pub fn load_from_env() -> Result<Config, ConfigError> {
    load_from(|var| env::var(var).ok())
}

/// Same as [`load_from_env`] with an explicit variable source.
pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
    // ---
    let defaults = Config::default();

    let stream_path = parse_env!(lookup, "STREAM_PATH", PathBuf, defaults.stream_path);
    let cursor_path = parse_env!(lookup, "CURSOR_PATH", PathBuf, defaults.cursor_path);
    let db_url = parse_env!(lookup, "DATABASE_URL", String, defaults.db_url);
    let db_pool_max = parse_env!(lookup, "DB_POOL_MAX", u32, defaults.db_pool_max);
    let event_log_path = parse_env!(lookup, "EVENT_LOG_PATH", PathBuf, defaults.event_log_path);
    let tick_ms = parse_env!(lookup, "TICK_INTERVAL_MS", u64, 60_000);
    let byte_order = parse_env!(lookup, "BYTE_ORDER", ByteOrder, defaults.byte_order);
    let resync_scan_bound =
        parse_env!(lookup, "RESYNC_SCAN_BOUND", usize, defaults.resync_scan_bound);
    let max_batch_bytes = parse_env!(lookup, "MAX_BATCH_BYTES", usize, defaults.max_batch_bytes);
    let http_addr = parse_var::<SocketAddr>(&lookup, "HTTP_ADDR")?;

    let mut limits = defaults.limits;
    limits.timestamp_min_ms = parse_var::<u64>(&lookup, "TIMESTAMP_MIN_MS")?;
    limits.timestamp_max_ms = parse_var::<u64>(&lookup, "TIMESTAMP_MAX_MS")?;

    let detector = load_detector(&lookup, defaults.detector)?;

    let cfg = Config {
        stream_path,
        cursor_path,
        db_url,
        db_pool_max,
        event_log_path,
        tick_interval: Duration::from_millis(tick_ms),
        byte_order,
        resync_scan_bound,
        max_batch_bytes,
        http_addr,
        limits,
        detector,
    };
    cfg.validate()?;
    Ok(cfg)
}

fn load_detector(
    lookup: &impl Fn(&str) -> Option<String>,
    defaults: DetectorConfig,
) -> Result<DetectorConfig, ConfigError> {
    // ---
    let window = parse_env!(lookup, "WINDOW_SIZE", usize, 30);
    let k = parse_env!(lookup, "Z_THRESHOLD", f64, 3.0);
    let warm_up = parse_env!(lookup, "WARMUP_COUNT", usize, defaults.warm_up);

    let enabled: BTreeSet<Metric> = match lookup("DETECTOR_METRICS") {
        Some(list) if !list.trim().is_empty() => list
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Metric::from_str)
            .collect::<Result<_, _>>()
            .map_err(|reason| ConfigError::Invalid {
                var: "DETECTOR_METRICS".to_string(),
                reason,
            })?,
        _ => Metric::ALL.into_iter().collect(),
    };

    let mut metrics = std::collections::BTreeMap::new();
    for metric in enabled {
        let suffix = metric.env_suffix();
        let base = defaults.metrics.get(&metric).copied();
        let thresholds = MetricThresholds {
            window_size: parse_env!(lookup, &format!("WINDOW_SIZE_{suffix}"), usize, window),
            k: parse_env!(lookup, &format!("Z_THRESHOLD_{suffix}"), f64, k),
            floor: parse_var::<f64>(lookup, &format!("FLOOR_{suffix}"))?
                .or(base.and_then(|b| b.floor)),
            ceiling: parse_var::<f64>(lookup, &format!("CEILING_{suffix}"))?
                .or(base.and_then(|b| b.ceiling)),
        };
        metrics.insert(metric, thresholds);
    }

    Ok(DetectorConfig { warm_up, metrics })
}

impl Config {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ---
        let invalid = |var: &str, reason: &str| ConfigError::Invalid {
            var: var.to_string(),
            reason: reason.to_string(),
        };

        if self.tick_interval.is_zero() {
            return Err(invalid("TICK_INTERVAL_MS", "must be greater than zero"));
        }
        if self.resync_scan_bound == 0 {
            return Err(invalid("RESYNC_SCAN_BOUND", "must be greater than zero"));
        }
        if self.max_batch_bytes < crate::codec::PACKET_SIZE {
            return Err(invalid("MAX_BATCH_BYTES", "must hold at least one packet"));
        }
        if self.db_pool_max == 0 {
            return Err(invalid("DB_POOL_MAX", "must be greater than zero"));
        }
        if let (Some(min), Some(max)) = (self.limits.timestamp_min_ms, self.limits.timestamp_max_ms) {
            if min > max {
                return Err(ConfigError::Inconsistent(format!(
                    "TIMESTAMP_MIN_MS {min} is after TIMESTAMP_MAX_MS {max}"
                )));
            }
        }

        let warm_up = self.detector.warm_up;
        if warm_up < 2 {
            return Err(invalid("WARMUP_COUNT", "must be at least 2"));
        }
        for (metric, t) in &self.detector.metrics {
            if t.window_size < warm_up {
                return Err(ConfigError::Inconsistent(format!(
                    "window for {metric} ({}) is smaller than WARMUP_COUNT ({warm_up})",
                    t.window_size
                )));
            }
            if !(t.k.is_finite() && t.k > 0.0) {
                return Err(ConfigError::Inconsistent(format!(
                    "z threshold for {metric} must be a positive number, got {}",
                    t.k
                )));
            }
            if let (Some(floor), Some(ceiling)) = (t.floor, t.ceiling) {
                if floor >= ceiling {
                    return Err(ConfigError::Inconsistent(format!(
                        "floor {floor} for {metric} is not below ceiling {ceiling}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Log the loaded configuration for debugging purposes.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  STREAM_PATH       : {}", self.stream_path.display());
        tracing::info!("  CURSOR_PATH       : {}", self.cursor_path.display());
        tracing::info!("  DATABASE_URL      : {}", self.db_url);
        tracing::info!("  DB_POOL_MAX       : {}", self.db_pool_max);
        tracing::info!("  EVENT_LOG_PATH    : {}", self.event_log_path.display());
        tracing::info!("  TICK_INTERVAL_MS  : {}", self.tick_interval.as_millis());
        tracing::info!("  BYTE_ORDER        : {}", self.byte_order);
        tracing::info!("  RESYNC_SCAN_BOUND : {}", self.resync_scan_bound);
        tracing::info!("  MAX_BATCH_BYTES   : {}", self.max_batch_bytes);
        match self.http_addr {
            Some(addr) => tracing::info!("  HTTP_ADDR         : {}", addr),
            None => tracing::info!("  HTTP_ADDR         : (disabled)"),
        }
        tracing::info!("  WARMUP_COUNT      : {}", self.detector.warm_up);
        for (metric, t) in &self.detector.metrics {
            tracing::info!(
                "  detector {:<16}: window={} k={} floor={:?} ceiling={:?}",
                metric.name(),
                t.window_size,
                t.k,
                t.floor,
                t.ceiling
            );
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_from(|var| map.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        // ---
        let cfg = load(&[]).unwrap();

        assert_eq!(cfg.tick_interval, Duration::from_secs(60));
        assert_eq!(cfg.byte_order, ByteOrder::Little);
        assert_eq!(cfg.resync_scan_bound, 4_096);
        assert!(cfg.http_addr.is_none());
        assert_eq!(cfg.detector.warm_up, 10);
        assert_eq!(cfg.detector.metrics.len(), Metric::ALL.len());
        assert_eq!(cfg.detector.metrics[&Metric::TempCenti].ceiling, Some(5_000.0));
    }

    #[test]
    fn test_overrides() {
        // ---
        let cfg = load(&[
            ("TICK_INTERVAL_MS", "250"),
            ("BYTE_ORDER", "big"),
            ("HTTP_ADDR", "127.0.0.1:8088"),
            ("DETECTOR_METRICS", "battery_mv, temp_centi"),
            ("WINDOW_SIZE", "50"),
            ("WINDOW_SIZE_TEMP_CENTI", "80"),
            ("Z_THRESHOLD_BATTERY_MV", "2.5"),
            ("FLOOR_BATTERY_MV", "6500"),
        ])
        .unwrap();

        assert_eq!(cfg.tick_interval, Duration::from_millis(250));
        assert_eq!(cfg.byte_order, ByteOrder::Big);
        assert_eq!(cfg.http_addr, Some("127.0.0.1:8088".parse().unwrap()));

        let battery = cfg.detector.metrics[&Metric::BatteryMv];
        assert_eq!(battery.window_size, 50);
        assert_eq!(battery.k, 2.5);
        assert_eq!(battery.floor, Some(6_500.0));
        assert_eq!(battery.ceiling, Some(8_400.0));

        assert_eq!(cfg.detector.metrics[&Metric::TempCenti].window_size, 80);
        assert_eq!(cfg.detector.metrics.len(), 2);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        // ---
        let err = load(&[("TICK_INTERVAL_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref var, .. } if var == "TICK_INTERVAL_MS"));

        assert!(load(&[("BYTE_ORDER", "middle")]).is_err());
        assert!(load(&[("DETECTOR_METRICS", "battery_mv,altitude")]).is_err());
    }

    #[test]
    fn test_inconsistent_values_are_rejected() {
        // ---
        assert!(load(&[("WARMUP_COUNT", "1")]).is_err());
        assert!(load(&[("WARMUP_COUNT", "40")]).is_err());
        assert!(load(&[("Z_THRESHOLD", "0")]).is_err());
        assert!(load(&[("RESYNC_SCAN_BOUND", "0")]).is_err());
        assert!(load(&[("TICK_INTERVAL_MS", "0")]).is_err());
        assert!(matches!(
            load(&[("FLOOR_TEMP_CENTI", "6000")]),
            Err(ConfigError::Inconsistent(_))
        ));
        assert!(matches!(
            load(&[("TIMESTAMP_MIN_MS", "10"), ("TIMESTAMP_MAX_MS", "5")]),
            Err(ConfigError::Inconsistent(_))
        ));
    }
}
