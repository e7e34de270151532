//! Data models shared by the codec, validator, store and detector.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---

/// One decoded telemetry frame. Magic and CRC are wire concerns owned by the
/// codec and are not carried here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPacket {
    // ---
    pub packet_id: u32,
    pub timestamp_ms: u64,
    pub battery_mv: u16,
    pub batt_current_ma: i16,
    pub soc_percent: u8,
    pub temp_centi: i16,
    pub solar_current_ma: i16,
    pub altitude_m: u32,
    pub error_flags: u16,
}

/// Range-checked packet fields, named as they appear in rule flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    TimestampMs,
    BatteryMv,
    BattCurrentMa,
    SocPercent,
    TempCenti,
    SolarCurrentMa,
    AltitudeM,
}

/// Diagnostic rule outcome. Flagged records are still persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", content = "field", rename_all = "snake_case")]
pub enum RuleViolation {
    OutOfRange(Field),
    NonMonotonicTimestamp,
    DuplicateOrRegressedPacketId,
}

/// A packet after validation, as written to the store. Immutable once
/// inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    // ---
    #[serde(flatten)]
    pub packet: TelemetryPacket,
    pub valid: bool,
    pub rule_flags: BTreeSet<RuleViolation>,
    pub ingest_time: DateTime<Utc>,
}

impl ValidatedRecord {
    // ---
    pub fn new(
        packet: TelemetryPacket,
        rule_flags: BTreeSet<RuleViolation>,
        ingest_time: DateTime<Utc>,
    ) -> Self {
        // ---
        Self {
            packet,
            valid: rule_flags.is_empty(),
            rule_flags,
            ingest_time,
        }
    }

    pub fn packet_id(&self) -> u32 {
        self.packet.packet_id
    }
}

// ---

/// Numeric series watched by the rolling anomaly detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    BatteryMv,
    BattCurrentMa,
    TempCenti,
    SolarCurrentMa,
    /// Derived: `battery_mv * batt_current_ma / 1000`.
    PowerMw,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::BatteryMv,
        Metric::BattCurrentMa,
        Metric::TempCenti,
        Metric::SolarCurrentMa,
        Metric::PowerMw,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::BatteryMv => "battery_mv",
            Metric::BattCurrentMa => "batt_current_ma",
            Metric::TempCenti => "temp_centi",
            Metric::SolarCurrentMa => "solar_current_ma",
            Metric::PowerMw => "power_mw",
        }
    }

    /// Suffix used for per-metric environment overrides, e.g. `FLOOR_BATTERY_MV`.
    pub fn env_suffix(self) -> String {
        self.name().to_ascii_uppercase()
    }

    pub fn sample(self, packet: &TelemetryPacket) -> f64 {
        // ---
        match self {
            Metric::BatteryMv => f64::from(packet.battery_mv),
            Metric::BattCurrentMa => f64::from(packet.batt_current_ma),
            Metric::TempCenti => f64::from(packet.temp_centi),
            Metric::SolarCurrentMa => f64::from(packet.solar_current_ma),
            Metric::PowerMw => {
                f64::from(packet.battery_mv) * f64::from(packet.batt_current_ma) / 1000.0
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown metric '{}'", s.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Major,
    Critical,
}

/// Which rule produced an [`AnomalyEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionRule {
    ZScore,
    AbsoluteFloor,
    AbsoluteCeiling,
}

/// One line of the event log. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    // ---
    pub metric: Metric,
    pub packet_id: u32,
    pub value: f64,
    /// Baseline mean the value was scored against.
    pub mean: f64,
    pub stddev: f64,
    /// `None` when the baseline has no spread and the value differs from it.
    pub z_score: Option<f64>,
    pub threshold_k: f64,
    pub rule: DetectionRule,
    pub severity: Severity,
    /// Packet timestamp in milliseconds since the epoch.
    pub timestamp: u64,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn create_test_packet() -> TelemetryPacket {
        // ---
        TelemetryPacket {
            packet_id: 7,
            timestamp_ms: 1_764_547_200_000,
            battery_mv: 7400,
            batt_current_ma: -500,
            soc_percent: 80,
            temp_centi: 2150,
            solar_current_ma: 420,
            altitude_m: 400_000,
            error_flags: 0,
        }
    }

    #[test]
    fn test_power_is_derived_from_voltage_and_current() {
        // ---
        let packet = create_test_packet();

        // 7.4 V * -500 mA = -3700 mW
        assert_eq!(Metric::PowerMw.sample(&packet), -3700.0);
        assert_eq!(Metric::BatteryMv.sample(&packet), 7400.0);
        assert_eq!(Metric::TempCenti.sample(&packet), 2150.0);
    }

    #[test]
    fn test_metric_names_round_trip_through_from_str() {
        // ---
        for metric in Metric::ALL {
            assert_eq!(metric.name().parse::<Metric>(), Ok(metric));
        }
        assert_eq!(" TEMP_CENTI ".parse::<Metric>(), Ok(Metric::TempCenti));
        assert!("altitude".parse::<Metric>().is_err());
        assert_eq!(Metric::SolarCurrentMa.env_suffix(), "SOLAR_CURRENT_MA");
    }

    #[test]
    fn test_record_validity_follows_rule_flags() {
        // ---
        let at = Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap();
        let clean = ValidatedRecord::new(create_test_packet(), BTreeSet::new(), at);
        assert!(clean.valid);

        let flagged = ValidatedRecord::new(
            create_test_packet(),
            BTreeSet::from([RuleViolation::NonMonotonicTimestamp]),
            at,
        );
        assert!(!flagged.valid);
    }

    #[test]
    fn test_rule_flags_serialize_with_field_names() {
        // ---
        let json = serde_json::to_value(RuleViolation::OutOfRange(Field::BatteryMv)).unwrap();
        assert_eq!(json, serde_json::json!({"rule": "out_of_range", "field": "battery_mv"}));

        let json = serde_json::to_value(RuleViolation::DuplicateOrRegressedPacketId).unwrap();
        assert_eq!(json, serde_json::json!({"rule": "duplicate_or_regressed_packet_id"}));
    }

    #[test]
    fn test_event_serializes_as_flat_json_object() {
        // ---
        let event = AnomalyEvent {
            metric: Metric::BatteryMv,
            packet_id: 500,
            value: 3000.0,
            mean: 7400.0,
            stddev: 0.0,
            z_score: None,
            threshold_k: 3.0,
            rule: DetectionRule::AbsoluteFloor,
            severity: Severity::Critical,
            timestamp: 1_764_547_200_000,
            detected_at: Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["metric"], "battery_mv");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["rule"], "absolute_floor");
        assert!(json["z_score"].is_null());
        assert_eq!(json["timestamp"], 1_764_547_200_000u64);
    }
}
