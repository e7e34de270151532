//! Field-range and sequencing rules.
//!
//! Validation never rejects a packet: every violation becomes a flag on the
//! resulting [`ValidatedRecord`], which is persisted regardless. Only CRC
//! corruption (handled by the scheduler) keeps a packet out of the store.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Field, RuleViolation, TelemetryPacket, ValidatedRecord};

/// Inclusive plausible range for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

impl Bounds {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Plausible operating ranges of the satellite's power and thermal system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldLimits {
    pub battery_mv: Bounds,
    pub batt_current_ma: Bounds,
    pub soc_percent: Bounds,
    pub temp_centi: Bounds,
    pub solar_current_ma: Bounds,
    pub altitude_m: Bounds,
    /// Optional acceptance window for `timestamp_ms`; either side may be open.
    pub timestamp_min_ms: Option<u64>,
    pub timestamp_max_ms: Option<u64>,
}

impl Default for FieldLimits {
    fn default() -> Self {
        Self {
            battery_mv: Bounds::new(6_000, 8_400),
            batt_current_ma: Bounds::new(-2_000, 2_000),
            soc_percent: Bounds::new(0, 100),
            temp_centi: Bounds::new(-2_000, 5_000),
            solar_current_ma: Bounds::new(0, 600),
            altitude_m: Bounds::new(300_000, 600_000),
            timestamp_min_ms: None,
            timestamp_max_ms: None,
        }
    }
}

/// Identity of the last packet accepted into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePoint {
    pub packet_id: u32,
    pub timestamp_ms: u64,
}

impl From<&TelemetryPacket> for SequencePoint {
    fn from(packet: &TelemetryPacket) -> Self {
        Self {
            packet_id: packet.packet_id,
            timestamp_ms: packet.timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    limits: FieldLimits,
}

impl Validator {
    pub fn new(limits: FieldLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &FieldLimits {
        &self.limits
    }

    /// Apply every rule to `packet`, given the previously accepted packet.
    pub fn validate(
        &self,
        packet: &TelemetryPacket,
        previous: Option<SequencePoint>,
        ingest_time: DateTime<Utc>,
    ) -> ValidatedRecord {
        // ---
        let mut flags = self.range_violations(packet);

        if let Some(prev) = previous {
            if packet.timestamp_ms < prev.timestamp_ms {
                flags.insert(RuleViolation::NonMonotonicTimestamp);
            }
            if packet.packet_id <= prev.packet_id {
                flags.insert(RuleViolation::DuplicateOrRegressedPacketId);
            }
        }

        if !flags.is_empty() {
            tracing::debug!(packet_id = packet.packet_id, ?flags, "packet flagged");
        }
        ValidatedRecord::new(*packet, flags, ingest_time)
    }

    fn range_violations(&self, packet: &TelemetryPacket) -> BTreeSet<RuleViolation> {
        // ---
        let limits = &self.limits;
        let checks = [
            (Field::BatteryMv, limits.battery_mv, i64::from(packet.battery_mv)),
            (Field::BattCurrentMa, limits.batt_current_ma, i64::from(packet.batt_current_ma)),
            (Field::SocPercent, limits.soc_percent, i64::from(packet.soc_percent)),
            (Field::TempCenti, limits.temp_centi, i64::from(packet.temp_centi)),
            (Field::SolarCurrentMa, limits.solar_current_ma, i64::from(packet.solar_current_ma)),
            (Field::AltitudeM, limits.altitude_m, i64::from(packet.altitude_m)),
        ];

        let mut flags: BTreeSet<RuleViolation> = checks
            .into_iter()
            .filter(|(_, bounds, value)| !bounds.contains(*value))
            .map(|(field, _, _)| RuleViolation::OutOfRange(field))
            .collect();

        let ts = packet.timestamp_ms;
        let too_early = limits.timestamp_min_ms.is_some_and(|min| ts < min);
        let too_late = limits.timestamp_max_ms.is_some_and(|max| ts > max);
        if too_early || too_late {
            flags.insert(RuleViolation::OutOfRange(Field::TimestampMs));
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn nominal(packet_id: u32, timestamp_ms: u64) -> TelemetryPacket {
        // ---
        TelemetryPacket {
            packet_id,
            timestamp_ms,
            battery_mv: 7_400,
            batt_current_ma: -250,
            soc_percent: 76,
            temp_centi: 2_100,
            solar_current_ma: 480,
            altitude_m: 400_050,
            error_flags: 0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 3, 10, 0, 0).unwrap()
    }

    fn prev(packet_id: u32, timestamp_ms: u64) -> Option<SequencePoint> {
        Some(SequencePoint { packet_id, timestamp_ms })
    }

    #[test]
    fn test_nominal_packet_is_valid() {
        // ---
        let validator = Validator::default();
        let record = validator.validate(&nominal(11, 5_000), prev(10, 0), now());

        assert!(record.valid);
        assert!(record.rule_flags.is_empty());
        assert_eq!(record.ingest_time, now());
    }

    #[test]
    fn test_first_packet_has_no_sequencing_rules() {
        // ---
        let record = Validator::default().validate(&nominal(0, 0), None, now());
        assert!(record.valid);
    }

    #[test]
    fn test_each_out_of_range_field_is_flagged_independently() {
        // ---
        let validator = Validator::default();
        let packet = TelemetryPacket {
            battery_mv: 3_000,
            soc_percent: 101,
            solar_current_ma: -5,
            ..nominal(1, 1_000)
        };

        let record = validator.validate(&packet, None, now());
        assert!(!record.valid);
        assert_eq!(
            record.rule_flags,
            BTreeSet::from([
                RuleViolation::OutOfRange(Field::BatteryMv),
                RuleViolation::OutOfRange(Field::SocPercent),
                RuleViolation::OutOfRange(Field::SolarCurrentMa),
            ])
        );
    }

    #[test]
    fn test_range_edges_are_inclusive() {
        // ---
        let validator = Validator::default();
        let low = TelemetryPacket {
            battery_mv: 6_000,
            temp_centi: -2_000,
            altitude_m: 300_000,
            ..nominal(1, 1_000)
        };
        let high = TelemetryPacket {
            battery_mv: 8_400,
            temp_centi: 5_000,
            batt_current_ma: 2_000,
            ..nominal(1, 1_000)
        };

        assert!(validator.validate(&low, None, now()).valid);
        assert!(validator.validate(&high, None, now()).valid);

        let hot = TelemetryPacket { temp_centi: 5_001, ..nominal(1, 1_000) };
        assert!(validator
            .validate(&hot, None, now())
            .rule_flags
            .contains(&RuleViolation::OutOfRange(Field::TempCenti)));
    }

    #[test]
    fn test_regressed_and_duplicate_ids_are_flagged() {
        // ---
        let validator = Validator::default();

        let regressed = validator.validate(&nominal(5, 20_000), prev(10, 10_000), now());
        assert_eq!(
            regressed.rule_flags,
            BTreeSet::from([RuleViolation::DuplicateOrRegressedPacketId])
        );

        let duplicate = validator.validate(&nominal(10, 20_000), prev(10, 10_000), now());
        assert!(duplicate
            .rule_flags
            .contains(&RuleViolation::DuplicateOrRegressedPacketId));
    }

    #[test]
    fn test_timestamp_may_repeat_but_not_go_back() {
        // ---
        let validator = Validator::default();

        let same = validator.validate(&nominal(11, 10_000), prev(10, 10_000), now());
        assert!(same.valid);

        let back = validator.validate(&nominal(11, 9_999), prev(10, 10_000), now());
        assert_eq!(
            back.rule_flags,
            BTreeSet::from([RuleViolation::NonMonotonicTimestamp])
        );
    }

    #[test]
    fn test_timestamp_window() {
        // ---
        let validator = Validator::new(FieldLimits {
            timestamp_min_ms: Some(1_000),
            timestamp_max_ms: Some(2_000),
            ..FieldLimits::default()
        });

        assert!(validator.validate(&nominal(1, 1_500), None, now()).valid);
        for ts in [999, 2_001] {
            let record = validator.validate(&nominal(1, ts), None, now());
            assert_eq!(
                record.rule_flags,
                BTreeSet::from([RuleViolation::OutOfRange(Field::TimestampMs)])
            );
        }
    }
}
