//! Append-only persistence of validated records.
//!
//! Backed by SQLite through an `sqlx` pool so the monitoring side can read
//! the same file the scheduler writes. The store exposes inserts and reads
//! only; nothing updates or deletes a record once it is written.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{TelemetryPacket, ValidatedRecord};
use crate::schema;

const DEFAULT_QUERY_LIMIT: u32 = 1_000;

const RECORD_COLUMNS: &str = "packet_id, timestamp_ms, battery_mv, batt_current_ma, soc_percent, \
     temp_centi, solar_current_ma, altitude_m, error_flags, valid, rule_flags, ingest_time";

/// Read filter for [`Store::query`]. Every bound is inclusive and optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordFilter {
    pub min_packet_id: Option<u32>,
    pub max_packet_id: Option<u32>,
    pub since_ms: Option<u64>,
    pub until_ms: Option<u64>,
    /// Only records carrying at least one rule violation.
    #[serde(default)]
    pub flagged_only: bool,
    #[serde(default)]
    pub newest_first: bool,
    /// Only records whose packet carried a non-zero `error_flags` mask.
    #[serde(default)]
    pub error_flags_set: bool,
    /// Defaults to 1000.
    pub limit: Option<u32>,
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    packet_id: i64,
    timestamp_ms: i64,
    battery_mv: i64,
    batt_current_ma: i64,
    soc_percent: i64,
    temp_centi: i64,
    solar_current_ma: i64,
    altitude_m: i64,
    error_flags: i64,
    valid: bool,
    rule_flags: String,
    ingest_time: DateTime<Utc>,
}

fn narrow<T: TryFrom<i64>>(packet_id: i64, column: &str, value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::CorruptRow {
        packet_id,
        reason: format!("{column}={value} out of range"),
    })
}

impl TryFrom<RecordRow> for ValidatedRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        // ---
        let id = row.packet_id;
        let rule_flags = serde_json::from_str(&row.rule_flags).map_err(|e| {
            StoreError::CorruptRow {
                packet_id: id,
                reason: format!("rule_flags: {e}"),
            }
        })?;

        let packet = TelemetryPacket {
            packet_id: narrow(id, "packet_id", row.packet_id)?,
            timestamp_ms: timestamp_from_sql(row.timestamp_ms),
            battery_mv: narrow(id, "battery_mv", row.battery_mv)?,
            batt_current_ma: narrow(id, "batt_current_ma", row.batt_current_ma)?,
            soc_percent: narrow(id, "soc_percent", row.soc_percent)?,
            temp_centi: narrow(id, "temp_centi", row.temp_centi)?,
            solar_current_ma: narrow(id, "solar_current_ma", row.solar_current_ma)?,
            altitude_m: narrow(id, "altitude_m", row.altitude_m)?,
            error_flags: narrow(id, "error_flags", row.error_flags)?,
        };

        Ok(ValidatedRecord {
            packet,
            valid: row.valid,
            rule_flags,
            ingest_time: row.ingest_time,
        })
    }
}

/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Connect using a `sqlite://` URL, creating the database file if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        // ---
        let options = SqliteConnectOptions::from_str(url)?;
        Self::connect_with(options, max_connections).await
    }

    /// Open (or create) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        // ---
        let options = SqliteConnectOptions::new().filename(path.as_ref());
        Self::connect_with(options, 5).await
    }

    async fn connect_with(
        options: SqliteConnectOptions,
        max_connections: u32,
    ) -> Result<Self, StoreError> {
        // ---
        if let Some(dir) = options.get_filename().parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        schema::create_schema(&pool).await?;
        info!("Telemetry store ready");
        Ok(Self { pool })
    }

    /// Persist `record`. A second insert of the same `packet_id` fails with
    /// [`StoreError::DuplicateKey`] and leaves the stored record untouched.
    pub async fn insert(&self, record: &ValidatedRecord) -> Result<(), StoreError> {
        // ---
        let packet = &record.packet;
        let rule_flags = serde_json::to_string(&record.rule_flags)?;

        let result = sqlx::query(
            r#"
            INSERT INTO packets (
                packet_id, timestamp_ms, battery_mv, batt_current_ma,
                soc_percent, temp_centi, solar_current_ma, altitude_m,
                error_flags, valid, rule_flags, ingest_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (packet_id) DO NOTHING
            "#,
        )
        .bind(i64::from(packet.packet_id))
        .bind(timestamp_to_sql(packet.timestamp_ms))
        .bind(i64::from(packet.battery_mv))
        .bind(i64::from(packet.batt_current_ma))
        .bind(i64::from(packet.soc_percent))
        .bind(i64::from(packet.temp_centi))
        .bind(i64::from(packet.solar_current_ma))
        .bind(i64::from(packet.altitude_m))
        .bind(i64::from(packet.error_flags))
        .bind(record.valid)
        .bind(rule_flags)
        .bind(record.ingest_time)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateKey(packet.packet_id));
        }
        debug!(packet_id = packet.packet_id, valid = record.valid, "record stored");
        Ok(())
    }

    pub async fn contains(&self, packet_id: u32) -> Result<bool, StoreError> {
        // ---
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM packets WHERE packet_id = ?")
            .bind(i64::from(packet_id))
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn query(&self, filter: &RecordFilter) -> Result<Vec<ValidatedRecord>, StoreError> {
        // ---
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {RECORD_COLUMNS} FROM packets WHERE 1 = 1"));

        if let Some(min) = filter.min_packet_id {
            qb.push(" AND packet_id >= ").push_bind(i64::from(min));
        }
        if let Some(max) = filter.max_packet_id {
            qb.push(" AND packet_id <= ").push_bind(i64::from(max));
        }
        if let Some(since) = filter.since_ms {
            push_since(&mut qb, since);
        }
        if let Some(until) = filter.until_ms {
            push_until(&mut qb, until);
        }
        if filter.flagged_only {
            qb.push(" AND valid = 0");
        }
        if filter.error_flags_set {
            qb.push(" AND error_flags != 0");
        }
        qb.push(if filter.newest_first {
            " ORDER BY packet_id DESC"
        } else {
            " ORDER BY packet_id ASC"
        });
        qb.push(" LIMIT ")
            .push_bind(i64::from(filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT)));

        let rows: Vec<RecordRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ValidatedRecord::try_from).collect()
    }

    /// Record with the highest `packet_id`, if any.
    pub async fn latest(&self) -> Result<Option<ValidatedRecord>, StoreError> {
        // ---
        let filter = RecordFilter {
            newest_first: true,
            limit: Some(1),
            ..RecordFilter::default()
        };
        Ok(self.query(&filter).await?.pop())
    }

    /// The `n` highest-id records, oldest first.
    pub async fn recent(&self, n: u32) -> Result<Vec<ValidatedRecord>, StoreError> {
        // ---
        let filter = RecordFilter {
            newest_first: true,
            limit: Some(n),
            ..RecordFilter::default()
        };
        let mut records = self.query(&filter).await?;
        records.reverse();
        Ok(records)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        // ---
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM packets")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Close the pool. Later calls fail with a database error.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// SQLite integers are signed 64-bit. Timestamps are stored as their exact
// bit pattern: values up to i64::MAX read as themselves, larger ones come
// back negative and the range filters below account for that.
fn timestamp_to_sql(ms: u64) -> i64 {
    ms as i64
}

fn timestamp_from_sql(raw: i64) -> u64 {
    raw as u64
}

/// `timestamp_ms >= since` in unsigned order over the bit-pattern column.
fn push_since(qb: &mut QueryBuilder<'_, Sqlite>, since: u64) {
    // ---
    if since <= i64::MAX as u64 {
        qb.push(" AND (timestamp_ms < 0 OR timestamp_ms >= ")
            .push_bind(timestamp_to_sql(since))
            .push(")");
    } else {
        qb.push(" AND timestamp_ms < 0 AND timestamp_ms >= ")
            .push_bind(timestamp_to_sql(since));
    }
}

/// `timestamp_ms <= until` in unsigned order over the bit-pattern column.
fn push_until(qb: &mut QueryBuilder<'_, Sqlite>, until: u64) {
    // ---
    if until <= i64::MAX as u64 {
        qb.push(" AND timestamp_ms >= 0 AND timestamp_ms <= ")
            .push_bind(timestamp_to_sql(until));
    } else {
        qb.push(" AND (timestamp_ms >= 0 OR timestamp_ms <= ")
            .push_bind(timestamp_to_sql(until))
            .push(")");
    }
}
