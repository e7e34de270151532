//! Database schema management for the telemetry store.
//!
//! Ensures the `packets` table and its indexes exist before the scheduler or
//! the query routes touch the database. Applied once from [`crate::Store`]
//! when the pool is opened.

use sqlx::SqlitePool;

use crate::error::StoreError;

// ---

/// Create the schema if it does not exist yet (idempotent).
///
/// `packet_id` is the primary key, which is what makes re-ingestion after a
/// crash harmless. `rule_flags` holds a JSON array of rule violations.
pub async fn create_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS packets (
            packet_id         INTEGER PRIMARY KEY,
            timestamp_ms      INTEGER NOT NULL,
            battery_mv        INTEGER NOT NULL,
            batt_current_ma   INTEGER NOT NULL,
            soc_percent       INTEGER NOT NULL,
            temp_centi        INTEGER NOT NULL,
            solar_current_ma  INTEGER NOT NULL,
            altitude_m        INTEGER NOT NULL,
            error_flags       INTEGER NOT NULL,
            valid             INTEGER NOT NULL,
            rule_flags        TEXT    NOT NULL,
            ingest_time       TEXT    NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Time-range queries from the monitoring side
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_packets_timestamp_ms
            ON packets (timestamp_ms);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_packets_valid
            ON packets (valid);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
