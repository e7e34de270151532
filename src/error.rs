//! Error taxonomy for the ingestion pipeline.
//!
//! Per-packet failures (`DecodeError`) are recovered inside a tick, I/O
//! failures (`StoreError`, `SinkError`, `CursorError`) abort the current tick
//! without committing the cursor, and `ConfigError` is only ever produced at
//! startup.

use std::io;

use thiserror::Error;

/// Failure to turn a 36-byte frame into a [`crate::TelemetryPacket`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes")]
    Truncated { len: usize },

    #[error("crc mismatch: received 0x{received:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { received: u32, computed: u32 },

    #[error("bad magic 0x{found:08X}")]
    BadMagic { found: u32 },
}

/// Persistence store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Expected on replay; the scheduler treats it as a no-op.
    #[error("packet {0} already stored")]
    DuplicateKey(u32),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("rule flag encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("stored row for packet {packet_id} is unreadable: {reason}")]
    CorruptRow { packet_id: i64, reason: String },
}

/// Event sink failures.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Stream cursor failures.
#[derive(Error, Debug)]
pub enum CursorError {
    #[error("cursor I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cursor file holds {content:?}, not a byte offset")]
    Corrupt { content: String },
}

/// Tick-level failure. Aborts the tick; the cursor stays where it was.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stream read failed: {0}")]
    Stream(#[source] io::Error),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Invalid configuration. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var}: {reason}")]
    Invalid { var: String, reason: String },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}
