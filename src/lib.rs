//! Ingestion, validation and rolling anomaly detection for a small-satellite
//! telemetry stream.
//!
//! Data flow: stream bytes -> [`codec`] -> [`validator`] -> [`store`], with
//! the numeric fields of every stored record also fed to the [`detector`],
//! whose events go to the [`sink`]. The [`scheduler`] orchestrates all of
//! it on a fixed tick and keeps its progress in the [`cursor`].
//!
//! The main types are re-exported at the crate root for the binary and the
//! integration tests.

pub mod codec;
pub mod config;
pub mod cursor;
pub mod detector;
pub mod error;
pub mod models;
pub mod routes;
pub mod scheduler;
pub mod schema;
pub mod sink;
pub mod store;
pub mod validator;

pub use codec::{ByteOrder, PacketCodec, MAGIC_ID, PACKET_SIZE};
pub use config::Config;
pub use cursor::StreamCursor;
pub use detector::{AnomalyDetector, DetectorConfig, DetectorState, MetricThresholds};
pub use error::{ConfigError, CursorError, DecodeError, PipelineError, SinkError, StoreError};
pub use models::{
    AnomalyEvent, DetectionRule, Field, Metric, RuleViolation, Severity, TelemetryPacket,
    ValidatedRecord,
};
pub use scheduler::{IngestCounters, Pipeline, TickReport};
pub use sink::EventSink;
pub use store::{RecordFilter, Store};
pub use validator::{FieldLimits, SequencePoint, Validator};
