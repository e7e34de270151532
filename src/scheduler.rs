//! Ingestion scheduler: the tick loop that drives the whole pipeline.
//!
//! Each tick moves through `Idle -> ReadAvailable -> DecodeLoop -> Commit`:
//!
//! 1. read the bytes appended to the stream since the committed cursor;
//! 2. decode whole 36-byte packets, resynchronizing byte by byte when the
//!    stream is misaligned and skipping aligned packets whose CRC fails;
//! 3. for every decoded packet not yet stored: validate, score against the
//!    rolling windows, append events, insert the record, admit the samples;
//! 4. commit the cursor once, after the batch.
//!
//! Per-packet decode problems never abort a tick. Store, sink and cursor
//! failures do, before the commit, so the same bytes are read again on the
//! next tick. Replays are harmless: already-stored packets are recognised and
//! skipped without touching the detector.

use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::codec::{PacketCodec, PACKET_SIZE};
use crate::config::Config;
use crate::cursor::StreamCursor;
use crate::detector::{AnomalyDetector, DetectorState};
use crate::error::{DecodeError, PipelineError, StoreError};
use crate::models::TelemetryPacket;
use crate::sink::EventSink;
use crate::store::Store;
use crate::validator::{SequencePoint, Validator};

// ---

/// What one tick did. Also returned (partially filled) for aborted ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub start_offset: u64,
    /// Offset committed at the end of the tick; equals `start_offset` when
    /// nothing was consumed or the tick was aborted.
    pub end_offset: u64,
    pub bytes_read: usize,
    pub decoded: u64,
    pub inserted: u64,
    pub flagged: u64,
    pub duplicates: u64,
    pub crc_failures: u64,
    pub framing_errors: u64,
    pub skipped_bytes: u64,
    pub missing_packets: u64,
    /// Stored packets whose on-board `error_flags` mask was non-zero.
    pub error_flag_packets: u64,
    pub anomaly_events: u64,
    /// The resync scan exhausted its bound.
    pub stalled: bool,
    /// Shutdown was requested mid-batch; nothing was committed.
    pub interrupted: bool,
}

/// Cumulative counters published for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestCounters {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub consecutive_failures: u64,
    pub slow_ticks: u64,
    pub packets_inserted: u64,
    pub flagged_records: u64,
    pub duplicates: u64,
    pub crc_failures: u64,
    pub framing_errors: u64,
    pub skipped_bytes: u64,
    pub resync_stalls: u64,
    pub missing_packets: u64,
    pub error_flag_packets: u64,
    pub anomaly_events: u64,
    pub committed_offset: u64,
}

impl IngestCounters {
    fn absorb(&mut self, report: &TickReport) {
        // ---
        self.packets_inserted += report.inserted;
        self.flagged_records += report.flagged;
        self.duplicates += report.duplicates;
        self.crc_failures += report.crc_failures;
        self.framing_errors += report.framing_errors;
        self.skipped_bytes += report.skipped_bytes;
        self.resync_stalls += u64::from(report.stalled);
        self.missing_packets += report.missing_packets;
        self.error_flag_packets += report.error_flag_packets;
        self.anomaly_events += report.anomaly_events;
    }
}

/// Single logical actor owning every piece of pipeline state.
///
/// At most one `Pipeline` may run against a given cursor file.
pub struct Pipeline {
    stream_path: PathBuf,
    codec: PacketCodec,
    cursor: StreamCursor,
    validator: Validator,
    detector: AnomalyDetector,
    windows: DetectorState,
    last_accepted: Option<SequencePoint>,
    store: Store,
    sink: EventSink,
    resync_scan_bound: usize,
    max_batch_bytes: usize,
    counters: IngestCounters,
}

impl Pipeline {
    /// Build a pipeline and restore its in-memory state from the store: the
    /// sequencing point from the newest record and the detector windows from
    /// the most recent records.
    pub async fn open(cfg: &Config, store: Store) -> Result<Self, PipelineError> {
        // ---
        let sink = EventSink::open(&cfg.event_log_path).await?;
        let cursor = StreamCursor::new(&cfg.cursor_path);
        let committed_offset = cursor.load().await?;

        let detector = AnomalyDetector::new(cfg.detector.clone());
        let mut windows = DetectorState::default();
        let warm = u32::try_from(detector.config().largest_window()).unwrap_or(u32::MAX);
        let history = store.recent(warm).await?;
        for record in &history {
            detector.admit(&mut windows, record);
        }
        let last_accepted = store
            .latest()
            .await?
            .map(|r| SequencePoint::from(&r.packet));

        info!(
            committed_offset,
            warmed_from = history.len(),
            last_packet_id = ?last_accepted.map(|p| p.packet_id),
            "pipeline state restored"
        );

        Ok(Self {
            stream_path: cfg.stream_path.clone(),
            codec: PacketCodec::new(cfg.byte_order),
            cursor,
            validator: Validator::new(cfg.limits.clone()),
            detector,
            windows,
            last_accepted,
            store,
            sink,
            resync_scan_bound: cfg.resync_scan_bound,
            max_batch_bytes: cfg.max_batch_bytes,
            counters: IngestCounters {
                committed_offset,
                ..IngestCounters::default()
            },
        })
    }

    pub fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    pub fn detector_state(&self) -> &DetectorState {
        &self.windows
    }

    /// Run one tick to completion.
    pub async fn tick(&mut self) -> Result<TickReport, PipelineError> {
        let (_keep, never) = watch::channel(false);
        self.tick_until(&never).await
    }

    /// Run one tick, stopping between packets once `stop` reads `true`.
    pub async fn tick_until(
        &mut self,
        stop: &watch::Receiver<bool>,
    ) -> Result<TickReport, PipelineError> {
        // ---
        let mut report = TickReport::default();
        let outcome = self.run_tick(&mut report, stop).await;

        self.counters.ticks += 1;
        self.counters.absorb(&report);
        match outcome {
            Ok(()) => {
                self.counters.consecutive_failures = 0;
                self.counters.committed_offset = report.end_offset;
                Ok(report)
            }
            Err(e) => {
                self.counters.failed_ticks += 1;
                self.counters.consecutive_failures += 1;
                Err(e)
            }
        }
    }

    async fn run_tick(
        &mut self,
        report: &mut TickReport,
        stop: &watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        // ---
        // ReadAvailable
        let committed = self.cursor.load().await?;
        report.start_offset = committed;
        report.end_offset = committed;

        let mut start = committed;
        let buf = match self.read_from(&mut start).await? {
            Some(buf) => buf,
            None => return Ok(()),
        };
        report.start_offset = start;
        report.bytes_read = buf.len();

        // DecodeLoop
        let mut pos = 0usize;
        let mut scan_run = 0usize;
        while buf.len() - pos >= PACKET_SIZE {
            if *stop.borrow() {
                info!(offset = start + pos as u64, "shutdown requested, abandoning batch");
                report.interrupted = true;
                return Ok(());
            }

            let frame = &buf[pos..pos + PACKET_SIZE];
            let offset = start + pos as u64;
            match self.codec.decode(frame) {
                Ok(packet) => {
                    if scan_run > 0 {
                        info!(offset, skipped = scan_run, "stream realigned");
                        scan_run = 0;
                    }
                    report.decoded += 1;
                    self.ingest(packet, report).await?;
                    pos += PACKET_SIZE;
                }
                Err(DecodeError::ChecksumMismatch { received, computed })
                    if self.codec.has_magic(frame) =>
                {
                    scan_run = 0;
                    report.crc_failures += 1;
                    warn!(
                        offset,
                        received = format_args!("0x{received:08X}"),
                        computed = format_args!("0x{computed:08X}"),
                        "crc mismatch, discarding packet"
                    );
                    pos += PACKET_SIZE;
                }
                Err(e) => {
                    if scan_run == 0 {
                        report.framing_errors += 1;
                        warn!(offset, error = %e, "lost packet alignment, scanning for magic");
                    }
                    if scan_run >= self.resync_scan_bound {
                        report.stalled = true;
                        warn!(
                            offset,
                            scanned = scan_run,
                            "no packet boundary within scan bound, resuming next tick"
                        );
                        break;
                    }
                    scan_run += 1;
                    report.skipped_bytes += 1;
                    pos += 1;
                }
            }
        }

        // Commit
        let end = start + pos as u64;
        if end != committed {
            self.cursor.commit(end).await?;
        }
        report.end_offset = end;

        let trailing = buf.len() - pos;
        if trailing > 0 && !report.stalled {
            debug!(trailing, "partial packet left for the next tick");
        }
        Ok(())
    }

    /// Read unconsumed stream bytes starting at `*offset`. Resets `*offset`
    /// to 0 when the stream is shorter than the cursor (rotated by its
    /// producer). `None` when the stream does not exist yet.
    async fn read_from(&self, offset: &mut u64) -> Result<Option<Vec<u8>>, PipelineError> {
        // ---
        let mut file = match File::open(&self.stream_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.stream_path.display(), "telemetry stream not found, nothing to do");
                return Ok(None);
            }
            Err(e) => return Err(PipelineError::Stream(e)),
        };

        let len = file.metadata().await.map_err(PipelineError::Stream)?.len();
        if *offset > len {
            warn!(
                committed = *offset,
                stream_len = len,
                "cursor is past the end of the stream (rotated?), restarting at 0"
            );
            *offset = 0;
        }

        file.seek(SeekFrom::Start(*offset))
            .await
            .map_err(PipelineError::Stream)?;
        let mut buf = Vec::new();
        file.take(self.max_batch_bytes as u64)
            .read_to_end(&mut buf)
            .await
            .map_err(PipelineError::Stream)?;
        Ok(Some(buf))
    }

    async fn ingest(
        &mut self,
        packet: TelemetryPacket,
        report: &mut TickReport,
    ) -> Result<(), PipelineError> {
        // ---
        if self.store.contains(packet.packet_id).await? {
            report.duplicates += 1;
            debug!(packet_id = packet.packet_id, "already stored, skipping replay");
            return Ok(());
        }

        if let Some(prev) = self.last_accepted {
            let expected = u64::from(prev.packet_id) + 1;
            let id = u64::from(packet.packet_id);
            if id > expected {
                report.missing_packets += id - expected;
                info!(
                    prev = prev.packet_id,
                    cur = packet.packet_id,
                    missing = id - expected,
                    "packet id gap"
                );
            }
        }

        let now = Utc::now();
        let record = self.validator.validate(&packet, self.last_accepted, now);
        let events = self.detector.evaluate(&self.windows, &record, now);
        for event in &events {
            self.sink.append(event).await?;
        }

        match self.store.insert(&record).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(id)) => {
                report.duplicates += 1;
                debug!(packet_id = id, "stored concurrently, skipping");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        self.detector.admit(&mut self.windows, &record);
        // high-water mark: a regressed id is stored but does not move it
        if self
            .last_accepted
            .map_or(true, |prev| record.packet.packet_id > prev.packet_id)
        {
            self.last_accepted = Some(SequencePoint::from(&record.packet));
        }
        report.inserted += 1;
        report.flagged += u64::from(!record.valid);
        if packet.error_flags != 0 {
            report.error_flag_packets += 1;
            info!(
                packet_id = packet.packet_id,
                error_flags = format_args!("0x{:04X}", packet.error_flags),
                "on-board error flags set"
            );
        }
        report.anomaly_events += events.len() as u64;
        Ok(())
    }
}

// ---

/// Drive `pipeline` every `every` until `stop` turns `true` (or its sender
/// goes away). Ticks never overlap; a tick that overruns the interval causes
/// the missed ticks to be skipped, not queued.
pub async fn run(
    pipeline: &mut Pipeline,
    every: Duration,
    mut stop: watch::Receiver<bool>,
    counters: watch::Sender<IngestCounters>,
) {
    // ---
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = every.as_millis() as u64, "scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop.borrow() {
            break;
        }

        let tick_no = pipeline.counters().ticks + 1;
        let started = Instant::now();
        let outcome = pipeline
            .tick_until(&stop)
            .instrument(info_span!("tick", n = tick_no))
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(report) => info!(
                inserted = report.inserted,
                duplicates = report.duplicates,
                crc_failures = report.crc_failures,
                framing_errors = report.framing_errors,
                skipped_bytes = report.skipped_bytes,
                events = report.anomaly_events,
                offset = report.end_offset,
                elapsed_ms = elapsed.as_millis() as u64,
                "tick complete"
            ),
            Err(e) => error!(error = %e, "tick aborted, cursor not committed; retrying next tick"),
        }

        if elapsed > every {
            pipeline.counters.slow_ticks += 1;
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = every.as_millis() as u64,
                "slow tick"
            );
        }
        counters.send_replace(pipeline.counters().clone());
    }

    info!("scheduler stopped");
}
