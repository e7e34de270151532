//! Append-only JSON Lines log of anomaly events.
//!
//! Single writer. Each `append` writes exactly one line and does not return
//! until the line is flushed and synced, so an acknowledged event survives a
//! crash. No deduplication: after a crash inside the scheduler's
//! at-least-once window the same event may be written again.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::SinkError;
use crate::models::AnomalyEvent;

#[derive(Debug)]
pub struct EventSink {
    path: PathBuf,
    file: File,
}

impl EventSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        // ---
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&mut self, event: &AnomalyEvent) -> Result<(), SinkError> {
        // ---
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;

        tracing::info!(
            metric = %event.metric,
            packet_id = event.packet_id,
            value = event.value,
            severity = ?event.severity,
            "anomaly event appended"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::{DetectionRule, Metric, Severity};

    fn event(packet_id: u32, value: f64) -> AnomalyEvent {
        // ---
        AnomalyEvent {
            metric: Metric::TempCenti,
            packet_id,
            value,
            mean: 2_050.0,
            stddev: 12.5,
            z_score: Some((value - 2_050.0) / 12.5),
            threshold_k: 3.0,
            rule: DetectionRule::ZScore,
            severity: Severity::Major,
            timestamp: 1_764_547_200_000 + u64::from(packet_id),
            detected_at: Utc.with_ymd_and_hms(2025, 12, 2, 0, 0, 0).unwrap(),
        }
    }

    fn read_lines(path: &Path) -> Vec<AnomalyEvent> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_one_json_object_per_line() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("ai_output.jsonl");

        let mut sink = EventSink::open(&path).await.unwrap();
        sink.append(&event(1, 2_300.0)).await.unwrap();
        sink.append(&event(2, 1_800.0)).await.unwrap();

        assert_eq!(read_lines(&path), vec![event(1, 2_300.0), event(2, 1_800.0)]);
    }

    #[tokio::test]
    async fn test_reopen_appends_instead_of_truncating() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ai_output.jsonl");

        EventSink::open(&path).await.unwrap().append(&event(1, 2_300.0)).await.unwrap();
        EventSink::open(&path).await.unwrap().append(&event(1, 2_300.0)).await.unwrap();

        // re-delivery is allowed; consumers deduplicate
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[tokio::test]
    async fn test_open_fails_when_path_is_a_directory() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            EventSink::open(dir.path()).await,
            Err(SinkError::Io(_))
        ));
    }
}
