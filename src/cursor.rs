//! Durable byte offset into the packet stream.
//!
//! The offset is stored as decimal text. `commit` writes a sibling temp file,
//! fsyncs it and renames it over the cursor file, so a crash leaves either
//! the previous or the new offset on disk and never a torn value.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::CursorError;

#[derive(Debug, Clone)]
pub struct StreamCursor {
    path: PathBuf,
}

impl StreamCursor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last committed offset, or 0 when nothing was ever committed.
    pub async fn load(&self) -> Result<u64, CursorError> {
        // ---
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        trimmed
            .parse::<u64>()
            .map_err(|_| CursorError::Corrupt { content: trimmed.to_string() })
    }

    /// Atomically replace the stored offset.
    pub async fn commit(&self, offset: u64) -> Result<(), CursorError> {
        // ---
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(offset.to_string().as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &self.path).await?;
        self.sync_parent_dir().await;

        tracing::trace!(offset, path = %self.path.display(), "cursor committed");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    #[cfg(unix)]
    async fn sync_parent_dir(&self) {
        // ---
        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        // Makes the rename itself durable. Best effort: some filesystems refuse.
        if let Ok(handle) = fs::File::open(dir).await {
            if let Err(e) = handle.sync_all().await {
                tracing::debug!(error = %e, "directory fsync not supported");
            }
        }
    }

    #[cfg(not(unix))]
    async fn sync_parent_dir(&self) {}
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_missing_cursor_starts_at_zero() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let cursor = StreamCursor::new(dir.path().join("last_offset.txt"));

        assert_eq!(assert_ok!(cursor.load().await), 0);
    }

    #[tokio::test]
    async fn test_commit_then_load() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let cursor = StreamCursor::new(dir.path().join("state").join("last_offset.txt"));

        assert_ok!(cursor.commit(360).await);
        assert_eq!(cursor.load().await.unwrap(), 360);

        assert_ok!(cursor.commit(720).await);
        assert_eq!(cursor.load().await.unwrap(), 720);

        // the temp file never survives a completed commit
        assert!(!cursor.temp_path().exists());
    }

    #[tokio::test]
    async fn test_reload_from_a_fresh_handle() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_offset.txt");

        StreamCursor::new(&path).commit(1_080).await.unwrap();
        assert_eq!(StreamCursor::new(&path).load().await.unwrap(), 1_080);
    }

    #[tokio::test]
    async fn test_garbage_cursor_is_an_error() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_offset.txt");
        std::fs::write(&path, "not-a-number").unwrap();

        let err = assert_err!(StreamCursor::new(&path).load().await);
        assert!(matches!(err, CursorError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_whitespace_is_tolerated() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_offset.txt");
        std::fs::write(&path, "72\n").unwrap();

        assert_eq!(StreamCursor::new(&path).load().await.unwrap(), 72);
    }
}
