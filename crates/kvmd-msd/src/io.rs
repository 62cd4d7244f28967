//! Image transfer primitives: a chunked reader and a writer that paces
//! fsync so a slow SD card never accumulates gigabytes of dirty pages.
//! Both throttle progress notifications to one per second.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};

use kvmd_core::{Notifier, NOTIFY_CHANGED};

use crate::MsdError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferState {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readed: Option<u64>,
}

pub struct ImageReader {
    file: File,
    name: String,
    size: u64,
    readed: u64,
    chunk_size: usize,
    notifier: Arc<Notifier>,
    tick: Instant,
}

impl ImageReader {
    pub async fn open(
        notifier: Arc<Notifier>,
        name: &str,
        path: &Path,
        chunk_size: usize,
    ) -> Result<Self, MsdError> {
        info!(name, "reading image from MSD");
        let file = File::open(path)
            .await
            .map_err(|err| MsdError::Internal(format!("can't open image for reading: {err}")))?;
        let size = file
            .metadata()
            .await
            .map_err(|err| MsdError::Internal(format!("can't stat image: {err}")))?
            .len();
        Ok(Self {
            file,
            name: name.to_owned(),
            size,
            readed: 0,
            chunk_size,
            notifier,
            tick: Instant::now() - std::time::Duration::from_secs(2),
        })
    }

    pub fn state(&self) -> TransferState {
        TransferState {
            name: self.name.clone(),
            size: self.size,
            written: None,
            readed: Some(self.readed),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// `None` at EOF.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, MsdError> {
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            let n = self
                .file
                .read(&mut chunk[filled..])
                .await
                .map_err(|err| MsdError::Internal(format!("image read failed: {err}")))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            self.notifier.notify(NOTIFY_CHANGED);
            return Ok(None);
        }
        chunk.truncate(filled);
        self.readed += filled as u64;

        if self.tick.elapsed().as_secs() >= 1 || self.readed == self.size {
            self.tick = Instant::now();
            self.notifier.notify(NOTIFY_CHANGED);
        }
        Ok(Some(chunk))
    }
}

pub struct ImageWriter {
    file: File,
    name: String,
    path: PathBuf,
    expected: u64,
    written: u64,
    unsynced: u64,
    sync_size: u64,
    chunk_size: usize,
    notifier: Arc<Notifier>,
    tick: Instant,
}

impl ImageWriter {
    pub async fn open(
        notifier: Arc<Notifier>,
        name: &str,
        path: &Path,
        expected: u64,
        sync_size: u64,
        chunk_size: usize,
    ) -> Result<Self, MsdError> {
        info!(name, expected, "writing image to MSD");
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| MsdError::Internal(format!("can't create image dirs: {err}")))?;
        }
        let file = File::create(path)
            .await
            .map_err(|err| MsdError::Internal(format!("can't open image for writing: {err}")))?;
        Ok(Self {
            file,
            name: name.to_owned(),
            path: path.to_owned(),
            expected,
            written: 0,
            unsynced: 0,
            sync_size,
            chunk_size,
            notifier,
            tick: Instant::now(),
        })
    }

    pub fn state(&self) -> TransferState {
        TransferState {
            name: self.name.clone(),
            size: self.expected,
            written: Some(self.written),
            readed: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<u64, MsdError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|err| MsdError::Internal(format!("image write failed: {err}")))?;
        self.written += chunk.len() as u64;

        self.unsynced += chunk.len() as u64;
        if self.unsynced >= self.sync_size {
            self.sync().await?;
            self.unsynced = 0;
        }

        if self.tick.elapsed().as_secs() >= 1 {
            self.tick = Instant::now();
            self.notifier.notify(NOTIFY_CHANGED);
        }
        Ok(self.written)
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.expected
    }

    /// Final sync + close with the OK/INCOMPLETE/OVERFLOW verdict log.
    pub async fn finish(mut self) -> bool {
        if self.written == self.expected {
            info!(name = %self.name, written = self.written, "image written: OK");
        } else if self.written < self.expected {
            error!(
                name = %self.name,
                written = self.written,
                expected = self.expected,
                "image written: INCOMPLETE"
            );
        } else {
            warn!(
                name = %self.name,
                written = self.written,
                expected = self.expected,
                "image written: OVERFLOW"
            );
        }
        let complete = self.written >= self.expected;
        if let Err(err) = self.sync().await {
            error!(%err, "can't sync image writer");
        }
        complete
    }

    async fn sync(&mut self) -> Result<(), MsdError> {
        self.file
            .flush()
            .await
            .map_err(|err| MsdError::Internal(format!("image flush failed: {err}")))?;
        self.file
            .sync_all()
            .await
            .map_err(|err| MsdError::Internal(format!("image fsync failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writer_then_reader_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/test.img");
        let notifier = Arc::new(Notifier::new());

        let payload = vec![0xA5u8; 100_000];
        let mut writer = ImageWriter::open(notifier.clone(), "test.img", &path, 100_000, 4096, 65536)
            .await
            .unwrap();
        for chunk in payload.chunks(30_000) {
            writer.write_chunk(chunk).await.unwrap();
        }
        assert!(writer.is_complete());
        assert_eq!(writer.state().written, Some(100_000));
        assert!(writer.finish().await);

        let mut reader = ImageReader::open(notifier, "test.img", &path, 65536).await.unwrap();
        assert_eq!(reader.total_size(), 100_000);
        let mut out = Vec::new();
        while let Some(chunk) = reader.read_chunk().await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, payload);
        assert_eq!(reader.state().readed, Some(100_000));
    }

    #[tokio::test]
    async fn short_upload_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.img");
        let notifier = Arc::new(Notifier::new());
        let mut writer = ImageWriter::open(notifier, "short.img", &path, 100, 4096, 65536)
            .await
            .unwrap();
        writer.write_chunk(&[0u8; 10]).await.unwrap();
        assert!(!writer.is_complete());
        assert!(!writer.finish().await);
    }
}
