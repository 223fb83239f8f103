//! File storage module
//!
//! The single output file a download writes verified pieces into.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::{Result, TorrentError};

/// Pre-sized output file with serialized writes
#[derive(Debug)]
pub struct OutputFile {
    path: PathBuf,
    total_size: u64,
    handle: Mutex<Option<File>>,
}

impl OutputFile {
    /// Create (or reuse) the file at `path` and size it to exactly `total_size` bytes
    pub async fn create(path: &Path, total_size: u64) -> Result<Self> {
        info!("Creating output file {} ({} bytes)", path.display(), total_size);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                error!("Failed to create directory '{}': {}", parent.display(), e);
                TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
            })?;
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to create file", path.display().to_string(), e.to_string())
            })?;

        file.set_len(total_size).await.map_err(|e| {
            error!("Failed to set file length for '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            total_size,
            handle: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Write `data` at `offset`. Writers queue on the file lock, so at most
    /// one write is in flight.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as u64;
        if end > self.total_size {
            return Err(TorrentError::storage_error_full(
                format!("Write of {} bytes at {} runs past end of file", data.len(), offset),
                self.path.display().to_string(),
                format!("file size {}", self.total_size),
            ));
        }

        let mut guard = self.handle.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            TorrentError::storage_error_full("Output file already closed", self.path.display().to_string(), "closed")
        })?;

        let path = self.path.display().to_string();
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| TorrentError::storage_error_full("Failed to seek in file", path.clone(), e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| TorrentError::storage_error_full("Failed to write to file", path.clone(), e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| TorrentError::storage_error_full("Failed to flush file", path, e.to_string()))?;

        trace!("Wrote {} bytes at offset {}", data.len(), offset);
        Ok(())
    }

    /// Flush to disk and release the handle; later writes fail. Closing twice is fine.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        if let Some(file) = guard.take() {
            file.sync_all().await.map_err(|e| {
                TorrentError::storage_error_full("Failed to sync file", self.path.display().to_string(), e.to_string())
            })?;
            debug!("Closed output file {}", self.path.display());
        }
        Ok(())
    }

    pub async fn is_open(&self) -> bool {
        self.handle.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_presizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video").join("clip.mp4");
        let file = OutputFile::create(&path, 49_152).await.unwrap();

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 49_152);
        assert_eq!(file.path(), path.as_path());
        assert!(file.is_open().await);
    }

    #[tokio::test]
    async fn test_write_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = OutputFile::create(&path, 10).await.unwrap();

        file.write_at(6, b"WXYZ").await.unwrap();
        file.write_at(0, b"abc").await.unwrap();
        file.close().await.unwrap();

        let content = std::fs::read(&path).unwrap();
        assert_eq!(&content, b"abc\0\0\0WXYZ");
    }

    #[tokio::test]
    async fn test_write_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = OutputFile::create(&dir.path().join("out.bin"), 4).await.unwrap();
        let err = file.write_at(2, b"abc").await.unwrap_err();
        assert!(matches!(err, TorrentError::StorageError { .. }));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = OutputFile::create(&dir.path().join("out.bin"), 4).await.unwrap();
        file.close().await.unwrap();
        file.close().await.unwrap();
        assert!(file.write_at(0, b"a").await.is_err());
        assert!(!file.is_open().await);
    }

    #[tokio::test]
    async fn test_concurrent_writes_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let file = Arc::new(OutputFile::create(&path, 64 * 8).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let file = file.clone();
            handles.push(tokio::spawn(async move {
                file.write_at(i as u64 * 64, &[i; 64]).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        file.close().await.unwrap();

        let content = std::fs::read(&path).unwrap();
        for i in 0..8usize {
            assert!(content[i * 64..(i + 1) * 64].iter().all(|&b| b == i as u8));
        }
    }
}
