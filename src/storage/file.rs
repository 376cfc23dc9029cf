use super::FileStore;
use crate::error::{BittorrentError, Result};
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// A file on disk. The handle mutex serializes reads and writes.
pub struct DiskFile {
    path: PathBuf,
    handle: Mutex<Option<File>>,
}

impl DiskFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            handle: Mutex::new(None),
        }
    }

    fn closed(&self) -> BittorrentError {
        BittorrentError::StorageLost(format!("{} is not open", self.path.display()))
    }
}

#[async_trait]
impl FileStore for DiskFile {
    async fn open(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // existing data is kept so an interrupted download's bytes survive
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;

        debug!("Opened {}", self.path.display());
        *self.handle.lock().await = Some(file);
        Ok(())
    }

    async fn write(&self, data: &[u8], file_offset: u64) -> Result<()> {
        let mut handle = self.handle.lock().await;
        let file = handle.as_mut().ok_or_else(|| self.closed())?;

        file.seek(SeekFrom::Start(file_offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn read(&self, buf: &mut [u8], file_offset: u64) -> Result<()> {
        let mut handle = self.handle.lock().await;
        let file = handle.as_mut().ok_or_else(|| self.closed())?;

        file.seek(SeekFrom::Start(file_offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.handle.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
            debug!("Closed {}", self.path.display());
        }
        Ok(())
    }
}
