mod file;

pub use file::DiskFile;

use crate::error::{BittorrentError, Result};
use crate::torrent::{FileInfo, Metainfo};
use async_trait::async_trait;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Offset-addressed access to one underlying file.
///
/// Implementations serialize their own I/O; callers may share a handle
/// between tasks.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn open(&self) -> Result<()>;

    /// Write all of `data` starting at `file_offset`
    async fn write(&self, data: &[u8], file_offset: u64) -> Result<()>;

    /// Fill `buf` from `file_offset`
    async fn read(&self, buf: &mut [u8], file_offset: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Part of a torrent-global byte range that lands in one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub file_index: usize,
    pub file_offset: u64,
    /// Sub-range of the caller's buffer
    pub buf_range: Range<usize>,
}

/// Split `[offset, offset + len)` into per-file segments, in file order.
/// Only files whose byte ranges overlap the range appear.
pub fn segments(files: &[FileInfo], offset: u64, len: usize) -> Vec<Segment> {
    let end = offset + len as u64;

    files
        .iter()
        .enumerate()
        .filter_map(|(file_index, file)| {
            let start = offset.max(file.offset);
            let stop = end.min(file.offset + file.length);
            (start < stop).then(|| Segment {
                file_index,
                file_offset: start - file.offset,
                buf_range: (start - offset) as usize..(stop - offset) as usize,
            })
        })
        .collect()
}

/// Maps the torrent's linear byte space onto its files
pub struct StorageManager {
    layout: Vec<FileInfo>,
    files: Vec<Arc<dyn FileStore>>,
}

impl StorageManager {
    /// Disk-backed storage rooted at `download_dir`
    pub fn on_disk<P: AsRef<Path>>(download_dir: P, metainfo: &Metainfo) -> Self {
        let download_dir = download_dir.as_ref();

        let files = metainfo
            .files
            .iter()
            .map(|file| {
                let path = file
                    .path
                    .iter()
                    .fold(download_dir.to_path_buf(), |path, part| path.join(part));
                Arc::new(DiskFile::new(path)) as Arc<dyn FileStore>
            })
            .collect();

        Self::with_files(metainfo.files.clone(), files)
    }

    pub fn with_files(layout: Vec<FileInfo>, files: Vec<Arc<dyn FileStore>>) -> Self {
        assert_eq!(layout.len(), files.len(), "one store per file");
        Self { layout, files }
    }

    pub async fn open(&self) -> Result<()> {
        for file in &self.files {
            file.open().await?;
        }
        info!("Storage initialized: {} files", self.files.len());
        Ok(())
    }

    /// Write `data` at torrent-global `offset`, one write per overlapping file
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        for segment in segments(&self.layout, offset, data.len()) {
            debug!(
                "Writing {} bytes to file {} at offset {}",
                segment.buf_range.len(),
                segment.file_index,
                segment.file_offset
            );
            self.files[segment.file_index]
                .write(&data[segment.buf_range], segment.file_offset)
                .await?;
        }
        Ok(())
    }

    /// Read `length` bytes from torrent-global `offset`
    pub async fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        let segments = segments(&self.layout, offset, length);

        let covered: usize = segments.iter().map(|s| s.buf_range.len()).sum();
        if covered != length {
            return Err(BittorrentError::StorageError(format!(
                "Range {}+{} is outside the torrent",
                offset, length
            )));
        }

        for segment in segments {
            self.files[segment.file_index]
                .read(&mut buf[segment.buf_range], segment.file_offset)
                .await?;
        }
        Ok(buf)
    }

    pub async fn close(&self) {
        for (file, info) in self.files.iter().zip(&self.layout) {
            if let Err(e) = file.close().await {
                warn!("Failed to close {}: {}", info.path.join("/"), e);
            }
        }
    }
}

/// In-memory file used by tests in place of the disk
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use parking_lot::Mutex;

    pub struct MemoryFile {
        pub data: Mutex<Vec<u8>>,
        pub open: Mutex<bool>,
        pub writes: Mutex<usize>,
    }

    impl MemoryFile {
        pub fn new(length: u64) -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(vec![0; length as usize]),
                open: Mutex::new(false),
                writes: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl FileStore for MemoryFile {
        async fn open(&self) -> Result<()> {
            *self.open.lock() = true;
            Ok(())
        }

        async fn write(&self, data: &[u8], file_offset: u64) -> Result<()> {
            if !*self.open.lock() {
                return Err(BittorrentError::StorageLost("file closed".to_string()));
            }
            let start = file_offset as usize;
            self.data.lock()[start..start + data.len()].copy_from_slice(data);
            *self.writes.lock() += 1;
            Ok(())
        }

        async fn read(&self, buf: &mut [u8], file_offset: u64) -> Result<()> {
            let start = file_offset as usize;
            buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            *self.open.lock() = false;
            Ok(())
        }
    }

    /// Storage over in-memory files matching `metainfo`'s layout
    pub fn storage_for(metainfo: &Metainfo) -> (StorageManager, Vec<Arc<MemoryFile>>) {
        let memory: Vec<Arc<MemoryFile>> = metainfo
            .files
            .iter()
            .map(|f| MemoryFile::new(f.length))
            .collect();
        let files = memory
            .iter()
            .map(|m| m.clone() as Arc<dyn FileStore>)
            .collect();
        (StorageManager::with_files(metainfo.files.clone(), files), memory)
    }
}
