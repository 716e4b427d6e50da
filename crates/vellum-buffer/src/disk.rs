//! Disk manager for page-level file I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use vellum_common::page::{PageId, PAGE_SIZE};
use vellum_common::Result;

/// Manages reading and writing pages of the index file.
///
/// The file is addressed in fixed-size blocks: page `n` lives at byte
/// offset `n * PAGE_SIZE`. The file grows on demand when a page past the
/// current end is written. A small sidecar file (`<path>.log`) persists the
/// page allocator's counter so allocation resumes correctly after reopen.
pub struct DiskManager {
    /// The index file handle.
    file: Mutex<File>,
    /// Path of the index file.
    path: PathBuf,
    /// Path of the allocation-log sidecar.
    log_path: PathBuf,
    /// Enable fsync after writes.
    fsync_enabled: bool,
    /// Whether the index file had content when it was opened.
    was_initialized: bool,
}

impl DiskManager {
    /// Opens (or creates) the index file at the given path.
    pub fn open(path: impl AsRef<Path>, fsync_enabled: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let was_initialized = file.metadata()?.len() > 0;

        let mut log_path = path.clone().into_os_string();
        log_path.push(".log");
        let log_path = PathBuf::from(log_path);

        tracing::debug!(
            path = %path.display(),
            existing = was_initialized,
            "opened index file"
        );

        Ok(Self {
            file: Mutex::new(file),
            path,
            log_path,
            fsync_enabled,
            was_initialized,
        })
    }

    /// Returns the path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if the index file already had content when opened.
    pub fn was_initialized(&self) -> bool {
        self.was_initialized
    }

    /// Reads a page from disk into the provided buffer.
    ///
    /// Reading past the end of the file is not an error: the missing tail
    /// is zero-filled. A page whose kind tag is zero is uninitialized and
    /// must be formatted by the caller before use.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset()))?;

        let mut read = 0;
        while read < PAGE_SIZE {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf[read..].fill(0);
        Ok(())
    }

    /// Writes a page to disk at its page-indexed offset.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.file_offset()))?;
        file.write_all(data)?;
        if self.fsync_enabled {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Persists the page allocator's counter to the sidecar log.
    ///
    /// The payload is a single little-endian u32.
    pub fn write_log(&self, next_page_id: u32) -> Result<()> {
        let mut log = File::create(&self.log_path)?;
        log.write_all(&next_page_id.to_le_bytes())?;
        if self.fsync_enabled {
            log.sync_data()?;
        }
        Ok(())
    }

    /// Reads the page allocator's counter back from the sidecar log.
    ///
    /// Returns `None` if the log is absent or truncated; the caller then
    /// falls back to the default (page 0 is the header, allocation resumes
    /// at 1).
    pub fn read_log(&self) -> Result<Option<u32>> {
        let mut log = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            let n = log.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        if read < buf.len() {
            tracing::warn!(path = %self.log_path.display(), "truncated allocation log");
            return Ok(None);
        }
        Ok(Some(u32::from_le_bytes(buf)))
    }

    /// Flushes all pending writes of the index file to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl Drop for DiskManager {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            tracing::warn!(path = %self.path.display(), error = %e, "sync on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_disk_manager() -> (DiskManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let dm = DiskManager::open(dir.path().join("test.db"), false).unwrap();
        (dm, dir)
    }

    #[test]
    fn test_disk_manager_open_fresh() {
        let (dm, _dir) = create_test_disk_manager();
        assert!(!dm.was_initialized());
        assert!(dm.path().exists());
    }

    #[test]
    fn test_disk_manager_write_read() {
        let (dm, _dir) = create_test_disk_manager();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAB;
        data[100] = 0xCD;
        data[PAGE_SIZE - 1] = 0xEF;
        dm.write_page(PageId(0), &data).unwrap();

        let mut read = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut read).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[100], 0xCD);
        assert_eq!(read[PAGE_SIZE - 1], 0xEF);
    }

    #[test]
    fn test_disk_manager_read_past_eof_zero_fills() {
        let (dm, _dir) = create_test_disk_manager();

        let mut buf = [0x77u8; PAGE_SIZE];
        dm.read_page(PageId(99), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disk_manager_sparse_write_zero_fills_gap() {
        let (dm, _dir) = create_test_disk_manager();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0x11;
        dm.write_page(PageId(3), &data).unwrap();

        // Pages 0..3 exist as file bytes now but were never written.
        let mut buf = [0xFFu8; PAGE_SIZE];
        dm.read_page(PageId(1), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        dm.read_page(PageId(3), &mut buf).unwrap();
        assert_eq!(buf[0], 0x11);
    }

    #[test]
    fn test_disk_manager_overwrite_page() {
        let (dm, _dir) = create_test_disk_manager();

        let mut data = [0u8; PAGE_SIZE];
        data[0] = 0xAA;
        dm.write_page(PageId(0), &data).unwrap();

        data[0] = 0xBB;
        dm.write_page(PageId(0), &data).unwrap();

        let mut read = [0u8; PAGE_SIZE];
        dm.read_page(PageId(0), &mut read).unwrap();
        assert_eq!(read[0], 0xBB);
    }

    #[test]
    fn test_disk_manager_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let dm = DiskManager::open(&path, true).unwrap();
            let mut data = [0u8; PAGE_SIZE];
            data[0] = 0xFF;
            dm.write_page(PageId(2), &data).unwrap();
        }

        {
            let dm = DiskManager::open(&path, true).unwrap();
            assert!(dm.was_initialized());
            let mut read = [0u8; PAGE_SIZE];
            dm.read_page(PageId(2), &mut read).unwrap();
            assert_eq!(read[0], 0xFF);
        }
    }

    #[test]
    fn test_disk_manager_log_roundtrip() {
        let (dm, _dir) = create_test_disk_manager();

        assert_eq!(dm.read_log().unwrap(), None);

        dm.write_log(42).unwrap();
        assert_eq!(dm.read_log().unwrap(), Some(42));

        dm.write_log(1000).unwrap();
        assert_eq!(dm.read_log().unwrap(), Some(1000));
    }

    #[test]
    fn test_disk_manager_log_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.db");

        {
            let dm = DiskManager::open(&path, false).unwrap();
            dm.write_log(17).unwrap();
        }

        let dm = DiskManager::open(&path, false).unwrap();
        assert_eq!(dm.read_log().unwrap(), Some(17));
    }
}
