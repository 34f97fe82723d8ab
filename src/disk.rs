use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::errors::EngineResult;
use crate::{Page, PageId, PAGE_SIZE};

/// Owns the two files backing the engine: a data file of fixed-size pages and
/// an append-only log file.
///
/// Page writes sync immediately; log appends do not. The log manager decides
/// when the log stream is forced with [`DiskManager::flush_log`].
pub struct DiskManager {
    data: Mutex<File>,
    log: Mutex<File>,
    next_page_id: AtomicU32,
}

impl DiskManager {
    pub fn open<P: AsRef<Path>>(data_path: P, log_path: P) -> EngineResult<Self> {
        let data_path = data_path.as_ref();
        if let Some(parent) = data_path.parent() {
            create_dir_all(parent)?;
        }
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(data_path)?;
        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(log_path.as_ref())?;

        // Free page ids are not persisted; the allocation counter restarts
        // from the file size.
        let file_size = data.metadata()?.len();
        let next_page_id = AtomicU32::new((file_size / PAGE_SIZE as u64) as u32);

        Ok(Self {
            data: Mutex::new(data),
            log: Mutex::new(log),
            next_page_id,
        })
    }

    /// Reads a page. A read past the end of the file yields a zeroed page,
    /// which the common header decodes as `PageType::Invalid`.
    pub fn read_page(&self, page_id: PageId) -> EngineResult<Page> {
        let mut page = Page::new(page_id);
        let mut file = self.data.lock();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= file.metadata()?.len() {
            return Ok(page);
        }
        file.seek(SeekFrom::Start(offset))?;
        let bytes_read = file.read(&mut page.data)?;
        for b in &mut page.data[bytes_read..] {
            *b = 0;
        }
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> EngineResult<()> {
        let mut file = self.data.lock();
        let offset = page.id as u64 * PAGE_SIZE as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.sync_all()?;
        let min_pages = page.id + 1;
        self.next_page_id.fetch_max(min_pages, Ordering::SeqCst);
        Ok(())
    }

    /// Hands out the next unused page id. Ids are dense and monotonic.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Space is not reclaimed in this engine; deallocation is a marker only.
    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Recovery replays pages whose ids precede the allocation counter; this
    /// keeps the counter ahead of any page id observed in the log.
    pub fn ensure_allocated(&self, page_id: PageId) {
        self.next_page_id.fetch_max(page_id + 1, Ordering::SeqCst);
    }

    pub fn num_pages(&self) -> u32 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Appends bytes to the log file without forcing them to stable storage.
    pub fn write_log(&self, bytes: &[u8]) -> EngineResult<()> {
        let mut file = self.log.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        Ok(())
    }

    pub fn flush_log(&self) -> EngineResult<()> {
        self.log.lock().sync_all()?;
        Ok(())
    }

    /// Reads up to `buf.len()` log bytes starting at `offset`. Returns the
    /// number of bytes read; 0 at end of stream.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> EngineResult<usize> {
        let mut file = self.log.lock();
        if offset >= file.metadata()?.len() {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    pub fn log_len(&self) -> EngineResult<u64> {
        Ok(self.log.lock().metadata()?.len())
    }

    /// Rewinds the log to a fresh starting point after recovery terminates.
    pub fn truncate_log(&self) -> EngineResult<()> {
        let file = self.log.lock();
        file.set_len(0)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use tempfile::tempdir;

    fn open_disk(dir: &std::path::Path) -> DiskManager {
        DiskManager::open(dir.join("test.db"), dir.join("test.log")).unwrap()
    }

    #[test]
    fn page_write_then_read() {
        let dir = tempdir().unwrap();
        let disk = open_disk(dir.path());

        let page_id = disk.allocate_page();
        assert_eq!(page_id, 0);

        let mut page = Page::new(page_id);
        page.set_page_type(PageType::Table);
        page.set_lsn(123);
        disk.write_page(&page).unwrap();

        let read = disk.read_page(page_id).unwrap();
        assert_eq!(read.page_type(), PageType::Table);
        assert_eq!(read.lsn(), 123);
    }

    #[test]
    fn read_past_eof_is_zeroed() {
        let dir = tempdir().unwrap();
        let disk = open_disk(dir.path());

        let page = disk.read_page(17).unwrap();
        assert_eq!(page.page_type(), PageType::Invalid);
        assert!(page.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn allocation_counter_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let disk = open_disk(dir.path());
            let mut page = Page::new(disk.allocate_page());
            page.set_page_type(PageType::Table);
            disk.write_page(&page).unwrap();
            let mut page = Page::new(disk.allocate_page());
            page.set_page_type(PageType::Table);
            disk.write_page(&page).unwrap();
        }
        let disk = open_disk(dir.path());
        assert_eq!(disk.allocate_page(), 2);
    }

    #[test]
    fn log_append_and_chunked_read() {
        let dir = tempdir().unwrap();
        let disk = open_disk(dir.path());

        disk.write_log(b"hello ").unwrap();
        disk.write_log(b"wal").unwrap();
        disk.flush_log().unwrap();
        assert_eq!(disk.log_len().unwrap(), 9);

        let mut buf = [0u8; 6];
        assert_eq!(disk.read_log(&mut buf, 0).unwrap(), 6);
        assert_eq!(&buf, b"hello ");
        assert_eq!(disk.read_log(&mut buf, 6).unwrap(), 3);
        assert_eq!(&buf[..3], b"wal");
        assert_eq!(disk.read_log(&mut buf, 9).unwrap(), 0);

        disk.truncate_log().unwrap();
        assert_eq!(disk.log_len().unwrap(), 0);
    }
}
