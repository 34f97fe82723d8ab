use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::disk::DiskManager;
use crate::errors::{EngineError, EngineResult};
use crate::failpoint;
use crate::log_manager::LogManager;
use crate::{Page, PageId, INVALID_PAGE_ID};

type FrameId = usize;

/// Owning latch guards for a page. Latch crabbing keeps these across call
/// frames, so they hold the frame's lock `Arc` rather than a borrow.
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// A held page latch, read or write.
pub enum PageLatch {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

impl PageLatch {
    pub fn page(&self) -> &Page {
        match self {
            PageLatch::Read(g) => g,
            PageLatch::Write(g) => g,
        }
    }

    pub fn page_mut(&mut self) -> &mut Page {
        match self {
            PageLatch::Read(_) => panic!("write access through a read latch"),
            PageLatch::Write(g) => g,
        }
    }
}

/// One buffer frame: the cached page plus its pin count and dirty flag. The
/// page `RwLock` doubles as the page latch.
pub struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: AtomicU32,
    is_dirty: AtomicBool,
}

impl Frame {
    fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Read latch that can outlive this borrow; used by crabbing.
    pub fn rlatch(&self) -> PageLatch {
        PageLatch::Read(self.page.read_arc())
    }

    /// Write latch that can outlive this borrow; used by crabbing.
    pub fn wlatch(&self) -> PageLatch {
        PageLatch::Write(self.page.write_arc())
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::SeqCst)
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::SeqCst)
    }

    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::SeqCst);
    }
}

/// LRU over evictable (unpinned) frames. `insert` records an unpin at the
/// most-recently-used position, `erase` removes a frame on re-pin, `victim`
/// pops the least recently used. Stale queue entries left by `erase` are
/// skipped at pop time.
struct LruReplacer {
    queue: VecDeque<FrameId>,
    evictable: HashSet<FrameId>,
}

impl LruReplacer {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            evictable: HashSet::new(),
        }
    }

    fn insert(&mut self, frame_id: FrameId) {
        if !self.evictable.insert(frame_id) {
            return;
        }
        // Drop any stale position left behind by `erase`.
        self.queue.retain(|f| *f != frame_id);
        self.queue.push_back(frame_id);
    }

    fn erase(&mut self, frame_id: FrameId) {
        self.evictable.remove(&frame_id);
    }

    fn victim(&mut self) -> Option<FrameId> {
        while let Some(frame_id) = self.queue.pop_front() {
            if self.evictable.remove(&frame_id) {
                return Some(frame_id);
            }
        }
        None
    }
}

struct PoolInner {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LruReplacer,
}

/// The buffer pool manager: a fixed array of frames caching disk pages.
///
/// Honors the WAL rule: before a dirty page goes to disk, the log is forced
/// up to that page's LSN. A page is never evicted while pinned.
pub struct BufferPoolManager {
    disk: Arc<DiskManager>,
    log: Arc<LogManager>,
    frames: Vec<Arc<Frame>>,
    inner: Mutex<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, log: Arc<LogManager>) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Frame::new())).collect();
        Self {
            disk,
            log,
            frames,
            inner: Mutex::new(PoolInner {
                page_table: HashMap::new(),
                free_list: (0..pool_size).collect(),
                replacer: LruReplacer::new(),
            }),
        }
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Returns the frame holding `page_id`, pinned. Reads the page from disk
    /// if it is not resident, evicting an unpinned frame if necessary.
    pub fn fetch_page(&self, page_id: PageId) -> EngineResult<Arc<Frame>> {
        assert_ne!(page_id, INVALID_PAGE_ID);
        // A fetched id is an allocated id, even when the page has never been
        // written; keeps the allocator ahead of recovery and bootstrap reads.
        self.disk.ensure_allocated(page_id);
        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            inner.replacer.erase(frame_id);
            return Ok(frame.clone());
        }

        let frame_id = self.evict_frame(&mut inner)?;
        let frame = &self.frames[frame_id];
        let page = self.disk.read_page(page_id)?;
        *frame.write() = page;
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(false, Ordering::SeqCst);
        inner.page_table.insert(page_id, frame_id);
        Ok(frame.clone())
    }

    /// Allocates a fresh page and returns its frame, pinned and dirty.
    pub fn new_page(&self) -> EngineResult<Arc<Frame>> {
        let mut inner = self.inner.lock();
        let frame_id = self.evict_frame(&mut inner)?;
        let page_id = self.disk.allocate_page();

        let frame = &self.frames[frame_id];
        *frame.write() = Page::new(page_id);
        frame.pin_count.store(1, Ordering::SeqCst);
        frame.is_dirty.store(true, Ordering::SeqCst);
        inner.page_table.insert(page_id, frame_id);
        Ok(frame.clone())
    }

    /// Drops one pin. The dirty flag is OR-ed with any prior state; at pin
    /// count zero the frame becomes a replacement candidate.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) {
        let mut inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return;
        };
        let frame = &self.frames[frame_id];
        if dirty {
            frame.mark_dirty();
        }
        let prior = frame.pin_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prior > 0, "unpin of page {page_id} with zero pin count");
        if prior == 1 {
            inner.replacer.insert(frame_id);
        }
    }

    pub fn flush_page(&self, page_id: PageId) -> EngineResult<()> {
        let inner = self.inner.lock();
        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            return Ok(());
        };
        self.write_back(&self.frames[frame_id])
    }

    /// Flushes every resident dirty page.
    pub fn flush_all(&self) -> EngineResult<()> {
        let inner = self.inner.lock();
        for &frame_id in inner.page_table.values() {
            self.write_back(&self.frames[frame_id])?;
        }
        Ok(())
    }

    /// Removes the page from the pool and marks it deallocated on disk.
    /// Returns false if the page is still pinned; the page then simply stays
    /// resident (space is never reclaimed in this engine).
    pub fn delete_page(&self, page_id: PageId) -> EngineResult<bool> {
        let mut inner = self.inner.lock();
        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            let frame = &self.frames[frame_id];
            if frame.pin_count() != 0 {
                return Ok(false);
            }
            inner.page_table.remove(&page_id);
            inner.replacer.erase(frame_id);
            *frame.write() = Page::new(INVALID_PAGE_ID);
            frame.is_dirty.store(false, Ordering::SeqCst);
            inner.free_list.push_back(frame_id);
        }
        self.disk.deallocate_page(page_id);
        Ok(true)
    }

    /// Picks a frame for reuse: free list first, then LRU among unpinned
    /// frames. A dirty victim is written back, WAL first.
    fn evict_frame(&self, inner: &mut PoolInner) -> EngineResult<FrameId> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        let Some(frame_id) = inner.replacer.victim() else {
            return Err(EngineError::PinExhaustion);
        };
        let frame = &self.frames[frame_id];
        debug_assert_eq!(frame.pin_count(), 0);

        let old_page_id = frame.read().id;
        inner.page_table.remove(&old_page_id);
        self.write_back(frame)?;
        Ok(frame_id)
    }

    fn write_back(&self, frame: &Arc<Frame>) -> EngineResult<()> {
        if !frame.is_dirty() {
            return Ok(());
        }
        failpoint::maybe_fail("buffer_pool.flush.before_write")?;
        let page = frame.read();
        if self.log.is_enabled() {
            self.log.force_flush(page.lsn())?;
        }
        self.disk.write_page(&page)?;
        frame.is_dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool(dir: &std::path::Path, size: usize) -> BufferPoolManager {
        let disk =
            Arc::new(DiskManager::open(dir.join("t.db"), dir.join("t.log")).unwrap());
        let log = Arc::new(LogManager::new(disk.clone()));
        BufferPoolManager::new(size, disk, log)
    }

    #[test]
    fn pinned_pages_are_never_evicted() {
        let dir = tempdir().unwrap();
        let bpm = pool(dir.path(), 2);

        let f1 = bpm.new_page().unwrap();
        let p1 = f1.read().id;
        let f2 = bpm.new_page().unwrap();
        let p2 = f2.read().id;

        assert!(matches!(bpm.new_page(), Err(EngineError::PinExhaustion)));

        bpm.unpin_page(p1, false);
        assert!(bpm.new_page().is_ok());

        // p1 was the only eviction candidate, so p2 must still be resident.
        assert_eq!(bpm.fetch_page(p2).unwrap().read().id, p2);
        bpm.unpin_page(p2, false);
        bpm.unpin_page(p2, false);
    }

    #[test]
    fn dirty_pages_round_trip_through_eviction() {
        let dir = tempdir().unwrap();
        let bpm = pool(dir.path(), 2);

        let frame = bpm.new_page().unwrap();
        let page_id = frame.read().id;
        frame.write().data[100] = 0x5a;
        bpm.unpin_page(page_id, true);

        // Force the page out and back in.
        for _ in 0..3 {
            let f = bpm.new_page().unwrap();
            let id = f.read().id;
            bpm.unpin_page(id, false);
        }
        let frame = bpm.fetch_page(page_id).unwrap();
        assert_eq!(frame.read().data[100], 0x5a);
        bpm.unpin_page(page_id, false);
    }

    #[test]
    fn lru_prefers_the_coldest_page() {
        let dir = tempdir().unwrap();
        let bpm = pool(dir.path(), 3);

        let mut ids = Vec::new();
        for _ in 0..3 {
            let f = bpm.new_page().unwrap();
            ids.push(f.read().id);
        }
        for &id in &ids {
            bpm.unpin_page(id, false);
        }
        // Touch the first page again so the second becomes coldest.
        let f = bpm.fetch_page(ids[0]).unwrap();
        bpm.unpin_page(f.read().id, false);

        let f = bpm.new_page().unwrap();
        bpm.unpin_page(f.read().id, false);

        let inner = bpm.inner.lock();
        assert!(inner.page_table.contains_key(&ids[0]));
        assert!(!inner.page_table.contains_key(&ids[1]));
        assert!(inner.page_table.contains_key(&ids[2]));
    }

    #[test]
    fn delete_page_frees_the_frame() {
        let dir = tempdir().unwrap();
        let bpm = pool(dir.path(), 1);

        let frame = bpm.new_page().unwrap();
        let page_id = frame.read().id;
        assert!(!bpm.delete_page(page_id).unwrap());

        bpm.unpin_page(page_id, false);
        assert!(bpm.delete_page(page_id).unwrap());

        let inner = bpm.inner.lock();
        assert_eq!(inner.free_list.len(), 1);
    }
}
