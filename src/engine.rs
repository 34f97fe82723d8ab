use std::path::Path;
use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::EngineResult;
use crate::lock_manager::LockManager;
use crate::log_manager::LogManager;
use crate::recovery::LogRecovery;
use crate::transaction::TransactionManager;
use crate::{Page, BUFFER_POOL_SIZE, HEADER_PAGE_ID};

/// The assembled storage engine: disk manager, log manager, buffer pool,
/// lock manager and transaction manager wired together over one database
/// directory.
///
/// Dropping the engine without [`StorageEngine::shutdown`] models a crash:
/// the log buffers drain (as the flush daemon eventually would have) but no
/// buffer-pool page is written back.
pub struct StorageEngine {
    pub disk: Arc<DiskManager>,
    pub log_manager: Arc<LogManager>,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub lock_manager: Arc<LockManager>,
    pub transaction_manager: Arc<TransactionManager>,
}

impl StorageEngine {
    /// Opens the database files without recovering or enabling logging;
    /// callers drive both explicitly. See [`StorageEngine::start`] for the
    /// common path.
    pub fn open<P: AsRef<Path>>(dir: P) -> EngineResult<Self> {
        Self::open_with_pool_size(dir, BUFFER_POOL_SIZE)
    }

    pub fn open_with_pool_size<P: AsRef<Path>>(dir: P, pool_size: usize) -> EngineResult<Self> {
        let dir = dir.as_ref();
        let disk = Arc::new(DiskManager::open(
            dir.join("shale.db"),
            dir.join("shale.log"),
        )?);
        let log_manager = Arc::new(LogManager::new(disk.clone()));
        let buffer_pool = Arc::new(BufferPoolManager::new(
            pool_size,
            disk.clone(),
            log_manager.clone(),
        ));
        let lock_manager = Arc::new(LockManager::new());
        let transaction_manager = Arc::new(TransactionManager::new(
            log_manager.clone(),
            lock_manager.clone(),
        ));

        // Page 0 is the index-roots page; reserve it on first open. Its
        // header LSN doubles as the engine's high-water LSN across clean
        // restarts.
        if disk.num_pages() == 0 {
            let page_id = disk.allocate_page();
            debug_assert_eq!(page_id, HEADER_PAGE_ID);
            let mut page = Page::new(HEADER_PAGE_ID);
            page.init_header_page();
            disk.write_page(&page)?;
        } else {
            let header = disk.read_page(HEADER_PAGE_ID)?;
            log_manager.bootstrap(header.lsn());
        }

        Ok(Self {
            disk,
            log_manager,
            buffer_pool,
            lock_manager,
            transaction_manager,
        })
    }

    /// Opens the engine the way a server boots it: recover if the previous
    /// incarnation left a log behind, then start the flush daemon.
    pub fn start<P: AsRef<Path>>(dir: P) -> EngineResult<Self> {
        Self::start_with_pool_size(dir, BUFFER_POOL_SIZE)
    }

    pub fn start_with_pool_size<P: AsRef<Path>>(dir: P, pool_size: usize) -> EngineResult<Self> {
        let engine = Self::open_with_pool_size(dir, pool_size)?;
        if engine.disk.log_len()? > 0 {
            engine.recover()?;
        }
        engine.log_manager.run_flush_thread();
        Ok(engine)
    }

    /// Runs redo then undo over the log, flushes the repaired pool, records
    /// the high-water LSN, and rewinds the log for normal operation.
    pub fn recover(&self) -> EngineResult<()> {
        assert!(!self.log_manager.is_enabled());
        let mut recovery = LogRecovery::new(self.disk.clone(), self.buffer_pool.clone());
        recovery.redo()?;
        recovery.undo()?;

        let last_lsn = recovery.max_lsn().max(self.log_manager.last_lsn());
        self.stamp_high_water(last_lsn)?;
        self.buffer_pool.flush_all()?;
        self.log_manager.rewind(last_lsn)?;
        Ok(())
    }

    /// Clean shutdown: stop logging, persist every dirty page, and record
    /// the high-water LSN so a reopen continues the sequence.
    pub fn shutdown(&self) -> EngineResult<()> {
        self.log_manager.stop_flush_thread();
        self.stamp_high_water(self.log_manager.last_lsn())?;
        self.buffer_pool.flush_all()?;
        self.disk.truncate_log()?;
        Ok(())
    }

    fn stamp_high_water(&self, last_lsn: crate::Lsn) -> EngineResult<()> {
        let frame = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        frame.write().set_lsn(last_lsn);
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        // Joining the daemon drains the log buffers; dirty pages are
        // deliberately not written, so an un-shutdown drop behaves like a
        // crash for everything the log does not cover.
        self.log_manager.stop_flush_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table_heap::TableHeap;
    use crate::table_page::Tuple;
    use tempfile::tempdir;

    #[test]
    fn open_reserves_the_header_page() {
        let dir = tempdir().unwrap();
        let engine = StorageEngine::open(dir.path()).unwrap();
        assert_eq!(engine.disk.num_pages(), 1);
        let header = engine.disk.read_page(HEADER_PAGE_ID).unwrap();
        assert_eq!(header.page_type(), crate::page::PageType::Header);
    }

    #[test]
    fn clean_shutdown_and_reopen_round_trips_data() {
        let dir = tempdir().unwrap();
        let first_page_id;
        let rid;
        {
            let engine = StorageEngine::start(dir.path()).unwrap();
            let mut txn = engine.transaction_manager.begin().unwrap();
            let heap = TableHeap::create(
                engine.buffer_pool.clone(),
                engine.lock_manager.clone(),
                engine.log_manager.clone(),
                &mut txn,
            )
            .unwrap();
            first_page_id = heap.first_page_id();
            rid = heap
                .insert_tuple(&Tuple::new(b"persistent".to_vec()), &mut txn)
                .unwrap();
            engine.transaction_manager.commit(&mut txn).unwrap();
            engine.shutdown().unwrap();
        }

        let engine = StorageEngine::start(dir.path()).unwrap();
        let heap = TableHeap::open(
            engine.buffer_pool.clone(),
            engine.lock_manager.clone(),
            engine.log_manager.clone(),
            first_page_id,
        );
        assert_eq!(heap.get_tuple(rid, None).unwrap().as_slice(), b"persistent");
    }

    #[test]
    fn lsn_sequence_survives_clean_restart() {
        let dir = tempdir().unwrap();
        let high_water;
        {
            let engine = StorageEngine::start(dir.path()).unwrap();
            let mut txn = engine.transaction_manager.begin().unwrap();
            engine.transaction_manager.commit(&mut txn).unwrap();
            high_water = engine.log_manager.last_lsn();
            engine.shutdown().unwrap();
        }

        let engine = StorageEngine::start(dir.path()).unwrap();
        let mut txn = engine.transaction_manager.begin().unwrap();
        assert!(txn.prev_lsn() > high_water);
        engine.transaction_manager.commit(&mut txn).unwrap();
    }
}
