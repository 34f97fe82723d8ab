use std::collections::HashMap;
use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::disk::DiskManager;
use crate::errors::{EngineError, EngineResult};
use crate::log_record::{LogPayload, LogRecord};
use crate::page::PageType;
use crate::{Lsn, PageId, TxnId, INVALID_LSN, INVALID_PAGE_ID, LOG_BUFFER_SIZE};

/// ARIES-style crash recovery over the log stream.
///
/// `redo` scans forward in [`LOG_BUFFER_SIZE`] chunks, rebuilding the active
/// transaction table, the dirty page table, and an `lsn -> file offset` map
/// while re-applying every mutation whose target page has `page_lsn <
/// record.lsn`. `undo` then walks each loser's `prev_lsn` chain backwards
/// applying compensations. Compensations are not logged; they are written to
/// tolerate already-compensated state instead, so a crash during recovery
/// just repeats work.
pub struct LogRecovery {
    disk: Arc<DiskManager>,
    bpm: Arc<BufferPoolManager>,
    active_txn: HashMap<TxnId, Lsn>,
    lsn_mapping: HashMap<Lsn, u64>,
    dirty_pages: HashMap<PageId, Lsn>,
    max_lsn: Lsn,
}

impl LogRecovery {
    pub fn new(disk: Arc<DiskManager>, bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            disk,
            bpm,
            active_txn: HashMap::new(),
            lsn_mapping: HashMap::new(),
            dirty_pages: HashMap::new(),
            max_lsn: INVALID_LSN,
        }
    }

    /// The highest LSN seen in the log; the log manager restarts above it.
    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn
    }

    /// Transactions with no commit/abort record, mapped to their last LSN.
    pub fn losers(&self) -> &HashMap<TxnId, Lsn> {
        &self.active_txn
    }

    /// recLSN per page, for inspection.
    pub fn dirty_pages(&self) -> &HashMap<PageId, Lsn> {
        &self.dirty_pages
    }

    pub fn redo(&mut self) -> EngineResult<()> {
        let mut buf = vec![0u8; LOG_BUFFER_SIZE];
        let mut offset: u64 = 0;
        loop {
            let n = self.disk.read_log(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            let mut pos = 0usize;
            while pos < n {
                let Some((record, consumed)) = LogRecord::decode(&buf[pos..n])? else {
                    break;
                };
                self.lsn_mapping.insert(record.lsn, offset + pos as u64);
                self.max_lsn = self.max_lsn.max(record.lsn);
                self.active_txn.insert(record.txn_id, record.lsn);
                if let Some(page_id) = record.payload.target_page() {
                    self.dirty_pages.entry(page_id).or_insert(record.lsn);
                }

                self.redo_record(&record)?;

                if matches!(record.payload, LogPayload::Commit | LogPayload::Abort) {
                    self.active_txn.remove(&record.txn_id);
                }
                pos += consumed;
            }
            if pos == 0 {
                if n == buf.len() {
                    return Err(EngineError::Corruption(
                        "log record exceeds the log buffer".into(),
                    ));
                }
                // Torn tail from the crash; everything after it is garbage.
                break;
            }
            offset += pos as u64;
        }
        Ok(())
    }

    fn redo_record(&mut self, record: &LogRecord) -> EngineResult<()> {
        match &record.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => Ok(()),

            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                let frame = self.bpm.fetch_page(*page_id)?;
                {
                    let mut page = frame.write();
                    if page.page_type() != PageType::Table {
                        page.init_table_page(*page_id, *prev_page_id);
                    }
                    if page.lsn() < record.lsn {
                        page.set_lsn(record.lsn);
                    }
                }
                self.bpm.unpin_page(*page_id, true);

                if *prev_page_id != INVALID_PAGE_ID {
                    let frame = self.bpm.fetch_page(*prev_page_id)?;
                    {
                        let mut page = frame.write();
                        if page.next_page_id() != *page_id {
                            page.set_next_page_id(*page_id);
                        }
                    }
                    self.bpm.unpin_page(*prev_page_id, true);
                }
                Ok(())
            }

            LogPayload::Insert { rid, tuple } => self.redo_on_page(rid.page_id, record.lsn, |p| {
                p.insert_tuple_at(rid.slot, tuple)
            }),
            LogPayload::MarkDelete { rid } => {
                self.redo_on_page(rid.page_id, record.lsn, |p| p.mark_delete(rid.slot))
            }
            LogPayload::RollbackDelete { rid } => {
                self.redo_on_page(rid.page_id, record.lsn, |p| p.rollback_delete(rid.slot))
            }
            LogPayload::ApplyDelete { rid, .. } => {
                self.redo_on_page(rid.page_id, record.lsn, |p| {
                    p.apply_delete(rid.slot).map(|_| ())
                })
            }
            LogPayload::Update { rid, new, .. } => {
                self.redo_on_page(rid.page_id, record.lsn, |p| {
                    p.update_tuple(rid.slot, new).map(|_| ())
                })
            }
        }
    }

    /// Fetches the target page and re-applies `action` unless the page
    /// already reflects this record (`page_lsn >= record.lsn`).
    fn redo_on_page<F>(&mut self, page_id: PageId, lsn: Lsn, action: F) -> EngineResult<()>
    where
        F: FnOnce(&mut crate::Page) -> EngineResult<()>,
    {
        let frame = self.bpm.fetch_page(page_id)?;
        let result = {
            let mut page = frame.write();
            if page.lsn() >= lsn {
                Ok(())
            } else {
                action(&mut page).map(|()| page.set_lsn(lsn))
            }
        };
        self.bpm.unpin_page(page_id, result.is_ok());
        result
    }

    pub fn undo(&mut self) -> EngineResult<()> {
        let losers: Vec<Lsn> = self.active_txn.values().copied().collect();
        let mut buf = vec![0u8; LOG_BUFFER_SIZE];

        for last_lsn in losers {
            let mut lsn = last_lsn;
            while lsn != INVALID_LSN {
                let Some(&offset) = self.lsn_mapping.get(&lsn) else {
                    return Err(EngineError::Corruption(format!(
                        "lsn {lsn} referenced by an undo chain is not in the log"
                    )));
                };
                let n = self.disk.read_log(&mut buf, offset)?;
                let Some((record, _)) = LogRecord::decode(&buf[..n])? else {
                    return Err(EngineError::Corruption(format!(
                        "undo failed to reread the record at lsn {lsn}"
                    )));
                };
                self.undo_record(&record)?;
                lsn = record.prev_lsn;
            }
        }

        self.active_txn.clear();
        self.lsn_mapping.clear();
        self.dirty_pages.clear();
        Ok(())
    }

    fn undo_record(&mut self, record: &LogRecord) -> EngineResult<()> {
        match &record.payload {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => Ok(()),

            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                // Unthread the page; its bytes are simply abandoned.
                if *prev_page_id == INVALID_PAGE_ID {
                    return Ok(());
                }
                let frame = self.bpm.fetch_page(*prev_page_id)?;
                {
                    let mut page = frame.write();
                    if page.next_page_id() == *page_id {
                        page.set_next_page_id(INVALID_PAGE_ID);
                    }
                }
                self.bpm.unpin_page(*prev_page_id, true);
                Ok(())
            }

            LogPayload::Insert { rid, .. } => self.undo_on_page(rid.page_id, |p| {
                match p.apply_delete(rid.slot) {
                    Ok(_) => Ok(()),
                    Err(EngineError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
            LogPayload::MarkDelete { rid } => self.undo_on_page(rid.page_id, |p| {
                match p.rollback_delete(rid.slot) {
                    Ok(()) | Err(EngineError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
            LogPayload::RollbackDelete { rid } => self.undo_on_page(rid.page_id, |p| {
                match p.mark_delete(rid.slot) {
                    Ok(()) | Err(EngineError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
            LogPayload::ApplyDelete { rid, tuple } => self.undo_on_page(rid.page_id, |p| {
                if p.slot_in_use(rid.slot) {
                    return Ok(());
                }
                p.insert_tuple_at(rid.slot, tuple)
            }),
            LogPayload::Update { rid, old, .. } => self.undo_on_page(rid.page_id, |p| {
                match p.update_tuple(rid.slot, old) {
                    Ok(_) | Err(EngineError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }),
        }
    }

    fn undo_on_page<F>(&mut self, page_id: PageId, action: F) -> EngineResult<()>
    where
        F: FnOnce(&mut crate::Page) -> EngineResult<()>,
    {
        let frame = self.bpm.fetch_page(page_id)?;
        let result = {
            let mut page = frame.write();
            action(&mut page)
        };
        self.bpm.unpin_page(page_id, result.is_ok());
        result
    }
}
