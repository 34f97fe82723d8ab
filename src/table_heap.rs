use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::errors::{EngineError, EngineResult};
use crate::lock_manager::LockManager;
use crate::log_manager::LogManager;
use crate::log_record::LogPayload;
use crate::table_page::{Tuple, MAX_TUPLE_SIZE};
use crate::transaction::{Transaction, WriteOp, WriteRecord};
use crate::{PageId, RecordId, INVALID_PAGE_ID};

/// A heap of tuples over a doubly-linked chain of slotted pages.
///
/// Every mutation takes the row lock, appends the matching log record with
/// the transaction's `prev_lsn` chain, stamps the page LSN, and pushes an
/// undo image onto the transaction's write set.
#[derive(Clone)]
pub struct TableHeap {
    bpm: Arc<BufferPoolManager>,
    lock: Arc<LockManager>,
    log: Arc<LogManager>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Creates a heap with one fresh page, logged as the chain head.
    pub fn create(
        bpm: Arc<BufferPoolManager>,
        lock: Arc<LockManager>,
        log: Arc<LogManager>,
        txn: &mut Transaction,
    ) -> EngineResult<Self> {
        let frame = bpm.new_page()?;
        let first_page_id = frame.read().id;
        {
            let mut page = frame.write();
            page.init_table_page(first_page_id, INVALID_PAGE_ID);
            if log.is_enabled() {
                let lsn = log.append_record(
                    txn.id(),
                    txn.prev_lsn(),
                    LogPayload::NewPage {
                        prev_page_id: INVALID_PAGE_ID,
                        page_id: first_page_id,
                    },
                )?;
                txn.set_prev_lsn(lsn);
                page.set_lsn(lsn);
            }
        }
        bpm.unpin_page(first_page_id, true);

        Ok(Self {
            bpm,
            lock,
            log,
            first_page_id,
        })
    }

    /// Opens an existing heap by its first page id.
    pub fn open(
        bpm: Arc<BufferPoolManager>,
        lock: Arc<LockManager>,
        log: Arc<LogManager>,
        first_page_id: PageId,
    ) -> Self {
        Self {
            bpm,
            lock,
            log,
            first_page_id,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    /// Inserts a tuple at the first page with room, extending the chain if
    /// every page is full.
    pub fn insert_tuple(&self, tuple: &Tuple, txn: &mut Transaction) -> EngineResult<RecordId> {
        if tuple.len() > MAX_TUPLE_SIZE {
            return Err(EngineError::OutOfSpace);
        }

        let mut page_id = self.first_page_id;
        loop {
            let frame = self.bpm.fetch_page(page_id)?;
            let mut page = frame.write();

            if let Some(slot) = page.insert_tuple(tuple) {
                let rid = RecordId::new(page_id, slot);
                if self.log.is_enabled() {
                    let lsn = self.log.append_record(
                        txn.id(),
                        txn.prev_lsn(),
                        LogPayload::Insert {
                            rid,
                            tuple: tuple.clone(),
                        },
                    )?;
                    txn.set_prev_lsn(lsn);
                    page.set_lsn(lsn);
                }
                drop(page);
                self.bpm.unpin_page(page_id, true);

                // The undo image goes in first: if the lock request loses a
                // deadlock, the abort still knows to reverse this insert.
                txn.write_set.push(WriteRecord {
                    rid,
                    op: WriteOp::Insert,
                    heap: self.clone(),
                });
                self.lock.lock_exclusive(txn.id(), rid)?;
                txn.lock_set.insert(rid);
                return Ok(rid);
            }

            let next = page.next_page_id();
            if next != INVALID_PAGE_ID {
                drop(page);
                self.bpm.unpin_page(page_id, false);
                page_id = next;
                continue;
            }

            // Chain exhausted: thread a new page behind this one.
            let new_frame = self.bpm.new_page()?;
            let new_page_id = new_frame.read().id;
            {
                let mut new_page = new_frame.write();
                new_page.init_table_page(new_page_id, page_id);
                if self.log.is_enabled() {
                    let lsn = self.log.append_record(
                        txn.id(),
                        txn.prev_lsn(),
                        LogPayload::NewPage {
                            prev_page_id: page_id,
                            page_id: new_page_id,
                        },
                    )?;
                    txn.set_prev_lsn(lsn);
                    new_page.set_lsn(lsn);
                }
            }
            page.set_next_page_id(new_page_id);
            drop(page);
            self.bpm.unpin_page(page_id, true);
            self.bpm.unpin_page(new_page_id, true);
            page_id = new_page_id;
        }
    }

    /// Sets the delete mark; the tuple disappears from reads but its bytes
    /// stay until `apply_delete`.
    pub fn mark_delete(&self, rid: RecordId, txn: &mut Transaction) -> EngineResult<()> {
        self.lock.lock_exclusive(txn.id(), rid)?;
        txn.lock_set.insert(rid);

        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        if let Err(e) = page.mark_delete(rid.slot) {
            drop(page);
            self.bpm.unpin_page(rid.page_id, false);
            return Err(e);
        }
        if self.log.is_enabled() {
            let lsn =
                self.log
                    .append_record(txn.id(), txn.prev_lsn(), LogPayload::MarkDelete { rid })?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);

        txn.write_set.push(WriteRecord {
            rid,
            op: WriteOp::MarkDelete,
            heap: self.clone(),
        });
        Ok(())
    }

    /// Physically removes a tuple, logging the deleted image for undo.
    pub fn apply_delete(&self, rid: RecordId, txn: &mut Transaction) -> EngineResult<()> {
        self.lock.lock_exclusive(txn.id(), rid)?;
        txn.lock_set.insert(rid);

        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        let image = match page.apply_delete(rid.slot) {
            Ok(image) => image,
            Err(e) => {
                drop(page);
                self.bpm.unpin_page(rid.page_id, false);
                return Err(e);
            }
        };
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::ApplyDelete {
                    rid,
                    tuple: image.clone(),
                },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);

        txn.write_set.push(WriteRecord {
            rid,
            op: WriteOp::ApplyDelete { tuple: image },
            heap: self.clone(),
        });
        Ok(())
    }

    /// Clears a delete mark set earlier in the same transaction.
    pub fn rollback_delete(&self, rid: RecordId, txn: &mut Transaction) -> EngineResult<()> {
        self.lock.lock_exclusive(txn.id(), rid)?;
        txn.lock_set.insert(rid);

        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        if let Err(e) = page.rollback_delete(rid.slot) {
            drop(page);
            self.bpm.unpin_page(rid.page_id, false);
            return Err(e);
        }
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::RollbackDelete { rid },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);

        txn.write_set.push(WriteRecord {
            rid,
            op: WriteOp::RollbackDelete,
            heap: self.clone(),
        });
        Ok(())
    }

    /// Replaces a tuple in place, logging both images.
    pub fn update_tuple(
        &self,
        rid: RecordId,
        new: &Tuple,
        txn: &mut Transaction,
    ) -> EngineResult<()> {
        self.lock.lock_exclusive(txn.id(), rid)?;
        txn.lock_set.insert(rid);

        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        let old = match page.update_tuple(rid.slot, new) {
            Ok(old) => old,
            Err(e) => {
                drop(page);
                self.bpm.unpin_page(rid.page_id, false);
                return Err(e);
            }
        };
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::Update {
                    rid,
                    old: old.clone(),
                    new: new.clone(),
                },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);

        txn.write_set.push(WriteRecord {
            rid,
            op: WriteOp::Update { old },
            heap: self.clone(),
        });
        Ok(())
    }

    /// Reads a tuple under a shared lock when run inside a transaction.
    pub fn get_tuple(&self, rid: RecordId, txn: Option<&mut Transaction>) -> EngineResult<Tuple> {
        if let Some(txn) = txn {
            self.lock.lock_shared(txn.id(), rid)?;
            txn.lock_set.insert(rid);
        }
        let frame = self.bpm.fetch_page(rid.page_id)?;
        let result = frame.read().get_tuple(rid.slot);
        self.bpm.unpin_page(rid.page_id, false);
        result
    }

    // Compensating actions used by transaction abort. Locks are already
    // held; each logs the compensating record and stamps the page, but does
    // not grow the write set.

    pub(crate) fn undo_insert(&self, rid: RecordId, txn: &mut Transaction) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        let image = page.apply_delete(rid.slot)?;
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::ApplyDelete { rid, tuple: image },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }

    pub(crate) fn undo_mark_delete(
        &self,
        rid: RecordId,
        txn: &mut Transaction,
    ) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        page.rollback_delete(rid.slot)?;
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::RollbackDelete { rid },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }

    pub(crate) fn undo_apply_delete(
        &self,
        rid: RecordId,
        tuple: &Tuple,
        txn: &mut Transaction,
    ) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        page.insert_tuple_at(rid.slot, tuple)?;
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::Insert {
                    rid,
                    tuple: tuple.clone(),
                },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }

    pub(crate) fn undo_rollback_delete(
        &self,
        rid: RecordId,
        txn: &mut Transaction,
    ) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        page.mark_delete(rid.slot)?;
        if self.log.is_enabled() {
            let lsn =
                self.log
                    .append_record(txn.id(), txn.prev_lsn(), LogPayload::MarkDelete { rid })?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }

    pub(crate) fn undo_update(
        &self,
        rid: RecordId,
        old: &Tuple,
        txn: &mut Transaction,
    ) -> EngineResult<()> {
        let frame = self.bpm.fetch_page(rid.page_id)?;
        let mut page = frame.write();
        let current = page.update_tuple(rid.slot, old)?;
        if self.log.is_enabled() {
            let lsn = self.log.append_record(
                txn.id(),
                txn.prev_lsn(),
                LogPayload::Update {
                    rid,
                    old: current,
                    new: old.clone(),
                },
            )?;
            txn.set_prev_lsn(lsn);
            page.set_lsn(lsn);
        }
        drop(page);
        self.bpm.unpin_page(rid.page_id, true);
        Ok(())
    }
}
