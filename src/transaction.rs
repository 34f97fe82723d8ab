use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::errors::{EngineError, EngineResult};
use crate::failpoint;
use crate::lock_manager::LockManager;
use crate::log_manager::LogManager;
use crate::log_record::LogPayload;
use crate::table_heap::TableHeap;
use crate::table_page::Tuple;
use crate::{Lsn, PageId, RecordId, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Acquiring locks.
    Growing,
    /// Has released a lock; may not acquire more.
    Shrinking,
    Committed,
    Aborted,
}

/// The compensating action needed to reverse one heap mutation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert,
    MarkDelete,
    ApplyDelete { tuple: Tuple },
    RollbackDelete,
    Update { old: Tuple },
}

/// One entry in a transaction's write set: enough to undo the mutation
/// through the heap that performed it.
pub struct WriteRecord {
    pub rid: RecordId,
    pub op: WriteOp,
    pub heap: TableHeap,
}

/// An in-flight transaction. `prev_lsn` heads this transaction's chain in
/// the log; the write set holds undo images for voluntary abort; the page
/// set tracks pages latched by an index operation running on its behalf.
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    prev_lsn: Lsn,
    pub(crate) page_set: Vec<PageId>,
    pub(crate) lock_set: HashSet<RecordId>,
    pub(crate) write_set: Vec<WriteRecord>,
}

impl Transaction {
    fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Growing,
            prev_lsn: INVALID_LSN,
            page_set: Vec::new(),
            lock_set: HashSet::new(),
            write_set: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    /// Pages latched on this transaction's behalf by an in-flight index
    /// operation; empty between operations.
    pub fn page_set(&self) -> &[PageId] {
        &self.page_set
    }

    pub(crate) fn set_prev_lsn(&mut self, lsn: Lsn) {
        self.prev_lsn = lsn;
    }
}

/// Hands out transactions and drives commit/abort.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    log: Arc<LogManager>,
    lock: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(log: Arc<LogManager>, lock: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            log,
            lock,
        }
    }

    pub fn begin(&self) -> EngineResult<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let mut txn = Transaction::new(id);
        if self.log.is_enabled() {
            let lsn = self.log.append_record(id, INVALID_LSN, LogPayload::Begin)?;
            txn.set_prev_lsn(lsn);
        }
        Ok(txn)
    }

    /// Appends the commit record, forces the log up to it, then releases
    /// locks. The caller is only acknowledged once the commit is durable.
    pub fn commit(&self, txn: &mut Transaction) -> EngineResult<()> {
        debug_assert_eq!(txn.state, TransactionState::Growing);
        failpoint::maybe_fail("transaction.commit.before_log")?;

        if self.log.is_enabled() {
            let lsn = self
                .log
                .append_record(txn.id, txn.prev_lsn, LogPayload::Commit)?;
            txn.set_prev_lsn(lsn);
            failpoint::maybe_fail("transaction.commit.before_force")?;
            self.log.force_flush(lsn)?;
        }

        txn.write_set.clear();
        self.release_locks(txn);
        txn.state = TransactionState::Committed;
        Ok(())
    }

    /// Walks the write set in reverse, applying compensating actions through
    /// the heaps that performed the originals, then appends the abort record
    /// and releases locks. An aborted transaction leaves no observable
    /// effect.
    pub fn abort(&self, txn: &mut Transaction) -> EngineResult<()> {
        while let Some(write) = txn.write_set.pop() {
            match write.op {
                WriteOp::Insert => write.heap.undo_insert(write.rid, txn)?,
                WriteOp::MarkDelete => write.heap.undo_mark_delete(write.rid, txn)?,
                WriteOp::ApplyDelete { tuple } => {
                    write.heap.undo_apply_delete(write.rid, &tuple, txn)?
                }
                WriteOp::RollbackDelete => write.heap.undo_rollback_delete(write.rid, txn)?,
                WriteOp::Update { old } => write.heap.undo_update(write.rid, &old, txn)?,
            }
        }

        if self.log.is_enabled() {
            let lsn = self
                .log
                .append_record(txn.id, txn.prev_lsn, LogPayload::Abort)?;
            txn.set_prev_lsn(lsn);
        }

        self.release_locks(txn);
        txn.state = TransactionState::Aborted;
        Ok(())
    }

    /// Aborts on behalf of a caller that hit an expected failure (deadlock
    /// victim, out of space) and wants the error back.
    pub fn abort_on(&self, txn: &mut Transaction, err: EngineError) -> EngineError {
        match self.abort(txn) {
            Ok(()) => err,
            Err(abort_err) => abort_err,
        }
    }

    fn release_locks(&self, txn: &mut Transaction) {
        txn.state = TransactionState::Shrinking;
        self.lock.unlock_all(txn.id);
        txn.lock_set.clear();
    }
}
