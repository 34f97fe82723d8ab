use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::disk::DiskManager;
use crate::errors::{EngineError, EngineResult};
use crate::log_record::{LogPayload, LogRecord};
use crate::{Lsn, TxnId, INVALID_LSN, LOG_BUFFER_SIZE, LOG_TIMEOUT};

struct LogState {
    /// Buffer currently receiving appends.
    active: Vec<u8>,
    /// Buffer owned by the flush daemon while a flush is in flight.
    flush: Vec<u8>,
    active_last_lsn: Lsn,
    flush_last_lsn: Lsn,
    next_lsn: Lsn,
    flush_pending: bool,
    force_requested: bool,
}

/// The write-ahead log manager.
///
/// Appends serialize into the active buffer under one mutex; a background
/// daemon swaps the buffers and writes the flush buffer out when the active
/// buffer fills, when a flush is forced, or when [`LOG_TIMEOUT`] elapses.
/// `persistent_lsn` is the highest LSN known durable; commit and
/// page-eviction wait on it.
pub struct LogManager {
    pub(crate) disk: Arc<DiskManager>,
    state: Mutex<LogState>,
    /// Wakes the flush daemon.
    flush_signal: Condvar,
    /// Wakes threads waiting for durability or for the flush buffer to drain.
    durable_signal: Condvar,
    persistent_lsn: AtomicU64,
    enabled: AtomicBool,
    poisoned: AtomicBool,
    flush_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            state: Mutex::new(LogState {
                active: Vec::with_capacity(LOG_BUFFER_SIZE),
                flush: Vec::with_capacity(LOG_BUFFER_SIZE),
                active_last_lsn: INVALID_LSN,
                flush_last_lsn: INVALID_LSN,
                next_lsn: 1,
                flush_pending: false,
                force_requested: false,
            }),
            flush_signal: Condvar::new(),
            durable_signal: Condvar::new(),
            persistent_lsn: AtomicU64::new(INVALID_LSN),
            enabled: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
        }
    }

    /// Whether the flush daemon is running and mutations should be logged.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    /// Appends a record, assigning its LSN. If the record does not fit in the
    /// active buffer the buffers are swapped and the append waits for any
    /// in-flight flush to drain first.
    pub fn append_record(
        &self,
        txn_id: TxnId,
        prev_lsn: Lsn,
        payload: LogPayload,
    ) -> EngineResult<Lsn> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(EngineError::Corruption(
                "log manager stopped after a flush failure".into(),
            ));
        }

        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let bytes = LogRecord::new(lsn, txn_id, prev_lsn, payload).encode()?;
        if bytes.len() > LOG_BUFFER_SIZE {
            return Err(EngineError::Corruption(format!(
                "log record of {} bytes exceeds the log buffer",
                bytes.len()
            )));
        }

        while state.active.len() + bytes.len() > LOG_BUFFER_SIZE {
            if state.flush_pending {
                self.durable_signal.wait(&mut state);
                if self.poisoned.load(Ordering::SeqCst) {
                    return Err(EngineError::Corruption(
                        "log manager stopped after a flush failure".into(),
                    ));
                }
                continue;
            }
            Self::swap_buffers(&mut state);
            self.flush_signal.notify_one();
        }

        state.next_lsn += 1;
        state.active.extend_from_slice(&bytes);
        state.active_last_lsn = lsn;
        Ok(lsn)
    }

    fn swap_buffers(state: &mut LogState) {
        debug_assert!(!state.flush_pending);
        debug_assert!(state.flush.is_empty());
        mem::swap(&mut state.active, &mut state.flush);
        state.flush_last_lsn = state.active_last_lsn;
        state.flush_pending = true;
    }

    /// Blocks until every record with LSN `<= lsn` is durable.
    pub fn force_flush(&self, lsn: Lsn) -> EngineResult<()> {
        if lsn == INVALID_LSN {
            return Ok(());
        }
        loop {
            if self.persistent_lsn() >= lsn {
                return Ok(());
            }
            if self.poisoned.load(Ordering::SeqCst) {
                return Err(EngineError::Corruption(
                    "log manager stopped after a flush failure".into(),
                ));
            }
            let mut state = self.state.lock();
            if self.persistent_lsn() >= lsn {
                return Ok(());
            }
            state.force_requested = true;
            self.flush_signal.notify_one();
            self.durable_signal.wait_for(&mut state, LOG_TIMEOUT);
        }
    }

    /// Starts the background flush daemon and enables logging.
    pub fn run_flush_thread(self: &Arc<Self>) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = thread::spawn(move || this.flush_loop());
        *self.flush_thread.lock() = Some(handle);
    }

    /// Disables logging, drains both buffers and joins the daemon.
    pub fn stop_flush_thread(&self) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.flush_signal.notify_one();
        let handle = self.flush_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn flush_loop(self: Arc<Self>) {
        loop {
            let mut state = self.state.lock();
            if self.enabled.load(Ordering::SeqCst)
                && !state.flush_pending
                && !state.force_requested
            {
                self.flush_signal.wait_for(&mut state, LOG_TIMEOUT);
            }
            state.force_requested = false;
            if !state.flush_pending && !state.active.is_empty() {
                Self::swap_buffers(&mut state);
            }

            if state.flush_pending {
                let buf = mem::take(&mut state.flush);
                let last = state.flush_last_lsn;
                drop(state);

                let result = self
                    .disk
                    .write_log(&buf)
                    .and_then(|()| self.disk.flush_log());

                let mut state = self.state.lock();
                match result {
                    Ok(()) => {
                        let mut buf = buf;
                        buf.clear();
                        state.flush = buf;
                        state.flush_pending = false;
                        self.persistent_lsn.store(last, Ordering::SeqCst);
                        self.durable_signal.notify_all();
                    }
                    Err(_) => {
                        // An I/O error here is fatal for mutations; leave the
                        // manager poisoned and stop.
                        self.poisoned.store(true, Ordering::SeqCst);
                        state.flush_pending = false;
                        self.durable_signal.notify_all();
                        return;
                    }
                }
                drop(state);
            } else {
                drop(state);
            }

            if !self.enabled.load(Ordering::SeqCst) {
                let state = self.state.lock();
                if !state.flush_pending && state.active.is_empty() {
                    return;
                }
            }
        }
    }

    /// Seeds the LSN counter when an existing database is opened, so new
    /// records sort after every LSN already stamped on disk pages.
    pub fn bootstrap(&self, last_lsn: Lsn) {
        assert!(!self.is_enabled());
        let mut state = self.state.lock();
        state.next_lsn = last_lsn + 1;
        self.persistent_lsn.store(last_lsn, Ordering::SeqCst);
    }

    /// The highest LSN assigned so far.
    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().next_lsn - 1
    }

    /// Rewinds the log to a fresh starting point after recovery terminates,
    /// continuing the LSN sequence from `last_lsn`. The daemon must be
    /// stopped.
    pub fn rewind(&self, last_lsn: Lsn) -> EngineResult<()> {
        assert!(!self.is_enabled());
        self.disk.truncate_log()?;
        let mut state = self.state.lock();
        state.active.clear();
        state.flush.clear();
        state.active_last_lsn = INVALID_LSN;
        state.flush_last_lsn = INVALID_LSN;
        state.next_lsn = last_lsn + 1;
        state.flush_pending = false;
        state.force_requested = false;
        self.persistent_lsn.store(last_lsn, Ordering::SeqCst);
        self.poisoned.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        self.stop_flush_thread();
    }
}
