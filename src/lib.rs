//! # Shale Storage Engine
//! An educational on-disk relational storage engine.
//! This crate implements the four hard pieces of such an engine: a page-resident
//! B+tree index, a write-ahead log with a background flush daemon, ARIES-style
//! crash recovery, and the buffer pool the first three share.

/// The B+tree index implementation.
pub mod btree;
/// The buffer pool manager.
pub mod buffer_pool;
/// The disk manager for raw page and log I/O.
pub mod disk;
/// The storage engine facade that wires the components together.
pub mod engine;
/// The error taxonomy shared by every component.
pub mod errors;
/// Crash/fault injection points for tests.
pub mod failpoint;
/// The index-roots page mapping index names to root page ids.
pub mod header_page;
/// Page-level reader-writer latches.
pub mod latch;
/// The row lock manager for concurrency control.
pub mod lock_manager;
/// The write-ahead log manager and its flush daemon.
pub mod log_manager;
/// The log record format and its byte codec.
pub mod log_record;
/// The page layout and common page header.
pub mod page;
/// ARIES-style redo/undo recovery over the log stream.
pub mod recovery;
/// The slotted heap page layout.
pub mod table_page;
/// The table heap over a chain of slotted pages.
pub mod table_heap;
/// Transactions and the transaction manager.
pub mod transaction;

use serde::{Deserialize, Serialize};

/// The size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// The size of each of the two in-memory log buffers.
pub const LOG_BUFFER_SIZE: usize = PAGE_SIZE;

/// Default number of frames in the buffer pool.
pub const BUFFER_POOL_SIZE: usize = 64;

/// How long the flush daemon sleeps before flushing on its own.
pub const LOG_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(300);

/// A unique identifier for a page in the data file. Page 0 is the header page.
pub type PageId = u32;

/// Reserved sentinel for "no page".
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// The page id of the index-roots page.
pub const HEADER_PAGE_ID: PageId = 0;

/// A log sequence number. LSN 0 is reserved as the invalid sentinel; the
/// first record of a fresh log stream carries LSN 1.
pub type Lsn = u64;

/// Reserved sentinel for "no log record".
pub const INVALID_LSN: Lsn = 0;

/// A transaction identifier.
pub type TxnId = u32;

/// A record id locating a tuple on a heap page.
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u32,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

pub use buffer_pool::BufferPoolManager;
pub use disk::DiskManager;
pub use engine::StorageEngine;
pub use errors::{EngineError, EngineResult};
pub use log_manager::LogManager;
pub use page::Page;
pub use recovery::LogRecovery;
pub use table_heap::TableHeap;
pub use table_page::Tuple;
pub use transaction::{Transaction, TransactionManager};
