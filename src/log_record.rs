use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::table_page::Tuple;
use crate::{Lsn, PageId, RecordId, TxnId};

/// Size of the fixed prefix every log record starts with:
///
/// ```text
/// | size: u32 | lsn: u64 | txn_id: u32 | prev_lsn: u64 | crc: u32 | payload... |
/// ```
///
/// `size` is the total record length including the prefix; readers parse it
/// to advance through the stream. `crc` covers the payload bytes.
pub const LOG_HEADER_SIZE: usize = 28;

/// The typed payload of a log record. Tuple images carried here are what redo
/// reinstalls and undo compensates with.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    /// A heap page was allocated and threaded behind `prev_page_id`
    /// (`INVALID_PAGE_ID` for the first page of a heap).
    NewPage {
        prev_page_id: PageId,
        page_id: PageId,
    },
    Insert {
        rid: RecordId,
        tuple: Tuple,
    },
    /// Physical delete; carries the deleted image for undo.
    ApplyDelete {
        rid: RecordId,
        tuple: Tuple,
    },
    MarkDelete {
        rid: RecordId,
    },
    RollbackDelete {
        rid: RecordId,
    },
    Update {
        rid: RecordId,
        old: Tuple,
        new: Tuple,
    },
}

impl LogPayload {
    /// The heap page this record mutates, if it mutates one.
    pub fn target_page(&self) -> Option<PageId> {
        match self {
            LogPayload::Begin | LogPayload::Commit | LogPayload::Abort => None,
            LogPayload::NewPage { page_id, .. } => Some(*page_id),
            LogPayload::Insert { rid, .. }
            | LogPayload::ApplyDelete { rid, .. }
            | LogPayload::MarkDelete { rid }
            | LogPayload::RollbackDelete { rid }
            | LogPayload::Update { rid, .. } => Some(rid.page_id),
        }
    }
}

/// A single write-ahead log record. `prev_lsn` points at the immediately
/// prior record of the same transaction, enabling reverse traversal during
/// undo.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub payload: LogPayload,
}

impl LogRecord {
    pub fn new(lsn: Lsn, txn_id: TxnId, prev_lsn: Lsn, payload: LogPayload) -> Self {
        Self {
            lsn,
            txn_id,
            prev_lsn,
            payload,
        }
    }

    pub fn encode(&self) -> EngineResult<Vec<u8>> {
        let payload = bincode::serialize(&self.payload)
            .map_err(|e| EngineError::Corruption(format!("log payload encode: {e}")))?;

        let total = LOG_HEADER_SIZE + payload.len();
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&(total as u32).to_le_bytes());
        bytes.extend_from_slice(&self.lsn.to_le_bytes());
        bytes.extend_from_slice(&self.txn_id.to_le_bytes());
        bytes.extend_from_slice(&self.prev_lsn.to_le_bytes());
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer starts with padding/end-of-stream
    /// zeroes or holds only a truncated prefix of a record; the caller
    /// re-reads from that offset. A well-formed prefix with a bad payload is
    /// `Corruption`.
    pub fn decode(buf: &[u8]) -> EngineResult<Option<(LogRecord, usize)>> {
        if buf.len() < LOG_HEADER_SIZE {
            return Ok(None);
        }
        let size = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        if size == 0 {
            return Ok(None);
        }
        if size < LOG_HEADER_SIZE {
            return Err(EngineError::Corruption(format!(
                "log record size {size} below prefix size"
            )));
        }
        if size > buf.len() {
            return Ok(None);
        }

        let lsn = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let txn_id = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let crc = u32::from_le_bytes(buf[24..28].try_into().unwrap());

        let payload_bytes = &buf[LOG_HEADER_SIZE..size];
        let mut hasher = Hasher::new();
        hasher.update(payload_bytes);
        if hasher.finalize() != crc {
            return Err(EngineError::Corruption(format!(
                "log record crc mismatch at lsn {lsn}"
            )));
        }

        let payload: LogPayload = bincode::deserialize(payload_bytes)
            .map_err(|e| EngineError::Corruption(format!("log payload decode: {e}")))?;

        Ok(Some((
            LogRecord {
                lsn,
                txn_id,
                prev_lsn,
                payload,
            },
            size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_LSN;

    #[test]
    fn encode_decode_round_trip() {
        let record = LogRecord::new(
            7,
            3,
            INVALID_LSN,
            LogPayload::Insert {
                rid: RecordId::new(4, 2),
                tuple: Tuple::new(vec![1, 2, 3, 4, 5]),
            },
        );
        let bytes = record.encode().unwrap();
        assert_eq!(
            u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize,
            bytes.len()
        );

        let (decoded, consumed) = LogRecord::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn decode_stops_at_truncation_and_padding() {
        let record = LogRecord::new(1, 1, INVALID_LSN, LogPayload::Begin);
        let bytes = record.encode().unwrap();

        // Truncated tail: not an error, the reader re-chunks.
        assert!(LogRecord::decode(&bytes[..bytes.len() - 1])
            .unwrap()
            .is_none());
        // Zero padding marks end of stream.
        assert!(LogRecord::decode(&[0u8; 64]).unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let record = LogRecord::new(
            2,
            1,
            1,
            LogPayload::MarkDelete {
                rid: RecordId::new(1, 0),
            },
        );
        let mut bytes = record.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            LogRecord::decode(&bytes),
            Err(EngineError::Corruption(_))
        ));
    }

    #[test]
    fn records_parse_back_to_back() {
        let a = LogRecord::new(1, 9, INVALID_LSN, LogPayload::Begin)
            .encode()
            .unwrap();
        let b = LogRecord::new(2, 9, 1, LogPayload::Commit).encode().unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let (first, n) = LogRecord::decode(&stream).unwrap().unwrap();
        assert_eq!(first.payload, LogPayload::Begin);
        let (second, _) = LogRecord::decode(&stream[n..]).unwrap().unwrap();
        assert_eq!(second.payload, LogPayload::Commit);
        assert_eq!(second.prev_lsn, first.lsn);
    }
}
