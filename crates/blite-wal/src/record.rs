//! WAL record framing: one type byte, then a fixed little-endian layout.
//!
//! ```text
//! Begin(1)      txn_id(8) timestamp(8)
//! Write(2)      txn_id(8) page_id(4) after_len(4) after(after_len)
//! Commit(3)     txn_id(8) timestamp(8)
//! Abort(4)      txn_id(8) timestamp(8)
//! Checkpoint(5) txn_id(8) timestamp(8)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use blite_types::{PageId, TxnId};

/// Valid record type bytes.
pub const RECORD_TYPE_RANGE: std::ops::RangeInclusive<u8> = 1..=5;

const MARKER_LEN: usize = 1 + 8 + 8;
const WRITE_HEADER_LEN: usize = 1 + 8 + 4 + 4;

/// One log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Begin { txn_id: TxnId, timestamp_ms: u64 },
    Write {
        txn_id: TxnId,
        page_id: PageId,
        after: Vec<u8>,
    },
    Commit { txn_id: TxnId, timestamp_ms: u64 },
    Abort { txn_id: TxnId, timestamp_ms: u64 },
    Checkpoint { txn_id: TxnId, timestamp_ms: u64 },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl WalRecord {
    /// Begin record stamped with the current time.
    #[must_use]
    pub fn begin(txn_id: TxnId) -> Self {
        Self::Begin {
            txn_id,
            timestamp_ms: now_ms(),
        }
    }

    /// Commit record stamped with the current time.
    #[must_use]
    pub fn commit(txn_id: TxnId) -> Self {
        Self::Commit {
            txn_id,
            timestamp_ms: now_ms(),
        }
    }

    /// Abort record stamped with the current time.
    #[must_use]
    pub fn abort(txn_id: TxnId) -> Self {
        Self::Abort {
            txn_id,
            timestamp_ms: now_ms(),
        }
    }

    /// Checkpoint marker stamped with the current time.
    #[must_use]
    pub fn checkpoint(txn_id: TxnId) -> Self {
        Self::Checkpoint {
            txn_id,
            timestamp_ms: now_ms(),
        }
    }

    /// The record's type byte.
    #[must_use]
    pub const fn type_byte(&self) -> u8 {
        match self {
            Self::Begin { .. } => 1,
            Self::Write { .. } => 2,
            Self::Commit { .. } => 3,
            Self::Abort { .. } => 4,
            Self::Checkpoint { .. } => 5,
        }
    }

    /// Transaction the record belongs to.
    #[must_use]
    pub const fn txn_id(&self) -> TxnId {
        match self {
            Self::Begin { txn_id, .. }
            | Self::Write { txn_id, .. }
            | Self::Commit { txn_id, .. }
            | Self::Abort { txn_id, .. }
            | Self::Checkpoint { txn_id, .. } => *txn_id,
        }
    }

    /// Serialize to the wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Write {
                txn_id,
                page_id,
                after,
            } => {
                let mut out = Vec::with_capacity(WRITE_HEADER_LEN + after.len());
                out.push(self.type_byte());
                out.extend_from_slice(&txn_id.to_le_bytes());
                out.extend_from_slice(&page_id.to_le_bytes());
                out.extend_from_slice(&(after.len() as u32).to_le_bytes());
                out.extend_from_slice(after);
                out
            }
            Self::Begin { txn_id, timestamp_ms }
            | Self::Commit { txn_id, timestamp_ms }
            | Self::Abort { txn_id, timestamp_ms }
            | Self::Checkpoint { txn_id, timestamp_ms } => {
                let mut out = Vec::with_capacity(MARKER_LEN);
                out.push(self.type_byte());
                out.extend_from_slice(&txn_id.to_le_bytes());
                out.extend_from_slice(&timestamp_ms.to_le_bytes());
                out
            }
        }
    }

    /// Parse one record from the front of `bytes`. Returns the record and
    /// the bytes consumed, or `None` when the tail is malformed or
    /// truncated (which callers treat as the end of the log).
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let type_byte = *bytes.first()?;
        if !RECORD_TYPE_RANGE.contains(&type_byte) {
            return None;
        }

        if type_byte == 2 {
            if bytes.len() < WRITE_HEADER_LEN {
                return None;
            }
            let txn_id = u64::from_le_bytes(bytes[1..9].try_into().ok()?);
            let page_id = u32::from_le_bytes(bytes[9..13].try_into().ok()?);
            let after_len = u32::from_le_bytes(bytes[13..17].try_into().ok()?) as usize;
            let total = WRITE_HEADER_LEN + after_len;
            if bytes.len() < total {
                return None;
            }
            let after = bytes[WRITE_HEADER_LEN..total].to_vec();
            return Some((
                Self::Write {
                    txn_id,
                    page_id,
                    after,
                },
                total,
            ));
        }

        if bytes.len() < MARKER_LEN {
            return None;
        }
        let txn_id = u64::from_le_bytes(bytes[1..9].try_into().ok()?);
        let timestamp_ms = u64::from_le_bytes(bytes[9..17].try_into().ok()?);
        let record = match type_byte {
            1 => Self::Begin { txn_id, timestamp_ms },
            3 => Self::Commit { txn_id, timestamp_ms },
            4 => Self::Abort { txn_id, timestamp_ms },
            5 => Self::Checkpoint { txn_id, timestamp_ms },
            _ => return None,
        };
        Some((record, MARKER_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_round_trip() {
        for record in [
            WalRecord::Begin { txn_id: 7, timestamp_ms: 123 },
            WalRecord::Commit { txn_id: 7, timestamp_ms: 124 },
            WalRecord::Abort { txn_id: 8, timestamp_ms: 125 },
            WalRecord::Checkpoint { txn_id: 0, timestamp_ms: 126 },
        ] {
            let encoded = record.encode();
            assert_eq!(encoded.len(), MARKER_LEN);
            let (decoded, consumed) = WalRecord::decode(&encoded).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(consumed, MARKER_LEN);
        }
    }

    #[test]
    fn test_write_round_trip() {
        let record = WalRecord::Write {
            txn_id: 3,
            page_id: 12,
            after: vec![1, 2, 3, 4, 5],
        };
        let encoded = record.encode();
        let (decoded, consumed) = WalRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_invalid_type_byte() {
        assert!(WalRecord::decode(&[0; 32]).is_none());
        assert!(WalRecord::decode(&[6; 32]).is_none());
        assert!(WalRecord::decode(&[]).is_none());
    }

    #[test]
    fn test_truncated_records() {
        let begin = WalRecord::Begin { txn_id: 1, timestamp_ms: 2 }.encode();
        assert!(WalRecord::decode(&begin[..10]).is_none());

        let write = WalRecord::Write {
            txn_id: 1,
            page_id: 2,
            after: vec![0; 100],
        }
        .encode();
        assert!(WalRecord::decode(&write[..50]).is_none());
        assert!(WalRecord::decode(&write[..WRITE_HEADER_LEN]).is_none());
    }
}
