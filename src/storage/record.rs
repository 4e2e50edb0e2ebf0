// src/storage/record.rs
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of bytes in the length prefix that frames every record on disk.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Put,
    Delete,
}

// A single logged mutation. Immutable once written; ordering by `seq`
// is the sole source of truth for "latest wins".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub seq: u64,
    pub kind: RecordKind,
    pub checksum: u32, // CRC32 of seq + kind + key + value
    pub key: String,
    pub value: Vec<u8>, // empty for Delete
}

/// Outcome of decoding one frame from a byte slice.
///
/// `TornTail` and `Corrupt` are distinct on purpose: a frame whose declared
/// length runs past the end of the available bytes is a partial write from a
/// crash mid-append and is discarded during recovery, while a fully present
/// frame that fails validation indicates real damage.
#[derive(Debug)]
pub enum Frame {
    Record { record: Record, consumed: usize },
    TornTail,
    Corrupt { consumed: usize, reason: String },
}

impl Record {
    pub fn put(seq: u64, key: String, value: Vec<u8>) -> Self {
        let checksum = compute_checksum(seq, RecordKind::Put, &key, &value);
        Record {
            seq,
            kind: RecordKind::Put,
            checksum,
            key,
            value,
        }
    }

    pub fn delete(seq: u64, key: String) -> Self {
        let checksum = compute_checksum(seq, RecordKind::Delete, &key, &[]);
        Record {
            seq,
            kind: RecordKind::Delete,
            checksum,
            key,
            value: Vec::new(),
        }
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum == compute_checksum(self.seq, self.kind, &self.key, &self.value)
    }

    // Serializes to a length-prefixed frame: u32 BE body length, then the
    // bincode body. The prefix is what lets recovery detect a torn tail.
    pub fn encode_frame(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes one frame from the front of `data`.
    pub fn decode_frame(data: &[u8]) -> Frame {
        if data.len() < FRAME_HEADER_LEN {
            return Frame::TornTail;
        }
        let body_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let total = FRAME_HEADER_LEN + body_len;
        if data.len() < total {
            return Frame::TornTail;
        }
        let body = &data[FRAME_HEADER_LEN..total];
        match bincode::deserialize::<Record>(body) {
            Ok(record) => {
                if record.verify_checksum() {
                    Frame::Record {
                        record,
                        consumed: total,
                    }
                } else {
                    Frame::Corrupt {
                        consumed: total,
                        reason: format!("checksum mismatch for record seq {}", record.seq),
                    }
                }
            }
            Err(e) => Frame::Corrupt {
                consumed: total,
                reason: format!("undecodable record body: {}", e),
            },
        }
    }

    /// Decodes a frame that must be fully present and valid.
    pub fn decode_strict(data: &[u8]) -> Result<(Record, usize)> {
        match Self::decode_frame(data) {
            Frame::Record { record, consumed } => Ok((record, consumed)),
            Frame::TornTail => Err(Error::Corruption("record frame truncated".to_string())),
            Frame::Corrupt { reason, .. } => Err(Error::Corruption(reason)),
        }
    }
}

fn compute_checksum(seq: u64, kind: RecordKind, key: &str, value: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&seq.to_be_bytes());
    hasher.update(&[match kind {
        RecordKind::Put => 0u8,
        RecordKind::Delete => 1u8,
    }]);
    hasher.update(&(key.len() as u32).to_be_bytes());
    hasher.update(key.as_bytes());
    hasher.update(value);
    hasher.finalize()
}
