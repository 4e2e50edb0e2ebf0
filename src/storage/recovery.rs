// src/storage/recovery.rs
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::storage::checkpoint;
use crate::storage::index::MemIndex;
use crate::storage::record::{Frame, Record, RecordKind};
use crate::storage::wal;
use crate::{Error, Result};

/// Result of startup recovery: the rebuilt index plus everything the WAL
/// needs to resume appending where the valid log left off.
#[derive(Debug)]
pub struct Recovered {
    pub index: MemIndex,
    pub next_seq: u64,
    pub active_base: u64,
    /// Byte length of valid data in the active segment. Anything past this
    /// is a torn tail the WAL truncates before its first append.
    pub active_len: u64,
}

// Rebuilds the in-memory index from durable state: latest valid checkpoint
// first, then every log record with seq > checkpoint position, in order.
//
// Crash-consistency policy: a record that fails to decode at the very end of
// the final segment is a torn write from a crash mid-append and is discarded.
// The same failure anywhere earlier means real damage and recovery aborts
// with Corruption.
pub fn recover(log_dir: &Path, ckpt_dir: &Path) -> Result<Recovered> {
    let (mut index, as_of_seq) = match checkpoint::load_latest(ckpt_dir)? {
        Some(ckpt) => {
            tracing::info!(
                "recovery: seeding {} entries from checkpoint as of seq {}",
                ckpt.entries.len(),
                ckpt.as_of_seq
            );
            let as_of = ckpt.as_of_seq;
            (MemIndex::seed(ckpt.entries, as_of), as_of)
        }
        None => (MemIndex::new(), 0),
    };

    let segments = wal::list_segments(log_dir)?;
    let mut active_base = as_of_seq + 1;
    let mut active_len = 0u64;
    let mut replayed = 0u64;

    let last_idx = segments.len().checked_sub(1);
    for (i, (base, path)) in segments.iter().enumerate() {
        let is_last = Some(i) == last_idx;
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut valid_len = 0u64;
        if file_len > 0 {
            let mmap = unsafe { Mmap::map(&file)? };
            let data = &mmap[..];
            let mut offset = 0usize;

            while offset < data.len() {
                match Record::decode_frame(&data[offset..]) {
                    Frame::Record { record, consumed } => {
                        // Records at or below the checkpoint position are
                        // already reflected in the seeded index; a segment
                        // that survived a crash mid-compaction may still
                        // contain them.
                        if record.seq > as_of_seq {
                            apply(&mut index, record);
                            replayed += 1;
                        }
                        offset += consumed;
                    }
                    Frame::TornTail => {
                        if is_last {
                            tracing::warn!(
                                "recovery: discarding torn tail in {:?} at byte {}",
                                path,
                                offset
                            );
                            break;
                        }
                        return Err(Error::Corruption(format!(
                            "segment {:?} is truncated but later segments exist",
                            path
                        )));
                    }
                    Frame::Corrupt { consumed, reason } => {
                        // A complete-but-invalid frame with nothing after it
                        // is still a torn write: a crash can land mid-sector
                        // after the length prefix hit the disk.
                        if is_last && offset + consumed == data.len() {
                            tracing::warn!(
                                "recovery: discarding invalid final record in {:?}: {}",
                                path,
                                reason
                            );
                            break;
                        }
                        return Err(Error::Corruption(format!(
                            "record at byte {} of {:?}: {}",
                            offset, path, reason
                        )));
                    }
                }
                valid_len = offset as u64;
            }
        }

        if is_last {
            active_base = *base;
            active_len = valid_len;
        }
    }

    // When a corrupt checkpoint forced a fallback to an older one, the
    // replayable records may end below the active segment's base even though
    // higher sequence numbers were already handed out before the crash. The
    // base is proof of that, so never assign below it.
    let next_seq = (index.last_seq() + 1).max(active_base);
    tracing::info!(
        "recovery complete: {} live keys, {} records replayed, next seq {}",
        index.len(),
        replayed,
        next_seq
    );
    Ok(Recovered {
        index,
        next_seq,
        active_base,
        active_len,
    })
}

fn apply(index: &mut MemIndex, record: Record) {
    match record.kind {
        RecordKind::Put => index.apply_put(&record.key, record.value, record.seq),
        RecordKind::Delete => index.apply_delete(&record.key, record.seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::Wal;
    use assert_matches::assert_matches;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    struct Dirs {
        _root: tempfile::TempDir,
        log: std::path::PathBuf,
        ckpt: std::path::PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempdir().expect("tempdir");
        let log = root.path().join("log");
        let ckpt = root.path().join("checkpoint");
        fs::create_dir_all(&log).expect("mkdir");
        fs::create_dir_all(&ckpt).expect("mkdir");
        Dirs {
            _root: root,
            log,
            ckpt,
        }
    }

    #[test]
    fn test_recover_from_empty_directories() {
        let d = dirs();
        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert!(recovered.index.is_empty());
        assert_eq!(recovered.next_seq, 1);
        assert_eq!(recovered.active_base, 1);
        assert_eq!(recovered.active_len, 0);
    }

    #[test]
    fn test_durability_round_trip() {
        let d = dirs();
        {
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "a", b"1").expect("append");
            wal.append(RecordKind::Put, "b", b"2").expect("append");
            wal.append(RecordKind::Put, "a", b"3").expect("append");
            wal.append(RecordKind::Delete, "b", b"").expect("append");
        }
        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(recovered.index.get("a"), Some(b"3".as_ref()));
        assert_eq!(recovered.index.get("b"), None);
        assert_eq!(recovered.next_seq, 5);
    }

    #[test]
    fn test_recovery_is_repeatable() {
        let d = dirs();
        {
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "k", b"v1").expect("append");
            wal.append(RecordKind::Put, "k", b"v2").expect("append");
        }
        let first = recover(&d.log, &d.ckpt).expect("recover");
        let second = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(first.index.snapshot(), second.index.snapshot());
        assert_eq!(first.next_seq, second.next_seq);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let d = dirs();
        let valid_len;
        {
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "a", b"1").expect("append");
            wal.append(RecordKind::Put, "b", b"2").expect("append");
            valid_len = wal.active_bytes();
        }
        // Crash mid-append: a frame whose declared length exceeds the bytes
        // actually present.
        let path = wal::segment_path(&d.log, 1);
        let mut data = fs::read(&path).expect("read");
        let partial = Record::put(3, "c".to_string(), b"3".to_vec())
            .encode_frame()
            .expect("encode");
        data.extend_from_slice(&partial[..partial.len() - 2]);
        fs::write(&path, data).expect("write");

        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(recovered.index.get("a"), Some(b"1".as_ref()));
        assert_eq!(recovered.index.get("b"), Some(b"2".as_ref()));
        assert_eq!(recovered.index.get("c"), None);
        assert_eq!(recovered.next_seq, 3);
        assert_eq!(recovered.active_len, valid_len);
    }

    #[test]
    fn test_invalid_final_record_is_discarded() {
        let d = dirs();
        {
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "a", b"1").expect("append");
            wal.append(RecordKind::Put, "b", b"2").expect("append");
        }
        // Full-length final frame with a flipped payload byte.
        let path = wal::segment_path(&d.log, 1);
        let mut data = fs::read(&path).expect("read");
        let last = data.len() - 1;
        data[last] ^= 0xff;
        fs::write(&path, data).expect("write");

        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(recovered.index.get("a"), Some(b"1".as_ref()));
        assert_eq!(recovered.index.get("b"), None);
        assert_eq!(recovered.next_seq, 2);
    }

    #[test]
    fn test_corrupt_record_before_tail_is_fatal() {
        let d = dirs();
        let first_len;
        {
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "a", b"1").expect("append");
            first_len = wal.active_bytes() as usize;
            wal.append(RecordKind::Put, "b", b"2").expect("append");
        }
        // Damage the first record; a valid record follows it.
        let path = wal::segment_path(&d.log, 1);
        let mut data = fs::read(&path).expect("read");
        data[first_len - 1] ^= 0xff;
        fs::write(&path, data).expect("write");

        assert_matches!(recover(&d.log, &d.ckpt), Err(Error::Corruption(_)));
    }

    #[test]
    fn test_truncated_non_final_segment_is_fatal() {
        let d = dirs();
        {
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "a", b"1").expect("append");
            wal.rotate().expect("rotate");
            wal.append(RecordKind::Put, "b", b"2").expect("append");
        }
        // Cut the first segment short even though a later segment exists.
        let path = wal::segment_path(&d.log, 1);
        let data = fs::read(&path).expect("read");
        fs::write(&path, &data[..data.len() - 1]).expect("write");

        assert_matches!(recover(&d.log, &d.ckpt), Err(Error::Corruption(_)));
    }

    #[test]
    fn test_checkpoint_plus_trailing_log() {
        let d = dirs();
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), b"ckpt".to_vec());
        checkpoint::write(&d.ckpt, 2, &entries).expect("write checkpoint");
        {
            // Segment holding only post-checkpoint records.
            let mut wal = Wal::open(&d.log, 3, 3, 0).expect("open");
            wal.append(RecordKind::Put, "b", b"tail").expect("append");
        }
        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(recovered.index.get("a"), Some(b"ckpt".as_ref()));
        assert_eq!(recovered.index.get("b"), Some(b"tail".as_ref()));
        assert_eq!(recovered.next_seq, 4);
        assert_eq!(recovered.active_base, 3);
    }

    #[test]
    fn test_fallback_checkpoint_does_not_reuse_sequence_numbers() {
        let d = dirs();
        // The newest checkpoint (as of seq 3) is damaged and compaction
        // already pruned the log it covered, leaving an empty active
        // segment at base 4. Recovery falls back to the checkpoint at
        // seq 1, but sequence numbers up to 3 were handed out and must
        // not be assigned again.
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), b"old".to_vec());
        checkpoint::write(&d.ckpt, 1, &entries).expect("write checkpoint");
        fs::write(d.ckpt.join("3.ckpt"), b"garbage").expect("write");
        fs::write(d.log.join("4.log"), b"").expect("write");

        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(recovered.index.get("a"), Some(b"old".as_ref()));
        assert_eq!(recovered.active_base, 4);
        assert_eq!(recovered.next_seq, 4);

        let mut wal = Wal::open(
            &d.log,
            recovered.active_base,
            recovered.next_seq,
            recovered.active_len,
        )
        .expect("open");
        assert_eq!(wal.append(RecordKind::Put, "b", b"new").expect("append"), 4);
    }

    #[test]
    fn test_superseded_segment_does_not_resurrect_deleted_key() {
        let d = dirs();
        {
            // put k, delete k, all covered by a checkpoint that no longer
            // carries the key. The old segment survives a crash that
            // happened before compaction could delete it.
            let mut wal = Wal::open(&d.log, 1, 1, 0).expect("open");
            wal.append(RecordKind::Put, "k", b"v").expect("append");
            wal.append(RecordKind::Delete, "k", b"").expect("append");
            wal.append(RecordKind::Put, "live", b"yes").expect("append");
            wal.rotate().expect("rotate");
        }
        let mut entries = BTreeMap::new();
        entries.insert("live".to_string(), b"yes".to_vec());
        checkpoint::write(&d.ckpt, 3, &entries).expect("write checkpoint");

        let recovered = recover(&d.log, &d.ckpt).expect("recover");
        assert_eq!(recovered.index.get("k"), None);
        assert_eq!(recovered.index.get("live"), Some(b"yes".as_ref()));
        assert_eq!(recovered.next_seq, 4);
        assert_eq!(recovered.active_base, 4);
    }
}
