// src/storage/wal.rs
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::storage::record::{Record, RecordKind};
use crate::Result;

// Append-only write-ahead log. One segment file is active at a time, named
// `<base_seq>.log` where base_seq is the sequence number of its first record.
// Segments are never mutated in place; rotation happens at checkpoint time
// and superseded segments are deleted wholesale once a checkpoint covers them.
pub struct Wal {
    log_dir: PathBuf,
    file: File,
    active_base: u64,
    next_seq: u64,
    active_bytes: u64,
    active_records: u64,
}

pub fn segment_path(dir: &Path, base_seq: u64) -> PathBuf {
    dir.join(format!("{}.log", base_seq))
}

/// Scans `dir` for segment files, returned sorted by base sequence number.
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "log") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(base) = stem.parse::<u64>() {
                segments.push((base, path));
            }
        }
    }
    segments.sort_by_key(|(base, _)| *base);
    Ok(segments)
}

impl Wal {
    /// Opens the active segment for appending. `valid_len` is the byte length
    /// of valid data recovery found in it; anything past that is a torn tail
    /// from a crash mid-append and is cut off before the first new write.
    pub fn open(log_dir: &Path, active_base: u64, next_seq: u64, valid_len: u64) -> Result<Self> {
        let path = segment_path(log_dir, active_base);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // The segment's directory entry must be durable as well, or a power
        // loss can drop the whole file along with records append already
        // acknowledged as synced.
        File::open(log_dir)?.sync_all()?;

        let on_disk_len = file.metadata()?.len();
        if on_disk_len > valid_len {
            tracing::warn!(
                "segment {:?}: dropping {} trailing bytes from a torn write",
                path,
                on_disk_len - valid_len
            );
            file.set_len(valid_len)?;
            file.sync_data()?;
        }

        let mut wal = Wal {
            log_dir: log_dir.to_path_buf(),
            file,
            active_base,
            next_seq,
            active_bytes: valid_len,
            active_records: next_seq.saturating_sub(active_base),
        };
        wal.file.seek(SeekFrom::Start(valid_len))?;
        Ok(wal)
    }

    // Appends one mutation and makes it durable before returning. The
    // returned sequence number is the caller's durability receipt: once this
    // returns Ok, the record survives a crash.
    pub fn append(&mut self, kind: RecordKind, key: &str, value: &[u8]) -> Result<u64> {
        let seq = self.next_seq;
        let record = match kind {
            RecordKind::Put => Record::put(seq, key.to_string(), value.to_vec()),
            RecordKind::Delete => Record::delete(seq, key.to_string()),
        };
        let frame = record.encode_frame()?;

        self.file.write_all(&frame)?;
        self.file.flush()?;
        self.file.sync_data()?;

        self.next_seq += 1;
        self.active_bytes += frame.len() as u64;
        self.active_records += 1;
        Ok(seq)
    }

    /// Closes the active segment and starts a fresh one at `next_seq`.
    /// Returns the new segment's base sequence number.
    pub fn rotate(&mut self) -> Result<u64> {
        self.file.sync_all()?;

        let new_base = self.next_seq;
        let path = segment_path(&self.log_dir, new_base);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        // Same directory-entry durability requirement as in open: the new
        // segment must survive a power loss before it takes appends.
        File::open(&self.log_dir)?.sync_all()?;

        tracing::debug!(
            "rotating wal: segment {} retired, segment {} active",
            self.active_base,
            new_base
        );
        self.file = file;
        self.active_base = new_base;
        self.active_bytes = 0;
        self.active_records = 0;
        Ok(new_base)
    }

    /// Deletes every segment whose base sequence number is below `base`.
    /// Only safe once a durable checkpoint covers all records before `base`.
    pub fn remove_segments_below(&self, base: u64) -> Result<()> {
        for (seg_base, path) in list_segments(&self.log_dir)? {
            if seg_base < base {
                fs::remove_file(&path)?;
                tracing::info!("removed superseded segment {:?}", path);
            }
        }
        Ok(())
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn active_base(&self) -> u64 {
        self.active_base
    }

    pub fn active_bytes(&self) -> u64 {
        self.active_bytes
    }

    pub fn active_records(&self) -> u64 {
        self.active_records
    }
}
