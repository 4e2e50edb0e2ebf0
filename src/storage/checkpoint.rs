// src/storage/checkpoint.rs
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

// A full snapshot of the index at a log position. A checkpoint supersedes
// every log record with seq <= as_of_seq, which is what lets the compaction
// pass delete those segments and bound recovery time.
#[derive(Serialize, Deserialize, Debug)]
pub struct Checkpoint {
    pub as_of_seq: u64,
    pub checksum: u32, // CRC32 of as_of_seq + entries
    pub entries: Vec<(String, Vec<u8>)>,
}

pub fn checkpoint_path(dir: &Path, as_of_seq: u64) -> PathBuf {
    dir.join(format!("{}.ckpt", as_of_seq))
}

fn compute_checksum(as_of_seq: u64, entries: &[(String, Vec<u8>)]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&as_of_seq.to_be_bytes());
    for (key, value) in entries {
        hasher.update(&(key.len() as u32).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update(&(value.len() as u32).to_be_bytes());
        hasher.update(value);
    }
    hasher.finalize()
}

impl Checkpoint {
    pub fn verify_checksum(&self) -> bool {
        self.checksum == compute_checksum(self.as_of_seq, &self.entries)
    }
}

/// Atomically publishes a checkpoint covering everything up to `as_of_seq`.
///
/// Two-phase: the body goes to a `.tmp` file which is fsync'd, then renamed
/// into place, then the directory is fsync'd. A crash at any point leaves
/// either no new checkpoint (a stray `.tmp` that loading ignores) or a
/// complete one, never a partially visible snapshot.
pub fn write(dir: &Path, as_of_seq: u64, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let entries: Vec<(String, Vec<u8>)> = entries
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let checkpoint = Checkpoint {
        as_of_seq,
        checksum: compute_checksum(as_of_seq, &entries),
        entries,
    };
    let body = bincode::serialize(&checkpoint)?;

    let final_path = checkpoint_path(dir, as_of_seq);
    let tmp_path = final_path.with_extension("ckpt.tmp");
    {
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&body)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    File::open(dir)?.sync_all()?;

    tracing::info!(
        "published checkpoint {:?} ({} entries, as of seq {})",
        final_path,
        checkpoint.entries.len(),
        as_of_seq
    );
    Ok(())
}

fn list_checkpoints(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "ckpt") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            if let Ok(as_of) = stem.parse::<u64>() {
                found.push((as_of, path));
            }
        }
    }
    found.sort_by_key(|(as_of, _)| *as_of);
    Ok(found)
}

/// Loads the newest checkpoint that validates. An unreadable or
/// checksum-failing file is skipped with a warning so an older checkpoint
/// (or none) can still seed recovery. Stray `.tmp` files from an
/// interrupted publish are removed.
pub fn load_latest(dir: &Path) -> Result<Option<Checkpoint>> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "tmp") {
            tracing::warn!("removing incomplete checkpoint {:?}", path);
            fs::remove_file(&path)?;
        }
    }

    for (as_of_seq, path) in list_checkpoints(dir)?.into_iter().rev() {
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("skipping unreadable checkpoint {:?}: {}", path, e);
                continue;
            }
        };
        let checkpoint: Checkpoint = match bincode::deserialize(&body) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("skipping undecodable checkpoint {:?}: {}", path, e);
                continue;
            }
        };
        if checkpoint.as_of_seq != as_of_seq || !checkpoint.verify_checksum() {
            tracing::warn!("skipping checkpoint {:?}: checksum mismatch", path);
            continue;
        }
        return Ok(Some(checkpoint));
    }
    Ok(None)
}

/// Prunes checkpoints superseded by the one at `as_of_seq`.
pub fn remove_older_than(dir: &Path, as_of_seq: u64) -> Result<()> {
    for (old_as_of, path) in list_checkpoints(dir)? {
        if old_as_of < as_of_seq {
            fs::remove_file(&path)?;
            tracing::info!("removed superseded checkpoint {:?}", path);
        }
    }
    Ok(())
}

/// Validation used by tests and tooling: loads a specific checkpoint file.
pub fn load_at(dir: &Path, as_of_seq: u64) -> Result<Checkpoint> {
    let path = checkpoint_path(dir, as_of_seq);
    let body = fs::read(&path)?;
    let checkpoint: Checkpoint = bincode::deserialize(&body).map_err(Error::Deserialization)?;
    if !checkpoint.verify_checksum() {
        return Err(Error::Corruption(format!(
            "checkpoint {:?} failed checksum validation",
            path
        )));
    }
    Ok(checkpoint)
}
