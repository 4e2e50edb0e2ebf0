// src/cache.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::storage::checkpoint;
use crate::storage::index::MemIndex;
use crate::storage::record::RecordKind;
use crate::storage::recovery;
use crate::storage::wal::Wal;
use crate::Result;

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Checkpoint once the active segment grows past this many bytes.
    pub checkpoint_after_bytes: u64,
    /// Checkpoint once the active segment holds this many records.
    pub checkpoint_after_records: u64,
    /// Periodic checkpoint interval; None disables the timer.
    pub checkpoint_interval: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            checkpoint_after_bytes: 4 * 1024 * 1024,
            checkpoint_after_records: 10_000,
            checkpoint_interval: Some(Duration::from_secs(60)),
        }
    }
}

struct Shared {
    ckpt_dir: PathBuf,
    // Single-writer model: every mutation goes through this mutex, which is
    // what keeps sequence numbers gapless and the index in log order. The
    // index update happens while the writer lock is held, after the WAL
    // append succeeded, never before.
    wal: Mutex<Wal>,
    index: RwLock<MemIndex>,
    opts: CacheOptions,
}

enum WorkerMsg {
    Checkpoint,
    Shutdown,
}

// The public get/put/delete/iterate surface. One Cache owns one WAL, one
// index, and one checkpoint worker; dropping it stops the worker. Data is
// durable per write, so there is no flush-on-close obligation.
pub struct Cache {
    shared: Arc<Shared>,
    worker_tx: Sender<WorkerMsg>,
    worker: Option<JoinHandle<()>>,
}

impl Cache {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::open_with(dir, CacheOptions::default())
    }

    /// Opens (or creates) a cache rooted at `dir`. Recovery runs to
    /// completion here; the returned cache is ready to serve.
    pub fn open_with<P: AsRef<Path>>(dir: P, opts: CacheOptions) -> Result<Self> {
        let log_dir = dir.as_ref().join("log");
        let ckpt_dir = dir.as_ref().join("checkpoint");
        fs::create_dir_all(&log_dir)?;
        fs::create_dir_all(&ckpt_dir)?;

        let recovered = recovery::recover(&log_dir, &ckpt_dir)?;
        let wal = Wal::open(
            &log_dir,
            recovered.active_base,
            recovered.next_seq,
            recovered.active_len,
        )?;

        let shared = Arc::new(Shared {
            ckpt_dir,
            wal: Mutex::new(wal),
            index: RwLock::new(recovered.index),
            opts,
        });

        let (worker_tx, worker_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let interval = opts.checkpoint_interval;
        let worker = thread::Builder::new()
            .name("cache-checkpoint".to_string())
            .spawn(move || worker_loop(worker_shared, worker_rx, interval))?;

        Ok(Cache {
            shared,
            worker_tx,
            worker: Some(worker),
        })
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.shared.index.read().get(key).map(|v| v.to_vec())
    }

    /// Stores `value` under `key`. Returns only after the mutation is
    /// durable on disk; an error means it was not applied.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.write(RecordKind::Put, key, value)
    }

    /// Removes `key`. Durable like `put`; deleting an absent key is fine.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.write(RecordKind::Delete, key, &[])
    }

    fn write(&self, kind: RecordKind, key: &str, value: &[u8]) -> Result<()> {
        let over_threshold = {
            let mut wal = self.shared.wal.lock();
            let seq = wal.append(kind, key, value)?;
            let mut index = self.shared.index.write();
            match kind {
                RecordKind::Put => index.apply_put(key, value.to_vec(), seq),
                RecordKind::Delete => index.apply_delete(key, seq),
            }
            wal.active_bytes() >= self.shared.opts.checkpoint_after_bytes
                || wal.active_records() >= self.shared.opts.checkpoint_after_records
        };
        if over_threshold {
            // Worker gone means we are shutting down; nothing to do.
            let _ = self.worker_tx.send(WorkerMsg::Checkpoint);
        }
        Ok(())
    }

    /// Iterates a consistent snapshot of the cache taken at call time.
    /// Mutations made while iterating are not visible to this iterator;
    /// restart it (call `iter` again) to observe them.
    pub fn iter(&self) -> impl Iterator<Item = (String, Vec<u8>)> {
        self.shared.index.read().snapshot().into_iter()
    }

    pub fn for_each<F: FnMut(&str, &[u8])>(&self, mut f: F) {
        for (key, value) in self.iter() {
            f(&key, &value);
        }
    }

    /// Bulk ingestion seam: loads every pair from an external producer
    /// (e.g. a JSON loader). Each pair is individually durable.
    pub fn load_from<I>(&self, source: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        for (key, value) in source {
            self.put(&key, &value)?;
        }
        Ok(())
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shared.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.index.read().is_empty()
    }

    /// Synchronously snapshots the index to a checkpoint and compacts the
    /// log. A no-op when nothing was written since the last checkpoint.
    pub fn checkpoint(&self) -> Result<()> {
        run_checkpoint(&self.shared)
    }

    /// Stops the checkpoint worker and shuts down. Also happens on Drop;
    /// this form surfaces nothing extra today but keeps shutdown explicit.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.worker_tx.send(WorkerMsg::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<WorkerMsg>, interval: Option<Duration>) {
    loop {
        let msg = match interval {
            Some(period) => match rx.recv_timeout(period) {
                Ok(msg) => Some(msg),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => return,
            },
        };
        match msg {
            Some(WorkerMsg::Shutdown) => return,
            // Explicit trigger or timer tick, same work either way.
            Some(WorkerMsg::Checkpoint) | None => {
                if let Err(e) = run_checkpoint(&shared) {
                    tracing::error!("background checkpoint failed: {}", e);
                }
            }
        }
    }
}

// Two-phase checkpoint. Phase one holds the writer lock just long enough to
// copy the index and rotate the WAL, so every surviving log record has
// seq > as_of. Phase two does the disk write with no locks held, and the
// superseded segments and checkpoints are removed only after the new
// checkpoint is durably published. A crash anywhere in between leaves a
// state recovery handles: either the old checkpoint with full logs, or the
// new one with not-yet-deleted logs that idempotent replay skips.
fn run_checkpoint(shared: &Shared) -> Result<()> {
    let (snapshot, as_of_seq) = {
        let mut wal = shared.wal.lock();
        if wal.active_records() == 0 {
            return Ok(());
        }
        let index = shared.index.read();
        let snapshot = index.snapshot();
        let as_of_seq = index.last_seq();
        drop(index);
        wal.rotate()?;
        (snapshot, as_of_seq)
    };

    checkpoint::write(&shared.ckpt_dir, as_of_seq, &snapshot)?;

    shared.wal.lock().remove_segments_below(as_of_seq + 1)?;
    checkpoint::remove_older_than(&shared.ckpt_dir, as_of_seq)?;
    tracing::debug!(
        "compaction complete: log truncated below seq {}",
        as_of_seq + 1
    );
    Ok(())
}
