// src/storage/index.rs
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
struct Slot {
    // None is a tombstone. The slot is kept so the delete's sequence number
    // still shadows any older record replayed for the same key.
    value: Option<Vec<u8>>,
    seq: u64,
}

// In-memory mapping from key to current value, rebuilt from durable state on
// every startup. Pure in-memory; never itself the source of truth.
#[derive(Debug, Default)]
pub struct MemIndex {
    map: HashMap<String, Slot>,
    last_seq: u64,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the index from checkpoint entries, all attributed to `as_of_seq`.
    pub fn seed(entries: Vec<(String, Vec<u8>)>, as_of_seq: u64) -> Self {
        let map = entries
            .into_iter()
            .map(|(key, value)| {
                (
                    key,
                    Slot {
                        value: Some(value),
                        seq: as_of_seq,
                    },
                )
            })
            .collect();
        MemIndex {
            map,
            last_seq: as_of_seq,
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.map
            .get(key)
            .and_then(|slot| slot.value.as_deref())
    }

    // Applying a record at or below the key's last applied sequence number is
    // a no-op. This is the guard against double replay.
    pub fn apply_put(&mut self, key: &str, value: Vec<u8>, seq: u64) {
        self.apply(key, Some(value), seq);
    }

    pub fn apply_delete(&mut self, key: &str, seq: u64) {
        self.apply(key, None, seq);
    }

    fn apply(&mut self, key: &str, value: Option<Vec<u8>>, seq: u64) {
        match self.map.get_mut(key) {
            Some(slot) => {
                if seq > slot.seq {
                    slot.value = value;
                    slot.seq = seq;
                }
            }
            None => {
                self.map.insert(key.to_string(), Slot { value, seq });
            }
        }
        self.last_seq = self.last_seq.max(seq);
    }

    /// Highest sequence number applied so far (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.map.values().filter(|s| s.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of the live entries, for checkpointing and
    /// snapshot iteration. Tombstones are dropped; they only matter while
    /// the log records they shadow are still replayable.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.map
            .iter()
            .filter_map(|(k, slot)| slot.value.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }
}
