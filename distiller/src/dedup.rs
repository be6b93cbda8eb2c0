use crate::chunker::Chunk;
use std::collections::HashSet;
use std::sync::Mutex;
use transcript_types::{Role, Turn};

/// Run-wide set of content hashes. Check and insert happen under one lock.
#[derive(Default)]
pub struct Deduplicator {
    seen: Mutex<HashSet<u64>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hash`; true when it was not seen before in this run.
    pub fn insert_if_absent(&self, hash: u64) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(hash)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// xxh3 over the chunk's final model run: every turn after its last `user` turn.
pub fn final_model_hash(chunk: &Chunk) -> u64 {
    xxhash_rust::xxh3::xxh3_64(final_model_text(chunk.turns).as_bytes())
}

pub fn final_model_text(turns: &[Turn]) -> String {
    let tail_start = turns
        .iter()
        .rposition(|t| t.role == Role::User)
        .map(|i| i + 1)
        .unwrap_or(0);
    turns[tail_start..]
        .iter()
        .map(Turn::text)
        .collect::<Vec<_>>()
        .join("\n")
}
