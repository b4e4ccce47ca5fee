//! In-memory window over the tail of the log, owned by the message queue.
//!
//! Entries are reference-counted: an `Arc<ReplicateMsg>` handed to a peer's
//! outbound request stays alive even after the cache evicts it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::proto::OpId;
use crate::proto::ReplicateMsg;

#[derive(Default)]
pub(crate) struct LogCache {
    entries: BTreeMap<u64, Arc<ReplicateMsg>>,
}

impl LogCache {
    pub fn insert(
        &mut self,
        msg: Arc<ReplicateMsg>,
    ) {
        self.entries.insert(msg.id.index, msg);
    }

    pub fn get(
        &self,
        index: u64,
    ) -> Option<Arc<ReplicateMsg>> {
        self.entries.get(&index).cloned()
    }

    /// Up to `max` consecutive entries starting at `from`. Stops at the
    /// first gap; the caller falls back to the log for anything missing.
    pub fn read_from(
        &self,
        from: u64,
        max: usize,
    ) -> Vec<Arc<ReplicateMsg>> {
        let mut out = Vec::new();
        let mut next = from;
        for (&index, msg) in self.entries.range(from..) {
            if index != next || out.len() >= max {
                break;
            }
            out.push(msg.clone());
            next += 1;
        }
        out
    }

    /// Term of the entry at `index`, if cached.
    pub fn term_of(
        &self,
        index: u64,
    ) -> Option<u64> {
        self.entries.get(&index).map(|m| m.id.term)
    }

    pub fn op_id_at(
        &self,
        index: u64,
    ) -> Option<OpId> {
        self.entries.get(&index).map(|m| m.id)
    }

    /// Drops entries at or below `index` (they are applied everywhere that
    /// matters and can be re-read from the log if a slow peer needs them).
    pub fn evict_up_to(
        &mut self,
        index: u64,
    ) {
        self.entries.retain(|&i, _| i > index);
    }

    /// Drops entries strictly above `index` (divergent suffix overwrite).
    pub fn truncate_after(
        &mut self,
        index: u64,
    ) {
        self.entries.split_off(&(index + 1));
    }

    pub fn last_index(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
