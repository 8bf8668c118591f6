//! In-memory dead-letter entry storage.
//!
//! Entries are keyed by id and stamped with an insertion sequence so that
//! "oldest" is well defined even when two entries share a `created_at`.
//! Pending entries are also indexed by `(created_at, seq)`, which keeps
//! eviction at capacity O(log n). Mutations go through [`EntryStore::update`]
//! so the index follows status changes. The store does no locking of its
//! own; the queue owns it behind a mutex.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use tradeflow_core::EntryId;

use super::types::{DeadLetterEntry, DlqStats, DlqStatus};

type PendingKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    entry: DeadLetterEntry,
}

impl Slot {
    fn key(&self) -> PendingKey {
        (self.entry.created_at, self.seq)
    }

    fn is_pending(&self) -> bool {
        self.entry.status == DlqStatus::Pending
    }
}

#[derive(Debug, Default)]
pub struct EntryStore {
    slots: HashMap<EntryId, Slot>,
    pending: BTreeMap<PendingKey, EntryId>,
    next_seq: u64,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn insert(&mut self, entry: DeadLetterEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = Slot { seq, entry };
        if slot.is_pending() {
            self.pending.insert(slot.key(), slot.entry.id);
        }
        if let Some(old) = self.slots.insert(slot.entry.id, slot) {
            self.pending.remove(&old.key());
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&DeadLetterEntry> {
        self.slots.get(&id).map(|slot| &slot.entry)
    }

    /// Mutate one entry in place, keeping the pending index in step with
    /// whatever status `f` leaves behind.
    pub fn update<R>(
        &mut self,
        id: EntryId,
        f: impl FnOnce(&mut DeadLetterEntry) -> R,
    ) -> Option<R> {
        let slot = self.slots.get_mut(&id)?;
        let was_pending = slot.is_pending();
        let result = f(&mut slot.entry);
        match (was_pending, slot.is_pending()) {
            (false, true) => {
                self.pending.insert(slot.key(), id);
            }
            (true, false) => {
                self.pending.remove(&slot.key());
            }
            _ => {}
        }
        Some(result)
    }

    pub fn remove(&mut self, id: EntryId) -> Option<DeadLetterEntry> {
        let slot = self.slots.remove(&id)?;
        self.pending.remove(&slot.key());
        Some(slot.entry)
    }

    /// Entry to drop when the queue is full.
    ///
    /// The oldest pending entry goes first. If nothing is pending, the oldest
    /// terminal entry, and only then the oldest in-flight one.
    pub fn eviction_candidate(&self) -> Option<EntryId> {
        if let Some(id) = self.pending.values().next() {
            return Some(*id);
        }
        self.slots
            .values()
            .min_by_key(|slot| (slot.entry.status == DlqStatus::Retrying, slot.key()))
            .map(|slot| slot.entry.id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Clones of entries matching `predicate`, in insertion order.
    pub fn collect(&self, predicate: impl Fn(&DeadLetterEntry) -> bool) -> Vec<DeadLetterEntry> {
        let mut slots: Vec<&Slot> = self
            .slots
            .values()
            .filter(|slot| predicate(&slot.entry))
            .collect();
        slots.sort_by_key(|slot| slot.seq);
        slots.into_iter().map(|slot| slot.entry.clone()).collect()
    }

    /// Remove every entry matching `predicate`, returning the removed ids.
    pub fn remove_where(&mut self, predicate: impl Fn(&DeadLetterEntry) -> bool) -> Vec<EntryId> {
        let ids: Vec<EntryId> = self
            .slots
            .values()
            .filter(|slot| predicate(&slot.entry))
            .map(|slot| slot.entry.id)
            .collect();
        for id in &ids {
            self.remove(*id);
        }
        ids
    }

    pub fn drain(&mut self) -> Vec<EntryId> {
        self.pending.clear();
        self.slots.drain().map(|(id, _)| id).collect()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> DlqStats {
        let mut stats = DlqStats::default();
        let mut oldest_pending: Option<DateTime<Utc>> = None;
        for slot in self.slots.values() {
            stats.record(slot.entry.status);
            if slot.entry.status == DlqStatus::Pending {
                let created = slot.entry.created_at;
                oldest_pending = Some(oldest_pending.map_or(created, |o| o.min(created)));
            }
        }
        stats.oldest_pending_age_ms = oldest_pending.map(|t| (now - t).num_milliseconds().max(0));
        stats
    }
}
