//! Ownership of server-side query ids for one logical connection
//!
//! Each live query session holds a slot. Releasing a slot queues its query
//! id for closing; the next session created takes one queued id and closes
//! it on the node as the replaced query of its first request.

use std::collections::{BTreeMap, VecDeque};

use tracing::warn;

/// Default number of query ids waiting to be closed
pub const DEFAULT_PENDING_CLOSE_CAPACITY: usize = 64;

/// A query id and the session epoch it was registered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryRef {
    /// 0 when no query is active
    pub query_id: i64,
    /// Epoch of the node session that knows `query_id`
    pub epoch: u64,
}

impl QueryRef {
    pub fn new(query_id: i64, epoch: u64) -> Self {
        Self { query_id, epoch }
    }
}

/// Handle of one registered query session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u64);

#[derive(Debug)]
pub struct QueryPool {
    slots: BTreeMap<SlotId, QueryRef>,
    pending: VecDeque<QueryRef>,
    capacity: usize,
    next_slot: u64,
}

impl Default for QueryPool {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CLOSE_CAPACITY)
    }
}

impl QueryPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: BTreeMap::new(),
            pending: VecDeque::new(),
            capacity: capacity.max(1),
            next_slot: 0,
        }
    }

    /// Register a session starting from `initial`
    pub fn register(&mut self, initial: QueryRef) -> SlotId {
        self.next_slot += 1;
        let slot = SlotId(self.next_slot);
        self.slots.insert(slot, initial);
        slot
    }

    pub fn get(&self, slot: SlotId) -> Option<&QueryRef> {
        self.slots.get(&slot)
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut QueryRef> {
        self.slots.get_mut(&slot)
    }

    /// Release a slot, queueing its query id when the current session still knows it
    pub fn detach(&mut self, slot: SlotId, current_epoch: u64) {
        let Some(query) = self.slots.remove(&slot) else {
            return;
        };
        if query.query_id != 0 && query.epoch == current_epoch {
            self.push_pending(query);
        }
    }

    /// Release every slot, as on connection close
    pub fn detach_all(&mut self, current_epoch: u64) {
        let slots: Vec<SlotId> = self.slots.keys().copied().collect();
        for slot in slots {
            self.detach(slot, current_epoch);
        }
    }

    fn push_pending(&mut self, query: QueryRef) {
        if self.pending.len() >= self.capacity {
            if let Some(evicted) = self.pending.pop_front() {
                warn!(
                    query_id = evicted.query_id,
                    capacity = self.capacity,
                    "Pending close queue full, dropping query id"
                );
            }
        }
        self.pending.push_back(query);
    }

    /// Take the most recently released query id, if any
    pub fn pull(&mut self) -> Option<QueryRef> {
        self.pending.pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.pending.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
