//! Time-ordered queue of pending delivery attempts.
//!
//! A min-heap keyed by `next_attempt_at`. Ids are de-duplicated: pushing an
//! id that is already queued moves it to the new due time. Removal and
//! rescheduling are lazy; stale heap entries are skipped when popped.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sierra_core::AttemptId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    id: AttemptId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<AttemptId, u64>,
    next_seq: u64,
}

impl QueueState {
    fn is_live(&self, entry: &Entry) -> bool {
        self.live.get(&entry.id) == Some(&entry.seq)
    }

    fn discard_stale_head(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.is_live(head) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Pending attempt ids ordered by due time.
#[derive(Debug, Default)]
pub struct RetryQueue {
    state: Mutex<QueueState>,
}

impl RetryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `id` for `due`. Returns false if the id was already queued, in
    /// which case it is moved to the new due time.
    pub fn push(&self, id: AttemptId, due: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let fresh = state.live.insert(id, seq).is_none();
        state.heap.push(Reverse(Entry { due, seq, id }));
        fresh
    }

    /// Queue `id` for `due` unless it is already queued. Returns true if it
    /// was added.
    pub fn push_if_absent(&self, id: AttemptId, due: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        if state.live.contains_key(&id) {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.live.insert(id, seq);
        state.heap.push(Reverse(Entry { due, seq, id }));
        true
    }

    /// Atomically remove and return up to `limit` ids due at or before `now`,
    /// earliest first.
    pub fn drain_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<AttemptId> {
        let mut state = self.lock();
        let mut due = Vec::new();

        while due.len() < limit {
            state.discard_stale_head();
            let Some(Reverse(head)) = state.heap.peek().copied() else {
                break;
            };
            if head.due > now {
                break;
            }
            state.heap.pop();
            state.live.remove(&head.id);
            due.push(head.id);
        }

        due
    }

    /// Remove `id` if queued.
    pub fn remove(&self, id: AttemptId) -> bool {
        self.lock().live.remove(&id).is_some()
    }

    #[must_use]
    pub fn contains(&self, id: AttemptId) -> bool {
        self.lock().live.contains_key(&id)
    }

    /// Earliest due time among queued ids.
    #[must_use]
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut state = self.lock();
        state.discard_stale_head();
        state.heap.peek().map(|Reverse(entry)| entry.due)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
