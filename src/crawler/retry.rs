//! Bounded retry queue for transiently failing ids
//!
//! Every entry carries the number of failed attempts so far. An id that
//! fails again once it has used up `max_retries` is moved into the
//! permanent-failure set instead of being queued.

use crate::state::RetryEntry;
use std::collections::{BTreeSet, VecDeque};

/// What happened to an id handed to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queued with this many failed attempts recorded
    Queued(u32),

    /// Already waiting in the queue; nothing changed
    AlreadyQueued,

    /// Out of retries; moved to the permanent-failure set
    Evicted,

    /// Succeeded (or proved absent) and left the queue
    Resolved,
}

impl RetryDecision {
    /// Returns true if the queue or permanent-failure set changed
    pub fn changed(&self) -> bool {
        !matches!(self, Self::AlreadyQueued)
    }
}

#[derive(Debug, Clone)]
pub struct RetryQueue {
    max_retries: u32,
    entries: VecDeque<RetryEntry>,
}

impl RetryQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            entries: VecDeque::new(),
        }
    }

    /// Rebuilds a queue from checkpointed entries
    pub fn from_entries(max_retries: u32, entries: &[RetryEntry]) -> Self {
        Self {
            max_retries,
            entries: entries.iter().copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    /// Entries in queue order, as persisted in the checkpoint
    pub fn entries(&self) -> Vec<RetryEntry> {
        self.entries.iter().copied().collect()
    }

    /// Records a first failure of `id`
    ///
    /// Ids already in `permanent` are never queued again.
    pub fn enqueue(&mut self, id: i64, permanent: &mut BTreeSet<i64>) -> RetryDecision {
        if permanent.contains(&id) {
            return RetryDecision::Evicted;
        }
        if self.contains(id) {
            return RetryDecision::AlreadyQueued;
        }
        self.push_failure(RetryEntry(id, 0), permanent)
    }

    /// Pops every currently waiting entry so each can be retried once
    ///
    /// Entries that fail again go back through [`RetryDrain::settle`] under
    /// the same cap. Entries never tried return to the front of the queue in
    /// [`RetryDrain::finish`].
    pub fn drain(&mut self) -> RetryDrain {
        RetryDrain {
            pending: std::mem::take(&mut self.entries),
            succeeded: 0,
        }
    }

    fn push_failure(&mut self, entry: RetryEntry, permanent: &mut BTreeSet<i64>) -> RetryDecision {
        if entry.attempts() < self.max_retries {
            let attempts = entry.attempts() + 1;
            self.entries.push_back(RetryEntry(entry.id(), attempts));
            RetryDecision::Queued(attempts)
        } else {
            permanent.insert(entry.id());
            RetryDecision::Evicted
        }
    }
}

/// Entries popped by [`RetryQueue::drain`]
#[derive(Debug)]
pub struct RetryDrain {
    pending: VecDeque<RetryEntry>,
    succeeded: usize,
}

impl RetryDrain {
    /// Entries not yet handed out
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Hands out the next entry to retry
    pub fn next_entry(&mut self) -> Option<RetryEntry> {
        self.pending.pop_front()
    }

    /// Records the result of retrying `entry`
    pub fn settle(
        &mut self,
        queue: &mut RetryQueue,
        entry: RetryEntry,
        succeeded: bool,
        permanent: &mut BTreeSet<i64>,
    ) -> RetryDecision {
        if succeeded {
            self.succeeded += 1;
            RetryDecision::Resolved
        } else {
            queue.push_failure(entry, permanent)
        }
    }

    /// Returns untried entries to the front of the queue
    ///
    /// # Returns
    ///
    /// The number of entries that succeeded
    pub fn finish(self, queue: &mut RetryQueue) -> usize {
        for entry in self.pending.into_iter().rev() {
            queue.entries.push_front(entry);
        }
        self.succeeded
    }
}
