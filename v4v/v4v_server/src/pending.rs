// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Blocked senders awaiting ring space.

use smallvec::SmallVec;
use v4v_core::DomainId;

/// One blocked sender: the domain and the payload bytes it wanted.
#[derive(Debug, Copy, Clone)]
struct PendingEntry {
    source: DomainId,
    len: u32,
}

/// The per-ring set of blocked senders, protected by the ring lock.
///
/// At most one entry exists per source; a later, larger request supersedes
/// the earlier length. Entries leave the list when the space they asked
/// for opens up, when a bulk query reports `SUFFICIENT`, or when the ring
/// goes away.
#[derive(Debug, Default)]
pub(crate) struct PendingList {
    entries: Vec<PendingEntry>,
}

impl PendingList {
    /// Records that `source` is blocked wanting `len` payload bytes,
    /// upgrading any existing entry.
    pub fn queue(&mut self, source: DomainId, len: u32) {
        match self.entries.iter_mut().find(|e| e.source == source) {
            Some(entry) => entry.len = entry.len.max(len),
            None => self.entries.push(PendingEntry { source, len }),
        }
    }

    /// Drops the entry for `source`, if any.
    pub fn cancel(&mut self, source: DomainId) {
        self.entries.retain(|e| e.source != source);
    }

    /// Moves every entry satisfied by `free` payload bytes onto `wake`.
    pub fn drain_satisfied(&mut self, free: u32, wake: &mut SmallVec<[DomainId; 4]>) {
        self.entries.retain(|e| {
            if e.len <= free {
                wake.push(e.source);
                false
            } else {
                true
            }
        });
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_upgrades_in_place() {
        let mut pending = PendingList::default();
        pending.queue(DomainId(3), 100);
        pending.queue(DomainId(3), 50);
        pending.queue(DomainId(3), 200);
        pending.queue(DomainId(5), 10);
        assert_eq!(pending.entries.len(), 2);
        assert_eq!(pending.entries[0].len, 200);
    }

    #[test]
    fn drain_moves_satisfied_entries() {
        let mut pending = PendingList::default();
        pending.queue(DomainId(3), 100);
        pending.queue(DomainId(5), 10);

        let mut wake = SmallVec::new();
        pending.drain_satisfied(50, &mut wake);
        assert_eq!(wake.as_slice(), [DomainId(5)]);

        pending.drain_satisfied(100, &mut wake);
        assert_eq!(wake.as_slice(), [DomainId(5), DomainId(3)]);
        assert!(pending.entries.is_empty());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut pending = PendingList::default();
        pending.queue(DomainId(3), 100);
        pending.cancel(DomainId(3));
        pending.cancel(DomainId(3));
        assert!(pending.entries.is_empty());
    }
}
