// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-domain ring registry.
//!
//! Each domain's active rings live in a small hash table keyed by ring
//! identity. The bucket array is L2 state; each entry carries its own L3
//! lock over the mutable ring state. Removal detaches under the L2 write
//! lock and then takes L3 to serialize with any insert still holding the
//! entry.

use crate::pending::PendingList;
use parking_lot::Mutex;
use std::sync::Arc;
use v4v_core::Address;
use v4v_core::DomainId;
use v4v_core::RingId;
use v4v_ring::ProducerRing;

/// Number of buckets in each domain's ring table.
const HTABLE_SIZE: usize = 32;

/// The mutable state of a registered ring (L3).
pub(crate) struct RingState {
    pub ring: ProducerRing,
    pub pending: PendingList,
}

/// A registered ring. The identity is immutable for the life of the entry.
pub(crate) struct RingEntry {
    pub id: RingId,
    pub state: Mutex<RingState>,
}

fn bucket_of(id: &RingId) -> usize {
    let mut hash = (id.addr.port >> 16) as u16;
    hash ^= id.addr.port as u16;
    hash ^= id.addr.domain.0;
    hash ^= id.partner.0;
    usize::from(hash) & (HTABLE_SIZE - 1)
}

/// The bucket array (L2 state).
pub(crate) struct RingTable {
    buckets: [Vec<Arc<RingEntry>>; HTABLE_SIZE],
}

impl RingTable {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// Finds a ring by exact identity.
    pub fn find(&self, id: &RingId) -> Option<&Arc<RingEntry>> {
        self.buckets[bucket_of(id)].iter().find(|e| e.id == *id)
    }

    /// Finds the ring serving `addr` for sends from `partner`: an exact
    /// partner binding wins over a wildcard ring.
    pub fn find_by_addr(&self, addr: Address, partner: DomainId) -> Option<&Arc<RingEntry>> {
        self.find(&RingId { addr, partner }).or_else(|| {
            self.find(&RingId {
                addr,
                partner: DomainId::ANY,
            })
        })
    }

    /// Inserts `entry`, failing if its identity is already registered.
    pub fn insert(&mut self, entry: Arc<RingEntry>) -> bool {
        let bucket = &mut self.buckets[bucket_of(&entry.id)];
        if bucket.iter().any(|e| e.id == entry.id) {
            return false;
        }
        bucket.push(entry);
        true
    }

    /// Detaches the ring with identity `id`.
    pub fn remove(&mut self, id: &RingId) -> Option<Arc<RingEntry>> {
        let bucket = &mut self.buckets[bucket_of(id)];
        let index = bucket.iter().position(|e| e.id == *id)?;
        Some(bucket.swap_remove(index))
    }

    /// Iterates every registered ring.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RingEntry>> {
        self.buckets.iter().flatten()
    }

    /// Detaches and returns every ring.
    pub fn drain(&mut self) -> Vec<Arc<RingEntry>> {
        self.buckets.iter_mut().flat_map(std::mem::take).collect()
    }
}
