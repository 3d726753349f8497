// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The hypervisor-resident V4V service: per-domain ring registries,
//! datagram delivery, space notification, and the send policy filter.
//!
//! Locking is hierarchical and always acquired outermost to innermost:
//!
//! - **L1**: the global directory lock over the per-domain state
//!   pointers. Read-held whenever a domain's state is dereferenced;
//!   write-held only to publish or clear a pointer.
//! - **L2**: a domain's registry lock, protecting its bucket array and
//!   ring identities. Read-held for lookups and sends, write-held for
//!   registration and removal.
//! - **L3**: a ring's state lock, protecting the producer state, the
//!   mapping cache, and the pending list.
//!
//! The rule table has its own lock outside the hierarchy. Debug builds
//! assert the acquisition order per thread.

#![forbid(unsafe_code)]

mod lockorder;
mod pending;
mod registry;
mod rules;
#[cfg(test)]
mod tests;

pub use rules::Rule;

use crate::lockorder::Held;
use crate::lockorder::Level;
use crate::pending::PendingList;
use crate::registry::RingEntry;
use crate::registry::RingState;
use crate::registry::RingTable;
use crate::rules::RuleTable;
use parking_lot::Mutex;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use v4v_core::guest::AccessError;
use v4v_core::guest::GuestMemory;
use v4v_core::protocol::InfoBlock;
use v4v_core::protocol::Iov;
use v4v_core::protocol::RingDataEnt;
use v4v_core::protocol::RingDataFlags;
use v4v_core::protocol::RingDataHeader;
use v4v_core::protocol::RingDescriptor;
use v4v_core::protocol::SendAddr;
use v4v_core::protocol::TablesListHeader;
use v4v_core::protocol::TablesRule;
use v4v_core::protocol::MESSAGE_HEADER_SIZE;
use v4v_core::protocol::NB_RULES_OFFSET;
use v4v_core::protocol::RING_DATA_FLAGS_OFFSET;
use v4v_core::protocol::RING_DATA_MAGIC;
use v4v_core::protocol::RING_DATA_MMS_OFFSET;
use v4v_core::protocol::RING_ID_OFFSET;
use v4v_core::protocol::RING_MAGIC;
use v4v_core::protocol::SLOT_SIZE;
use v4v_core::protocol::TABLES_LIST_MAGIC;
use v4v_core::protocol::TX_PTR_OFFSET;
use v4v_core::Address;
use v4v_core::DomainId;
use v4v_core::RingId;
use v4v_ring::FramePool;
use v4v_ring::FrameSet;
use v4v_ring::InsertError;
use v4v_ring::PinError;
use v4v_ring::ProducerRing;
use v4v_ring::PAGE_SIZE;

/// An event-channel port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvtchnPort(pub u32);

/// Failure to allocate an event-channel port.
#[derive(Debug, Error)]
#[error("failed to allocate an event channel port")]
pub struct PortError;

/// The host's event-channel primitive. Signaling a port wakes the domain
/// that owns it.
pub trait Notifier: Send + Sync {
    /// Allocates a port for `domain`, bound to the domain itself.
    fn allocate_port(&self, domain: DomainId) -> Result<EvtchnPort, PortError>;

    /// Releases a port returned by [`Self::allocate_port`].
    fn free_port(&self, domain: DomainId, port: EvtchnPort);

    /// Signals `port`, waking `domain`.
    fn signal(&self, domain: DomainId, port: EvtchnPort);
}

/// Hypercall result taxonomy. The dispatch shim maps these onto the host's
/// numeric error codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum V4vError {
    /// Malformed handle, magic, length, or argument.
    #[error("invalid argument")]
    InvalidArgument,
    /// A guest handle was inaccessible or a frame mapping failed.
    #[error("guest memory fault")]
    MemoryFault,
    /// An internal allocation failed.
    #[error("out of memory")]
    OutOfMemory,
    /// No ring with the requested identity is registered.
    #[error("ring not found")]
    NotFound,
    /// A ring with the same identity is already registered.
    #[error("ring already exists")]
    AlreadyExists,
    /// The destination domain, ring, or policy refused the send.
    #[error("connection refused")]
    Refused,
    /// The destination ring is full; a pending entry has been queued.
    #[error("destination ring is full")]
    WouldBlock,
    /// The message exceeds the ring capacity or the 2 GiB bound.
    #[error("message too large")]
    MessageTooLarge,
    /// The calling domain has no V4V state.
    #[error("v4v is not enabled for this domain")]
    NoDevice,
    /// Unknown operation.
    #[error("unsupported operation")]
    Unsupported,
}

impl From<AccessError> for V4vError {
    fn from(_: AccessError) -> Self {
        Self::MemoryFault
    }
}

impl From<PinError> for V4vError {
    fn from(err: PinError) -> Self {
        match err {
            PinError::InvalidFrame(_) => Self::InvalidArgument,
            PinError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

impl From<InsertError> for V4vError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::MessageTooLarge => Self::MessageTooLarge,
            InsertError::WouldBlock => Self::WouldBlock,
            InsertError::Access(_) | InsertError::Map(_) => Self::MemoryFault,
        }
    }
}

/// Failure to enable V4V for a domain.
#[derive(Debug, Error)]
pub enum InitError {
    /// The domain already has V4V state.
    #[error("domain already has v4v state")]
    AlreadyEnabled,
    /// The event-channel allocation failed.
    #[error("event channel allocation failed")]
    Port(#[from] PortError),
}

/// Per-domain V4V state.
struct DomainState {
    evtchn_port: EvtchnPort,
    /// L2. Protects the bucket array and the ring identities within.
    registry: RwLock<RingTable>,
}

/// The scatter total may not exceed 2 GiB.
const MAX_SEND_BYTES: u64 = 2 << 30;

/// The V4V service. One instance serves the whole host.
pub struct V4v {
    /// L1. Protects the per-domain state pointers, not their contents.
    domains: RwLock<HashMap<DomainId, Arc<DomainState>>>,
    rules: RwLock<RuleTable>,
    frame_pool: Arc<dyn FramePool>,
    notifier: Arc<dyn Notifier>,
}

impl V4v {
    /// Returns a new service over the host's page-ownership and
    /// event-channel primitives.
    pub fn new(frame_pool: Arc<dyn FramePool>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            rules: RwLock::new(RuleTable::default()),
            frame_pool,
            notifier,
        }
    }

    /// Enables V4V for `domain`: allocates its event-channel port and
    /// publishes empty per-domain state. Called from the host's domain
    /// creation hook.
    pub fn domain_init(&self, domain: DomainId) -> Result<(), InitError> {
        let port = self.notifier.allocate_port(domain)?;
        let state = Arc::new(DomainState {
            evtchn_port: port,
            registry: RwLock::new(RingTable::new()),
        });

        let published = {
            let _l1 = Held::enter(Level::Directory);
            let mut domains = self.domains.write();
            match domains.entry(domain) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(state);
                    true
                }
            }
        };
        if !published {
            self.notifier.free_port(domain, port);
            return Err(InitError::AlreadyEnabled);
        }
        tracing::debug!(%domain, port = port.0, "v4v enabled");
        Ok(())
    }

    /// Tears down `domain`'s V4V state, removing every ring and releasing
    /// its pinned frames. Called from the host's destruction hook once the
    /// domain is dying; a domain that never had state is a no-op.
    pub fn domain_destroy(&self, domain: DomainId) {
        let _l1 = Held::enter(Level::Directory);
        let mut domains = self.domains.write();
        let Some(state) = domains.remove(&domain) else {
            return;
        };

        {
            let _l2 = Held::enter(Level::Registry);
            let mut table = state.registry.write();
            for entry in table.drain() {
                // L3 serializes with any insert that still holds the entry.
                let _l3 = Held::enter(Level::Ring);
                let mut ring_state = entry.state.lock();
                ring_state.pending.clear();
                ring_state.ring.unmap_all();
            }
        }
        drop(domains);
        self.notifier.free_port(domain, state.evtchn_port);
        tracing::info!(%domain, "v4v state destroyed");
    }

    /// Registers the ring described at `ring_gva`, backed by `npage` frames
    /// whose numbers are listed at `pfns_gva`. Frame 0 must hold the ring
    /// descriptor, so `ring_gva` must be page-aligned.
    pub fn register_ring(
        &self,
        domain: DomainId,
        mem: &dyn GuestMemory,
        ring_gva: u64,
        pfns_gva: u64,
        npage: u32,
    ) -> Result<(), V4vError> {
        if ring_gva % PAGE_SIZE as u64 != 0 {
            return Err(V4vError::InvalidArgument);
        }

        let _l1 = Held::enter(Level::Directory);
        let domains = self.domains.read();
        let state = domains.get(&domain).ok_or(V4vError::InvalidArgument)?;

        let mut desc: RingDescriptor = mem.read_plain(ring_gva)?;
        if desc.magic != RING_MAGIC {
            return Err(V4vError::InvalidArgument);
        }
        if desc.len < MESSAGE_HEADER_SIZE + 2 * SLOT_SIZE || desc.len % SLOT_SIZE != 0 {
            return Err(V4vError::InvalidArgument);
        }
        if u64::from(npage) * (PAGE_SIZE as u64) < u64::from(desc.len) {
            return Err(V4vError::InvalidArgument);
        }

        // The descriptor's domain field belongs to the hypervisor; write
        // the normalized identity back before the ring goes live.
        desc.id.domain = domain.0;
        let id = RingId::from(desc.id);
        mem.write_plain(ring_gva + RING_ID_OFFSET as u64, &desc.id)?;

        // A bogus producer pointer (a re-registration after suspend leaves
        // a live one) is reset rather than rejected.
        if desc.tx_ptr >= desc.len || desc.tx_ptr % SLOT_SIZE != 0 {
            desc.tx_ptr = desc.rx_ptr;
            if desc.tx_ptr >= desc.len || desc.tx_ptr % SLOT_SIZE != 0 {
                desc.tx_ptr = 0;
            }
        }
        mem.write_plain(ring_gva + TX_PTR_OFFSET as u64, &desc.tx_ptr)?;

        // Pin the backing frames, all or nothing: an error drops the pins
        // already taken.
        let mut frames = Vec::with_capacity(npage as usize);
        for i in 0..npage {
            let pfn: u64 = mem.read_plain(pfns_gva + u64::from(i) * size_of::<u64>() as u64)?;
            frames.push(self.frame_pool.pin_writable(domain, pfn)?);
        }

        let entry = Arc::new(RingEntry {
            id,
            state: Mutex::new(RingState {
                ring: ProducerRing::new(desc.len, desc.tx_ptr, FrameSet::new(frames)),
                pending: PendingList::default(),
            }),
        });

        let _l2 = Held::enter(Level::Registry);
        let mut table = state.registry.write();
        if !table.insert(entry) {
            tracing::info!(ring = %id, "ring already registered");
            return Err(V4vError::AlreadyExists);
        }
        tracing::debug!(ring = %id, len = desc.len, npage, "ring registered");
        Ok(())
    }

    /// Removes the ring described at `ring_gva`, dropping its pending
    /// entries and releasing its pinned frames.
    pub fn unregister_ring(
        &self,
        domain: DomainId,
        mem: &dyn GuestMemory,
        ring_gva: u64,
    ) -> Result<(), V4vError> {
        let _l1 = Held::enter(Level::Directory);
        let domains = self.domains.read();
        let state = domains.get(&domain).ok_or(V4vError::InvalidArgument)?;

        let mut desc: RingDescriptor = mem.read_plain(ring_gva)?;
        if desc.magic != RING_MAGIC {
            return Err(V4vError::InvalidArgument);
        }
        desc.id.domain = domain.0;
        let id = RingId::from(desc.id);

        {
            let _l2 = Held::enter(Level::Registry);
            let mut table = state.registry.write();
            let entry = table.remove(&id).ok_or(V4vError::NotFound)?;
            let _l3 = Held::enter(Level::Ring);
            let mut ring_state = entry.state.lock();
            ring_state.pending.clear();
            ring_state.ring.unmap_all();
        }
        tracing::debug!(ring = %id, "ring unregistered");
        Ok(())
    }

    /// Sends one datagram assembled from the `niov` iovs at `iovs_gva` to
    /// the destination named by the send-address block at `addr_gva`.
    /// Returns the number of payload bytes queued.
    ///
    /// A full destination ring queues a pending entry for the caller and
    /// fails with [`V4vError::WouldBlock`]; the caller will be signaled
    /// when enough space opens up.
    pub fn sendv(
        &self,
        domain: DomainId,
        mem: &dyn GuestMemory,
        addr_gva: u64,
        iovs_gva: u64,
        niov: u32,
        message_type: u32,
    ) -> Result<u32, V4vError> {
        let send: SendAddr = mem.read_plain(addr_gva)?;
        let mut src = Address::from(send.src);
        let dst = Address::from(send.dst);
        // The source domain is whoever made the hypercall, no matter what
        // the block claims.
        src.domain = domain;

        let _l1 = Held::enter(Level::Directory);
        let domains = self.domains.read();
        if !domains.contains_key(&domain) {
            return Err(V4vError::InvalidArgument);
        }
        let Some(dst_state) = domains.get(&dst.domain) else {
            return Err(V4vError::Refused);
        };

        if !self.rules.read().check(src, dst) {
            tracing::warn!(%src, %dst, "tables rejected send");
            return Err(V4vError::Refused);
        }

        // Bound the scatter total before touching any ring state.
        let total = iov_total(mem, iovs_gva, niov)?;

        let _l2 = Held::enter(Level::Registry);
        let table = dst_state.registry.read();
        let Some(entry) = table.find_by_addr(dst, src.domain) else {
            return Err(V4vError::Refused);
        };

        {
            let _l3 = Held::enter(Level::Ring);
            let mut ring_state = entry.state.lock();
            match ring_state
                .ring
                .insertv(src, message_type, mem, iovs_gva, niov, total)
            {
                Ok(()) => {}
                Err(InsertError::WouldBlock) => {
                    // Wake the sender once the consumer frees the space it
                    // wanted.
                    ring_state.pending.queue(src.domain, total);
                    return Err(V4vError::WouldBlock);
                }
                Err(err) => return Err(err.into()),
            }
        }

        // The producer commit is visible; only now raise the signal.
        self.notifier.signal(dst.domain, dst_state.evtchn_port);
        tracing::trace!(%src, %dst, len = total, "datagram queued");
        Ok(total)
    }

    /// Scans the caller's rings, waking senders whose space requests have
    /// become satisfiable, then fills the optional bulk ring-state query at
    /// `ring_data_gva`.
    pub fn notify(
        &self,
        domain: DomainId,
        mem: &dyn GuestMemory,
        ring_data_gva: Option<u64>,
    ) -> Result<(), V4vError> {
        let _l1 = Held::enter(Level::Directory);
        let domains = self.domains.read();
        let state = domains.get(&domain).ok_or(V4vError::NoDevice)?;

        let mut wake = SmallVec::<[DomainId; 4]>::new();
        {
            let _l2 = Held::enter(Level::Registry);
            let table = state.registry.read();
            for entry in table.iter() {
                let _l3 = Held::enter(Level::Ring);
                let mut ring_state = entry.state.lock();
                let free = match ring_state.ring.payload_space() {
                    Ok(space) => space.free,
                    Err(_) => 0,
                };
                ring_state.ring.unmap_all();
                ring_state.pending.drain_satisfied(free, &mut wake);
            }
        }

        for source in wake {
            // A blocked sender may have been destroyed since it queued.
            if let Some(src_state) = domains.get(&source) {
                self.notifier.signal(source, src_state.evtchn_port);
            }
        }

        if let Some(gva) = ring_data_gva {
            let header: RingDataHeader = mem.read_plain(gva)?;
            if header.magic != RING_DATA_MAGIC {
                return Err(V4vError::InvalidArgument);
            }
            let mut ent_gva = gva + size_of::<RingDataHeader>() as u64;
            for _ in 0..header.nent {
                self.fill_ring_data(domain, &domains, mem, ent_gva)?;
                ent_gva += size_of::<RingDataEnt>() as u64;
            }
        }
        Ok(())
    }

    /// Answers one bulk-query entry: does the ring exist, how much space
    /// does it have, and is the caller's request satisfiable now. A
    /// satisfiable request cancels the caller's pending entry; an
    /// unsatisfiable one queues it.
    fn fill_ring_data(
        &self,
        caller: DomainId,
        domains: &HashMap<DomainId, Arc<DomainState>>,
        mem: &dyn GuestMemory,
        ent_gva: u64,
    ) -> Result<(), V4vError> {
        let ent: RingDataEnt = mem.read_plain(ent_gva)?;
        let dst = Address::from(ent.ring);
        let mut flags = RingDataFlags::new();
        let mut max_message_size = 0;

        if let Some(dst_state) = domains.get(&dst.domain) {
            let _l2 = Held::enter(Level::Registry);
            let table = dst_state.registry.read();
            if let Some(entry) = table.find_by_addr(dst, caller) {
                flags.set_exists(true);
                let _l3 = Held::enter(Level::Ring);
                let mut ring_state = entry.state.lock();
                max_message_size = ring_state.ring.max_message_size();
                let space = ring_state.ring.payload_space();
                ring_state.ring.unmap_all();
                if let Ok(space) = space {
                    if space.free >= ent.space_required {
                        ring_state.pending.cancel(caller);
                        flags.set_sufficient(true);
                    } else {
                        ring_state.pending.queue(caller, ent.space_required);
                        flags.set_pending(true);
                    }
                    if space.empty {
                        flags.set_empty(true);
                    }
                }
            }
        }

        mem.write_plain(ent_gva + RING_DATA_FLAGS_OFFSET as u64, &flags)?;
        mem.write_plain(ent_gva + RING_DATA_MMS_OFFSET as u64, &max_message_size)?;
        Ok(())
    }

    /// Inserts the rule at `rule_gva` before the rule at 1-based
    /// `position`.
    pub fn tables_add(
        &self,
        mem: &dyn GuestMemory,
        rule_gva: u64,
        position: u32,
    ) -> Result<(), V4vError> {
        let wire: TablesRule = mem.read_plain(rule_gva)?;
        let rule = Rule::from(wire);
        self.rules.write().add(rule, position);
        tracing::info!(%rule, position, "tables rule added");
        Ok(())
    }

    /// Removes a rule: by 1-based `position` if given, else by exact
    /// address match against the rule at `rule_gva`, else flushes the
    /// whole table. Removing a rule that is not there is not an error.
    pub fn tables_del(
        &self,
        mem: &dyn GuestMemory,
        rule_gva: Option<u64>,
        position: Option<u32>,
    ) -> Result<(), V4vError> {
        let mut rules = self.rules.write();
        if let Some(position) = position {
            if let Some(rule) = rules.remove_at(position) {
                tracing::info!(%rule, position, "tables rule removed");
            }
        } else if let Some(gva) = rule_gva {
            let wire: TablesRule = mem.read_plain(gva)?;
            let rule = Rule::from(wire);
            if let Some(removed) = rules.remove_matching(rule.src, rule.dst) {
                tracing::info!(rule = %removed, "tables rule removed");
            }
        } else {
            tracing::info!("tables flushed");
            rules.flush();
        }
        Ok(())
    }

    /// Copies a window of the rule table into the list block at
    /// `list_gva`, writing the number of rules copied back into the
    /// block's header.
    pub fn tables_list(&self, mem: &dyn GuestMemory, list_gva: u64) -> Result<(), V4vError> {
        let header: TablesListHeader = mem.read_plain(list_gva)?;
        if header.magic != TABLES_LIST_MAGIC {
            return Err(V4vError::InvalidArgument);
        }
        if header.nb_rules == 0 {
            return Err(V4vError::InvalidArgument);
        }

        let rules = self.rules.read();
        let window = rules.list(header.start_rule, header.nb_rules);
        let mut rule_gva = list_gva + size_of::<TablesListHeader>() as u64;
        for rule in window {
            mem.write_plain(rule_gva, &TablesRule::from(*rule))?;
            rule_gva += size_of::<TablesRule>() as u64;
        }
        mem.write_plain(list_gva + NB_RULES_OFFSET as u64, &(window.len() as u32))?;
        Ok(())
    }

    /// Writes the protocol magics and the caller's event-channel port into
    /// the info block at `info_gva`.
    pub fn info(&self, domain: DomainId, mem: &dyn GuestMemory, info_gva: u64) -> Result<(), V4vError> {
        let _l1 = Held::enter(Level::Directory);
        let domains = self.domains.read();
        let state = domains.get(&domain).ok_or(V4vError::NoDevice)?;
        let info = InfoBlock {
            ring_magic: RING_MAGIC,
            data_magic: RING_DATA_MAGIC,
            evtchn: state.evtchn_port.0,
            pad: 0,
        };
        mem.write_plain(info_gva, &info)?;
        Ok(())
    }
}

/// Sums the scatter list, rejecting totals past the 2 GiB bound.
fn iov_total(mem: &dyn GuestMemory, iovs_gva: u64, niov: u32) -> Result<u32, V4vError> {
    let mut total = 0u64;
    for i in 0..u64::from(niov) {
        let iov: Iov = mem.read_plain(iovs_gva + i * size_of::<Iov>() as u64)?;
        total += u64::from(iov.len);
        if total > MAX_SEND_BYTES {
            return Err(V4vError::MessageTooLarge);
        }
    }
    Ok(total as u32)
}
