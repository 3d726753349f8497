// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest-visible wire structures.
//!
//! Everything here is little-endian and laid out flat so that no struct
//! carries implicit padding. The 6 significant bytes of an address (port +
//! domain) are always followed by an explicit 16-bit field: the partner in a
//! ring identity, padding elsewhere.

use crate::Address;
use crate::DomainId;
use crate::RingId;
use bitfield_struct::bitfield;
use std::mem::offset_of;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Identifies a guest page as a V4V ring descriptor.
pub const RING_MAGIC: u64 = 0x0002763320f86a38;

/// Identifies a ring-data query block passed to `notify`.
pub const RING_DATA_MAGIC: u64 = 0x563c93ae17b04b45;

/// Identifies a rule-list block passed to `tables_list`.
pub const TABLES_LIST_MAGIC: u64 = 0x4eb5c58649cf6eb1;

/// Messages and the producer pointer are aligned to 16-byte slots.
pub const SLOT_SIZE: u32 = 16;

/// Rounds `n` up to the next slot boundary.
pub const fn round_up(n: u32) -> u32 {
    (n + (SLOT_SIZE - 1)) & !(SLOT_SIZE - 1)
}

/// An address as it appears on the wire, padded to 8 bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct WireAddress {
    pub port: u32,
    pub domain: u16,
    pub pad: u16,
}

impl From<Address> for WireAddress {
    fn from(addr: Address) -> Self {
        Self {
            port: addr.port,
            domain: addr.domain.0,
            pad: 0,
        }
    }
}

impl From<WireAddress> for Address {
    fn from(wire: WireAddress) -> Self {
        Self {
            domain: DomainId(wire.domain),
            port: wire.port,
        }
    }
}

/// A ring identity as stored in the ring descriptor: the address bytes
/// followed by the partner domain.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct WireRingId {
    pub port: u32,
    pub domain: u16,
    pub partner: u16,
}

impl From<RingId> for WireRingId {
    fn from(id: RingId) -> Self {
        Self {
            port: id.addr.port,
            domain: id.addr.domain.0,
            partner: id.partner.0,
        }
    }
}

impl From<WireRingId> for RingId {
    fn from(wire: WireRingId) -> Self {
        Self {
            addr: Address {
                domain: DomainId(wire.domain),
                port: wire.port,
            },
            partner: DomainId(wire.partner),
        }
    }
}

/// The fixed-layout descriptor at the start of frame 0 of every ring. The
/// payload region of `len` bytes follows it.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RingDescriptor {
    pub magic: u64,
    /// Total payload capacity in bytes; a multiple of [`SLOT_SIZE`].
    pub len: u32,
    /// Consumer offset. Written only by the guest consumer.
    pub rx_ptr: u32,
    /// Producer offset. Written only by the hypervisor.
    pub tx_ptr: u32,
    pub pad: u32,
    pub id: WireRingId,
    pub reserved: [u8; 8],
}

/// Byte offset of `rx_ptr` within the descriptor.
pub const RX_PTR_OFFSET: usize = offset_of!(RingDescriptor, rx_ptr);
/// Byte offset of `tx_ptr` within the descriptor.
pub const TX_PTR_OFFSET: usize = offset_of!(RingDescriptor, tx_ptr);
/// Byte offset of the ring identity within the descriptor.
pub const RING_ID_OFFSET: usize = offset_of!(RingDescriptor, id);

/// Size of [`RingDescriptor`]; ring payload offsets are relative to this.
pub const DESCRIPTOR_SIZE: u32 = size_of::<RingDescriptor>() as u32;

/// The 16-byte header preceding every message in a ring. `len` includes the
/// header itself; the payload that follows is padded to the next slot
/// boundary.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    pub len: u32,
    pub message_type: u32,
    pub port: u32,
    pub domain: u16,
    pub pad: u16,
}

impl MessageHeader {
    /// The sender's address.
    pub fn source(&self) -> Address {
        Address {
            domain: DomainId(self.domain),
            port: self.port,
        }
    }
}

/// Size of [`MessageHeader`].
pub const MESSAGE_HEADER_SIZE: u32 = size_of::<MessageHeader>() as u32;

/// One scatter/gather element of a `sendv` payload, resident in the
/// sender's memory.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct Iov {
    pub base: u64,
    pub len: u32,
    pub reserved: u32,
}

/// The source/destination pair naming a `sendv`.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct SendAddr {
    pub src: WireAddress,
    pub dst: WireAddress,
}

/// Header of the bulk ring-state query block passed to `notify`, followed
/// by `nent` entries.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RingDataHeader {
    pub magic: u64,
    pub nent: u32,
    pub pad: u32,
}

/// Per-entry status reported by the bulk ring-state query.
#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct RingDataFlags {
    /// The ring is registered and accepts sends from the caller.
    pub exists: bool,
    /// At least `space_required` payload bytes are free.
    pub sufficient: bool,
    /// The requested space is not yet available; a pending entry has been
    /// queued.
    pub pending: bool,
    /// The ring is empty.
    pub empty: bool,
    #[bits(12)]
    _reserved: u16,
}

/// One entry of the bulk ring-state query.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RingDataEnt {
    /// The destination address being queried.
    pub ring: WireAddress,
    pub flags: RingDataFlags,
    pub pad: u16,
    pub space_required: u32,
    pub max_message_size: u32,
}

/// Byte offset of `flags` within [`RingDataEnt`].
pub const RING_DATA_FLAGS_OFFSET: usize = offset_of!(RingDataEnt, flags);
/// Byte offset of `max_message_size` within [`RingDataEnt`].
pub const RING_DATA_MMS_OFFSET: usize = offset_of!(RingDataEnt, max_message_size);

/// One accept/reject rule on the wire.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TablesRule {
    pub src: WireAddress,
    pub dst: WireAddress,
    /// Nonzero to accept matching sends, zero to reject them.
    pub accept: u32,
}

/// Header of the rule-list block for `tables_list`, followed by `nb_rules`
/// rule slots.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct TablesListHeader {
    pub magic: u64,
    /// Index of the first rule to copy out.
    pub start_rule: u32,
    /// In: the capacity of the rule slots. Out: the number copied.
    pub nb_rules: u32,
}

/// Byte offset of `nb_rules` within [`TablesListHeader`].
pub const NB_RULES_OFFSET: usize = offset_of!(TablesListHeader, nb_rules);

/// Result block of the `info` operation.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct InfoBlock {
    pub ring_magic: u64,
    pub data_magic: u64,
    /// The caller's event-channel port.
    pub evtchn: u32,
    pub pad: u32,
}
