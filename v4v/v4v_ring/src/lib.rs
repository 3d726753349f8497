// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypervisor-side implementation of the V4V ring storage protocol.
//!
//! A registered ring is a circular byte buffer in guest memory, backed by
//! pinned guest frames. Frame 0 begins with the ring descriptor; the
//! payload region of `len` bytes follows it and spans the remaining frames.
//! The hypervisor is the only producer (it owns `tx_ptr`); the guest
//! consumer advances `rx_ptr`. Both pointers live in shared memory, so
//! every value read back from the descriptor is treated as untrusted: the
//! consumer offset is read exactly once per decision and all pointer
//! arithmetic wraps modulo the ring length.

// UNSAFETY: the atomic module reinterprets mapped page bytes as wider
// atomics.
#![expect(unsafe_code)]

mod atomic;
pub mod memory;

pub use memory::AsPage;
pub use memory::FramePool;
pub use memory::FrameSet;
pub use memory::GuestFrame;
pub use memory::HeapFrames;
pub use memory::MapFault;
pub use memory::MappedPage;
pub use memory::Page;
pub use memory::PinError;
pub use memory::PAGE_SIZE;

use std::sync::atomic::fence;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use thiserror::Error;
use v4v_core::guest::AccessError;
use v4v_core::guest::GuestMemory;
use v4v_core::protocol::round_up;
use v4v_core::protocol::Iov;
use v4v_core::protocol::MessageHeader;
use v4v_core::protocol::RingDescriptor;
use v4v_core::protocol::DESCRIPTOR_SIZE;
use v4v_core::protocol::MESSAGE_HEADER_SIZE;
use v4v_core::protocol::RING_MAGIC;
use v4v_core::protocol::RX_PTR_OFFSET;
use v4v_core::protocol::SLOT_SIZE;
use v4v_core::protocol::TX_PTR_OFFSET;
use v4v_core::Address;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// An error terminating the current insert.
#[derive(Debug, Error)]
pub enum InsertError {
    /// The message can never fit in this ring.
    #[error("message too large for ring")]
    MessageTooLarge,
    /// Insufficient free space; retry once the consumer advances.
    #[error("ring is full")]
    WouldBlock,
    /// A guest access failed.
    #[error(transparent)]
    Access(#[from] AccessError),
    /// A frame mapping failed.
    #[error(transparent)]
    Map(#[from] MapFault),
}

/// Free-space information for a ring at a point in time.
#[derive(Debug, Copy, Clone)]
pub struct PayloadSpace {
    /// Payload bytes available to the largest insert that can currently
    /// succeed.
    pub free: u32,
    /// Whether the consumer has caught up with the producer.
    pub empty: bool,
}

/// The producer end of a registered ring.
///
/// The cached `tx_ptr` is authoritative; the guest's copy is republished
/// after every completed insert. Mappings acquired by any operation are
/// dropped before that operation returns.
pub struct ProducerRing {
    len: u32,
    tx_ptr: u32,
    frames: FrameSet,
}

impl ProducerRing {
    /// Adopts a registered ring. `len` and `tx_ptr` must already be
    /// validated: slot-aligned, `tx_ptr < len`, and `len` within the
    /// backing frames.
    pub fn new(len: u32, tx_ptr: u32, frames: FrameSet) -> Self {
        debug_assert!(len % SLOT_SIZE == 0);
        debug_assert!(tx_ptr < len && tx_ptr % SLOT_SIZE == 0);
        debug_assert!(frames.page_count() * PAGE_SIZE >= len as usize);
        Self {
            len,
            tx_ptr,
            frames,
        }
    }

    /// The ring's payload capacity in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// The cached producer offset.
    pub fn tx_ptr(&self) -> u32 {
        self.tx_ptr
    }

    /// The largest payload a single message can carry.
    pub fn max_message_size(&self) -> u32 {
        self.len - MESSAGE_HEADER_SIZE - SLOT_SIZE
    }

    /// Drops every cached frame mapping.
    pub fn unmap_all(&mut self) {
        self.frames.unmap_all();
    }

    fn descriptor_u32(&mut self, offset: usize) -> Result<&AtomicU32, MapFault> {
        let page = self.frames.map(0)?;
        Ok(atomic::as_u32(&page.page()[offset..offset + 4]))
    }

    /// Reads the consumer offset: a single acquire load, trusted for
    /// nothing beyond its bit pattern.
    fn read_rx_ptr(&mut self) -> Result<u32, MapFault> {
        Ok(self.descriptor_u32(RX_PTR_OFFSET)?.load(Ordering::Acquire))
    }

    fn write_rx_ptr(&mut self, rx_ptr: u32) -> Result<(), MapFault> {
        self.descriptor_u32(RX_PTR_OFFSET)?
            .store(rx_ptr, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Publishes the cached producer offset to the guest copy.
    fn commit_tx_ptr(&mut self) -> Result<(), MapFault> {
        let tx_ptr = self.tx_ptr;
        self.descriptor_u32(TX_PTR_OFFSET)?
            .store(tx_ptr, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Computes the currently available payload space against a fresh
    /// consumer offset.
    pub fn payload_space(&mut self) -> Result<PayloadSpace, MapFault> {
        let rx_ptr = self.read_rx_ptr()?;
        Ok(self.space_for(rx_ptr))
    }

    fn space_for(&self, rx_ptr: u32) -> PayloadSpace {
        if rx_ptr == self.tx_ptr {
            PayloadSpace {
                free: self.len - MESSAGE_HEADER_SIZE,
                empty: true,
            }
        } else {
            // The ring length need not divide 2^32, so the gap cannot be
            // computed with wrapping u32 arithmetic. One slot is reserved
            // so a full ring never looks empty.
            let gap = if rx_ptr >= self.tx_ptr {
                rx_ptr - self.tx_ptr
            } else {
                self.len - (self.tx_ptr - rx_ptr)
            };
            PayloadSpace {
                free: gap.saturating_sub(MESSAGE_HEADER_SIZE + SLOT_SIZE),
                empty: false,
            }
        }
    }

    /// Atomically appends one message assembled from the sender's scatter
    /// list.
    ///
    /// The caller holds the ring lock and has already bounded `total_len`.
    /// The guest-visible `tx_ptr` is published only once every byte is in
    /// place; on failure the producer state is unchanged except for the
    /// empty-ring pointer reset, which is an independently committed state.
    pub fn insertv(
        &mut self,
        source: Address,
        message_type: u32,
        mem: &dyn GuestMemory,
        iovs_gva: u64,
        niov: u32,
        total_len: u32,
    ) -> Result<(), InsertError> {
        let r = self.insert_inner(source, message_type, mem, iovs_gva, niov, total_len);
        self.frames.unmap_all();
        r
    }

    fn insert_inner(
        &mut self,
        source: Address,
        message_type: u32,
        mem: &dyn GuestMemory,
        iovs_gva: u64,
        niov: u32,
        total_len: u32,
    ) -> Result<(), InsertError> {
        let padded = (u64::from(total_len) + u64::from(SLOT_SIZE) - 1) & !(u64::from(SLOT_SIZE) - 1);
        if padded + u64::from(MESSAGE_HEADER_SIZE) >= u64::from(self.len) {
            return Err(InsertError::MessageTooLarge);
        }

        let mut rx_ptr = self.read_rx_ptr()?;
        if rx_ptr == self.tx_ptr && self.tx_ptr != 0 {
            // The consumer has caught up; collapse accumulated wrap drift
            // before writing. The consumer must observe the rx reset no
            // later than the tx reset, hence the ordering.
            self.tx_ptr = 0;
            self.write_rx_ptr(0)?;
            self.commit_tx_ptr()?;
            rx_ptr = 0;
        }

        if round_up(total_len) > self.space_for(rx_ptr).free {
            return Err(InsertError::WouldBlock);
        }

        let header = MessageHeader {
            len: total_len + MESSAGE_HEADER_SIZE,
            message_type,
            port: source.port,
            domain: source.domain.0,
            pad: 0,
        };
        let mut tx_ptr = self.tx_ptr;
        self.copy_to_ring(tx_ptr, header.as_bytes())?;
        tx_ptr = self.advance(tx_ptr, MESSAGE_HEADER_SIZE);

        // The scatter list lives in guest memory and is re-read as it is
        // consumed; the byte count committed to the header bounds the copy
        // no matter what the list says by now.
        let mut remaining = total_len;
        for i in 0..niov {
            if remaining == 0 {
                break;
            }
            let iov: Iov = mem.read_plain(iovs_gva + u64::from(i) * size_of::<Iov>() as u64)?;
            let mut base = iov.base;
            let mut chunk = iov.len.min(remaining);
            while chunk != 0 {
                // Split at the end of the payload region.
                let run = chunk.min(self.len - tx_ptr);
                self.copy_in_to_ring(tx_ptr, mem, base, run)?;
                tx_ptr = self.advance(tx_ptr, run);
                base += u64::from(run);
                chunk -= run;
                remaining -= run;
            }
        }

        let mut tx_ptr = round_up(tx_ptr);
        if tx_ptr >= self.len {
            tx_ptr -= self.len;
        }
        self.tx_ptr = tx_ptr;
        self.commit_tx_ptr()?;
        Ok(())
    }

    fn advance(&self, ptr: u32, n: u32) -> u32 {
        let next = ptr + n;
        debug_assert!(next <= self.len);
        if next == self.len {
            0
        } else {
            next
        }
    }

    /// Writes `data` into the payload region at `offset`, crossing frame
    /// boundaries as needed. The caller has already split the write at the
    /// end of the payload region.
    fn copy_to_ring(&mut self, offset: u32, data: &[u8]) -> Result<(), MapFault> {
        debug_assert!(offset + data.len() as u32 <= self.len);
        let mut abs = offset as usize + DESCRIPTOR_SIZE as usize;
        let npage = self.frames.page_count();
        let mut data = data;
        while !data.is_empty() {
            let index = (abs / PAGE_SIZE) % npage;
            let page_off = abs % PAGE_SIZE;
            let run = data.len().min(PAGE_SIZE - page_off);
            let (chunk, rest) = data.split_at(run);
            let page = self.frames.map(index)?;
            atomic::write_bytes(&page.page()[page_off..page_off + run], chunk);
            abs += run;
            data = rest;
        }
        Ok(())
    }

    /// Copies `len` bytes of sender memory at `gva` into the payload region
    /// at `offset`.
    fn copy_in_to_ring(
        &mut self,
        offset: u32,
        mem: &dyn GuestMemory,
        gva: u64,
        len: u32,
    ) -> Result<(), InsertError> {
        let mut buf = [0u8; 1024];
        let mut offset = offset;
        let mut gva = gva;
        let mut remaining = len as usize;
        while remaining != 0 {
            let n = remaining.min(buf.len());
            mem.read_at(gva, &mut buf[..n])?;
            self.copy_to_ring(offset, &buf[..n])?;
            offset += n as u32;
            gva += n as u64;
            remaining -= n;
        }
        Ok(())
    }
}

/// A malformed or undersized ring descriptor.
#[derive(Debug, Error)]
#[error("malformed ring descriptor")]
pub struct BadDescriptor;

/// A message removed from a ring by [`RingConsumer`].
#[derive(Debug)]
pub struct ReceivedMessage {
    pub source: Address,
    pub message_type: u32,
    pub data: Vec<u8>,
}

/// The consumer end of a ring: parses messages and advances `rx_ptr`.
///
/// In production the consumer runs inside the owning guest; this
/// implementation serves loopback validation and tests.
pub struct RingConsumer {
    pages: Vec<MappedPage>,
    len: u32,
}

impl RingConsumer {
    /// Wraps the mapped frames of a registered ring, validating its
    /// descriptor.
    pub fn new(pages: Vec<MappedPage>) -> Result<Self, BadDescriptor> {
        let first = pages.first().ok_or(BadDescriptor)?;
        let mut raw = [0u8; DESCRIPTOR_SIZE as usize];
        atomic::read_bytes(&first.page()[..raw.len()], &mut raw);
        let desc = RingDescriptor::read_from_bytes(&raw).map_err(|_| BadDescriptor)?;
        if desc.magic != RING_MAGIC
            || desc.len == 0
            || desc.len % SLOT_SIZE != 0
            || pages.len() * PAGE_SIZE < desc.len as usize
        {
            return Err(BadDescriptor);
        }
        Ok(Self {
            pages,
            len: desc.len,
        })
    }

    fn descriptor_u32(&self, offset: usize) -> &AtomicU32 {
        atomic::as_u32(&self.pages[0].page()[offset..offset + 4])
    }

    /// The producer offset as last published by the hypervisor.
    pub fn tx_ptr(&self) -> u32 {
        self.descriptor_u32(TX_PTR_OFFSET).load(Ordering::Acquire)
    }

    /// The consumer offset.
    pub fn rx_ptr(&self) -> u32 {
        self.descriptor_u32(RX_PTR_OFFSET).load(Ordering::Acquire)
    }

    /// Removes the next message, if any.
    pub fn try_recv(&self) -> Option<ReceivedMessage> {
        let rx_ptr = self.rx_ptr();
        if rx_ptr == self.tx_ptr() {
            return None;
        }
        let mut header = MessageHeader::new_zeroed();
        self.read_ring(rx_ptr, header.as_mut_bytes());
        let payload_len = header.len.saturating_sub(MESSAGE_HEADER_SIZE);
        let mut data = vec![0; payload_len as usize];
        self.read_ring((rx_ptr + MESSAGE_HEADER_SIZE) % self.len, &mut data);
        let next = round_up(rx_ptr + MESSAGE_HEADER_SIZE + payload_len) % self.len;
        self.descriptor_u32(RX_PTR_OFFSET)
            .store(next, Ordering::Release);
        Some(ReceivedMessage {
            source: header.source(),
            message_type: header.message_type,
            data,
        })
    }

    /// Removes every queued message.
    pub fn drain(&self) -> Vec<ReceivedMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    fn read_ring(&self, offset: u32, data: &mut [u8]) {
        let first = data.len().min((self.len - offset) as usize);
        let (a, b) = data.split_at_mut(first);
        self.read_abs(offset, a);
        if !b.is_empty() {
            self.read_abs(0, b);
        }
    }

    fn read_abs(&self, offset: u32, data: &mut [u8]) {
        let mut abs = offset as usize + DESCRIPTOR_SIZE as usize;
        let npage = self.pages.len();
        let mut data = data;
        while !data.is_empty() {
            let index = (abs / PAGE_SIZE) % npage;
            let page_off = abs % PAGE_SIZE;
            let run = data.len().min(PAGE_SIZE - page_off);
            let (chunk, rest) = data.split_at_mut(run);
            atomic::read_bytes(&self.pages[index].page()[page_off..page_off + run], chunk);
            abs += run;
            data = rest;
        }
    }
}
