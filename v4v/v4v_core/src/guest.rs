// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory accessors.
//!
//! Hypercall arguments arrive as guest addresses; the embedding host
//! supplies an accessor for the calling domain's address space. Accessors
//! validate the full range on every call, so a fault maps cleanly onto the
//! hypercall error taxonomy and partial transfers never occur.

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// An error accessing guest memory through a [`GuestMemory`] accessor.
#[derive(Debug, Error)]
pub enum AccessError {
    /// The range is not accessible to the guest.
    #[error("guest address range {0:#x}+{1:#x} is inaccessible")]
    OutOfRange(u64, u64),
}

/// Access to a guest address space, provided by the embedding host.
pub trait GuestMemory {
    /// Reads `data.len()` bytes at `gva`.
    fn read_at(&self, gva: u64, data: &mut [u8]) -> Result<(), AccessError>;

    /// Writes `data` at `gva`.
    fn write_at(&self, gva: u64, data: &[u8]) -> Result<(), AccessError>;
}

impl<'a> dyn GuestMemory + 'a {
    /// Reads a plain-data object at `gva`.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, gva: u64) -> Result<T, AccessError> {
        let mut obj = T::new_zeroed();
        self.read_at(gva, obj.as_mut_bytes())?;
        Ok(obj)
    }

    /// Writes a plain-data object at `gva`.
    pub fn write_plain<T: IntoBytes + Immutable>(
        &self,
        gva: u64,
        value: &T,
    ) -> Result<(), AccessError> {
        self.write_at(gva, value.as_bytes())
    }
}
