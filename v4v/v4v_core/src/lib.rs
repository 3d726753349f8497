// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core types for the V4V inter-domain datagram facility.
//!
//! A V4V endpoint is a `(domain, port)` pair. A guest publishes a ring bound
//! to such an address, optionally restricted to a single partner domain, and
//! peers enqueue datagrams into it by hypercall. This crate holds the
//! addressing types, the guest-visible wire structures, and the guest memory
//! accessor used to transfer hypercall arguments.

#![forbid(unsafe_code)]

pub mod guest;
pub mod protocol;

use std::fmt;

/// A 16-bit domain identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The wildcard domain, valid only in rules and ring partners.
    pub const ANY: Self = Self(0x7ff4);
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANY {
            f.write_str("*")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// The wildcard port, valid only in rules.
pub const PORT_ANY: u32 = !0;

/// A message endpoint: a port within a domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub domain: DomainId,
    pub port: u32,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.domain)?;
        if self.port == PORT_ANY {
            f.write_str("*")
        } else {
            write!(f, "{}", self.port)
        }
    }
}

/// The identity of a registered ring, unique within its owning domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RingId {
    /// The address the ring answers to. The domain field is always the
    /// ring's owner.
    pub addr: Address,
    /// The domain this ring accepts sends from; [`DomainId::ANY`] permits
    /// any sender.
    pub partner: DomainId,
}

impl fmt::Display for RingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {}", self.addr, self.partner)
    }
}
