// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pinned guest frames and their hypervisor mappings.
//!
//! A registered ring owns a pin on every frame backing it; the pins hold
//! until the ring is removed. Mappings are a separate, lazy resource:
//! [`FrameSet`] establishes them on demand and every hypercall drops the
//! ones it acquired before returning, so long-term mapping residency is
//! bounded by the duration of a single call.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;
use thiserror::Error;
use v4v_core::DomainId;

/// Effective page size for ring frames.
pub const PAGE_SIZE: usize = 4096;

/// A page of guest memory viewed as atomic bytes.
pub type Page = [AtomicU8; PAGE_SIZE];

/// Failure to pin a guest frame.
#[derive(Debug, Error)]
pub enum PinError {
    /// The frame number does not resolve to pinnable writable memory.
    #[error("guest frame {0:#x} is not a valid writable frame")]
    InvalidFrame(u64),
    /// The host is out of tracking resources.
    #[error("out of memory pinning guest frame")]
    OutOfMemory,
}

/// Failure to map a pinned frame into the hypervisor address space.
#[derive(Debug, Error)]
#[error("failed to map pinned guest frame")]
pub struct MapFault;

/// Provides the backing bytes of a mapped frame.
pub trait AsPage: Send + Sync {
    fn as_page(&self) -> &Page;
}

/// A live hypervisor mapping of a pinned guest frame. The mapping is
/// released when the last clone is dropped.
#[derive(Clone)]
pub struct MappedPage(Arc<dyn AsPage>);

impl MappedPage {
    /// Wraps a backing mapping.
    pub fn new(inner: Arc<dyn AsPage>) -> Self {
        Self(inner)
    }

    /// The mapped bytes.
    pub fn page(&self) -> &Page {
        self.0.as_page()
    }
}

impl Debug for MappedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedPage").finish()
    }
}

/// A guest frame pinned writable on behalf of its owning domain. Dropping
/// the pin releases the frame.
pub trait GuestFrame: Send + Sync {
    /// Maps the frame into the hypervisor address space.
    fn map(&self) -> Result<MappedPage, MapFault>;
}

/// The host's page-ownership primitive: translates guest frame numbers and
/// pins the frames they name.
pub trait FramePool: Send + Sync {
    /// Pins guest frame `pfn` of `owner` for writing.
    fn pin_writable(&self, owner: DomainId, pfn: u64) -> Result<Box<dyn GuestFrame>, PinError>;
}

/// The pinned frames backing one ring, with a lazy mapping cache.
pub struct FrameSet {
    frames: Vec<Box<dyn GuestFrame>>,
    mappings: Vec<Option<MappedPage>>,
}

impl FrameSet {
    /// Takes ownership of `frames`, with no mappings established.
    pub fn new(frames: Vec<Box<dyn GuestFrame>>) -> Self {
        let mappings = frames.iter().map(|_| None).collect();
        Self { frames, mappings }
    }

    /// The number of frames backing the ring.
    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    /// Returns a mapping of frame `index`, establishing one if the cache
    /// holds none.
    pub fn map(&mut self, index: usize) -> Result<&MappedPage, MapFault> {
        let slot = self.mappings.get_mut(index).ok_or(MapFault)?;
        match slot {
            Some(mapping) => Ok(mapping),
            None => {
                let mapping = self.frames[index].map()?;
                Ok(slot.insert(mapping))
            }
        }
    }

    /// Drops every cached mapping.
    pub fn unmap_all(&mut self) {
        for slot in &mut self.mappings {
            *slot = None;
        }
    }
}

impl Debug for FrameSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSet")
            .field("page_count", &self.frames.len())
            .finish()
    }
}

struct HeapPage(Page);

impl AsPage for HeapPage {
    fn as_page(&self) -> &Page {
        &self.0
    }
}

struct HeapFrame(Arc<HeapPage>);

impl GuestFrame for HeapFrame {
    fn map(&self) -> Result<MappedPage, MapFault> {
        Ok(MappedPage::new(self.0.clone()))
    }
}

/// An in-memory [`FramePool`] over heap pages, indexed by frame number.
/// Useful for tests.
#[derive(Clone, Default)]
pub struct HeapFrames {
    pages: Arc<Mutex<HashMap<u64, Arc<HeapPage>>>>,
}

impl HeapFrames {
    fn heap_page(&self, pfn: u64) -> Arc<HeapPage> {
        self.pages
            .lock()
            .entry(pfn)
            .or_insert_with(|| Arc::new(HeapPage(std::array::from_fn(|_| AtomicU8::new(0)))))
            .clone()
    }

    /// Returns the page backing `pfn`, allocating it zeroed on first use.
    pub fn page(&self, pfn: u64) -> MappedPage {
        MappedPage::new(self.heap_page(pfn))
    }
}

impl FramePool for HeapFrames {
    fn pin_writable(&self, _owner: DomainId, pfn: u64) -> Result<Box<dyn GuestFrame>, PinError> {
        Ok(Box::new(HeapFrame(self.heap_page(pfn))))
    }
}
