//! Memory-map registry: opaque handles to client-shared regions.
//!
//! The command path maps and unmaps regions; the data path resolves
//! (handle, lsw, msw, size) tuples into validated ranges, bumping the
//! handle refcount until the matching ack releases it. Handles are 8-byte
//! aligned values by construction and anything else is rejected up front.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use aria_sync::{Error, Result};

use crate::packet::join_addr;

/// Alignment every handle value and resolved address must satisfy.
pub const SHM_ALIGNMENT: u64 = 8;

/// A validated, refcounted view into a mapped region.
///
/// Holds no pointer: reads and writes go back through the registry so the
/// region stays behind its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    pub handle: u32,
    pub offset: usize,
    pub len: usize,
}

struct Region {
    bytes: RwLock<Box<[u8]>>,
    refs: RwLock<u32>,
}

/// Process-wide table of shared-memory regions.
///
/// Constructed once by the embedder and passed to every endpoint; there
/// is no global instance.
pub struct MemMapRegistry {
    regions: RwLock<HashMap<u32, Arc<Region>>>,
    next_handle: RwLock<u32>,
}

impl MemMapRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: RwLock::new(HashMap::new()),
            next_handle: RwLock::new(SHM_ALIGNMENT as u32),
        })
    }

    /// Map a fresh region of `len` zeroed bytes, returning its handle.
    pub fn map(&self, len: usize) -> Result<u32> {
        if len == 0 {
            return Err(Error::BadParam);
        }
        let mut next = self.next_handle.write();
        let handle = *next;
        *next += SHM_ALIGNMENT as u32;
        self.regions.write().insert(
            handle,
            Arc::new(Region {
                bytes: RwLock::new(vec![0u8; len].into_boxed_slice()),
                refs: RwLock::new(0),
            }),
        );
        tracing::debug!(handle, len, "mapped shared region");
        Ok(handle)
    }

    /// Unmap a region. Fails with `NotReady` while data-path references
    /// are outstanding.
    pub fn unmap(&self, handle: u32) -> Result<()> {
        let mut regions = self.regions.write();
        let region = regions.get(&handle).ok_or(Error::BadParam)?;
        if *region.refs.read() != 0 {
            tracing::warn!(handle, "unmap with outstanding references");
            return Err(Error::NotReady);
        }
        regions.remove(&handle);
        Ok(())
    }

    /// Resolve a wire (handle, lsw, msw, size) tuple into a validated
    /// range, incrementing the handle refcount.
    pub fn resolve(&self, handle: u32, addr_lsw: u32, addr_msw: u32, size: usize) -> Result<MappedRange> {
        if handle == 0 || (handle as u64) % SHM_ALIGNMENT != 0 {
            tracing::error!(handle, "misaligned or null shm handle");
            return Err(Error::BadParam);
        }
        let addr = join_addr(addr_lsw, addr_msw);
        if addr % SHM_ALIGNMENT != 0 {
            tracing::error!(handle, addr, "misaligned shm address");
            return Err(Error::BadParam);
        }
        let regions = self.regions.read();
        let region = regions.get(&handle).ok_or(Error::BadParam)?;
        let offset = addr as usize;
        let end = offset.checked_add(size).ok_or(Error::BadParam)?;
        if end > region.bytes.read().len() {
            tracing::error!(handle, offset, size, "shm range out of bounds");
            return Err(Error::BadParam);
        }
        *region.refs.write() += 1;
        Ok(MappedRange { handle, offset, len: size })
    }

    /// Drop the reference a [`Self::resolve`] took.
    pub fn release(&self, range: &MappedRange) {
        if let Some(region) = self.regions.read().get(&range.handle) {
            let mut refs = region.refs.write();
            debug_assert!(*refs > 0, "releasing an unresolved range");
            *refs = refs.saturating_sub(1);
        }
    }

    pub fn refcount(&self, handle: u32) -> u32 {
        self.regions
            .read()
            .get(&handle)
            .map(|r| *r.refs.read())
            .unwrap_or(0)
    }

    /// Copy bytes out of a resolved range.
    pub fn read(&self, range: &MappedRange, out: &mut [u8]) -> Result<()> {
        let regions = self.regions.read();
        let region = regions.get(&range.handle).ok_or(Error::BadParam)?;
        let bytes = region.bytes.read();
        let src = bytes
            .get(range.offset..range.offset + out.len().min(range.len))
            .ok_or(Error::BadParam)?;
        out[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copy `data` into a resolved range at `at` bytes from its start.
    pub fn write(&self, range: &MappedRange, at: usize, data: &[u8]) -> Result<()> {
        if at + data.len() > range.len {
            return Err(Error::BadParam);
        }
        let regions = self.regions.read();
        let region = regions.get(&range.handle).ok_or(Error::BadParam)?;
        let mut bytes = region.bytes.write();
        let dst = bytes
            .get_mut(range.offset + at..range.offset + at + data.len())
            .ok_or(Error::BadParam)?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Read the whole range into a fresh vector.
    pub fn read_vec(&self, range: &MappedRange) -> Result<Vec<u8>> {
        let mut out = vec![0u8; range.len];
        self.read(range, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for MemMapRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemMapRegistry")
            .field("regions", &self.regions.read().len())
            .finish()
    }
}
