//! DMA-coherent allocations and user address translation.
//!
//! Every buffer handed to a transfer must come from a mapping made through
//! the control device. The table below is the only place where a
//! user-supplied address is turned into a bus address.

use std::fmt;
use std::mem;
use std::sync::RwLock;

use log::{debug, error};

use crate::Error;

/// A physically contiguous, uncached region mapped into a client process.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CoherentRegion {
    pub user_addr: usize,
    pub kern_addr: usize,
    pub bus_addr: u64,
    pub size: usize,
}

impl CoherentRegion {
    pub fn user_end(&self) -> usize {
        self.user_addr + self.size
    }

    fn overlaps(&self, other: &CoherentRegion) -> bool {
        self.user_addr < other.user_end() && other.user_addr < self.user_end()
    }
}

impl fmt::Debug for CoherentRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CoherentRegion")?;
        writeln!(f, "  user_addr: {:#x?}", &self.user_addr)?;
        writeln!(f, "  kern_addr: {:#x?}", &self.kern_addr)?;
        writeln!(f, "  bus_addr: {:#x?}", &self.bus_addr)?;
        write!(f, "  size: {:#x?}", &self.size)
    }
}

/// Source of DMA-capable memory (CMA and the VMA remapping behind it).
pub trait CoherentAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> Result<CoherentRegion, Error>;
    fn free(&self, region: &CoherentRegion);
}

impl<A: CoherentAllocator + ?Sized> CoherentAllocator for std::sync::Arc<A> {
    fn alloc(&self, size: usize) -> Result<CoherentRegion, Error> {
        (**self).alloc(size)
    }

    fn free(&self, region: &CoherentRegion) {
        (**self).free(region)
    }
}

/// Upper bound on a single list the driver builds for one request, the
/// same bound `kmalloc` places on it.
pub const MAX_LIST_BYTES: usize = 4 << 20;

/// Empty list with room for `count` entries.
///
/// Fails with [`Error::OutOfMemory`] instead of aborting when `count` is
/// too large to hold.
pub fn list_with_capacity<T>(count: usize) -> Result<Vec<T>, Error> {
    let bytes = count
        .checked_mul(mem::size_of::<T>())
        .filter(|&bytes| bytes <= MAX_LIST_BYTES)
        .ok_or_else(|| {
            error!("unable to allocate a list of {} entries", count);
            Error::OutOfMemory
        })?;
    let mut list = Vec::new();
    list.try_reserve_exact(count).map_err(|_| {
        error!("unable to allocate {} bytes for a list", bytes);
        Error::OutOfMemory
    })?;
    Ok(list)
}

/// The set of live mappings, shared by all client threads.
#[derive(Debug, Default)]
pub struct BufferTable {
    regions: RwLock<Vec<CoherentRegion>>,
}

impl BufferTable {
    pub fn new() -> BufferTable {
        BufferTable::default()
    }

    /// Registers a new mapping. Virtual ranges of live mappings never overlap.
    pub fn insert(&self, region: CoherentRegion) -> Result<(), Error> {
        if region.size == 0 || region.user_addr.checked_add(region.size).is_none() {
            return Err(Error::InvalidArgument);
        }
        let mut regions = self.regions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(other) = regions.iter().find(|r| r.overlaps(&region)) {
            error!(
                "mapping at {:#x} (size {:#x}) overlaps live mapping at {:#x}",
                region.user_addr, region.size, other.user_addr
            );
            return Err(Error::InvalidArgument);
        }
        debug!(
            "mapped {:#x} bytes at user {:#x}, bus {:#x}",
            region.size, region.user_addr, region.bus_addr
        );
        regions.push(region);
        Ok(())
    }

    /// Forgets the mapping that starts at `user_addr`.
    pub fn remove(&self, user_addr: usize) -> Option<CoherentRegion> {
        let mut regions = self.regions.write().unwrap_or_else(|e| e.into_inner());
        let index = regions.iter().position(|r| r.user_addr == user_addr)?;
        Some(regions.swap_remove(index))
    }

    pub fn drain(&self) -> Vec<CoherentRegion> {
        let mut regions = self.regions.write().unwrap_or_else(|e| e.into_inner());
        regions.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.regions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts `[addr, addr + len)` to a bus address.
    ///
    /// The whole range must lie inside a single mapping.
    pub fn translate(&self, addr: usize, len: usize) -> Result<u64, Error> {
        if len == 0 {
            return Err(Error::InvalidArgument);
        }
        let end = addr.checked_add(len).ok_or(Error::Fault)?;
        let regions = self.regions.read().unwrap_or_else(|e| e.into_inner());
        regions
            .iter()
            .find(|r| r.user_addr <= addr && end <= r.user_end())
            .map(|r| r.bus_addr + (addr - r.user_addr) as u64)
            .ok_or_else(|| {
                error!(
                    "unable to get DMA address for buffer at {:#x} (length {:#x})",
                    addr, len
                );
                Error::Fault
            })
    }
}
