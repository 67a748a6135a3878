//! # DMA Memory
//!
//! ## Purpose
//!
//! Descriptor rings, completion rings and the shared device area live in memory
//! the device reads and writes directly. This module owns that memory and the
//! bus mappings of network buffers handed to the device.
//!
//! ## How it works
//!
//! `DmaRegion` wraps an anonymous `libc::mmap` region and releases it with
//! `munmap` on drop. The simulated backend shares the host address space, so
//! `HostDma` maps a buffer by using its host address as the bus address and
//! splitting it at the map's segment size limit.
//!
//! ## Main components
//!
//! - `DmaRegion`: owner of one contiguous device-visible region.
//! - `DmaMap`, `DmaSegment`: the bus segments a buffer is currently bound to.
//! - `BusDma`: the allocation and mapping interface the engine depends on.
//! - `HostDma`: identity-mapped implementation.

use std::{io, ptr};

use crate::error::LoadError;

/// A zeroed, page-aligned memory region visible to the device.
pub struct DmaRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

// The region is plain memory; concurrent access is mediated by the ring owners.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocates a region of at least `size` bytes aligned to `align`.
    ///
    /// # Errors
    ///
    /// Returns the `mmap` error, or `InvalidInput` when `align` exceeds the
    /// page size.
    pub fn alloc(size: usize, align: usize) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        if align > page_size || !align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported DMA alignment {align}"),
            ));
        }
        let aligned_size = (size.max(1) + page_size - 1) & !(page_size - 1);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(DmaRegion {
            ptr,
            len: aligned_size,
        })
    }

    /// Bus address of the first byte.
    pub fn bus_addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn as_ptr<T>(&self) -> *mut T {
        self.ptr as *mut T
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clears the whole region with volatile writes.
    pub fn zero(&self) {
        let base = self.ptr as *mut u8;
        for off in 0..self.len {
            unsafe { base.add(off).write_volatile(0) };
        }
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe {
            if self.ptr != libc::MAP_FAILED && !self.ptr.is_null() {
                let res = libc::munmap(self.ptr, self.len);
                if res < 0 {
                    log::error!("Failed to unmap DMA region: {}", io::Error::last_os_error());
                }
            }
        }
    }
}

/// One bus-visible piece of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub addr: u64,
    pub len: u32,
}

/// A host memory span to be bound to a map.
#[derive(Debug, Clone, Copy)]
pub struct HostSpan {
    pub addr: *const u8,
    pub len: usize,
}

impl HostSpan {
    pub fn of(bytes: &[u8]) -> Self {
        HostSpan {
            addr: bytes.as_ptr(),
            len: bytes.len(),
        }
    }
}

/// Mapping handle: limits fixed at creation, segments valid while loaded.
#[derive(Debug)]
pub struct DmaMap {
    max_size: usize,
    max_segs: usize,
    max_seg_size: usize,
    segs: Vec<DmaSegment>,
}

impl DmaMap {
    pub fn new(max_size: usize, max_segs: usize, max_seg_size: usize) -> Self {
        DmaMap {
            max_size,
            max_segs,
            max_seg_size,
            segs: Vec::with_capacity(max_segs),
        }
    }

    pub fn segments(&self) -> &[DmaSegment] {
        &self.segs
    }
}

/// Allocation and bus mapping of device-visible memory.
pub trait BusDma: Send + Sync {
    /// Allocates a zeroed region for rings or the shared area.
    fn alloc_region(&self, size: usize, align: usize) -> io::Result<DmaRegion> {
        DmaRegion::alloc(size, align)
    }

    /// Allocates a receive buffer of `len` bytes, `None` when exhausted.
    fn alloc_buffer(&self, len: usize) -> Option<Vec<u8>> {
        Some(vec![0; len])
    }

    /// Binds `spans` to `map`. The map is left unloaded on failure.
    fn load(&self, map: &mut DmaMap, spans: &[HostSpan]) -> Result<(), LoadError>;

    /// Releases the binding held by `map`.
    fn unload(&self, map: &mut DmaMap) {
        map.segs.clear();
    }
}

/// Identity mapping: bus address equals host address.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDma;

impl BusDma for HostDma {
    fn load(&self, map: &mut DmaMap, spans: &[HostSpan]) -> Result<(), LoadError> {
        map.segs.clear();
        let total: usize = spans.iter().map(|s| s.len).sum();
        if total > map.max_size {
            return Err(LoadError::TooBig);
        }
        for span in spans.iter().filter(|s| s.len > 0) {
            let mut off = 0;
            while off < span.len {
                if map.segs.len() == map.max_segs {
                    map.segs.clear();
                    return Err(LoadError::TooBig);
                }
                let len = (span.len - off).min(map.max_seg_size);
                map.segs.push(DmaSegment {
                    addr: span.addr as u64 + off as u64,
                    len: len as u32,
                });
                off += len;
            }
        }
        Ok(())
    }
}

/// A record of type `T` at a fixed offset inside a shared region.
pub struct SharedRecord<T> {
    region: std::sync::Arc<DmaRegion>,
    offset: usize,
    _record: std::marker::PhantomData<T>,
}

impl<T> SharedRecord<T> {
    /// Refers to the `index`-th `T` after `base` bytes of `region`.
    pub fn new(region: std::sync::Arc<DmaRegion>, base: usize, index: usize) -> Self {
        let offset = base + index * size_of::<T>();
        debug_assert!(offset + size_of::<T>() <= region.len());
        SharedRecord {
            region,
            offset,
            _record: std::marker::PhantomData,
        }
    }

    pub fn ptr(&self) -> *mut T {
        unsafe { self.region.as_ptr::<u8>().add(self.offset) as *mut T }
    }
}
