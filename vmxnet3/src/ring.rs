//! # Descriptor Rings
//!
//! ## Purpose
//!
//! Typed access to a circular array of descriptors living in DMA memory, and
//! the reader side of a completion ring.
//!
//! ## How it works
//!
//! `Ring<T>` owns its `DmaRegion` and exposes descriptors only through
//! volatile reads and writes by index. `CompRing<T>` adds the reader cursor and
//! the expected generation: an entry is ready once its generation equals the
//! expected one, and the cursor flips the expected generation on every wrap.
//! Readers issue an acquire fence after observing a ready entry, producers a
//! release fence before the publishing generation flip.
//!
//! ## Main components
//!
//! - `Ring<T>`: owned descriptor array.
//! - `CompRing<T>`: completion ring reader.
//! - `Completion`: generation access for completion records.
//! - `barrier()`: read/write ordering points.

use std::io;
use std::sync::atomic::{Ordering, fence};

use crate::desc::{INIT_GEN, RxCompDesc, TxCompDesc};
use crate::dma::{BusDma, DmaRegion};

/// Ring memory alignment the device requires.
pub const RING_ALIGN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Before trusting data guarded by a newly observed generation.
    Read,
    /// Before publishing a newly built descriptor chain.
    Write,
}

#[inline]
pub fn barrier(kind: Barrier) {
    match kind {
        Barrier::Read => fence(Ordering::Acquire),
        Barrier::Write => fence(Ordering::Release),
    }
}

pub struct Ring<T> {
    region: DmaRegion,
    len: u32,
    _desc: std::marker::PhantomData<T>,
}

impl<T> Ring<T>
where
    T: Copy,
{
    pub fn alloc(dma: &dyn BusDma, len: u32) -> Result<Self, io::Error> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty ring"));
        }
        let region = dma.alloc_region(len as usize * size_of::<T>(), RING_ALIGN)?;
        region.zero();
        Ok(Ring {
            region,
            len,
            _desc: std::marker::PhantomData,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bus_addr(&self) -> u64 {
        self.region.bus_addr()
    }

    /// Advances `value` by one slot, wrapping at the ring end.
    /// Returns `true` when the index wrapped.
    pub fn increment(&self, value: &mut u32) -> bool {
        *value += 1;
        if *value == self.len {
            *value = 0;
            true
        } else {
            false
        }
    }

    pub fn desc_at(&self, index: u32) -> T {
        debug_assert!(index < self.len);
        unsafe { self.region.as_ptr::<T>().add(index as usize).read_volatile() }
    }

    pub fn set_desc(&mut self, index: u32, desc: T) {
        debug_assert!(index < self.len);
        unsafe {
            self.region
                .as_ptr::<T>()
                .add(index as usize)
                .write_volatile(desc)
        }
    }

    pub fn update(&mut self, index: u32, f: impl FnOnce(&mut T)) {
        let mut desc = self.desc_at(index);
        f(&mut desc);
        self.set_desc(index, desc);
    }

    pub fn zero(&mut self) {
        self.region.zero();
    }
}

/// Completion records expose the device-written generation bit.
pub trait Completion: Copy {
    fn generation(&self) -> u32;
}

impl Completion for TxCompDesc {
    fn generation(&self) -> u32 {
        TxCompDesc::generation(self)
    }
}

impl Completion for RxCompDesc {
    fn generation(&self) -> u32 {
        RxCompDesc::generation(self)
    }
}

pub struct CompRing<T> {
    ring: Ring<T>,
    next: u32,
    generation: u32,
}

impl<T> CompRing<T>
where
    T: Completion,
{
    pub fn alloc(dma: &dyn BusDma, len: u32) -> Result<Self, io::Error> {
        Ok(CompRing {
            ring: Ring::alloc(dma, len)?,
            next: 0,
            generation: INIT_GEN,
        })
    }

    pub fn reset(&mut self) {
        self.next = 0;
        self.generation = INIT_GEN;
        self.ring.zero();
    }

    /// Returns the entry under the cursor if the device has written it.
    pub fn peek(&self) -> Option<T> {
        let cd = self.ring.desc_at(self.next);
        if cd.generation() != self.generation {
            return None;
        }
        barrier(Barrier::Read);
        Some(self.ring.desc_at(self.next))
    }

    pub fn advance(&mut self) {
        if self.ring.increment(&mut self.next) {
            self.generation ^= 1;
        }
    }

    pub fn next(&self) -> u32 {
        self.next
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn len(&self) -> u32 {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn bus_addr(&self) -> u64 {
        self.ring.bus_addr()
    }
}
