// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{STACK_MIN, STACK_SYSTEM};
use core::fmt;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

/// Backing memory of a single stack segment.
pub struct SegmentMem {
    buf: Box<[u8]>,
}
assert_impl_all!(SegmentMem: Send, Sync);

/// Source of stack segment memory.
///
/// The scheduler never allocates segment memory itself, it always goes through this trait so
/// embedders can route stack memory through their own allocator.
pub trait SegmentAllocator: Send + Sync {
    /// Allocate a zeroed segment of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if no memory is available.
    fn allocate(&self, size: usize) -> Result<SegmentMem, AllocError>;

    /// Give a segment back.
    fn release(&self, mem: SegmentMem);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    pub size: usize,
}

/// The default allocator: segments of the common minimum size are cached and handed out again,
/// every other size goes straight to the global allocator.
pub struct StackPool {
    cache: Mutex<Vec<SegmentMem>>,
    max_cached: usize,
}

// === impl SegmentMem ===

impl SegmentMem {
    /// Allocate `size` zeroed bytes from the global allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the global allocator cannot satisfy the request.
    pub fn new(size: usize) -> Result<Self, AllocError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| AllocError { size })?;
        buf.resize(size, 0);

        Ok(Self {
            buf: buf.into_boxed_slice(),
        })
    }

    /// Lowest address of the segment.
    #[inline]
    #[must_use]
    pub fn start(&self) -> usize {
        self.buf.as_ptr().addr()
    }

    /// One past the highest address of the segment.
    #[inline]
    #[must_use]
    pub fn end(&self) -> usize {
        self.start() + self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.start() && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }

    /// The bytes `[addr, addr + len)`, which must lie inside this segment.
    pub(crate) fn slice(&self, addr: usize, len: usize) -> &[u8] {
        debug_assert!(self.contains(addr, len));
        let offset = addr - self.start();
        &self.buf[offset..offset + len]
    }

    pub(crate) fn slice_mut(&mut self, addr: usize, len: usize) -> &mut [u8] {
        debug_assert!(self.contains(addr, len));
        let offset = addr - self.start();
        &mut self.buf[offset..offset + len]
    }
}

impl fmt::Debug for SegmentMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentMem")
            .field("start", &format_args!("{:#x}", self.start()))
            .field("len", &self.len())
            .finish()
    }
}

// === impl AllocError ===

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "out of memory allocating {} byte stack segment", self.size)
    }
}

impl core::error::Error for AllocError {}

// === impl StackPool ===

impl StackPool {
    /// Size of the segments the pool caches.
    pub const FIXED_SIZE: usize = STACK_MIN + STACK_SYSTEM;

    #[must_use]
    pub fn new(max_cached: usize) -> Self {
        Self {
            cache: Mutex::new(Vec::new()),
            max_cached,
        }
    }

    /// Number of segments currently held in the cache.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new(64)
    }
}

impl fmt::Debug for StackPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackPool")
            .field("cached", &self.cached())
            .field("max_cached", &self.max_cached)
            .finish()
    }
}

impl SegmentAllocator for StackPool {
    fn allocate(&self, size: usize) -> Result<SegmentMem, AllocError> {
        if size == Self::FIXED_SIZE
            && let Some(mut mem) = self.cache.lock().pop()
        {
            mem.buf.fill(0);
            return Ok(mem);
        }

        tracing::trace!(size, "allocating stack segment");
        SegmentMem::new(size)
    }

    fn release(&self, mem: SegmentMem) {
        if mem.len() == Self::FIXED_SIZE {
            let mut cache = self.cache.lock();
            if cache.len() < self.max_cached {
                cache.push(mem);
            }
        }
    }
}
