// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Segmented task stacks.
//!
//! A task's stack is a chain of segments. Each segment is topped by a [`Stktop`] header that
//! remembers the bounds of the segment below it, the resume point of the call that caused the
//! split, and the argument bytes that were copied across. Calls that don't fit into the
//! remaining space of the current segment allocate a new one ("growth"); returning from such
//! a call copies the argument area back and releases the segment again ("shrink").
//!
//! Segments live in an arena owned by the [`SegmentedStack`] and are addressed by their real
//! memory addresses, but all memory access goes through the owned segment buffers, so a stale
//! address can never be dereferenced.

mod alloc;
mod error;
mod stack;
mod stktop;

pub use alloc::{AllocError, SegmentAllocator, SegmentMem, StackPool};
pub use error::StackError;
pub use stack::{FrameId, FrameRecord, SegmentedStack, StackBounds};
pub use stktop::{Gobuf, Pc, Stktop};

/// Minimum size of a stack segment.
pub const STACK_MIN: usize = 4096;
/// Bytes below the guard that a frame may dip into before a split is forced.
pub const STACK_GUARD: usize = 256;
/// Extra room added to every new segment for the functions called from the new frame.
pub const STACK_EXTRA: usize = 1024;
/// Space reserved per segment for the host system (signal frames etc.).
pub const STACK_SYSTEM: usize = 0;
/// Space reserved at the top of every segment for its [`Stktop`] header.
pub const STKTOP_SIZE: usize = 64;
/// Largest argument frame a new task may be started with.
pub const MAX_SPAWN_ARGS: usize = STACK_MIN - 1024;

/// Rounds an argument size up to the argument frame alignment.
#[inline]
#[must_use]
pub const fn round_args(size: usize) -> usize {
    (size + 7) & !7
}
