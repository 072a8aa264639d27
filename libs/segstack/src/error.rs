// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::alloc::AllocError;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackError {
    /// The segment allocator could not provide backing memory.
    Alloc(AllocError),
    /// The stack pointer fell below the guard area of the current segment.
    Overflow { sp: usize, limit: usize },
    /// An argument frame size that is not a multiple of the frame alignment.
    MisalignedArgs(usize),
    /// Frames must be popped in the reverse order they were pushed.
    FrameOrder { expected: usize, got: usize },
    /// Unwinding did not find the target address in any live segment.
    BadUnwind { sp: usize, guard: usize, base: usize },
    /// An address that is not backed by any live segment.
    Unmapped { addr: usize, len: usize },
    /// A stack returned to the free list still has extra segments attached.
    InvalidStack,
}

impl From<AllocError> for StackError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::Alloc(err) => write!(f, "stack segment allocation failed: {err}"),
            StackError::Overflow { sp, limit } => {
                write!(f, "split stack overflow: {sp:#x} < {limit:#x}")
            }
            StackError::MisalignedArgs(size) => {
                write!(f, "stack split with misaligned argsize {size}")
            }
            StackError::FrameOrder { expected, got } => {
                write!(f, "frame {got} popped while frame {expected} is on top")
            }
            StackError::BadUnwind { sp, guard, base } => {
                write!(f, "bad unwindstack: {sp:#x} not in [{guard:#x}, {base:#x}]")
            }
            StackError::Unmapped { addr, len } => {
                write!(f, "{len} bytes at {addr:#x} are not backed by a live segment")
            }
            StackError::InvalidStack => f.write_str("invalid stack in free list"),
        }
    }
}

impl core::error::Error for StackError {}
