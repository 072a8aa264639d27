// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::panic::Location;

/// A program counter: the source location of a call site.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Pc(Option<&'static Location<'static>>);

/// A saved resume point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gobuf {
    pub sp: usize,
    pub pc: Pc,
}

/// Header at the top of every stack segment.
///
/// ```text
/// |  previous segment ...  | <- stackbase (of the previous segment)
/// |         ...            |
/// +========================+ <- end of the new segment's memory
/// |        Stktop          |
/// +------------------------+ <- stackbase (of the new segment)
/// |  copied argument area  | argsize bytes
/// +------------------------+ <- sp of the first frame
/// |         ...            |
/// +------------------------+ <- stackguard
/// |  guard area            | STACK_GUARD bytes
/// +========================+ <- start of the segment's memory
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stktop {
    /// Base of the previous segment, or 0 for the initial segment.
    pub stackbase: usize,
    /// Guard of the previous segment.
    pub stackguard: usize,
    /// Where to resume the caller once the call that split the stack returns.
    pub gobuf: Gobuf,
    /// Address the argument area was copied from, 0 if it did not come from the stack.
    pub argp: usize,
    pub argsize: usize,
    /// Size of the memory to release when this segment is popped, 0 if the header was placed
    /// inside the previous segment.
    pub free: usize,
    /// Whether this segment was created to run a deferred call during a panic.
    pub panic: bool,
}

// === impl Pc ===

impl Pc {
    pub const NONE: Self = Self(None);

    #[must_use]
    pub const fn new(location: &'static Location<'static>) -> Self {
        Self(Some(location))
    }

    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        Self(Some(Location::caller()))
    }

    #[must_use]
    pub fn location(self) -> Option<&'static Location<'static>> {
        self.0
    }
}

impl fmt::Debug for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Pc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(loc) => write!(f, "{}:{}:{}", loc.file(), loc.line(), loc.column()),
            None => f.write_str("?"),
        }
    }
}

impl From<&'static Location<'static>> for Pc {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location)
    }
}

// === impl Stktop ===

impl Stktop {
    /// Whether this is the header of the initial segment, which has nothing below it.
    #[inline]
    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.stackbase == 0
    }
}
