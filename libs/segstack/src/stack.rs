// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::alloc::{SegmentAllocator, SegmentMem};
use crate::error::StackError;
use crate::stktop::{Gobuf, Pc, Stktop};
use crate::{STACK_EXTRA, STACK_GUARD, STACK_MIN, STACK_SYSTEM, STKTOP_SIZE, round_args};
use core::fmt;
use std::sync::Arc;

/// A task's stack: a chain of segments plus the records of the frames living on it.
///
/// Frames grow downwards. A frame consists of its argument area (placed by the caller) and its
/// locals (reserved by the callee):
///
/// ```text
/// +-------------+ <- caller sp
/// |  arguments  | argsize bytes, starting at argp
/// +-------------+
/// |  locals     | frame_size bytes
/// +-------------+ <- sp while the frame is on top
/// ```
pub struct SegmentedStack {
    alloc: Arc<dyn SegmentAllocator>,
    /// Segment headers, oldest first. The first entry is the initial segment and is never
    /// released while the stack is alive.
    segments: Vec<Segment>,
    frames: Vec<FrameRecord>,
    /// Lowest address of the initial segment.
    stack0: usize,
    stackbase: usize,
    stackguard: usize,
    sp: usize,
    /// Set right before a deferred call is made on behalf of a panic, consumed by the next split.
    ispanic: bool,
}

struct Segment {
    /// `None` if the header was placed inside the segment below.
    mem: Option<SegmentMem>,
    top: Stktop,
}

/// The bounds of the current segment and the current stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub guard: usize,
    pub base: usize,
    pub sp: usize,
}

/// Identifies a live frame by its depth on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub argp: usize,
    pub argsize: usize,
    pub frame_size: usize,
    pub pc: Pc,
    caller_sp: usize,
    locals: usize,
    /// Number of segment headers pushed on behalf of this frame (0, 1 or 2).
    headers: u8,
    /// Index of the segment the frame lives in.
    segment: usize,
}

enum ArgSource<'a> {
    /// Arguments already live on the stack at the given address.
    Stack(usize),
    /// Arguments come from outside the stack.
    Bytes(&'a [u8]),
}

// === impl FrameId ===

impl FrameId {
    #[inline]
    #[must_use]
    pub const fn depth(self) -> usize {
        self.0
    }
}

// === impl FrameRecord ===

impl FrameRecord {
    /// Whether setting up this frame split the stack.
    #[inline]
    #[must_use]
    pub fn split(&self) -> bool {
        self.headers > 0
    }
}

// === impl SegmentedStack ===

impl SegmentedStack {
    /// Allocate the initial segment of `size` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Alloc`] if the allocator has no memory left.
    pub fn new(alloc: Arc<dyn SegmentAllocator>, size: usize) -> Result<Self, StackError> {
        debug_assert!(size >= STKTOP_SIZE + STACK_GUARD);

        let mem = alloc.allocate(STACK_SYSTEM + size)?;
        let stack0 = mem.start();
        let stackbase = stack0 + STACK_SYSTEM + size - STKTOP_SIZE;

        Ok(Self {
            alloc,
            segments: vec![Segment {
                mem: Some(mem),
                top: Stktop::default(),
            }],
            frames: Vec::new(),
            stack0,
            stackbase,
            stackguard: stack0 + STACK_GUARD,
            sp: stackbase,
            ispanic: false,
        })
    }

    #[must_use]
    pub fn bounds(&self) -> StackBounds {
        StackBounds {
            guard: self.stackguard,
            base: self.stackbase,
            sp: self.sp,
        }
    }

    /// Lowest address of the initial segment.
    #[must_use]
    pub fn stack0(&self) -> usize {
        self.stack0
    }

    /// Header of the current segment.
    #[must_use]
    pub fn top(&self) -> &Stktop {
        &self.current().top
    }

    /// Number of segment headers, including the initial segment.
    #[must_use]
    pub fn segments(&self) -> usize {
        self.segments.len()
    }

    /// Live frames, outermost first.
    #[must_use]
    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    #[must_use]
    pub fn frame(&self, id: FrameId) -> Option<&FrameRecord> {
        self.frames.get(id.0)
    }

    /// The topmost live frame.
    #[must_use]
    pub fn top_frame(&self) -> Option<FrameId> {
        self.frames.len().checked_sub(1).map(FrameId)
    }

    /// The argument area of a live frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not live.
    pub fn args(&self, id: FrameId) -> Result<&[u8], StackError> {
        let frame = self.live(id)?;
        self.mem(frame.argp, frame.argsize)
    }

    /// The argument area of a live frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not live.
    pub fn args_mut(&mut self, id: FrameId) -> Result<&mut [u8], StackError> {
        let frame = *self.live(id)?;
        self.mem_mut(frame.argp, frame.argsize)
    }

    /// The locals of a live frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not live.
    pub fn locals_mut(&mut self, id: FrameId) -> Result<&mut [u8], StackError> {
        let frame = *self.live(id)?;
        self.mem_mut(frame.locals, frame.frame_size)
    }

    /// Push a frame for an ordinary call: the caller places `args` below its own frame, the
    /// callee reserves `frame_size` bytes of locals. Either step splits the stack if the
    /// current segment is too small.
    ///
    /// # Errors
    ///
    /// Returns an error if a new segment was needed and could not be allocated.
    pub fn push_frame(
        &mut self,
        frame_size: usize,
        args: &[u8],
        pc: Pc,
    ) -> Result<FrameId, StackError> {
        let argsize = round_args(args.len());
        let caller_sp = self.sp;
        let mut headers = 0;

        let mut argp = match self.sp.checked_sub(argsize) {
            Some(argp) if argp >= self.stackguard => {
                self.write(argp, args, argsize)?;
                self.sp = argp;
                argp
            }
            // not even the arguments fit, they travel in a header of their own
            _ => {
                headers += 1;
                self.newstack(0, argsize, ArgSource::Bytes(args), true, pc)?
            }
        };

        if !self.fits(frame_size) {
            headers += 1;
            argp = self.newstack(frame_size, argsize, ArgSource::Stack(argp), false, pc)?;
        }

        Ok(self.finish_frame(argp, argsize, frame_size, pc, caller_sp, headers))
    }

    /// Push a frame for a call whose argument size is only known at runtime, such as a deferred
    /// call. Such calls always get a header of their own, so the argument size can be recovered
    /// when the call returns and so `panic` can mark the segment as the one a deferred call
    /// runs on. If the current segment has room the header is placed in place without
    /// allocating.
    ///
    /// # Errors
    ///
    /// Returns an error if a new segment was needed and could not be allocated.
    pub fn push_call(
        &mut self,
        frame_size: usize,
        args: &[u8],
        panic: bool,
        pc: Pc,
    ) -> Result<FrameId, StackError> {
        let argsize = round_args(args.len());
        let caller_sp = self.sp;
        let mut headers = 1;

        self.ispanic = panic;
        let mut argp = self
            .newstack(0, argsize, ArgSource::Bytes(args), true, pc)
            .inspect_err(|_| self.ispanic = false)?;

        if !self.fits(frame_size) {
            headers += 1;
            argp = self.newstack(frame_size, argsize, ArgSource::Stack(argp), false, pc)?;
        }

        Ok(self.finish_frame(argp, argsize, frame_size, pc, caller_sp, headers))
    }

    /// Pop the topmost frame, releasing any segments that were allocated for it. Returns the
    /// final contents of the frame's argument area, which is where results are passed.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::FrameOrder`] if `id` is not the topmost frame.
    pub fn pop_frame(&mut self, id: FrameId) -> Result<Vec<u8>, StackError> {
        let expected = self.frames.len().wrapping_sub(1);
        if id.0 != expected {
            return Err(StackError::FrameOrder {
                expected,
                got: id.0,
            });
        }
        let frame = self.frames[id.0];
        let results = self.mem(frame.argp, frame.argsize)?.to_vec();
        self.frames.truncate(id.0);

        for _ in 0..frame.headers {
            self.oldstack()?;
        }
        self.sp = frame.caller_sp;

        Ok(results)
    }

    /// Release segments until the one holding `target` is current again and drop every frame
    /// above it. `None` unwinds to the initial segment and drops all frames.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::BadUnwind`] if the target frame is not on the stack.
    pub fn unwind_to(&mut self, target: Option<FrameId>) -> Result<(), StackError> {
        let keep = match target {
            Some(id) => self.live(id)?.segment,
            None => 0,
        };

        while self.segments.len() - 1 > keep {
            if let Some(seg) = self.segments.pop() {
                self.stackbase = seg.top.stackbase;
                self.stackguard = seg.top.stackguard;
                if let Some(mem) = seg.mem {
                    self.alloc.release(mem);
                }
            }
        }
        self.ispanic = false;

        let Some(id) = target else {
            self.frames.clear();
            self.sp = self.stackbase;
            return Ok(());
        };

        let frame = self.frames[id.0];
        let limit = self.stackguard - STACK_GUARD;
        if frame.argp < limit || self.stackbase < frame.argp {
            return Err(StackError::BadUnwind {
                sp: frame.argp,
                guard: limit,
                base: self.stackbase,
            });
        }

        self.frames.truncate(id.0 + 1);
        self.sp = frame.locals;
        Ok(())
    }

    /// Whether a function whose arguments start at `argp` is the top frame of a segment that
    /// was created to run a deferred call during a panic.
    #[must_use]
    pub fn is_panic_frame(&self, argp: usize) -> bool {
        let mut idx = self.segments.len() - 1;
        let top = self.segments[idx].top;
        if argp < self.stackbase - top.argsize || self.stackbase < argp {
            return false;
        }

        // The deferred function may have needed a segment of its own for its locals right
        // away, in which case its arguments were copied out of the header that was created
        // for the call. Back up to that one.
        if !top.is_initial() && top.argp == top.stackbase - top.argsize {
            idx -= 1;
        }

        self.segments[idx].top.panic
    }

    /// Prepare the stack for reuse by another task.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::InvalidStack`] if segments other than the initial one are still
    /// attached.
    pub fn reset(&mut self) -> Result<(), StackError> {
        if self.segments.len() != 1 || self.stackguard - STACK_GUARD != self.stack0 {
            return Err(StackError::InvalidStack);
        }
        self.frames.clear();
        self.sp = self.stackbase;
        self.ispanic = false;
        Ok(())
    }

    fn current(&self) -> &Segment {
        // the initial segment is never popped
        &self.segments[self.segments.len() - 1]
    }

    fn live(&self, id: FrameId) -> Result<&FrameRecord, StackError> {
        self.frames
            .get(id.0)
            .ok_or(StackError::FrameOrder {
                expected: self.frames.len().wrapping_sub(1),
                got: id.0,
            })
    }

    fn fits(&self, size: usize) -> bool {
        self.sp
            .checked_sub(size)
            .is_some_and(|sp| sp >= self.stackguard)
    }

    fn finish_frame(
        &mut self,
        argp: usize,
        argsize: usize,
        frame_size: usize,
        pc: Pc,
        caller_sp: usize,
        headers: u8,
    ) -> FrameId {
        self.sp -= frame_size;
        let id = FrameId(self.frames.len());
        self.frames.push(FrameRecord {
            argp,
            argsize,
            frame_size,
            pc,
            caller_sp,
            locals: self.sp,
            headers,
            segment: self.segments.len() - 1,
        });
        id
    }

    /// Start a new segment (or an in-place header for runtime-sized calls) big enough for
    /// `framesize` bytes of locals and copy the `argsize` byte argument area into it. Returns
    /// the new argument pointer.
    fn newstack(
        &mut self,
        framesize: usize,
        argsize: usize,
        src: ArgSource<'_>,
        reflectcall: bool,
        pc: Pc,
    ) -> Result<usize, StackError> {
        let limit = self.stackguard - STACK_GUARD;
        if self.sp < limit {
            return Err(StackError::Overflow { sp: self.sp, limit });
        }
        if argsize % size_of::<usize>() != 0 {
            return Err(StackError::MisalignedArgs(argsize));
        }

        // Runtime-sized calls only need the header to find the argument size again when
        // returning. If there is room, put it on the current segment.
        let in_place = reflectcall
            && self
                .sp
                .checked_sub(STKTOP_SIZE + argsize + 32)
                .is_some_and(|sp| sp > self.stackguard);

        let bytes = match src {
            ArgSource::Stack(argp) => self.mem(argp, argsize)?.to_vec(),
            ArgSource::Bytes(bytes) => bytes.to_vec(),
        };

        let (mem, base, guard, free) = if in_place {
            (None, self.sp - STKTOP_SIZE, self.stackguard, 0)
        } else {
            let size = (framesize + argsize + STACK_EXTRA).max(STACK_MIN) + STACK_SYSTEM;
            let mem = self.alloc.allocate(size)?;
            let base = mem.start() + size - STKTOP_SIZE;
            let guard = mem.start() + STACK_GUARD;
            (Some(mem), base, guard, size)
        };

        let top = Stktop {
            stackbase: self.stackbase,
            stackguard: self.stackguard,
            gobuf: Gobuf { sp: self.sp, pc },
            argp: match src {
                ArgSource::Stack(argp) => argp,
                ArgSource::Bytes(_) => 0,
            },
            argsize,
            free,
            panic: self.ispanic,
        };
        self.ispanic = false;

        tracing::trace!(
            framesize,
            argsize,
            free,
            panic = top.panic,
            base = format_args!("{base:#x}"),
            "newstack"
        );

        self.segments.push(Segment { mem, top });
        self.stackbase = base;
        self.stackguard = guard;

        let sp = base - argsize;
        self.write(sp, &bytes, argsize)?;
        self.sp = sp;

        Ok(sp)
    }

    /// Return from the call that created the current segment header.
    fn oldstack(&mut self) -> Result<(), StackError> {
        if self.segments.len() <= 1 {
            return Err(StackError::InvalidStack);
        }
        let top = self.current().top;

        // copy results back into the caller's argument area
        if top.argsize > 0 && top.argp != 0 {
            let results = self.mem(self.stackbase - top.argsize, top.argsize)?.to_vec();
            self.mem_mut(top.argp, top.argsize)?
                .copy_from_slice(&results);
        }

        if let Some(seg) = self.segments.pop()
            && let Some(mem) = seg.mem
        {
            self.alloc.release(mem);
        }

        tracing::trace!(free = top.free, "oldstack");

        self.stackbase = top.stackbase;
        self.stackguard = top.stackguard;
        self.sp = top.gobuf.sp;
        Ok(())
    }

    fn write(&mut self, addr: usize, bytes: &[u8], len: usize) -> Result<(), StackError> {
        let dst = self.mem_mut(addr, len)?;
        let (head, tail) = dst.split_at_mut(bytes.len().min(len));
        head.copy_from_slice(&bytes[..head.len()]);
        tail.fill(0);
        Ok(())
    }

    fn mem(&self, addr: usize, len: usize) -> Result<&[u8], StackError> {
        if len == 0 {
            return Ok(&[]);
        }
        self.segments
            .iter()
            .rev()
            .filter_map(|seg| seg.mem.as_ref())
            .find(|mem| mem.contains(addr, len))
            .map(|mem| mem.slice(addr, len))
            .ok_or(StackError::Unmapped { addr, len })
    }

    fn mem_mut(&mut self, addr: usize, len: usize) -> Result<&mut [u8], StackError> {
        if len == 0 {
            return Ok(&mut []);
        }
        self.segments
            .iter_mut()
            .rev()
            .filter_map(|seg| seg.mem.as_mut())
            .find(|mem| mem.contains(addr, len))
            .map(|mem| mem.slice_mut(addr, len))
            .ok_or(StackError::Unmapped { addr, len })
    }
}

impl Drop for SegmentedStack {
    fn drop(&mut self) {
        for seg in self.segments.drain(..) {
            if let Some(mem) = seg.mem {
                self.alloc.release(mem);
            }
        }
    }
}

impl fmt::Debug for SegmentedStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentedStack")
            .field("stackbase", &format_args!("{:#x}", self.stackbase))
            .field("stackguard", &format_args!("{:#x}", self.stackguard))
            .field("sp", &format_args!("{:#x}", self.sp))
            .field("segments", &self.segments.len())
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}
