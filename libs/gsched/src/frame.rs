// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Call frames on the task's segmented stack.
//!
//! Task code opts into the runtime's notion of a call by going through [`call`]. Each call gets
//! an argument area and a locals area on the segmented stack, is a preemption point, and is
//! where deferred calls registered through its [`Frame`] run when it returns.

use crate::context;
use crate::fatal;
use crate::panic::{self, DeferRecord, PanicValue, Unwind};
use crate::profile;
use crate::task::{Entry, Suspend};
use core::fmt;
use core::marker::PhantomData;
use segstack::{FrameId, FrameRecord, Pc, SegmentedStack, StackError};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

/// A live call frame of the current task.
pub struct Frame {
    id: FrameId,
    argp: usize,
    argsize: usize,
    // frames belong to the task that pushed them
    _not_send: PhantomData<*mut ()>,
}

/// Returned by [`call`] when a deferred call of the callee recovered from a panic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    results: Vec<u8>,
}

// === impl Frame ===

impl Frame {
    fn new(id: FrameId, record: &FrameRecord) -> Self {
        Self {
            id,
            argp: record.argp,
            argsize: record.argsize,
            _not_send: PhantomData,
        }
    }

    /// How many frames are below this one.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.id.depth()
    }

    /// Size of the argument area, rounded up to the frame alignment.
    #[must_use]
    pub fn arg_size(&self) -> usize {
        self.argsize
    }

    /// A copy of the argument area. Callees write their results here.
    #[must_use]
    pub fn args(&self) -> Vec<u8> {
        let args = context::locals(|locals| locals.stack.args(self.id).map(<[u8]>::to_vec));
        args.unwrap_or_else(|err| stack_failure(&err))
    }

    /// Overwrite the start of the argument area with `bytes`.
    ///
    /// Panics the task if `bytes` does not fit.
    pub fn set_args(&mut self, bytes: &[u8]) {
        if bytes.len() > self.argsize {
            panic::panic(format!(
                "{} result bytes do not fit a {} byte argument area",
                bytes.len(),
                self.argsize
            ));
        }
        let res = context::locals(|locals| {
            let args = locals.stack.args_mut(self.id)?;
            args[..bytes.len()].copy_from_slice(bytes);
            Ok::<_, StackError>(())
        });
        if let Err(err) = res {
            stack_failure(&err);
        }
    }

    /// Scratch space of `frame_size` bytes for the frame's own use. `f` must not call back into
    /// the runtime.
    pub fn with_locals<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let res = context::locals(|locals| locals.stack.locals_mut(self.id).map(f));
        res.unwrap_or_else(|err| stack_failure(&err))
    }

    /// Run `f` when this frame returns or panics. Deferred calls run newest first.
    #[track_caller]
    pub fn defer(&mut self, f: impl FnOnce(&mut Frame) + Send + 'static) {
        self.push_defer(Box::new(f), Vec::new(), Pc::caller());
    }

    /// Like [`defer`](Self::defer) for a plain function, with the argument bytes of the deferred
    /// call copied now. The deferred call reads them from its own frame.
    #[track_caller]
    pub fn defer_raw(&mut self, f: fn(&mut Frame), args: &[u8]) {
        self.push_defer(Box::new(f), args.to_vec(), Pc::caller());
    }

    fn push_defer(
        &self,
        func: Box<dyn FnOnce(&mut Frame) + Send>,
        args: Vec<u8>,
        pc: Pc,
    ) {
        let frame = self.depth();
        context::locals(|locals| {
            locals.defers.push(DeferRecord {
                frame,
                args,
                pc,
                func,
            });
        });
    }

    /// Stop the panic that is running this deferred call and return its value.
    ///
    /// Returns `None` when no panic is in progress, when it was already recovered, or when this
    /// frame is not a deferred call run directly by the panic.
    #[must_use]
    pub fn recover(&self) -> Option<PanicValue> {
        panic::recover(self.argp, self.depth())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("depth", &self.depth())
            .field("argp", &format_args!("{:#x}", self.argp))
            .field("argsize", &self.argsize)
            .finish()
    }
}

// === impl Recovered ===

impl Recovered {
    /// The argument area of the callee when it returned, with whatever results its deferred
    /// calls wrote.
    #[must_use]
    pub fn results(&self) -> &[u8] {
        &self.results
    }

    #[must_use]
    pub fn into_results(self) -> Vec<u8> {
        self.results
    }
}

impl fmt::Display for Recovered {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("callee recovered from a panic")
    }
}

impl core::error::Error for Recovered {}

/// Call `f` in a new frame with `frame_size` bytes of locals and a copy of `args` as its
/// argument area.
///
/// This is a preemption point: if the scheduler asked the current task to yield, it does so
/// before the frame is pushed.
///
/// # Errors
///
/// Returns [`Recovered`] if `f` panicked and one of its deferred calls recovered.
#[track_caller]
pub fn call<R>(
    frame_size: usize,
    args: &[u8],
    f: impl FnOnce(&mut Frame) -> R,
) -> Result<R, Recovered> {
    let pc = Pc::caller();
    morestack_check();
    let frame = push(|stack| stack.push_frame(frame_size, args, pc));
    run_frame(frame, f)
}

fn morestack_check() {
    let cx = context::expect_current("call");
    profile::sample(&cx);
    if cx.sched.preempt_requested(&cx.worker) {
        drop(cx);
        context::suspend(Suspend::Yield);
    }
}

pub(crate) fn push(
    op: impl FnOnce(&mut SegmentedStack) -> Result<FrameId, StackError>,
) -> Frame {
    let frame = context::locals(|locals| {
        let id = op(&mut locals.stack)?;
        let record = locals.stack.frame(id).ok_or(StackError::InvalidStack)?;
        Ok::<_, StackError>(Frame::new(id, record))
    });
    frame.unwrap_or_else(|err| stack_failure(&err))
}

/// Run `f` in `frame`, then its deferred calls, then pop it.
pub(crate) fn run_frame<R>(
    mut frame: Frame,
    f: impl FnOnce(&mut Frame) -> R,
) -> Result<R, Recovered> {
    let depth = frame.depth();
    let mut result = catch_unwind(AssertUnwindSafe(|| f(&mut frame)));

    loop {
        match result {
            Ok(value) => {
                panic::deferreturn(depth);
                pop(&frame);
                return Ok(value);
            }
            Err(payload) => match Unwind::classify(payload) {
                Unwind::Recovery { frame: target, .. } if target == depth => {
                    let res = context::locals(|locals| locals.stack.unwind_to(Some(frame.id)));
                    if let Err(err) = res {
                        stack_failure(&err);
                    }
                    panic::deferreturn(depth);
                    let results = pop(&frame);
                    return Err(Recovered { results });
                }
                Unwind::Recovery { payload, .. } | Unwind::Runtime(payload) => {
                    resume_unwind(payload)
                }
                Unwind::Native(payload) => {
                    // a Rust panic in task code becomes a task panic raised from this frame
                    let value = PanicValue::from_payload(payload);
                    result = catch_unwind(AssertUnwindSafe(|| -> R { panic::panic_impl(value) }));
                }
            },
        }
    }
}

fn pop(frame: &Frame) -> Vec<u8> {
    let res = context::locals(|locals| locals.stack.pop_frame(frame.id));
    res.unwrap_or_else(|err| stack_failure(&err))
}

/// Run a task's entry point in the frame `Exec::prepare` pushed for it.
pub(crate) fn run_entry(entry: Entry) {
    let frame = context::locals(|locals| {
        let id = locals.stack.top_frame()?;
        locals.stack.frame(id).map(|record| Frame::new(id, record))
    });
    let Some(frame) = frame else {
        fatal::throw("task started without an entry frame");
    };

    let Err(payload) = catch_unwind(AssertUnwindSafe(|| run_frame(frame, entry))) else {
        return;
    };
    match Unwind::classify(payload) {
        // goexit or exit
        Unwind::Runtime(_) => {}
        Unwind::Recovery { frame, .. } => {
            fatal::throw(&format!("recovery unwound past frame {frame}"))
        }
        Unwind::Native(_) => fatal::throw("unwind escaped the task entry frame"),
    }
}

fn stack_failure(err: &StackError) -> ! {
    fatal::throw(&format!("runtime: {err}"))
}
