// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Panics, deferred calls and recovery.
//!
//! Every task keeps a chain of deferred calls and a chain of active panics. A panic runs the
//! pending deferred calls newest first, each on a stack segment marked as belonging to the
//! panic. If one of them calls [`Frame::recover`](crate::Frame::recover), the panic is marked
//! recovered, and once that deferred call returns the stack is unwound to the frame that
//! registered it, which then returns normally. If the deferred calls run out the process dies,
//! printing the chain of panics.
//!
//! Unwinding is done with Rust unwinds carrying a payload that says where to stop. Native Rust
//! panics raised by task code are caught at the nearest call boundary and turned into panics of
//! their own.

use crate::context;
use crate::fatal;
use crate::frame::{self, Frame};
use core::any::Any;
use core::fmt;
use segstack::Pc;
use std::borrow::Cow;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;

/// The value a task panicked with.
#[derive(Clone)]
pub struct PanicValue(Arc<dyn Payload>);

trait Payload: Any + Send + Sync {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn as_any(&self) -> &dyn Any;
}

struct Value<T> {
    value: T,
    describe: fn(&T, &mut fmt::Formatter<'_>) -> fmt::Result,
}

pub(crate) struct DeferRecord {
    /// Depth of the frame that registered the call.
    pub(crate) frame: usize,
    pub(crate) args: Vec<u8>,
    pub(crate) pc: Pc,
    pub(crate) func: Box<dyn FnOnce(&mut Frame) + Send>,
}

#[derive(Clone)]
pub(crate) struct PanicRecord {
    pub(crate) value: PanicValue,
    pub(crate) recovered: bool,
    /// Depth of the deferred call this panic is running.
    pub(crate) running: Option<usize>,
}

/// Unwind payload: stop at the frame at depth `frame`, which recovered.
pub(crate) struct Recovery {
    frame: usize,
}

/// Unwind payload: the task is exiting, unwind all the way.
pub(crate) struct Goexit;

pub(crate) enum Unwind {
    Recovery {
        frame: usize,
        payload: Box<dyn Any + Send>,
    },
    /// Unwinds the runtime started that must reach the task's entry point.
    Runtime(Box<dyn Any + Send>),
    /// A Rust panic raised by task code.
    Native(Box<dyn Any + Send>),
}

// === impl PanicValue ===

impl PanicValue {
    /// Panic with an arbitrary value, described by its `Debug` representation.
    pub fn new<T: Any + Send + Sync + fmt::Debug>(value: T) -> Self {
        Self(Arc::new(Value {
            value,
            describe: <T as fmt::Debug>::fmt,
        }))
    }

    /// Panic with an error, described by its `Display` representation.
    pub fn from_error<E: core::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self(Arc::new(Value {
            value: err,
            describe: <E as fmt::Display>::fmt,
        }))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    /// The value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref::<&'static str>()
            .copied()
            .or_else(|| self.downcast_ref::<String>().map(String::as_str))
    }

    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<Self>() {
            Ok(value) => return *value,
            Err(payload) => payload,
        };
        let payload = match payload.downcast::<&'static str>() {
            Ok(msg) => return Self::from(*msg),
            Err(payload) => payload,
        };
        match payload.downcast::<String>() {
            Ok(msg) => Self::from(*msg),
            Err(_) => Self::from("Box<dyn Any>"),
        }
    }
}

impl From<&'static str> for PanicValue {
    fn from(msg: &'static str) -> Self {
        Self(Arc::new(Value {
            value: msg,
            describe: |msg: &&'static str, f: &mut fmt::Formatter<'_>| f.write_str(msg),
        }))
    }
}

impl From<String> for PanicValue {
    fn from(msg: String) -> Self {
        Self(Arc::new(Value {
            value: msg,
            describe: |msg: &String, f: &mut fmt::Formatter<'_>| f.write_str(msg),
        }))
    }
}

impl From<Cow<'static, str>> for PanicValue {
    fn from(msg: Cow<'static, str>) -> Self {
        match msg {
            Cow::Borrowed(msg) => Self::from(msg),
            Cow::Owned(msg) => Self::from(msg),
        }
    }
}

impl fmt::Display for PanicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.describe(f)
    }
}

impl fmt::Debug for PanicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicValue")
            .field(&format_args!("{self}"))
            .finish()
    }
}

impl<T: Any + Send + Sync> Payload for Value<T> {
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.describe)(&self.value, f)
    }

    fn as_any(&self) -> &dyn Any {
        &self.value
    }
}

// === impl Unwind ===

impl Unwind {
    pub(crate) fn classify(payload: Box<dyn Any + Send>) -> Self {
        if let Some(recovery) = payload.downcast_ref::<Recovery>() {
            return Self::Recovery {
                frame: recovery.frame,
                payload,
            };
        }
        if payload.is::<Goexit>() || payload.is::<crate::runtime::Exit>() {
            return Self::Runtime(payload);
        }
        Self::Native(payload)
    }
}

/// Panic the current task with `value`.
///
/// Runs the task's deferred calls. If none of them recovers, the process exits with status 2
/// after printing the panic and a traceback of every task.
pub fn panic(value: impl Into<PanicValue>) -> ! {
    panic_impl(value.into())
}

pub(crate) fn panic_impl(value: PanicValue) -> ! {
    let Some(cx) = context::current() else {
        // Nobody to recover. Die the same way an unrecovered panic would.
        let reporter = fatal::start_panic();
        print_panics(&[PanicRecord {
            value,
            recovered: false,
            running: None,
        }]);
        fatal::do_panic(reporter);
    };

    if cx.worker.is_gcing() {
        print_panics(&[PanicRecord {
            value,
            recovered: false,
            running: None,
        }]);
        fatal::throw("panic during gc");
    }
    drop(cx);

    let level = context::locals(|locals| {
        locals.panics.push(PanicRecord {
            value,
            recovered: false,
            running: None,
        });
        locals.panics.len() - 1
    });
    tracing::trace!(level, "panicking");

    loop {
        let Some(d) = context::locals(|locals| locals.defers.pop()) else {
            break;
        };
        let frame = d.frame;

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| invoke_defer(d, true))) {
            // A recovery further up the stack, or the task exiting, unwinds through this
            // deferred call. This panic is abandoned.
            context::locals(|locals| locals.panics.truncate(level));
            resume_unwind(payload);
        }

        let recovered = context::locals(|locals| {
            let recovered = locals.panics.get(level).is_some_and(|p| p.recovered);
            if recovered {
                locals.panics.truncate(level);
            }
            recovered
        });
        if recovered {
            tracing::trace!(level, frame, "recovered");
            resume_unwind(Box::new(Recovery { frame }));
        }
    }

    // ran out of deferred calls
    let reporter = fatal::start_panic();
    let chain = context::locals(|locals| locals.panics.clone());
    tracing::error!(panics = chain.len(), "unrecovered panic");
    print_panics(&chain);
    fatal::do_panic(reporter)
}

/// Stop the current panic, if the calling frame is a deferred call run directly by it.
pub(crate) fn recover(argp: usize, depth: usize) -> Option<PanicValue> {
    context::with_locals(|locals| {
        let is_panic_frame = locals.stack.is_panic_frame(argp);
        let panic = locals.panics.last_mut()?;
        if panic.recovered || panic.running != Some(depth) || !is_panic_frame {
            return None;
        }
        panic.recovered = true;
        Some(panic.value.clone())
    })
    .flatten()
}

/// Run the deferred calls registered by the frame at `depth`, newest first.
pub(crate) fn deferreturn(depth: usize) {
    loop {
        let d = context::locals(|locals| {
            if locals.defers.last().is_some_and(|d| d.frame == depth) {
                locals.defers.pop()
            } else {
                None
            }
        });
        let Some(d) = d else {
            break;
        };
        invoke_defer(d, false);
    }
}

/// Run every pending deferred call of the current task.
pub(crate) fn rundefer() {
    while let Some(d) = context::locals(|locals| locals.defers.pop()) {
        invoke_defer(d, false);
    }
}

/// Terminate the current task after running all of its deferred calls.
pub fn goexit() -> ! {
    context::expect_current("goexit");
    rundefer();
    resume_unwind(Box::new(Goexit))
}

fn invoke_defer(d: DeferRecord, panic: bool) {
    let DeferRecord { args, pc, func, .. } = d;
    let frame = frame::push(|stack| stack.push_call(0, &args, panic, pc));
    if panic {
        let depth = frame.depth();
        context::locals(|locals| {
            if let Some(p) = locals.panics.last_mut() {
                p.running = Some(depth);
            }
        });
    }
    // A panic the deferred call recovered from itself is none of our business.
    let _ = frame::run_frame(frame, func);
}

/// Print the panic chain, oldest first.
fn print_panics(chain: &[PanicRecord]) {
    let printed = catch_unwind(AssertUnwindSafe(|| {
        let mut out = io::stderr().lock();
        write_panics(&mut out, chain)
    }));
    if printed.is_err() {
        // Describing a panic value panicked.
        fatal::start_panic();
    }
}

fn write_panics(out: &mut impl Write, chain: &[PanicRecord]) -> io::Result<()> {
    for (i, p) in chain.iter().enumerate() {
        if i > 0 {
            out.write_all(b"\t")?;
        }
        write!(out, "panic: {}", p.value)?;
        if p.recovered {
            out.write_all(b" [recovered]")?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}
