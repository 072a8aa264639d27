// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fatal errors.
//!
//! Everything that ends the process goes through here: unrecovered panics, scheduler invariant
//! violations ("throws") and deadlock. The report is written straight to stderr:
//!
//! ```text
//! throw: all goroutines are asleep - deadlock!
//!
//! goroutine 1 [semacquire]:
//!     src/main.rs:12:5
//! created by src/main.rs:40:9
//! ```
//!
//! The first reporting thread also lists every other task. If several threads report at once,
//! all but the last to finish block forever and the last one exits the process.

use crate::config;
use crate::context::{self, Current};
use crate::sched::SchedInner;
use crate::task::{TaskId, TaskStatus};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::{Mutex, MutexGuard};
use segstack::Pc;
use std::io::{self, Write};
use std::process;

/// Exit status of a process that died from a panic or a fatal runtime error.
pub const EXIT_PANIC: i32 = 2;
/// Exit status of a process that panicked while already reporting a panic.
pub const EXIT_PANIC_DURING_PANIC: i32 = 3;

/// Threads currently reporting a fatal error.
static PANICKING: AtomicU32 = AtomicU32::new(0);
static PANIC_LOCK: Mutex<()> = parking_lot::const_mutex(());
/// Whether somebody already listed the other tasks.
static DID_OTHERS: AtomicBool = AtomicBool::new(false);

thread_local! {
    static DYING: Cell<bool> = const { Cell::new(false) };
}

/// Proof that the calling thread is reporting a fatal error.
pub(crate) struct Reporter {
    _lock: MutexGuard<'static, ()>,
}

/// Per-thread initialization for a new worker.
#[inline(never)]
pub(crate) fn minit() {
    DYING.set(false);
}

/// Begin reporting a fatal error on this thread.
#[inline(never)]
pub(crate) fn start_panic() -> Reporter {
    if DYING.replace(true) {
        let _ = io::stderr().write_all(b"panic during panic\n");
        process::exit(EXIT_PANIC_DURING_PANIC);
    }
    PANICKING.fetch_add(1, Ordering::SeqCst);
    Reporter {
        _lock: PANIC_LOCK.lock(),
    }
}

/// Finish a fatal error report and end the process.
pub(crate) fn do_panic(reporter: Reporter) -> ! {
    finish(reporter, None)
}

/// Like [`do_panic`], for callers holding the scheduler lock.
pub(crate) fn do_panic_locked(reporter: Reporter, inner: &SchedInner) -> ! {
    finish(reporter, Some(inner))
}

/// Report a fatal runtime error and end the process.
#[cold]
pub(crate) fn throw(msg: &str) -> ! {
    let reporter = start_panic();
    report_throw(msg);
    do_panic(reporter)
}

/// Like [`throw`], for callers holding the scheduler lock.
#[cold]
pub(crate) fn throw_locked(inner: &SchedInner, msg: &str) -> ! {
    let reporter = start_panic();
    report_throw(msg);
    do_panic_locked(reporter, inner)
}

fn report_throw(msg: &str) {
    tracing::error!(msg, "fatal runtime error");
    let _ = writeln!(io::stderr().lock(), "throw: {msg}");
}

fn finish(reporter: Reporter, inner: Option<&SchedInner>) -> ! {
    let cx = context::current();
    let level = cx
        .as_ref()
        .map_or_else(config::env_traceback, |cx| cx.sched.config.traceback);

    if level > 0 {
        let mut out = io::stderr().lock();
        if let Some(cx) = &cx {
            let _ = writeln!(out);
            let _ = current_traceback(&mut out, cx);
        }

        if !DID_OTHERS.swap(true, Ordering::SeqCst) {
            let me = cx.as_ref().map(|cx| cx.task);
            let listed = match (inner, &cx) {
                (Some(inner), _) => Some(other_tracebacks(&mut out, inner, me)),
                (None, Some(cx)) => cx
                    .sched
                    .try_inspect(|inner| other_tracebacks(&mut out, inner, me)),
                (None, None) => Some(Ok(())),
            };
            if listed.is_none() {
                let _ = writeln!(out, "\n(other tasks unavailable: scheduler lock is held)");
            }
        }
        let _ = out.flush();
    }

    drop(reporter);
    if PANICKING.fetch_sub(1, Ordering::SeqCst) - 1 != 0 {
        // Somebody else is reporting as well and will exit once done.
        loop {
            std::thread::park();
        }
    }
    process::exit(EXIT_PANIC)
}

/// `goroutine 7 [chan receive]:`
pub(crate) fn write_header(
    out: &mut impl Write,
    id: TaskId,
    status: TaskStatus,
    wait_reason: &str,
) -> io::Result<()> {
    let state = match status {
        TaskStatus::Waiting if !wait_reason.is_empty() => wait_reason,
        status => status.as_str(),
    };
    writeln!(out, "goroutine {id} [{state}]:")
}

fn write_frames(out: &mut impl Write, pcs: &[Pc]) -> io::Result<()> {
    for pc in pcs {
        writeln!(out, "\t{pc}")?;
    }
    Ok(())
}

fn current_traceback(out: &mut impl Write, cx: &Current) -> io::Result<()> {
    write_header(out, cx.task, cx.header.status(), "")?;
    match context::inspect_locals(|locals| locals.frame_pcs()) {
        Some(pcs) => write_frames(out, &pcs),
        None => writeln!(out, "\t(frames unavailable)"),
    }
}

fn other_tracebacks(
    out: &mut impl Write,
    inner: &SchedInner,
    me: Option<TaskId>,
) -> io::Result<()> {
    for slot in inner.tasks() {
        let status = slot.status();
        if Some(slot.id) == me || matches!(status, TaskStatus::Dead | TaskStatus::Idle) {
            continue;
        }

        writeln!(out)?;
        write_header(out, slot.id, status, slot.wait_reason)?;
        match (&slot.exec, slot.worker) {
            (Some(exec), _) => write_frames(out, &exec.frame_pcs())?,
            (None, Some(worker)) => writeln!(out, "\t(running on {worker})")?,
            (None, None) => {}
        }
        writeln!(out, "created by {}", slot.gopc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(status: TaskStatus, reason: &str) -> String {
        let mut out = Vec::new();
        write_header(&mut out, TaskId::new(7, 0), status, reason).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn header_uses_wait_reason() {
        assert_eq!(header(TaskStatus::Waiting, "semacquire"), "goroutine 7 [semacquire]:\n");
        assert_eq!(header(TaskStatus::Waiting, ""), "goroutine 7 [waiting]:\n");
        assert_eq!(header(TaskStatus::Running, "ignored"), "goroutine 7 [running]:\n");
        assert_eq!(header(TaskStatus::Syscall, ""), "goroutine 7 [syscall]:\n");
        assert_eq!(header(TaskStatus::Runnable, ""), "goroutine 7 [runnable]:\n");
        assert_eq!(header(TaskStatus::Moribund, ""), "goroutine 7 [moribund]:\n");
    }

    #[test]
    fn frames_are_indented() {
        let mut out = Vec::new();
        write_frames(&mut out, &[Pc::NONE, Pc::NONE]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "\t?\n\t?\n");
    }
}
