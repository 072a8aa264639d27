// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The "current task" of a worker thread.
//!
//! Task code can migrate between worker threads at every suspension point, so nothing in here
//! may be inlined into task code: the compiler would otherwise be free to compute the address of
//! a thread-local once and reuse it after the task woke up on a different thread.

use crate::fatal;
use crate::sched::Sched;
use crate::task::{Suspend, TaskHeader, TaskId, TaskLocals};
use crate::worker::{Worker, WorkerId};
use core::cell::{Cell, RefCell};
use core::ptr::NonNull;
use std::sync::Arc;

thread_local! {
    static CURRENT: Cell<Option<NonNull<Context>>> = const { Cell::new(None) };
}

/// What a worker knows about the task it is running. Lives on the worker's stack for as long as
/// the task is resumed.
pub(crate) struct Context {
    pub(crate) sched: Arc<Sched>,
    pub(crate) worker: Arc<Worker>,
    pub(crate) task: TaskId,
    pub(crate) header: Arc<TaskHeader>,
    pub(crate) locals: NonNull<RefCell<TaskLocals>>,
}

/// An owned snapshot of the current [`Context`]. Only valid until the task next suspends.
#[derive(Clone)]
pub(crate) struct Current {
    pub(crate) sched: Arc<Sched>,
    pub(crate) worker: Arc<Worker>,
    pub(crate) task: TaskId,
    pub(crate) header: Arc<TaskHeader>,
}

impl Current {
    pub(crate) fn worker_id(&self) -> WorkerId {
        self.worker.id
    }
}

/// Install `cx` as the current context while `f` runs.
pub(crate) fn enter<R>(cx: &Context, f: impl FnOnce() -> R) -> R {
    struct Reset(Option<NonNull<Context>>);
    impl Drop for Reset {
        fn drop(&mut self) {
            CURRENT.set(self.0);
        }
    }

    let _reset = Reset(CURRENT.replace(Some(NonNull::from(cx))));
    f()
}

#[inline(never)]
pub(crate) fn current() -> Option<Current> {
    let cx = CURRENT.get()?;
    // SAFETY: the pointer was installed by `enter` and the context outlives the resume.
    let cx = unsafe { cx.as_ref() };
    Some(Current {
        sched: cx.sched.clone(),
        worker: cx.worker.clone(),
        task: cx.task,
        header: cx.header.clone(),
    })
}

/// Like [`current`], but treats running outside of a task as a fatal error.
#[inline(never)]
pub(crate) fn expect_current(op: &str) -> Current {
    current().unwrap_or_else(|| fatal::throw(&format!("{op} called outside of a task")))
}

/// The id of the worker running on this thread, if it belongs to `sched`.
#[inline(never)]
pub(crate) fn worker_of(sched: &Sched) -> Option<WorkerId> {
    let cx = CURRENT.get()?;
    // SAFETY: see `current`
    let cx = unsafe { cx.as_ref() };
    core::ptr::eq(&*cx.sched, sched).then_some(cx.worker.id)
}

/// Run `f` with exclusive access to the current task's local state. Returns `None` outside of
/// a task. `f` must not suspend or call back into the runtime.
#[inline(never)]
pub(crate) fn with_locals<R>(f: impl FnOnce(&mut TaskLocals) -> R) -> Option<R> {
    let cx = CURRENT.get()?;
    // SAFETY: see `current`
    let locals = unsafe { cx.as_ref().locals.as_ref() };
    let Ok(mut locals) = locals.try_borrow_mut() else {
        fatal::throw("task state borrowed twice");
    };
    Some(f(&mut locals))
}

/// Like [`with_locals`], for callers that already know they run inside a task.
#[inline(never)]
pub(crate) fn locals<R>(f: impl FnOnce(&mut TaskLocals) -> R) -> R {
    with_locals(f).unwrap_or_else(|| fatal::throw("no current task"))
}

/// Shared access to the current task's local state, for diagnostics. Returns `None` if there is
/// no current task or its state is borrowed.
#[inline(never)]
pub(crate) fn inspect_locals<R>(f: impl FnOnce(&TaskLocals) -> R) -> Option<R> {
    let cx = CURRENT.get()?;
    // SAFETY: see `current`
    let locals = unsafe { cx.as_ref().locals.as_ref() };
    let locals = locals.try_borrow().ok()?;
    Some(f(&locals))
}

/// Hand control back to the worker running the current task.
#[inline(never)]
pub(crate) fn suspend(reason: Suspend) {
    let Some(yielder) = with_locals(|locals| locals.yielder).flatten() else {
        fatal::throw("suspend called outside of a task");
    };
    // SAFETY: the yielder lives at the bottom of this task's own coroutine stack, which is the
    // stack we are running on right now.
    unsafe { yielder.as_ref() }.suspend(reason);
}
