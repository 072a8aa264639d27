// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task control blocks.
//!
//! A task is split three ways:
//!
//! - [`TaskHeader`] holds the fields other threads read without the scheduler lock (the status
//!   word and the stack snapshot taken when entering a blocking call).
//! - [`TaskSlot`] holds the fields owned by the scheduler, only touched under its lock.
//! - [`Exec`] is the execution state proper: the coroutine, its machine stack and the task-local
//!   state (segmented stack, defer and panic chains). It is owned by whoever runs the task. The
//!   scheduler hands it to a worker when the task is dispatched and gets it back when the task
//!   stops running.

use crate::context::{self, Context};
use crate::frame::Frame;
use crate::panic::{DeferRecord, PanicRecord};
use crate::worker::WorkerId;
use core::cell::RefCell;
use core::fmt;
use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use segstack::{Pc, STACK_GUARD, STACK_MIN, SegmentAllocator, SegmentedStack, StackBounds};
use std::io;
use std::sync::Arc;

/// Identifies a task.
///
/// Task ids are handed out in increasing order and never reused, even though the control block
/// behind a finished task is.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    id: u64,
    slot: usize,
}

/// The lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    /// The control block was just allocated.
    Idle = 0,
    /// On a run queue, waiting for a worker.
    Runnable = 1,
    /// Executing task code on a worker.
    Running = 2,
    /// Executing a blocking call. Still owns its worker but not a running slot.
    Syscall = 3,
    /// Parked until somebody readies it.
    Waiting = 4,
    /// Finished, but its worker hasn't noticed yet.
    Moribund = 5,
    /// Finished and on the free list.
    Dead = 6,
}

/// Stack bounds recorded while a task is in a blocking call, so a collector can scan the
/// stack without stopping the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStackBounds {
    pub sp: usize,
    pub base: usize,
    pub guard: usize,
}

pub(crate) type Entry = Box<dyn FnOnce(&mut Frame) + Send>;

/// Why a task handed control back to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    /// Requeue and let somebody else run.
    Yield,
    /// Wait until readied.
    Park(&'static str),
    /// Leave a blocking call the slow way: the task is requeued once its worker has stopped.
    ExitBlocking,
}

pub(crate) struct TaskHeader {
    status: AtomicU8,
    gc_sp: AtomicUsize,
    gc_base: AtomicUsize,
    gc_guard: AtomicUsize,
}

pub(crate) struct TaskSlot {
    pub(crate) header: Arc<TaskHeader>,
    pub(crate) id: TaskId,
    pub(crate) wait_reason: &'static str,
    /// The worker currently running the task.
    pub(crate) worker: Option<WorkerId>,
    /// Ready the task as soon as its worker has stopped running it.
    pub(crate) ready_on_stop: bool,
    pub(crate) locked_worker: Option<WorkerId>,
    pub(crate) idle_worker: Option<WorkerId>,
    /// Where the task was spawned.
    pub(crate) gopc: Pc,
    /// `None` while a worker runs the task.
    pub(crate) exec: Option<Box<Exec>>,
}

pub(crate) struct Exec {
    coroutine: Option<TaskCoroutine>,
    machine_stack: Option<MachineStack>,
    stack_size: usize,
    pub(crate) locals: Box<RefCell<TaskLocals>>,
}

pub(crate) struct TaskLocals {
    pub(crate) stack: SegmentedStack,
    /// Pending deferred calls, innermost last.
    pub(crate) defers: Vec<DeferRecord>,
    /// Active panics, newest last.
    pub(crate) panics: Vec<PanicRecord>,
    pub(crate) entry: Option<Entry>,
    pub(crate) yielder: Option<NonNull<Yielder<(), Suspend>>>,
}

struct TaskCoroutine(Coroutine<(), Suspend, (), DefaultStack>);
struct MachineStack(DefaultStack);

// SAFETY: A task coroutine is only ever resumed by the worker that currently owns its `Exec`,
// and ownership moves between workers under the scheduler lock. Task code reaches thread-local
// state exclusively through `#[inline(never)]` accessors, so no thread-local address is cached
// across a suspension point.
unsafe impl Send for TaskCoroutine {}
// SAFETY: The stack is plain memory owned by exactly one task.
unsafe impl Send for MachineStack {}
// SAFETY: The yielder pointer is only dereferenced from the task's own coroutine, see above.
unsafe impl Send for TaskLocals {}

// === impl TaskId ===

impl TaskId {
    pub(crate) const fn new(id: u64, slot: usize) -> Self {
        Self { id, slot }
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.id
    }

    pub(crate) const fn slot(self) -> usize {
        self.slot
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

// === impl TaskStatus ===

impl TaskStatus {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Idle,
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Syscall,
            4 => Self::Waiting,
            5 => Self::Moribund,
            _ => Self::Dead,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::Syscall => "syscall",
            Self::Waiting => "waiting",
            Self::Moribund => "moribund",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl TaskHeader ===

impl TaskHeader {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(TaskStatus::Idle as u8),
            gc_sp: AtomicUsize::new(0),
            gc_base: AtomicUsize::new(0),
            gc_guard: AtomicUsize::new(0),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn record_gc_stack(&self, bounds: StackBounds) {
        self.gc_sp.store(bounds.sp, Ordering::Relaxed);
        self.gc_guard.store(bounds.guard, Ordering::Relaxed);
        self.gc_base.store(bounds.base, Ordering::Release);
    }

    pub(crate) fn clear_gc_stack(&self) {
        self.gc_base.store(0, Ordering::Release);
    }

    pub(crate) fn gc_stack(&self) -> Option<GcStackBounds> {
        let base = self.gc_base.load(Ordering::Acquire);
        (base != 0).then(|| GcStackBounds {
            sp: self.gc_sp.load(Ordering::Relaxed),
            base,
            guard: self.gc_guard.load(Ordering::Relaxed),
        })
    }
}

impl fmt::Debug for TaskHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHeader")
            .field("status", &self.status())
            .field("gc_stack", &self.gc_stack())
            .finish()
    }
}

// === impl TaskSlot ===

impl TaskSlot {
    pub(crate) fn new(exec: Exec, slot: usize) -> Self {
        Self {
            header: Arc::new(TaskHeader::new()),
            id: TaskId::new(0, slot),
            wait_reason: "",
            worker: None,
            ready_on_stop: false,
            locked_worker: None,
            idle_worker: None,
            gopc: Pc::NONE,
            exec: Some(Box::new(exec)),
        }
    }

    pub(crate) fn status(&self) -> TaskStatus {
        self.header.status()
    }
}

impl fmt::Debug for TaskSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSlot")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("wait_reason", &self.wait_reason)
            .field("worker", &self.worker)
            .field("ready_on_stop", &self.ready_on_stop)
            .field("locked_worker", &self.locked_worker)
            .field("idle_worker", &self.idle_worker)
            .field("gopc", &self.gopc)
            .finish_non_exhaustive()
    }
}

// === impl Exec ===

impl Exec {
    /// Allocate the execution state of a new task. The machine stack is allocated lazily when
    /// the task is first armed.
    pub(crate) fn new(
        segments: Arc<dyn SegmentAllocator>,
        stack_size: usize,
    ) -> Result<Self, crate::Error> {
        let stack = SegmentedStack::new(segments, STACK_MIN)?;
        Ok(Self {
            coroutine: None,
            machine_stack: None,
            stack_size,
            locals: Box::new(RefCell::new(TaskLocals {
                stack,
                defers: Vec::new(),
                panics: Vec::new(),
                entry: None,
                yielder: None,
            })),
        })
    }

    /// Arm the execution state for a new task: push the entry frame holding `args` and create a
    /// fresh coroutine on the (possibly recycled) machine stack.
    pub(crate) fn prepare(&mut self, entry: Entry, args: &[u8], gopc: Pc) -> Result<(), crate::Error> {
        let locals = self.locals.get_mut();
        debug_assert!(locals.stack.frames().is_empty());
        locals.stack.push_frame(0, args, gopc)?;
        locals.entry = Some(entry);

        let stack = match self.machine_stack.take() {
            Some(MachineStack(stack)) => stack,
            None => DefaultStack::new(self.stack_size).map_err(|err: io::Error| {
                crate::Error::MachineStack {
                    size: self.stack_size,
                    kind: err.kind(),
                }
            })?,
        };
        self.coroutine = Some(TaskCoroutine(Coroutine::with_stack(stack, task_main)));
        Ok(())
    }

    /// Run the task until it suspends or returns.
    ///
    /// `enter` builds the worker's view of the running task; it is installed as the current
    /// context for the duration of the resume.
    pub(crate) fn resume(
        &mut self,
        enter: impl FnOnce(NonNull<RefCell<TaskLocals>>) -> Context,
    ) -> CoroutineResult<Suspend, ()> {
        let Self {
            coroutine, locals, ..
        } = self;
        let Some(TaskCoroutine(coroutine)) = coroutine.as_mut() else {
            crate::fatal::throw("resume of a task without a coroutine");
        };
        let cx = enter(NonNull::from(&**locals));
        context::enter(&cx, || coroutine.resume(()))
    }

    /// Tear down a finished task so the control block can be reused: keep the machine stack for
    /// the next coroutine and release every stack segment but the initial one.
    pub(crate) fn retire(&mut self) -> Result<(), segstack::StackError> {
        if let Some(TaskCoroutine(coroutine)) = self.coroutine.take() {
            if coroutine.done() {
                self.machine_stack = Some(MachineStack(coroutine.into_stack()));
            } else {
                // still suspended somewhere inside task code, see `Drop`
                mem::forget(coroutine);
            }
        }

        let locals = self.locals.get_mut();
        locals.defers.clear();
        locals.panics.clear();
        locals.entry = None;
        locals.yielder = None;
        locals.stack.unwind_to(None)?;
        locals.stack.reset()
    }

    /// Whether the task stack is back to its initial segment, as required for reuse.
    pub(crate) fn stack_is_pristine(&self) -> bool {
        let locals = self.locals.borrow();
        let bounds = locals.stack.bounds();
        bounds.guard - STACK_GUARD == locals.stack.stack0() && locals.stack.frames().is_empty()
    }

    /// The call sites of the task's frames, innermost first. Empty if the task state is
    /// currently borrowed.
    pub(crate) fn frame_pcs(&self) -> Vec<Pc> {
        self.locals
            .try_borrow()
            .map(|locals| locals.frame_pcs())
            .unwrap_or_default()
    }
}

impl Drop for Exec {
    fn drop(&mut self) {
        if let Some(TaskCoroutine(coroutine)) = self.coroutine.take()
            && coroutine.started()
            && !coroutine.done()
        {
            // Dropping a suspended coroutine would unwind it, running task code on whatever
            // thread tears down the runtime. Leak it instead.
            tracing::trace!("leaking suspended task");
            mem::forget(coroutine);
        }
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec")
            .field("armed", &self.coroutine.is_some())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

// === impl TaskLocals ===

impl TaskLocals {
    pub(crate) fn frame_pcs(&self) -> Vec<Pc> {
        self.stack.frames().iter().rev().map(|frame| frame.pc).collect()
    }
}

/// Body of every task coroutine.
fn task_main(yielder: &Yielder<(), Suspend>, _input: ()) {
    let entry = context::with_locals(|locals| {
        locals.yielder = Some(NonNull::from(yielder));
        locals.entry.take()
    })
    .flatten();
    let Some(entry) = entry else {
        crate::fatal::throw("task started without an entry point");
    };

    crate::frame::run_entry(entry);

    // Drop whatever `goexit` or `exit` left behind while we are still running as the task,
    // so no user destructor runs under the scheduler lock.
    let leftovers = context::with_locals(|locals| {
        (mem::take(&mut locals.defers), mem::take(&mut locals.panics))
    });
    drop(leftovers);
}
