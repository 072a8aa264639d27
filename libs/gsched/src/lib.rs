// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An M:N task scheduler.
//!
//! Tasks are stackful coroutines, multiplexed onto a pool of worker threads. At most
//! [`Builder::max_workers`] workers execute task code at once; a task that blocks its thread
//! announces it with [`enter_blocking`] / [`exit_blocking`] so another worker can take its
//! place meanwhile. Scheduling is cooperative: tasks switch at [`yield_now`], [`park`], blocking
//! calls and every [`call`] boundary.
//!
//! Each task runs on a segmented stack ([`segstack`]) that [`call`] grows and shrinks, and has
//! Go-style panics: deferred calls registered with [`Frame::defer`] run when their frame returns
//! or panics, and may stop a [`panic`] with [`Frame::recover`].
//!
//! ```no_run
//! let rt = gsched::Runtime::builder().max_workers(4).build();
//! let code = rt.run_main(|_| {
//!     let sema = std::sync::Arc::new(gsched::Semaphore::new(0));
//!     let s = sema.clone();
//!     gsched::spawn(move |_| s.release());
//!     sema.acquire();
//! });
//! assert_eq!(code, Ok(0));
//! ```
//!
//! Fatal errors (unrecovered panics, deadlock, broken scheduler invariants) end the process with
//! a report on stderr, see [`EXIT_PANIC`].

mod config;
mod context;
mod error;
mod fatal;
mod frame;
mod loom;
mod note;
mod panic;
mod profile;
mod runtime;
mod sched;
mod sema;
mod task;
mod word;
mod worker;

pub use config::{Builder, Collector, ENV_MAX_WORKERS, ENV_TRACEBACK};
pub use error::Error;
pub use fatal::{EXIT_PANIC, EXIT_PANIC_DURING_PANIC};
pub use frame::{Frame, Recovered, call};
pub use panic::{PanicValue, goexit, panic};
pub use profile::ProfileFn;
pub use runtime::{
    Runtime, Stats, blocking, current_task, enter_blocking, exit, exit_blocking, help_gc,
    idle_goroutine, lock_os_thread, locked_os_thread, mcount, num_goroutine, park, ready,
    set_cpu_profile_rate, set_max_workers, spawn, spawn_raw, start_the_world, stop_the_world,
    unlock_os_thread, worker_id, yield_now,
};
pub use sema::Semaphore;
pub use task::{GcStackBounds, TaskId, TaskStatus};
pub use word::MAX_WORKERS;
pub use worker::{ThreadStart, WorkerId};

pub use segstack::{Pc, SegmentAllocator, StackPool};
