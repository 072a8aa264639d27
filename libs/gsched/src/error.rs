// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use segstack::StackError;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// [`Runtime::run`](crate::Runtime::run) was already called.
    AlreadyStarted,
    /// The runtime exited, no more tasks can be spawned.
    Exited,
    /// A task's segmented stack could not be set up.
    Stack(StackError),
    /// The machine stack backing a task could not be allocated.
    MachineStack { size: usize, kind: io::ErrorKind },
}

impl From<StackError> for Error {
    fn from(err: StackError) -> Self {
        Self::Stack(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AlreadyStarted => f.write_str("runtime already started"),
            Error::Exited => f.write_str("runtime exited"),
            Error::Stack(err) => write!(f, "task stack: {err}"),
            Error::MachineStack { size, kind } => {
                write!(f, "failed to allocate a {size} byte task stack: {kind}")
            }
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Error::Stack(err) => Some(err),
            _ => None,
        }
    }
}
