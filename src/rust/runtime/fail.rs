// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::libc::{
    c_int,
    ECANCELED,
    EFAULT,
    EIO,
    ENODATA,
    EPIPE,
    ESHUTDOWN,
    ETIMEDOUT,
};
use ::std::{
    any::Any,
    error,
    fmt,
    io,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Classes of failures that travel through promises.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailKind {
    /// Raised by the body of a task or scheduled task.
    Task,
    /// A scheduled task was canceled before it fired.
    Canceled,
    /// The peer cleanly closed the stream.
    EndOfStream,
    /// Any other error reported by the operating system.
    Io,
    /// The owning scheduler stopped before the task could run to completion.
    SchedulerStopped,
    /// A bounded wait expired.
    TimedOut,
    /// The promise was dropped without ever being set.
    BrokenPromise,
}

/// Failure
#[derive(Clone)]
pub struct Fail {
    /// Class of failure.
    pub kind: FailKind,
    /// Error code.
    pub errno: c_int,
    /// Cause.
    pub cause: String,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

/// Associate Functions for Failures
impl Fail {
    /// Creates a new task failure.
    pub fn new(errno: i32, cause: &str) -> Self {
        Self {
            kind: FailKind::Task,
            errno,
            cause: cause.to_string(),
        }
    }

    /// Creates a failure of a specific kind.
    pub fn with_kind(kind: FailKind, errno: i32, cause: &str) -> Self {
        Self {
            kind,
            errno,
            cause: cause.to_string(),
        }
    }

    pub fn canceled(cause: &str) -> Self {
        Self::with_kind(FailKind::Canceled, ECANCELED, cause)
    }

    pub fn end_of_stream(cause: &str) -> Self {
        Self::with_kind(FailKind::EndOfStream, ENODATA, cause)
    }

    pub fn io(errno: i32, cause: &str) -> Self {
        Self::with_kind(FailKind::Io, errno, cause)
    }

    pub fn scheduler_stopped(cause: &str) -> Self {
        Self::with_kind(FailKind::SchedulerStopped, ESHUTDOWN, cause)
    }

    pub fn timed_out(cause: &str) -> Self {
        Self::with_kind(FailKind::TimedOut, ETIMEDOUT, cause)
    }

    pub fn broken_promise() -> Self {
        Self::with_kind(FailKind::BrokenPromise, EPIPE, "promise dropped before it was set")
    }

    /// Converts the payload of a caught panic into a task failure.
    pub fn from_panic(task_name: &str, payload: Box<dyn Any + Send>) -> Self {
        let message: &str = if let Some(message) = payload.downcast_ref::<&str>() {
            message
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str()
        } else {
            "unknown panic payload"
        };
        let cause: String = format!("task panicked (task_name={:?}): {}", task_name, message);
        Self::new(EFAULT, &cause)
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == FailKind::Canceled
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.kind == FailKind::EndOfStream
    }

    pub fn is_io(&self) -> bool {
        self.kind == FailKind::Io
    }

    pub fn is_scheduler_stopped(&self) -> bool {
        self.kind == FailKind::SchedulerStopped
    }

    pub fn is_timed_out(&self) -> bool {
        self.kind == FailKind::TimedOut
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Display Trait Implementation for Failures
impl fmt::Display for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error {:?}: {:?}", self.kind, self.errno, self.cause)
    }
}

/// Debug trait Implementation for Failures
impl fmt::Debug for Fail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} error {:?}: {:?}", self.kind, self.errno, self.cause)
    }
}

/// Error Trait Implementation for Failures
impl error::Error for Fail {}

/// Conversion Trait Implementation for Fail
impl From<io::Error> for Fail {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Self::end_of_stream(&e.to_string());
        }
        Self::io(e.raw_os_error().unwrap_or(EIO), &e.to_string())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
