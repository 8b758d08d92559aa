// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    sync::Arc,
    thread::{
        self,
        Thread,
    },
    time::Duration,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Wakes a parked scheduler. Callable from any thread.
pub trait Unpark: Send + Sync {
    fn unpark(&self);
}

/// What a scheduler does while it has nothing ready to run.
pub trait Driver {
    /// Blocks for at most `timeout`, or until unparked. `None` blocks until unparked.
    fn park(&mut self, timeout: Option<Duration>) -> Result<(), Fail>;

    /// Returns a handle other threads use to cut [Self::park] short.
    fn unparker(&self) -> Arc<dyn Unpark>;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Parks the OS thread it was created on.
pub struct ThreadDriver {
    thread: Thread,
}

struct ThreadUnparker(Thread);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ThreadDriver {
    /// Creates a driver for the calling thread.
    pub fn new() -> Self {
        Self {
            thread: thread::current(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for ThreadDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for ThreadDriver {
    fn park(&mut self, timeout: Option<Duration>) -> Result<(), Fail> {
        match timeout {
            Some(timeout) => thread::park_timeout(timeout),
            None => thread::park(),
        }
        Ok(())
    }

    fn unparker(&self) -> Arc<dyn Unpark> {
        Arc::new(ThreadUnparker(self.thread.clone()))
    }
}

impl Unpark for ThreadUnparker {
    fn unpark(&self) {
        self.0.unpark();
    }
}
