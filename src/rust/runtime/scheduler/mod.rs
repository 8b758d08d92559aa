// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod driver;
mod handle;
mod scheduled;
mod scheduler;
mod task;
mod thread;
mod waker;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    driver::{
        Driver,
        ThreadDriver,
        Unpark,
    },
    handle::SchedulerHandle,
    scheduled::{
        ScheduledTask,
        ScheduledTaskWithResult,
    },
    scheduler::Scheduler,
    task::{
        Task,
        TaskId,
        TaskWithResult,
    },
    thread::SchedulerThread,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    promise::PromiseFuture,
};
use ::std::{
    future::Future,
    sync::Arc,
    time::Instant,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Spawns `f` on the scheduler of the calling thread.
pub fn spawn<F, Fut, R>(task_name: &str, f: F) -> Result<PromiseFuture<R>, Fail>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, Fail>> + 'static,
    R: Send + 'static,
{
    Scheduler::current().spawn(task_name, f)
}

/// Schedules `f` on the scheduler of the calling thread.
pub fn schedule<F, Fut, R>(task_name: &str, f: F, fire_time: Instant) -> Result<Arc<ScheduledTaskWithResult<R>>, Fail>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, Fail>> + 'static,
    R: Send + 'static,
{
    Scheduler::current().schedule(task_name, f, fire_time)
}
