// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deferred tasks with exactly-once firing.
//!
//! A scheduled task leaves the pending state exactly once, either because its scheduler reached the fire time or
//! because somebody canceled it. Both paths race on a single atomic exchange of the `executed` flag and the loser
//! backs off without touching anything else.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    promise::{
        promise,
        Promise,
        PromiseFuture,
    },
    scheduler::{
        handle::{
            Message,
            SchedulerShared,
            TimerKey,
        },
        task::{
            Task,
            TaskId,
            TaskWithResult,
        },
    },
};
use ::std::{
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Mutex,
        PoisonError,
        Weak,
    },
    time::Instant,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Type-erased view of a scheduled task, as kept in a scheduler's timer set.
pub trait ScheduledTask: Send + Sync {
    fn get_name(&self) -> String;
    /// Position in the timer set. Equal fire times are ordered by registration.
    fn get_key(&self) -> TimerKey;
    /// Attempts to leave the pending state on behalf of the timer loop. Returns the task to run if this call won.
    fn fire(&self) -> Option<Box<dyn Task>>;
    /// Attempts to leave the pending state by failing the task with `cause`. Returns true if this call won.
    fn abort(&self, cause: Fail) -> bool;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduled task producing a value of type [R].
pub struct ScheduledTaskWithResult<R: Send + 'static> {
    name: String,
    id: TaskId,
    fire_time: Instant,
    /// Set by whichever of firing and cancellation happens first.
    executed: AtomicBool,
    /// Owning scheduler. Does not keep it alive.
    scheduler: Weak<SchedulerShared>,
    /// Only touched by the winner of the race on `executed`.
    task: Mutex<Option<TaskWithResult<R>>>,
    result: Mutex<Option<PromiseFuture<R>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<R: Send + 'static> ScheduledTaskWithResult<R> {
    pub(crate) fn new<F, Fut>(name: &str, id: TaskId, fire_time: Instant, scheduler: Weak<SchedulerShared>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, Fail>> + 'static,
    {
        let (promise, future): (Promise<R>, PromiseFuture<R>) = promise();
        Self {
            name: name.to_string(),
            id,
            fire_time,
            executed: AtomicBool::new(false),
            scheduler,
            task: Mutex::new(Some(TaskWithResult::new(name, id, f, promise))),
            result: Mutex::new(Some(future)),
        }
    }

    /// Takes the future bound to the outcome of this task. Can only be taken once.
    pub fn get_result(&self) -> Result<PromiseFuture<R>, Fail> {
        match self.result.lock().unwrap_or_else(PoisonError::into_inner).take() {
            Some(future) => Ok(future),
            None => Err(Fail::new(libc::EALREADY, "result of scheduled task already taken")),
        }
    }

    /// Cancels the task. Returns true if and only if this call moved the task from pending to canceled.
    pub fn cancel(&self) -> bool {
        let cause: Fail = Fail::canceled(&format!("scheduled task canceled (name={:?})", self.name));
        if !self.resolve(cause) {
            return false;
        }
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.send(Message::Unschedule(self.get_key()));
        }
        debug!("cancel(): name={:?}, id={:?}", self.name, self.id);
        true
    }

    pub fn get_fire_time(&self) -> Instant {
        self.fire_time
    }

    /// Returns true once the task fired or was canceled.
    pub fn is_resolved(&self) -> bool {
        self.executed.load(Ordering::SeqCst)
    }

    /// Single transition out of the pending state.
    fn try_execute(&self) -> Option<TaskWithResult<R>> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn resolve(&self, cause: Fail) -> bool {
        match self.try_execute() {
            Some(task) => {
                task.fail(cause);
                true
            },
            None => false,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<R: Send + 'static> ScheduledTask for ScheduledTaskWithResult<R> {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn get_key(&self) -> TimerKey {
        (self.fire_time, self.id.into())
    }

    fn fire(&self) -> Option<Box<dyn Task>> {
        let task: TaskWithResult<R> = self.try_execute()?;
        trace!("fire(): name={:?}, id={:?}", self.name, self.id);
        Some(Box::new(task))
    }

    fn abort(&self, cause: Fail) -> bool {
        self.resolve(cause)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
