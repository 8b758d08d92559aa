// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    promise::PromiseFuture,
    scheduler::{
        Scheduler,
        SchedulerHandle,
        ScheduledTaskWithResult,
    },
};
use ::async_trait::async_trait;
use ::futures::{
    future::FusedFuture,
    FutureExt,
};
use ::std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Future that resolves once the clock of the calling thread's scheduler reaches a deadline. Dropping it cancels the
/// underlying scheduled task.
pub struct Sleep {
    task: Option<Arc<ScheduledTaskWithResult<()>>>,
    state: SleepState,
}

enum SleepState {
    Waiting(PromiseFuture<()>),
    Failed(Fail),
    Done,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the calling fiber for `duration` of scheduler time.
pub fn sleep(duration: Duration) -> Sleep {
    let scheduler: SchedulerHandle = Scheduler::current();
    let deadline: Instant = scheduler.now() + duration;
    Sleep::new(&scheduler, deadline)
}

/// Suspends the calling fiber until the scheduler clock reaches `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::new(&Scheduler::current(), deadline)
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Sleep {
    fn new(scheduler: &SchedulerHandle, deadline: Instant) -> Self {
        let task: Arc<ScheduledTaskWithResult<()>> = match scheduler.schedule("sleep", || async { Ok(()) }, deadline)
        {
            Ok(task) => task,
            Err(e) => {
                return Self {
                    task: None,
                    state: SleepState::Failed(e),
                }
            },
        };
        let state: SleepState = match task.get_result() {
            Ok(future) => SleepState::Waiting(future),
            Err(e) => SleepState::Failed(e),
        };
        Self { task: Some(task), state }
    }
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Provides useful high-level future-related methods.
#[async_trait(?Send)]
pub trait UtilityMethods: Future + FusedFuture + Unpin {
    /// Transforms our current future to include a timeout. We either return the results of the
    /// future finishing or a Timeout error. Whichever happens first. The raced future is left untouched on timeout.
    async fn with_timeout<Timer>(&mut self, timer: Timer) -> Result<Self::Output, Fail>
    where
        Timer: Future<Output = Result<(), Fail>>,
    {
        futures::select! {
            result = self => Ok(result),
            result = timer.fuse() => match result {
                Ok(()) => Err(Fail::timed_out("timer expired")),
                Err(e) => Err(e),
            },
        }
    }
}

// Implement UtilityMethods for any Future that implements Unpin and FusedFuture.
impl<F: ?Sized> UtilityMethods for F where F: Future + Unpin + FusedFuture {}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for Sleep {
    type Output = Result<(), Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        let result: Result<(), Fail> = match &mut self_.state {
            SleepState::Waiting(future) => match Pin::new(future).poll(ctx) {
                Poll::Ready(result) => result,
                Poll::Pending => return Poll::Pending,
            },
            SleepState::Failed(e) => Err(e.clone()),
            SleepState::Done => return Poll::Pending,
        };
        self_.state = SleepState::Done;
        Poll::Ready(result)
    }
}

impl FusedFuture for Sleep {
    fn is_terminated(&self) -> bool {
        matches!(self.state, SleepState::Done)
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            // No effect once fired.
            task.cancel();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
