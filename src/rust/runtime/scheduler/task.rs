// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    promise::Promise,
};
use ::futures::FutureExt;
use ::std::{
    future::Future,
    panic::{
        self,
        AssertUnwindSafe,
    },
    pin::Pin,
    sync::Arc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Externally visible task identifier.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct TaskId(pub u64);

/// A started task, as the scheduler stores it.
pub type FiberFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Fails the promise of a started task that will never finish.
pub type AbortHandle = Box<dyn FnOnce(Fail)>;

type Coroutine<R> = Pin<Box<dyn Future<Output = Result<R, Fail>>>>;

type Factory<R> = Box<dyn FnOnce() -> Coroutine<R> + Send>;

/// Single-shot unit of work. Travels to the owning thread, where it is started exactly once or aborted.
pub trait Task: Send {
    fn get_name(&self) -> String;
    fn get_id(&self) -> TaskId;
    /// Turns the task into a fiber. The closure runs on the first poll of the returned future.
    fn start(self: Box<Self>) -> (FiberFuture, AbortHandle);
    /// Fails the task without running it.
    fn abort(self: Box<Self>, cause: Fail);
}

/// A specific instance of Task that returns a particular return type [R].
pub struct TaskWithResult<R: Send + 'static> {
    /// Task name, for diagnostics.
    name: String,
    /// Task identifier.
    task_id: TaskId,
    /// Builds the coroutine on the owning thread.
    factory: Factory<R>,
    /// Receives the outcome of the coroutine.
    promise: Promise<R>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<R: Send + 'static> TaskWithResult<R> {
    /// Instantiates a new Task.
    pub fn new<F, Fut>(name: &str, task_id: TaskId, f: F, promise: Promise<R>) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, Fail>> + 'static,
    {
        Self {
            name: name.to_string(),
            task_id,
            factory: Box::new(move || -> Coroutine<R> { Box::pin(f()) }),
            promise,
        }
    }

    /// Delivers `cause` without running the task.
    pub fn fail(self, cause: Fail) {
        if let Err(e) = self.promise.set(Err(cause)) {
            warn!("fail(): name={:?}, id={:?}: {:?}", self.name, self.task_id, e);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for TaskId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TaskId> for u64 {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl<R: Send + 'static> Task for TaskWithResult<R> {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn get_id(&self) -> TaskId {
        self.task_id
    }

    fn start(self: Box<Self>) -> (FiberFuture, AbortHandle) {
        let TaskWithResult {
            name,
            task_id,
            factory,
            promise,
        } = *self;
        let promise: Arc<Promise<R>> = Arc::new(promise);
        let abort_promise: Arc<Promise<R>> = promise.clone();

        let fiber: FiberFuture = Box::pin(async move {
            trace!("start(): name={:?}, id={:?}", name, task_id);
            // Panics in the closure or in the coroutine become failures of this task.
            let result: Result<R, Fail> = match panic::catch_unwind(AssertUnwindSafe(factory)) {
                Ok(coroutine) => match AssertUnwindSafe(coroutine).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(Fail::from_panic(&name, payload)),
                },
                Err(payload) => Err(Fail::from_panic(&name, payload)),
            };
            trace!("finish(): name={:?}, id={:?}, ok={:?}", name, task_id, result.is_ok());
            let _ = promise.set(result);
        });
        let abort: AbortHandle = Box::new(move |cause: Fail| {
            let _ = abort_promise.set(Err(cause));
        });

        (fiber, abort)
    }

    fn abort(self: Box<Self>, cause: Fail) {
        trace!("abort(): name={:?}, id={:?}", self.name, self.task_id);
        self.fail(cause);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        AbortHandle,
        FiberFuture,
        Task,
        TaskId,
        TaskWithResult,
    };
    use crate::runtime::{
        fail::{
            Fail,
            FailKind,
        },
        promise::{
            promise,
            Promise,
            PromiseFuture,
        },
    };
    use ::anyhow::Result;
    use ::futures::task::noop_waker_ref;
    use ::std::{
        future::Future,
        pin::Pin,
        task::{
            Context,
            Poll,
        },
    };

    async fn explode() -> Result<u32, Fail> {
        panic!("task exploded")
    }

    fn poll_to_completion(mut fiber: FiberFuture) -> Result<()> {
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        match fiber.as_mut().poll(&mut ctx) {
            Poll::Ready(()) => Ok(()),
            Poll::Pending => anyhow::bail!("fiber should complete in one poll"),
        }
    }

    fn take(mut future: PromiseFuture<u32>) -> Result<Result<u32, Fail>> {
        let mut ctx: Context = Context::from_waker(noop_waker_ref());
        match Pin::new(&mut future).poll(&mut ctx) {
            Poll::Ready(result) => Ok(result),
            Poll::Pending => anyhow::bail!("result should be available"),
        }
    }

    #[test]
    fn task_delivers_value() -> Result<()> {
        let (promise, future): (Promise<u32>, PromiseFuture<u32>) = promise();
        let task: Box<dyn Task> = Box::new(TaskWithResult::new("value", TaskId(1), || async { Ok(7) }, promise));
        crate::ensure_eq!(task.get_name(), "value".to_string());
        crate::ensure_eq!(task.get_id(), TaskId(1));
        let (fiber, _abort): (FiberFuture, AbortHandle) = task.start();
        poll_to_completion(fiber)?;
        crate::ensure_eq!(take(future)?.map_err(|e| e.errno), Ok(7));
        Ok(())
    }

    #[test]
    fn task_panic_is_captured() -> Result<()> {
        let (promise, future): (Promise<u32>, PromiseFuture<u32>) = promise();
        let task: Box<dyn Task> = Box::new(TaskWithResult::new("panics", TaskId(2), explode, promise));
        let (fiber, _abort): (FiberFuture, AbortHandle) = task.start();
        poll_to_completion(fiber)?;
        match take(future)? {
            Err(e) => {
                crate::ensure_eq!(e.kind, FailKind::Task);
                crate::ensure_eq!(e.cause.contains("task exploded"), true);
            },
            Ok(_) => anyhow::bail!("panic should have failed the task"),
        }
        Ok(())
    }

    #[test]
    fn aborted_task_never_runs() -> Result<()> {
        let (promise, future): (Promise<u32>, PromiseFuture<u32>) = promise();
        let task: Box<dyn Task> = Box::new(TaskWithResult::new("aborted", TaskId(3), explode, promise));
        task.abort(Fail::scheduler_stopped("stopped"));
        crate::ensure_eq!(take(future)?.map_err(|e| e.kind), Err(FailKind::SchedulerStopped));
        Ok(())
    }
}
