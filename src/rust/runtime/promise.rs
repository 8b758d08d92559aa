// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-assignment result channel between a setter and the one future that reads it.
//!
//! The setter may live on any OS thread. Fulfilling a [Promise] only wakes the waker registered by the last poll of its
//! [PromiseFuture], the owning scheduler decides when the waiting fiber actually resumes.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    scheduler::Scheduler,
};
use ::futures::future::FusedFuture;
use ::std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    task::{
        Context,
        Poll,
        Waker,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

struct State<T> {
    /// Delivered result, until the future takes it.
    result: Option<Result<T, Fail>>,
    /// Set once a result was delivered. Never cleared.
    fulfilled: bool,
    /// Waker of the last poll.
    waker: Option<Waker>,
    /// Cleared when the future is dropped.
    observed: bool,
}

struct Slot<T> {
    state: Mutex<State<T>>,
}

/// Write side of a promise/future pair.
pub struct Promise<T> {
    slot: Arc<Slot<T>>,
}

/// Read side of a promise/future pair.
pub struct PromiseFuture<T> {
    slot: Arc<Slot<T>>,
    done: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates a connected promise/future pair.
pub fn promise<T>() -> (Promise<T>, PromiseFuture<T>) {
    let slot: Arc<Slot<T>> = Arc::new(Slot {
        state: Mutex::new(State {
            result: None,
            fulfilled: false,
            waker: None,
            observed: true,
        }),
    });
    (
        Promise { slot: slot.clone() },
        PromiseFuture { slot, done: false },
    )
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> Slot<T> {
    fn lock(&self) -> MutexGuard<State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Promise<T> {
    /// Delivers `result`. Only the first call has an effect, later calls are rejected with `EALREADY`.
    pub fn set(&self, result: Result<T, Fail>) -> Result<(), Fail> {
        let waker: Option<Waker> = {
            let mut state: MutexGuard<State<T>> = self.slot.lock();
            if state.fulfilled {
                warn!("set(): promise already fulfilled");
                return Err(Fail::new(libc::EALREADY, "promise already fulfilled"));
            }
            if !state.observed {
                if let Err(e) = &result {
                    warn!("set(): nobody is waiting for this failure: {:?}", e);
                }
            }
            state.result = Some(result);
            state.fulfilled = true;
            state.waker.take()
        };
        // Wake outside the lock, the waker may hand off to another thread.
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    pub fn set_value(&self, value: T) -> Result<(), Fail> {
        self.set(Ok(value))
    }

    pub fn set_error(&self, cause: Fail) -> Result<(), Fail> {
        self.set(Err(cause))
    }

    /// Returns true if a result was already delivered.
    pub fn is_set(&self) -> bool {
        self.slot.lock().fulfilled
    }
}

impl<T> PromiseFuture<T> {
    /// Creates a future that is already resolved with `result`.
    pub fn ready(result: Result<T, Fail>) -> Self {
        let (promise, future): (Promise<T>, PromiseFuture<T>) = promise();
        let _ = promise.set(result);
        future
    }

    /// Returns true if the result is available. Does not consume it.
    pub fn is_ready(&self) -> bool {
        self.slot.lock().result.is_some()
    }

    /// Blocks the calling context until the result is available by driving the calling thread's scheduler.
    pub fn wait(self) -> Result<T, Fail> {
        Scheduler::block_on(self)?
    }

    /// Like [Self::wait] but gives up after `timeout`. On expiry returns `Ok(None)` and leaves this future pending.
    pub fn wait_for(&mut self, timeout: Duration) -> Result<Option<T>, Fail> {
        match Scheduler::block_on_timeout(self, timeout)? {
            Some(result) => result.map(Some),
            None => Ok(None),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, Fail>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if self_.done {
            return Poll::Pending;
        }
        let mut state: MutexGuard<State<T>> = self_.slot.lock();
        match state.result.take() {
            Some(result) => {
                state.waker = None;
                drop(state);
                self_.done = true;
                Poll::Ready(result)
            },
            None => {
                match &state.waker {
                    Some(waker) if waker.will_wake(ctx.waker()) => (),
                    _ => state.waker = Some(ctx.waker().clone()),
                }
                Poll::Pending
            },
        }
    }
}

impl<T> FusedFuture for PromiseFuture<T> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Unpin for PromiseFuture<T> {}

impl<T> Drop for PromiseFuture<T> {
    fn drop(&mut self) {
        let mut state: MutexGuard<State<T>> = self.slot.lock();
        state.observed = false;
        state.waker = None;
    }
}

/// A promise that was never fulfilled breaks its future.
impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        let waker: Option<Waker> = {
            let mut state: MutexGuard<State<T>> = self.slot.lock();
            if state.fulfilled {
                return;
            }
            trace!("drop(): breaking unfulfilled promise");
            state.result = Some(Err(Fail::broken_promise()));
            state.fulfilled = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
