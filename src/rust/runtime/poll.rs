// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    future::Future,
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Suspends the calling fiber for exactly one scheduler iteration.
#[derive(Default)]
pub struct YieldNow {
    yielded: bool,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Hands the thread back to the scheduler. The calling fiber resumes on the next iteration, after every other fiber
/// that was ready ran once.
pub fn yield_now() -> YieldNow {
    YieldNow::default()
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let self_: &mut Self = self.get_mut();
        if self_.yielded {
            return Poll::Ready(());
        }
        self_.yielded = true;
        // Re-queued behind the fibers that are already ready.
        ctx.waker().wake_by_ref();
        Poll::Pending
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
