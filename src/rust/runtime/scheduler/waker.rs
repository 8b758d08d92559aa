// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::{
    handle::{
        Message,
        SchedulerShared,
    },
    task::TaskId,
};
use ::futures::task::ArcWake;
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Waker of a fiber. Waking never resumes the fiber directly, it posts a message to the owning scheduler.
pub struct FiberWaker {
    shared: Arc<SchedulerShared>,
    /// Slab slot of the fiber.
    key: usize,
    /// Identifier of the fiber, guards against a reused slot.
    id: TaskId,
    /// Set between a wake and the next poll, so repeated wakes post a single message.
    notified: AtomicBool,
}

/// Waker of the root future driven by [crate::runtime::scheduler::Scheduler::block_on].
pub struct RootWaker {
    shared: Arc<SchedulerShared>,
    notified: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FiberWaker {
    pub fn new(shared: Arc<SchedulerShared>, key: usize, id: TaskId) -> Self {
        Self {
            shared,
            key,
            id,
            notified: AtomicBool::new(false),
        }
    }

    /// Re-arms the waker. Called right before the fiber is polled.
    pub fn reset(&self) {
        self.notified.store(false, Ordering::SeqCst);
    }
}

impl RootWaker {
    /// The root future is polled once before anything wakes it.
    pub fn new(shared: Arc<SchedulerShared>) -> Self {
        Self {
            shared,
            notified: AtomicBool::new(true),
        }
    }

    pub fn take_notified(&self) -> bool {
        self.notified.swap(false, Ordering::SeqCst)
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl ArcWake for FiberWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.notified.swap(true, Ordering::SeqCst) {
            arc_self.shared.send(Message::Wake(arc_self.key, arc_self.id));
        }
    }
}

impl ArcWake for RootWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.notified.store(true, Ordering::SeqCst);
        if thread::current().id() != arc_self.shared.owner() {
            arc_self.shared.unpark();
        }
    }
}
