// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::Unpark;
use ::std::{
    sync::{
        Arc,
        Mutex,
        PoisonError,
        Weak,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Source of time for a scheduler. Fire times of scheduled tasks are measured against it.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Registers a scheduler that must be unparked whenever time moves other than in real time.
    fn subscribe(&self, _unparker: Arc<dyn Unpark>) {}
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Wall clock.
#[derive(Default)]
pub struct SystemClock;

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<Instant>,
    /// Schedulers that went away are dropped on the next notification.
    subscribers: Mutex<Vec<Weak<dyn Unpark>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            *now += duration;
        }
        self.notify();
    }

    /// Moves the clock to `when`. The clock never goes backwards.
    pub fn set(&self, when: Instant) {
        {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            if when > *now {
                *now = when;
            }
        }
        self.notify();
    }

    /// Number of subscribers still alive.
    pub fn num_subscribers(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|unparker| unparker.strong_count() > 0)
            .count()
    }

    fn notify(&self) {
        let subscribers: Vec<Arc<dyn Unpark>> = {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
            subscribers.retain(|unparker| unparker.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        for unparker in subscribers {
            unparker.unpark();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, unparker: Arc<dyn Unpark>) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&unparker));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
