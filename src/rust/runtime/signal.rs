// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

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
    timer::{
        sleep,
        UtilityMethods,
    },
};
use ::slab::Slab;
use ::std::{
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

type Slot<T> = Arc<dyn Fn(T) + Send + Sync>;

type Slots<T> = Mutex<Slab<Slot<T>>>;

/// Broadcasts values to every connected slot.
pub struct Signal<T: Clone + Send + 'static> {
    slots: Arc<Slots<T>>,
}

/// Keeps a slot connected. Dropping it disconnects the slot.
pub struct Connection<T: Clone + Send + 'static> {
    slots: Weak<Slots<T>>,
    key: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: Clone + Send + 'static> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slab::new())),
        }
    }

    /// Connects `slot`. It is called on the emitting thread for every emission until the connection is dropped.
    pub fn connect<F>(&self, slot: F) -> Connection<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let key: usize = self.lock().insert(Arc::new(slot));
        Connection {
            slots: Arc::downgrade(&self.slots),
            key: Some(key),
        }
    }

    /// Calls every connected slot with a copy of `value`.
    pub fn emit(&self, value: T) {
        // Slots may connect or disconnect while running.
        let slots: Vec<Slot<T>> = self.lock().iter().map(|(_, slot)| slot.clone()).collect();
        for slot in slots {
            slot(value.clone());
        }
    }

    pub fn num_slots(&self) -> usize {
        self.lock().len()
    }

    /// Suspends the calling fiber until the next emission, or fails with a timed-out error after `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<T, Fail> {
        let (promise, mut future): (Promise<T>, PromiseFuture<T>) = promise();
        let promise: Mutex<Option<Promise<T>>> = Mutex::new(Some(promise));
        let _connection: Connection<T> = self.connect(move |value: T| {
            if let Some(promise) = promise.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = promise.set_value(value);
            }
        });
        future.with_timeout(sleep(timeout)).await?
    }

    fn lock(&self) -> MutexGuard<Slab<Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone + Send + 'static> Connection<T> {
    /// Disconnects the slot. Returns false if it was already disconnected.
    pub fn disconnect(&mut self) -> bool {
        let key: usize = match self.key.take() {
            Some(key) => key,
            None => return false,
        };
        match self.slots.upgrade() {
            Some(slots) => {
                let removed: Option<Slot<T>> = slots.lock().unwrap_or_else(PoisonError::into_inner).try_remove(key);
                removed.is_some()
            },
            None => false,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Drop for Connection<T> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
