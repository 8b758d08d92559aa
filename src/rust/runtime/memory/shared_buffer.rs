// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Reference-counted byte buffer. Every pending I/O operation issued against it holds one handle, so the bytes stay
/// alive until the operation completes even if the issuer drops its own handle.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedBuffer {
    /// Creates a zero-filled buffer.
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copies the contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.lock())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.lock())
    }

    /// Number of live handles, including those held by pending operations.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    fn lock(&self) -> MutexGuard<Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<Vec<u8>> for SharedBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }
}

impl From<&[u8]> for SharedBuffer {
    fn from(bytes: &[u8]) -> Self {
        Self::from(bytes.to_vec())
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("handles", &self.handle_count())
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
