// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod clock;
pub mod config;
pub mod fail;
pub mod logging;
pub mod memory;
pub mod poll;
pub mod promise;
pub mod scheduler;
pub mod signal;
pub mod timer;

pub use self::{
    poll::yield_now,
    scheduler::{
        schedule,
        spawn,
    },
    timer::{
        sleep,
        sleep_until,
        UtilityMethods,
    },
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns true if `errno` means that a non-blocking operation could not complete yet and has to be retried once the
/// descriptor is ready.
pub fn should_retry(errno: i32) -> bool {
    errno == libc::EINPROGRESS || errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EALREADY
}
