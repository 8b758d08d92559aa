// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::cofiber::{
    runtime::clock::ManualClock,
    Scheduler,
    SchedulerHandle,
};
use ::std::sync::Arc;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Installs a scheduler on a manual clock for the calling test thread.
#[allow(dead_code)]
pub fn manual_scheduler(name: &str) -> anyhow::Result<(Arc<ManualClock>, SchedulerHandle)> {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::default());
    let handle: SchedulerHandle = Scheduler::install(name, clock.clone())?;
    Ok((clock, handle))
}

/// Runs `iterations` scheduler iterations on the calling thread.
#[allow(dead_code)]
pub fn drive(iterations: usize) -> anyhow::Result<()> {
    for _ in 0..iterations {
        Scheduler::poll()?;
    }
    Ok(())
}
