// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    clock::{
        Clock,
        SystemClock,
    },
    fail::Fail,
    scheduler::{
        driver::{
            Driver,
            ThreadDriver,
        },
        handle::SchedulerHandle,
        scheduler::Scheduler,
    },
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    ops::Deref,
    panic,
    sync::Arc,
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// An OS thread dedicated to running one scheduler. Dropping it shuts the scheduler down and joins the thread.
pub struct SchedulerThread {
    handle: SchedulerHandle,
    thread: Option<JoinHandle<()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedulerThread {
    /// Starts a scheduler thread on the wall clock.
    pub fn new(name: &str) -> Result<Self, Fail> {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    pub fn with_clock(name: &str, clock: Arc<dyn Clock>) -> Result<Self, Fail> {
        Self::with_driver(name, clock, || -> Result<Box<dyn Driver>, Fail> { Ok(Box::new(ThreadDriver::new())) })
    }

    /// Starts a scheduler thread whose driver is built by `make_driver` on the new thread.
    pub fn with_driver<D>(name: &str, clock: Arc<dyn Clock>, make_driver: D) -> Result<Self, Fail>
    where
        D: FnOnce() -> Result<Box<dyn Driver>, Fail> + Send + 'static,
    {
        let (ready_tx, ready_rx): (Sender<Result<SchedulerHandle, Fail>>, Receiver<Result<SchedulerHandle, Fail>>) =
            ::crossbeam_channel::bounded(1);
        let thread_name: String = name.to_string();
        let thread: JoinHandle<()> = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let installed: Result<SchedulerHandle, Fail> =
                    make_driver().and_then(|driver| Scheduler::install_with_driver(&thread_name, clock, driver));
                let handle: SchedulerHandle = match installed {
                    Ok(handle) => handle,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    },
                };
                let _ = ready_tx.send(Ok(handle.clone()));
                Self::run_loop(&thread_name, &handle);
                Scheduler::uninstall();
            })?;

        match ready_rx.recv() {
            Ok(Ok(handle)) => Ok(Self {
                handle,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            },
            Err(_) => {
                let _ = thread.join();
                Err(Fail::new(libc::ECHILD, "scheduler thread exited during startup"))
            },
        }
    }

    /// Runs the scheduler until it is shut down. Errors and panics escaping the loop are logged and the loop restarts.
    fn run_loop(name: &str, handle: &SchedulerHandle) {
        loop {
            match panic::catch_unwind(Scheduler::run) {
                Ok(Ok(())) => break,
                Ok(Err(e)) => error!("run_loop(): scheduler={:?} failed: {:?}", name, e),
                Err(payload) => error!(
                    "run_loop(): scheduler={:?} panicked: {:?}",
                    name,
                    Fail::from_panic(name, payload)
                ),
            }
            if !handle.is_running() {
                break;
            }
            // Persistent driver failures would otherwise spin.
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Waits for the thread to exit. The scheduler must be shut down by someone for this to return.
    pub fn join(mut self) -> Result<(), Fail> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|payload| Fail::from_panic(&self.handle.name(), payload)),
            None => Ok(()),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SchedulerThread {
    type Target = SchedulerHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        let thread: JoinHandle<()> = match self.thread.take() {
            Some(thread) => thread,
            None => return,
        };
        if self.handle.is_current() {
            warn!("drop(): scheduler thread {:?} dropped by itself", self.handle.name());
            return;
        }
        if let Err(e) = self.handle.shutdown() {
            warn!("drop(): failed to shut down {:?}: {:?}", self.handle.name(), e);
        }
        if thread.join().is_err() {
            error!("drop(): scheduler thread {:?} panicked", self.handle.name());
        }
    }
}
