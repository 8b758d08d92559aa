// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    reactor::{
        epoll::{
            EpollDriver,
            Reactor,
        },
        operation::{
            Interest,
            IoOperation,
        },
    },
    runtime::{
        clock::SystemClock,
        config::Config,
        fail::Fail,
        logging,
        scheduler::{
            Driver,
            SchedulerHandle,
            SchedulerThread,
        },
    },
};
use ::std::{
    mem,
    os::unix::io::RawFd,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

static RUNTIME: Mutex<Option<Arc<ReactorRuntime>>> = Mutex::new(None);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Process-wide set of reactor threads. Each thread runs a scheduler that parks in its reactor's `epoll_wait`.
pub struct ReactorRuntime {
    reactors: Vec<Arc<Reactor>>,
    handles: Vec<SchedulerHandle>,
    threads: Mutex<Vec<SchedulerThread>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ReactorRuntime {
    /// Returns the runtime, creating it from the environment's configuration on first use.
    pub fn get() -> Result<Arc<Self>, Fail> {
        let mut runtime: MutexGuard<Option<Arc<Self>>> = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(runtime) = runtime.as_ref() {
            return Ok(runtime.clone());
        }
        logging::initialize();
        let config: Config = Config::from_env()?;
        let created: Arc<Self> = Arc::new(Self::new(&config)?);
        *runtime = Some(created.clone());
        Ok(created)
    }

    /// Returns the runtime if one is running, without creating it.
    pub fn try_get() -> Option<Arc<Self>> {
        RUNTIME.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stops every reactor thread and fails the operations still queued on them. Does nothing if no runtime exists.
    /// Must not be called from a reactor thread.
    pub fn cleanup() -> Result<(), Fail> {
        let runtime: Arc<Self> = {
            let mut runtime: MutexGuard<Option<Arc<Self>>> = RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);
            match runtime.as_ref() {
                None => return Ok(()),
                Some(current) if current.handles.iter().any(SchedulerHandle::is_current) => {
                    let cause: &str = "cannot clean up the reactor runtime from one of its threads";
                    error!("cleanup(): {}", cause);
                    return Err(Fail::new(libc::EDEADLK, cause));
                },
                Some(_) => (),
            }
            match runtime.take() {
                Some(runtime) => runtime,
                None => return Ok(()),
            }
        };
        runtime.stop();
        Ok(())
    }

    pub fn new(config: &Config) -> Result<Self, Fail> {
        let nthreads: usize = config.reactor_threads()?;
        let batch_size: usize = config.epoll_batch_size()?;
        let max_park: Duration = config.max_park()?;

        let mut reactors: Vec<Arc<Reactor>> = Vec::with_capacity(nthreads);
        let mut handles: Vec<SchedulerHandle> = Vec::with_capacity(nthreads);
        let mut threads: Vec<SchedulerThread> = Vec::with_capacity(nthreads);
        for i in 0..nthreads {
            let reactor: Arc<Reactor> = Arc::new(Reactor::new(i, batch_size, max_park)?);
            let driver_reactor: Arc<Reactor> = reactor.clone();
            // Threads started so far are shut down and joined when `threads` is dropped on error.
            let thread: SchedulerThread =
                SchedulerThread::with_driver(&format!("reactor{}", i), Arc::new(SystemClock), move || {
                    Ok(Box::new(EpollDriver::new(driver_reactor)) as Box<dyn Driver>)
                })?;
            reactors.push(reactor);
            handles.push(thread.handle());
            threads.push(thread);
        }

        info!(
            "new(): reactor runtime started (threads={:?}, batch_size={:?}, max_park={:?})",
            nthreads, batch_size, max_park
        );
        Ok(Self {
            reactors,
            handles,
            threads: Mutex::new(threads),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.reactors.len()
    }

    /// Reactor that watches `fd`.
    pub fn reactor_for(&self, fd: RawFd) -> &Arc<Reactor> {
        &self.reactors[fd.unsigned_abs() as usize % self.reactors.len()]
    }

    /// Scheduler of the reactor thread that watches `fd`.
    pub fn scheduler_for(&self, fd: RawFd) -> SchedulerHandle {
        self.handles[fd.unsigned_abs() as usize % self.handles.len()].clone()
    }

    pub fn submit(&self, fd: RawFd, interest: Interest, operation: Box<dyn IoOperation>) {
        self.reactor_for(fd).submit(fd, interest, operation);
    }

    /// Cancels the operations queued on `fd`. See [Reactor::cancel].
    pub fn cancel(&self, fd: RawFd) -> usize {
        self.reactor_for(fd).cancel(fd)
    }

    fn stop(&self) {
        let threads: Vec<SchedulerThread> = mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for thread in threads {
            if let Err(e) = thread.shutdown() {
                warn!("stop(): failed to shut down {:?}: {:?}", thread.name(), e);
            }
            let name: String = thread.name();
            if let Err(e) = thread.join() {
                error!("stop(): reactor thread {:?} failed: {:?}", name, e);
            }
        }
        for reactor in &self.reactors {
            reactor.shutdown(Fail::canceled("reactor runtime was cleaned up"));
        }
        info!("stop(): reactor runtime stopped");
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
