// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    clock::Clock,
    fail::Fail,
    promise::{
        promise,
        Promise,
        PromiseFuture,
    },
    scheduler::{
        scheduled::{
            ScheduledTask,
            ScheduledTaskWithResult,
        },
        scheduler::Scheduler,
        task::{
            Task,
            TaskId,
            TaskWithResult,
        },
        Unpark,
    },
};
use ::crossbeam_channel::Sender;
use ::std::{
    fmt,
    future::Future,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    thread::{
        self,
        ThreadId,
    },
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Position of a scheduled task in the timer set: fire time, then registration order.
pub type TimerKey = (Instant, u64);

/// Inbox message of a scheduler.
pub enum Message {
    /// Start a task.
    Spawn(Box<dyn Task>),
    /// Mark the fiber in a slab slot ready. Ignored if the slot now holds another fiber.
    Wake(usize, TaskId),
    /// Add a scheduled task to the timer set.
    Schedule(Arc<dyn ScheduledTask>),
    /// Remove a canceled scheduled task from the timer set.
    Unschedule(TimerKey),
    /// Stop the scheduler.
    Shutdown,
}

/// State of a scheduler that other threads may touch.
pub struct SchedulerShared {
    name: Mutex<String>,
    /// Thread that owns the scheduler.
    owner: ThreadId,
    /// False for schedulers that were created implicitly, which cannot be quit by another thread.
    joinable: bool,
    clock: Arc<dyn Clock>,
    sender: Sender<Message>,
    unparker: Arc<dyn Unpark>,
    /// Cleared once shutdown begins. Spawns check it and enqueue under the same lock.
    accepting: Mutex<bool>,
    /// Set after every pending task was failed.
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
    next_id: AtomicU64,
}

/// Thread-safe handle to a scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SchedulerShared {
    pub fn new(
        name: &str,
        joinable: bool,
        clock: Arc<dyn Clock>,
        sender: Sender<Message>,
        unparker: Arc<dyn Unpark>,
    ) -> Self {
        Self {
            name: Mutex::new(name.to_string()),
            owner: thread::current().id(),
            joinable,
            clock,
            sender,
            unparker,
            accepting: Mutex::new(true),
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn unpark(&self) {
        self.unparker.unpark();
    }

    /// Posts a message that is not subject to shutdown. Returns false if the scheduler is gone.
    pub fn send(&self, message: Message) -> bool {
        if self.sender.send(message).is_err() {
            return false;
        }
        self.unpark_if_foreign();
        true
    }

    /// Posts work, failing once shutdown has begun.
    fn submit(&self, message: Message) -> Result<(), Fail> {
        {
            let accepting: MutexGuard<bool> = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
            if !*accepting || self.sender.send(message).is_err() {
                let cause: String = format!("scheduler {:?} is shutting down", self.name());
                return Err(Fail::scheduler_stopped(&cause));
            }
        }
        self.unpark_if_foreign();
        Ok(())
    }

    /// The owning thread picks up its own messages on its next iteration.
    fn unpark_if_foreign(&self) {
        if thread::current().id() != self.owner {
            self.unparker.unpark();
        }
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops accepting work. Returns true if this call did it.
    pub fn close(&self) -> bool {
        let mut accepting: MutexGuard<bool> = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
        let was_accepting: bool = *accepting;
        *accepting = false;
        was_accepting
    }

    pub fn mark_stopped(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.stopped_cv.notify_all();
    }

    fn wait_stopped(&self) {
        let mut stopped: MutexGuard<bool> = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            stopped = self.stopped_cv.wait(stopped).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl SchedulerHandle {
    pub fn new(shared: Arc<SchedulerShared>) -> Self {
        Self { shared }
    }

    /// Submits `f` to run as a fiber of this scheduler. The closure is moved to the owning thread and called there.
    pub fn spawn<F, Fut, R>(&self, task_name: &str, f: F) -> Result<PromiseFuture<R>, Fail>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, Fail>> + 'static,
        R: Send + 'static,
    {
        let (promise, future): (Promise<R>, PromiseFuture<R>) = promise();
        let task_id: TaskId = self.shared.next_id();
        let task: TaskWithResult<R> = TaskWithResult::new(task_name, task_id, f, promise);
        self.shared.submit(Message::Spawn(Box::new(task)))?;
        trace!(
            "spawn(): scheduler={:?}, task_name={:?}, id={:?}",
            self.shared.name(),
            task_name,
            task_id
        );
        Ok(future)
    }

    /// Registers `f` to run once the clock of this scheduler reaches `fire_time`.
    pub fn schedule<F, Fut, R>(
        &self,
        task_name: &str,
        f: F,
        fire_time: Instant,
    ) -> Result<Arc<ScheduledTaskWithResult<R>>, Fail>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, Fail>> + 'static,
        R: Send + 'static,
    {
        let task_id: TaskId = self.shared.next_id();
        let task: Arc<ScheduledTaskWithResult<R>> = Arc::new(ScheduledTaskWithResult::new(
            task_name,
            task_id,
            fire_time,
            Arc::downgrade(&self.shared),
            f,
        ));
        self.shared.submit(Message::Schedule(task.clone()))?;
        trace!(
            "schedule(): scheduler={:?}, task_name={:?}, id={:?}",
            self.shared.name(),
            task_name,
            task_id
        );
        Ok(task)
    }

    /// Stops the scheduler and fails every task it still holds with a scheduler-stopped error.
    ///
    /// From another thread this blocks until all of them were failed. From the owning thread it only flags
    /// termination when called by a running fiber, the scheduler stops at the end of the current iteration.
    pub fn shutdown(&self) -> Result<(), Fail> {
        let on_owner: bool = self.is_current();
        if !on_owner && !self.shared.joinable {
            let cause: String = format!("scheduler {:?} was created implicitly by its thread", self.shared.name());
            warn!("shutdown(): {}", cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        if self.shared.close() {
            debug!("shutdown(): scheduler={:?}", self.shared.name());
        }
        self.shared.send(Message::Shutdown);
        if on_owner {
            Scheduler::stop_local(&self.shared);
            return Ok(());
        }
        self.shared.wait_stopped();
        Ok(())
    }

    pub fn name(&self) -> String {
        self.shared.name()
    }

    /// Sets the diagnostic label.
    pub fn set_name(&self, name: &str) {
        *self.shared.name.lock().unwrap_or_else(PoisonError::into_inner) = name.to_string();
    }

    /// Returns true until shutdown begins.
    pub fn is_running(&self) -> bool {
        self.shared.is_accepting()
    }

    /// Returns true if the calling thread owns this scheduler.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("name", &self.shared.name())
            .field("running", &self.is_running())
            .finish()
    }
}

impl PartialEq for SchedulerHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for SchedulerHandle {}
