// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Implementation of our cooperative, single-threaded fiber scheduler.
//!
//! Every OS thread has at most one scheduler, reachable through a thread-local. Fibers live in a [Slab] and are only
//! ever polled by the owning thread. Everything else (spawning from other threads, waking a fiber, registering and
//! canceling scheduled tasks) arrives through the inbox, so a fiber woken by another thread is marked ready here and
//! resumed on a later iteration.

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
        handle::{
            Message,
            SchedulerHandle,
            SchedulerShared,
            TimerKey,
        },
        scheduled::ScheduledTask,
        task::{
            AbortHandle,
            FiberFuture,
            Task,
            TaskId,
        },
        waker::{
            FiberWaker,
            RootWaker,
        },
    },
};
use ::crossbeam_channel::Receiver;
use ::slab::Slab;
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    collections::{
        BTreeMap,
        VecDeque,
    },
    future::Future,
    mem,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{
        Context,
        Poll,
        Waker,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Thread Local Storage
//======================================================================================================================

thread_local! {
    /// Scheduler of the calling thread.
    static THREAD_SCHEDULER: RefCell<Option<Rc<Scheduler>>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// A fiber and the bookkeeping the scheduler keeps for it.
struct FiberSlot {
    id: TaskId,
    name: String,
    /// Taken out while the fiber is being polled.
    future: Option<FiberFuture>,
    abort: Option<AbortHandle>,
    waker: Arc<FiberWaker>,
    /// Set while the slot sits in the ready queue.
    queued: bool,
}

#[derive(Default)]
struct SchedulerState {
    fibers: Slab<FiberSlot>,
    ready: VecDeque<usize>,
    timers: BTreeMap<TimerKey, Arc<dyn ScheduledTask>>,
}

/// Task Scheduler
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    inbox: Receiver<Message>,
    driver: RefCell<Box<dyn Driver>>,
    state: RefCell<SchedulerState>,
    /// Set while an iteration runs. Fibers that try to drive the scheduler themselves are rejected.
    ticking: Cell<bool>,
    /// Shutdown was requested and will be carried out at the end of the current iteration.
    stopping: Cell<bool>,
    stopped: Cell<bool>,
}

/// Clears the ticking flag even if an iteration unwinds.
struct TickGuard<'a>(&'a Cell<bool>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FiberSlot {
    /// Fails the promise of the fiber and then drops it.
    fn abort(mut self, cause: Fail) {
        if let Some(abort) = self.abort.take() {
            abort(cause);
        }
        trace!("abort(): name={:?}, id={:?}", self.name, self.id);
    }
}

impl Scheduler {
    fn new(name: &str, clock: Arc<dyn Clock>, driver: Box<dyn Driver>, joinable: bool) -> Self {
        let (sender, inbox) = ::crossbeam_channel::unbounded();
        let unparker = driver.unparker();
        clock.subscribe(unparker.clone());
        let shared: Arc<SchedulerShared> = Arc::new(SchedulerShared::new(name, joinable, clock, sender, unparker));
        debug!("new(): scheduler={:?}, joinable={:?}", name, joinable);
        Self {
            shared,
            inbox,
            driver: RefCell::new(driver),
            state: RefCell::new(SchedulerState::default()),
            ticking: Cell::new(false),
            stopping: Cell::new(false),
            stopped: Cell::new(false),
        }
    }

    /// Returns the scheduler of the calling thread, creating one if the thread has none yet.
    fn local() -> Rc<Scheduler> {
        THREAD_SCHEDULER.with(|cell| {
            let mut slot = cell.borrow_mut();
            if let Some(scheduler) = slot.as_ref() {
                return scheduler.clone();
            }
            let name: String = match thread::current().name() {
                Some(name) => name.to_string(),
                None => format!("{:?}", thread::current().id()),
            };
            let scheduler: Rc<Scheduler> = Rc::new(Scheduler::new(
                &name,
                Arc::new(SystemClock),
                Box::new(ThreadDriver::new()),
                false,
            ));
            *slot = Some(scheduler.clone());
            scheduler
        })
    }

    /// Returns a handle to the scheduler of the calling thread. Threads that have none get one implicitly, which
    /// other threads cannot shut down.
    pub fn current() -> SchedulerHandle {
        SchedulerHandle::new(Self::local().shared.clone())
    }

    /// Installs a scheduler driven by `clock` on the calling thread.
    pub fn install(name: &str, clock: Arc<dyn Clock>) -> Result<SchedulerHandle, Fail> {
        Self::install_with_driver(name, clock, Box::new(ThreadDriver::new()))
    }

    /// Installs a scheduler that parks through `driver` on the calling thread.
    pub fn install_with_driver(
        name: &str,
        clock: Arc<dyn Clock>,
        driver: Box<dyn Driver>,
    ) -> Result<SchedulerHandle, Fail> {
        THREAD_SCHEDULER.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                let cause: String = format!("thread already has a scheduler (name={:?})", name);
                warn!("install(): {}", cause);
                return Err(Fail::new(libc::EEXIST, &cause));
            }
            let scheduler: Rc<Scheduler> = Rc::new(Scheduler::new(name, clock, driver, true));
            let handle: SchedulerHandle = SchedulerHandle::new(scheduler.shared.clone());
            *slot = Some(scheduler);
            Ok(handle)
        })
    }

    /// Removes the scheduler of the calling thread, stopping it.
    pub(crate) fn uninstall() {
        let scheduler: Option<Rc<Scheduler>> = THREAD_SCHEDULER.with(|cell| cell.borrow_mut().take());
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
    }

    /// Carries out a shutdown requested on the owning thread. Deferred to the end of the iteration if one is running.
    pub(crate) fn stop_local(shared: &Arc<SchedulerShared>) {
        let scheduler: Option<Rc<Scheduler>> = THREAD_SCHEDULER
            .try_with(|cell| cell.borrow().clone())
            .ok()
            .flatten();
        if let Some(scheduler) = scheduler {
            if Arc::ptr_eq(&scheduler.shared, shared) {
                if scheduler.ticking.get() {
                    scheduler.stopping.set(true);
                } else {
                    scheduler.stop();
                }
            }
        }
    }

    /// Runs a single iteration on the calling thread without blocking.
    pub fn poll() -> Result<(), Fail> {
        let scheduler: Rc<Scheduler> = Self::local();
        scheduler.tick()?;
        scheduler.park(Some(Duration::ZERO))
    }

    /// Main loop of the calling thread. Returns once the scheduler was shut down.
    pub fn run() -> Result<(), Fail> {
        let scheduler: Rc<Scheduler> = Self::local();
        if scheduler.ticking.get() {
            return Err(Fail::new(libc::EDEADLK, "scheduler loop entered from one of its fibers"));
        }
        info!("run(): scheduler={:?}", scheduler.shared.name());
        while !scheduler.stopped.get() {
            scheduler.tick()?;
            if scheduler.stopped.get() {
                break;
            }
            let timeout: Option<Duration> = scheduler.park_timeout();
            scheduler.park(timeout)?;
        }
        info!("run(): scheduler={:?} exited", scheduler.shared.name());
        Ok(())
    }

    /// Drives the scheduler of the calling thread until `future` completes.
    pub fn block_on<F: Future>(future: F) -> Result<F::Output, Fail> {
        let mut future: Pin<Box<F>> = Box::pin(future);
        match Self::drive(&mut future, None)? {
            Some(output) => Ok(output),
            None => Err(Fail::timed_out("root future did not complete")),
        }
    }

    /// Like [Self::block_on] but gives up after `timeout`, leaving `future` pending.
    pub fn block_on_timeout<F: Future + Unpin>(future: &mut F, timeout: Duration) -> Result<Option<F::Output>, Fail> {
        Self::drive(future, Some(Instant::now() + timeout))
    }

    fn drive<F: Future + Unpin>(future: &mut F, deadline: Option<Instant>) -> Result<Option<F::Output>, Fail> {
        let scheduler: Rc<Scheduler> = Self::local();
        if scheduler.ticking.get() {
            return Err(Fail::new(libc::EDEADLK, "blocking wait inside a fiber, use .await instead"));
        }
        let root: Arc<RootWaker> = Arc::new(RootWaker::new(scheduler.shared.clone()));
        let waker: Waker = ::futures::task::waker(root.clone());
        let mut ctx: Context = Context::from_waker(&waker);
        loop {
            if root.take_notified() {
                if let Poll::Ready(output) = Pin::new(&mut *future).poll(&mut ctx) {
                    return Ok(Some(output));
                }
            }
            scheduler.tick()?;
            if root.is_notified() {
                continue;
            }
            let mut timeout: Option<Duration> = scheduler.park_timeout();
            if let Some(deadline) = deadline {
                let now: Instant = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                let remaining: Duration = deadline - now;
                timeout = Some(timeout.map_or(remaining, |timeout| timeout.min(remaining)));
            }
            scheduler.park(timeout)?;
        }
    }

    /// One iteration: drain the inbox, fire due scheduled tasks, poll every fiber that was ready at the start.
    fn tick(&self) -> Result<(), Fail> {
        if self.ticking.get() {
            return Err(Fail::new(libc::EDEADLK, "scheduler iteration entered from one of its fibers"));
        }
        if self.stopped.get() {
            return Ok(());
        }
        {
            let _guard: TickGuard = TickGuard::new(&self.ticking);
            self.drain_inbox();
            if self.stopped.get() {
                return Ok(());
            }
            self.fire_due_timers();
            // Fibers woken from here on run on the next iteration.
            let ready: VecDeque<usize> = mem::take(&mut self.state.borrow_mut().ready);
            for key in ready {
                self.poll_fiber(key);
            }
        }
        if self.stopping.get() {
            self.stop();
        }
        Ok(())
    }

    fn drain_inbox(&self) {
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                Message::Spawn(task) => self.start_task(task),
                Message::Wake(key, id) => self.enqueue(key, id),
                Message::Schedule(task) => {
                    let key: TimerKey = task.get_key();
                    self.state.borrow_mut().timers.insert(key, task);
                },
                Message::Unschedule(key) => {
                    let removed: Option<Arc<dyn ScheduledTask>> = self.state.borrow_mut().timers.remove(&key);
                    drop(removed);
                },
                // Nothing that is still pending may run once shutdown was requested.
                Message::Shutdown => {
                    self.stop();
                    return;
                },
            }
        }
    }

    /// Pops scheduled tasks whose fire time is due, in time order.
    fn fire_due_timers(&self) {
        let now: Instant = self.shared.clock().now();
        loop {
            let due: Option<Arc<dyn ScheduledTask>> = {
                let mut state = self.state.borrow_mut();
                let key: TimerKey = match state.timers.first_key_value() {
                    Some((key, _)) if key.0 <= now => *key,
                    _ => break,
                };
                state.timers.remove(&key)
            };
            if let Some(task) = due {
                if let Some(runnable) = task.fire() {
                    self.start_task(runnable);
                }
            }
        }
    }

    /// Turns a task into a ready fiber. Tasks that arrive after shutdown began fail instead.
    fn start_task(&self, task: Box<dyn Task>) {
        if self.stopped.get() || !self.shared.is_accepting() {
            task.abort(Fail::scheduler_stopped("scheduler stopped"));
            return;
        }
        let id: TaskId = task.get_id();
        let name: String = task.get_name();
        let (future, abort): (FiberFuture, AbortHandle) = task.start();
        let mut state = self.state.borrow_mut();
        let entry = state.fibers.vacant_entry();
        let key: usize = entry.key();
        trace!("start_task(): name={:?}, id={:?}, key={:?}", name, id, key);
        entry.insert(FiberSlot {
            id,
            name,
            future: Some(future),
            abort: Some(abort),
            waker: Arc::new(FiberWaker::new(self.shared.clone(), key, id)),
            queued: true,
        });
        state.ready.push_back(key);
    }

    fn enqueue(&self, key: usize, id: TaskId) {
        let mut state = self.state.borrow_mut();
        let queue: bool = match state.fibers.get_mut(key) {
            Some(slot) if slot.id == id && !slot.queued => {
                slot.queued = true;
                true
            },
            _ => false,
        };
        if queue {
            state.ready.push_back(key);
        }
    }

    /// Polls a fiber once. The fiber is moved out of the slab while it runs, so it can freely use the scheduler.
    fn poll_fiber(&self, key: usize) {
        let (mut future, fiber_waker): (FiberFuture, Arc<FiberWaker>) = {
            let mut state = self.state.borrow_mut();
            let slot: &mut FiberSlot = match state.fibers.get_mut(key) {
                Some(slot) => slot,
                None => return,
            };
            slot.queued = false;
            match slot.future.take() {
                Some(future) => (future, slot.waker.clone()),
                None => return,
            }
        };
        fiber_waker.reset();
        let waker: Waker = ::futures::task::waker(fiber_waker);
        let mut ctx: Context = Context::from_waker(&waker);
        match future.as_mut().poll(&mut ctx) {
            Poll::Ready(()) => {
                let finished: Option<FiberSlot> = self.state.borrow_mut().fibers.try_remove(key);
                drop(finished);
                drop(future);
            },
            Poll::Pending => {
                if let Some(slot) = self.state.borrow_mut().fibers.get_mut(key) {
                    slot.future = Some(future);
                }
            },
        }
    }

    /// How long the scheduler may sleep before it has something to do.
    fn park_timeout(&self) -> Option<Duration> {
        if self.stopping.get() || !self.inbox.is_empty() {
            return Some(Duration::ZERO);
        }
        let state = self.state.borrow();
        if !state.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        state
            .timers
            .keys()
            .next()
            .map(|(fire_time, _)| fire_time.saturating_duration_since(self.shared.clock().now()))
    }

    fn park(&self, timeout: Option<Duration>) -> Result<(), Fail> {
        self.driver.borrow_mut().park(timeout)
    }

    /// Fails everything the scheduler still holds: queued tasks, started fibers and pending scheduled tasks.
    fn stop(&self) {
        if self.stopped.replace(true) {
            return;
        }
        self.shared.close();
        let name: String = self.shared.name();
        let cause: Fail = Fail::scheduler_stopped(&format!("scheduler {:?} stopped", name));

        let mut queued: usize = 0;
        while let Ok(message) = self.inbox.try_recv() {
            match message {
                Message::Spawn(task) => {
                    queued += 1;
                    task.abort(cause.clone());
                },
                Message::Schedule(task) => {
                    task.abort(cause.clone());
                },
                _ => (),
            }
        }

        let (fibers, timers): (Slab<FiberSlot>, BTreeMap<TimerKey, Arc<dyn ScheduledTask>>) = {
            let mut state = self.state.borrow_mut();
            state.ready.clear();
            (mem::take(&mut state.fibers), mem::take(&mut state.timers))
        };
        let in_flight: usize = fibers.len();
        for (_, slot) in fibers {
            slot.abort(cause.clone());
        }
        for (_, task) in timers {
            task.abort(cause.clone());
        }
        // Dropped fibers may have posted wakes and cancellations.
        while self.inbox.try_recv().is_ok() {}

        self.shared.mark_stopped();
        info!(
            "stop(): scheduler={:?}, queued={:?}, in_flight={:?}",
            name, queued, in_flight
        );
    }
}

impl<'a> TickGuard<'a> {
    fn new(ticking: &'a Cell<bool>) -> Self {
        ticking.set(true);
        Self(ticking)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
