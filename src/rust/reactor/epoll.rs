// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    reactor::operation::{
        Interest,
        IoOperation,
    },
    runtime::{
        fail::Fail,
        scheduler::{
            Driver,
            Unpark,
        },
    },
};
use ::libc::{
    c_int,
    c_void,
    epoll_event,
};
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    mem,
    os::unix::io::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Token of the eventfd used to interrupt `epoll_wait`.
const WAKE_TOKEN: u64 = u64::MAX;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Open file a descriptor number referred to when it was registered. Tells a reused number apart from the file it
/// replaced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FileId {
    dev: libc::dev_t,
    ino: libc::ino_t,
}

/// Operations queued on one descriptor.
struct Registration {
    file: FileId,
    readers: VecDeque<Box<dyn IoOperation>>,
    writers: VecDeque<Box<dyn IoOperation>>,
    /// Whether the descriptor was added to the epoll set.
    added: bool,
}

/// Epoll instance that completes queued operations as their descriptors become ready. Descriptors are registered
/// one-shot and re-armed for as long as operations remain queued on them.
pub struct Reactor {
    id: usize,
    epoll_fd: RawFd,
    event_fd: RawFd,
    batch_size: usize,
    max_park: Duration,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    closed: AtomicBool,
}

/// Parks a scheduler in `epoll_wait`, so I/O dispatch runs between scheduler iterations.
pub struct EpollDriver {
    reactor: Arc<Reactor>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn close_fd(fd: RawFd) {
    if unsafe { libc::close(fd) } != 0 {
        warn!("close_fd(): failed to close fd={:?} (errno={:?})", fd, last_errno());
    }
}

/// Rounds up to whole milliseconds so a short timer is never turned into a busy poll.
fn timeout_millis(timeout: Duration) -> c_int {
    if timeout.is_zero() {
        return 0;
    }
    let millis: u128 = timeout.as_nanos().div_ceil(1_000_000);
    millis.min(c_int::MAX as u128) as c_int
}

/// Runs queued operations in order until one reports that it would still block.
fn run_queue(queue: &mut VecDeque<Box<dyn IoOperation>>) {
    while let Some(mut operation) = queue.pop_front() {
        if operation.perform().is_pending() {
            queue.push_front(operation);
            break;
        }
    }
}

fn identify(fd: RawFd) -> Result<FileId, i32> {
    let mut stat: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(last_errno());
    }
    Ok(FileId {
        dev: stat.st_dev,
        ino: stat.st_ino,
    })
}

fn abort_all(registration: Registration, cause: &Fail) {
    for operation in registration.readers.into_iter().chain(registration.writers) {
        operation.abort(cause.clone());
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Registration {
    fn new(file: FileId) -> Self {
        Self {
            file,
            readers: VecDeque::new(),
            writers: VecDeque::new(),
            added: false,
        }
    }

    fn len(&self) -> usize {
        self.readers.len() + self.writers.len()
    }
}

impl Reactor {
    pub fn new(id: usize, batch_size: usize, max_park: Duration) -> Result<Self, Fail> {
        let epoll_fd: RawFd = match unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let errno: i32 = last_errno();
                error!("new(): failed to create epoll (errno={:?})", errno);
                return Err(Fail::io(errno, "failed to create epoll"));
            },
        };
        let event_fd: RawFd = match unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let errno: i32 = last_errno();
                error!("new(): failed to create eventfd (errno={:?})", errno);
                close_fd(epoll_fd);
                return Err(Fail::io(errno, "failed to create eventfd"));
            },
        };
        let mut event: epoll_event = epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, event_fd, &mut event) } != 0 {
            let errno: i32 = last_errno();
            error!("new(): failed to register eventfd (errno={:?})", errno);
            close_fd(event_fd);
            close_fd(epoll_fd);
            return Err(Fail::io(errno, "failed to register eventfd"));
        }

        debug!("new(): reactor={:?}, epoll_fd={:?}, event_fd={:?}", id, epoll_fd, event_fd);
        Ok(Self {
            id,
            epoll_fd,
            event_fd,
            batch_size: batch_size.max(1),
            max_park,
            registrations: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of descriptors with queued operations.
    pub fn num_registrations(&self) -> usize {
        self.lock().len()
    }

    /// Queues `operation` on `fd` and arms the descriptor. Fails the operation right away if the reactor was shut down
    /// or the descriptor cannot be watched.
    ///
    /// Operations still queued for a file that `fd` no longer refers to are canceled first, they belong to a stream
    /// that was closed while they were pending.
    pub fn submit(&self, fd: RawFd, interest: Interest, operation: Box<dyn IoOperation>) {
        let file: FileId = match identify(fd) {
            Ok(file) => file,
            Err(errno) => {
                warn!("submit(): cannot watch fd={:?} (errno={:?})", fd, errno);
                operation.abort(Fail::io(errno, "cannot watch descriptor"));
                return;
            },
        };
        let mut registrations: MutexGuard<HashMap<RawFd, Registration>> = self.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(registrations);
            operation.abort(Fail::canceled("reactor was shut down"));
            return;
        }
        let reused: bool = registrations.get(&fd).is_some_and(|registration| registration.file != file);
        let stale: Option<Registration> = if reused { registrations.remove(&fd) } else { None };
        let registration: &mut Registration = registrations.entry(fd).or_insert_with(|| Registration::new(file));
        match interest {
            Interest::Read => registration.readers.push_back(operation),
            Interest::Write => registration.writers.push_back(operation),
        }
        let failed: Option<(Registration, Fail)> = match self.arm(fd, registration) {
            Ok(()) => None,
            Err(e) => registrations.remove(&fd).map(|registration| (registration, e)),
        };
        drop(registrations);

        if let Some(stale) = stale {
            debug!("submit(): fd={:?} was reused, canceling {:?} stale operations", fd, stale.len());
            abort_all(stale, &Fail::canceled("descriptor was closed"));
        }
        if let Some((registration, e)) = failed {
            abort_all(registration, &e);
        }
    }

    /// Fails every operation queued on `fd` with a canceled error and stops watching it. Must be called before the
    /// descriptor is closed. Returns the number of operations canceled.
    pub fn cancel(&self, fd: RawFd) -> usize {
        let registration: Option<Registration> = {
            let mut registrations: MutexGuard<HashMap<RawFd, Registration>> = self.lock();
            let registration: Option<Registration> = registrations.remove(&fd);
            if let Some(registration) = registration.as_ref() {
                if registration.added {
                    if let Err(errno) = self.control(libc::EPOLL_CTL_DEL, fd, 0) {
                        // ENOENT: the file was already closed.
                        trace!("cancel(): fd={:?} was not watched (errno={:?})", fd, errno);
                    }
                }
            }
            registration
        };
        match registration {
            Some(registration) => {
                let count: usize = registration.len();
                trace!("cancel(): fd={:?}, count={:?}", fd, count);
                abort_all(registration, &Fail::canceled("descriptor was closed"));
                count
            },
            None => 0,
        }
    }

    /// Waits up to `timeout` (capped at the configured maximum) for readiness and runs the operations of every ready
    /// descriptor. Returns the number of events handled.
    pub fn poll_events(&self, timeout: Option<Duration>) -> Result<usize, Fail> {
        let timeout: Duration = timeout.map_or(self.max_park, |timeout| timeout.min(self.max_park));
        let mut events: Vec<epoll_event> = vec![epoll_event { events: 0, u64: 0 }; self.batch_size];
        let nevents: c_int = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                self.batch_size as c_int,
                timeout_millis(timeout),
            )
        };
        if nevents < 0 {
            let errno: i32 = last_errno();
            if errno == libc::EINTR {
                return Ok(0);
            }
            error!("poll_events(): epoll_wait failed on reactor {:?} (errno={:?})", self.id, errno);
            return Err(Fail::io(errno, "epoll_wait failed"));
        }

        for event in &events[..nevents as usize] {
            // Copied out, epoll_event is packed.
            let token: u64 = event.u64;
            let flags: u32 = event.events;
            if token == WAKE_TOKEN {
                self.drain_wakeups();
            } else {
                self.dispatch(token as RawFd, flags);
            }
        }
        Ok(nevents as usize)
    }

    /// Fails every queued operation with `cause` and refuses new ones.
    pub fn shutdown(&self, cause: Fail) {
        let registrations: HashMap<RawFd, Registration> = {
            let mut registrations: MutexGuard<HashMap<RawFd, Registration>> = self.lock();
            self.closed.store(true, Ordering::Release);
            mem::take(&mut *registrations)
        };
        if !registrations.is_empty() {
            debug!(
                "shutdown(): reactor={:?} aborting operations on {:?} descriptors",
                self.id,
                registrations.len()
            );
        }
        for (_, registration) in registrations {
            abort_all(registration, &cause);
        }
    }

    fn dispatch(&self, fd: RawFd, flags: u32) {
        let failed: bool = flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
        let readable: bool = failed || flags & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0;
        let writable: bool = failed || flags & libc::EPOLLOUT as u32 != 0;
        trace!("dispatch(): fd={:?}, flags={:#x}", fd, flags);

        let mut registrations: MutexGuard<HashMap<RawFd, Registration>> = self.lock();
        let registration: &mut Registration = match registrations.get_mut(&fd) {
            Some(registration) => registration,
            None => return,
        };
        if identify(fd) != Ok(registration.file) {
            // Closed, and maybe reused, while its operations were pending.
            if let Some(registration) = registrations.remove(&fd) {
                drop(registrations);
                debug!("dispatch(): fd={:?} was closed, canceling {:?} operations", fd, registration.len());
                abort_all(registration, &Fail::canceled("descriptor was closed"));
            }
            return;
        }
        if readable {
            run_queue(&mut registration.readers);
        }
        if writable {
            run_queue(&mut registration.writers);
        }
        if registration.readers.is_empty() && registration.writers.is_empty() {
            // Disarmed by EPOLLONESHOT, a later submit modifies the existing entry.
            registrations.remove(&fd);
            return;
        }
        if let Err(e) = self.arm(fd, registration) {
            if let Some(registration) = registrations.remove(&fd) {
                drop(registrations);
                abort_all(registration, &e);
            }
        }
    }

    /// Arms `fd` for the interests of its queued operations.
    fn arm(&self, fd: RawFd, registration: &mut Registration) -> Result<(), Fail> {
        let mut events: u32 = (libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;
        if !registration.readers.is_empty() {
            events |= libc::EPOLLIN as u32;
        }
        if !registration.writers.is_empty() {
            events |= libc::EPOLLOUT as u32;
        }
        let first: c_int = if registration.added {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let result: Result<(), i32> = match self.control(first, fd, events) {
            Err(libc::ENOENT) if first == libc::EPOLL_CTL_MOD => self.control(libc::EPOLL_CTL_ADD, fd, events),
            Err(libc::EEXIST) if first == libc::EPOLL_CTL_ADD => self.control(libc::EPOLL_CTL_MOD, fd, events),
            result => result,
        };
        match result {
            Ok(()) => {
                registration.added = true;
                Ok(())
            },
            Err(errno) => {
                warn!("arm(): cannot watch fd={:?} (errno={:?})", fd, errno);
                Err(Fail::io(errno, "failed to register descriptor with epoll"))
            },
        }
    }

    fn control(&self, op: c_int, fd: RawFd, events: u32) -> Result<(), i32> {
        let mut event: epoll_event = epoll_event {
            events,
            u64: fd as u64,
        };
        match unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } {
            0 => Ok(()),
            _ => Err(last_errno()),
        }
    }

    fn drain_wakeups(&self) {
        let mut count: u64 = 0;
        unsafe {
            libc::read(
                self.event_fd,
                &mut count as *mut u64 as *mut c_void,
                mem::size_of::<u64>(),
            )
        };
    }

    fn lock(&self) -> MutexGuard<HashMap<RawFd, Registration>> {
        self.registrations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EpollDriver {
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self { reactor }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Unpark for Reactor {
    fn unpark(&self) {
        let one: u64 = 1;
        let nbytes: isize = unsafe {
            libc::write(
                self.event_fd,
                &one as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated, so a wakeup is pending anyway.
        if nbytes < 0 && last_errno() != libc::EAGAIN {
            warn!("unpark(): failed to signal reactor {:?} (errno={:?})", self.id, last_errno());
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown(Fail::canceled("reactor was dropped"));
        close_fd(self.event_fd);
        close_fd(self.epoll_fd);
        debug!("drop(): reactor={:?} closed", self.id);
    }
}

impl Driver for EpollDriver {
    fn park(&mut self, timeout: Option<Duration>) -> Result<(), Fail> {
        self.reactor.poll_events(timeout).map(|_| ())
    }

    fn unparker(&self) -> Arc<dyn Unpark> {
        self.reactor.clone()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
