// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    memory::SharedBuffer,
    promise::Promise,
    should_retry,
};
use ::libc::c_void;
use ::std::{
    io,
    os::unix::io::RawFd,
    task::Poll,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which readiness an operation waits for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interest {
    Read,
    Write,
}

/// Pending operation parked on a descriptor until the reactor reports it ready.
pub trait IoOperation: Send {
    /// Attempts the operation. Returns `Poll::Pending` if the descriptor turned out not to be ready after all, in
    /// which case the operation stays queued.
    fn perform(&mut self) -> Poll<()>;

    /// Fails the operation without performing it.
    fn abort(self: Box<Self>, cause: Fail);
}

/// Completes as soon as the descriptor is ready.
pub struct Readiness {
    promise: Promise<()>,
}

/// Partial read into a region of a shared buffer. Holds a handle to the buffer until it completes.
pub struct ReadSome {
    fd: RawFd,
    buffer: SharedBuffer,
    offset: usize,
    len: usize,
    promise: Promise<usize>,
}

/// Partial write from a region of a shared buffer. Holds a handle to the buffer until it completes.
pub struct WriteSome {
    fd: RawFd,
    buffer: SharedBuffer,
    offset: usize,
    len: usize,
    promise: Promise<usize>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reads from `fd` without blocking, retrying on `EINTR`.
pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let nbytes: isize = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if nbytes >= 0 {
            return Ok(nbytes as usize);
        }
        let e: io::Error = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::EINTR) {
            return Err(e);
        }
    }
}

/// Writes to `fd` without blocking, retrying on `EINTR`. Sockets never raise `SIGPIPE`.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let mut nbytes: isize = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL) };
        if nbytes < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::ENOTSOCK) {
            nbytes = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        }
        if nbytes >= 0 {
            return Ok(nbytes as usize);
        }
        let e: io::Error = io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::EINTR) {
            return Err(e);
        }
    }
}

/// Maps the outcome of a read of `requested` bytes. `None` means it would block. Zero bytes for a non-empty request
/// is a clean end of stream.
pub fn complete_read(result: io::Result<usize>, requested: usize) -> Option<Result<usize, Fail>> {
    match result {
        Ok(0) if requested > 0 => Some(Err(Fail::end_of_stream("end of stream"))),
        Ok(nbytes) => Some(Ok(nbytes)),
        Err(e) => match e.raw_os_error() {
            Some(errno) if should_retry(errno) => None,
            _ => Some(Err(Fail::from(e))),
        },
    }
}

/// Maps the outcome of a write. `None` means it would block.
pub fn complete_write(result: io::Result<usize>) -> Option<Result<usize, Fail>> {
    match result {
        Ok(nbytes) => Some(Ok(nbytes)),
        Err(e) => match e.raw_os_error() {
            Some(errno) if should_retry(errno) => None,
            _ => Some(Err(Fail::from(e))),
        },
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Readiness {
    pub fn new(promise: Promise<()>) -> Self {
        Self { promise }
    }
}

impl ReadSome {
    pub fn new(fd: RawFd, buffer: SharedBuffer, offset: usize, len: usize, promise: Promise<usize>) -> Self {
        Self {
            fd,
            buffer,
            offset,
            len,
            promise,
        }
    }
}

impl WriteSome {
    pub fn new(fd: RawFd, buffer: SharedBuffer, offset: usize, len: usize, promise: Promise<usize>) -> Self {
        Self {
            fd,
            buffer,
            offset,
            len,
            promise,
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl IoOperation for Readiness {
    fn perform(&mut self) -> Poll<()> {
        let _ = self.promise.set_value(());
        Poll::Ready(())
    }

    fn abort(self: Box<Self>, cause: Fail) {
        let _ = self.promise.set_error(cause);
    }
}

impl IoOperation for ReadSome {
    fn perform(&mut self) -> Poll<()> {
        let (fd, offset, len): (RawFd, usize, usize) = (self.fd, self.offset, self.len);
        let result: io::Result<usize> = self.buffer.with_mut(|bytes| read_fd(fd, &mut bytes[offset..offset + len]));
        match complete_read(result, len) {
            Some(result) => {
                trace!("perform(): read fd={:?}, ok={:?}", fd, result.is_ok());
                let _ = self.promise.set(result);
                Poll::Ready(())
            },
            None => Poll::Pending,
        }
    }

    fn abort(self: Box<Self>, cause: Fail) {
        let _ = self.promise.set_error(cause);
    }
}

impl IoOperation for WriteSome {
    fn perform(&mut self) -> Poll<()> {
        let (fd, offset, len): (RawFd, usize, usize) = (self.fd, self.offset, self.len);
        let result: io::Result<usize> = self.buffer.with(|bytes| write_fd(fd, &bytes[offset..offset + len]));
        match complete_write(result) {
            Some(result) => {
                trace!("perform(): write fd={:?}, ok={:?}", fd, result.is_ok());
                let _ = self.promise.set(result);
                Poll::Ready(())
            },
            None => Poll::Pending,
        }
    }

    fn abort(self: Box<Self>, cause: Fail) {
        let _ = self.promise.set_error(cause);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
