// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fiber-friendly reads and writes on non-blocking streams.
//!
//! Operations first try the stream's non-blocking call on the calling thread. Only when that would block is the
//! operation queued on the reactor that watches the descriptor, which completes the operation's promise once the
//! descriptor is ready.

pub mod net;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    reactor::{
        complete_read,
        complete_write,
        read_fd,
        write_fd,
        Interest,
        IoOperation,
        ReactorRuntime,
        ReadSome,
        Readiness,
        WriteSome,
    },
    runtime::{
        fail::Fail,
        memory::SharedBuffer,
        promise::{
            promise,
            Promise,
            PromiseFuture,
        },
    },
};
use ::socket2::Socket;
use ::std::{
    io,
    net::TcpStream,
    ops::Deref,
    os::unix::{
        io::{
            AsRawFd,
            RawFd,
        },
        net::UnixStream,
    },
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// Byte stream backed by a pollable descriptor.
pub trait Stream: AsRawFd {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;

    /// Reads without blocking. Fails with `EWOULDBLOCK` if no data is available.
    fn read_nonblocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.as_raw_fd(), buf)
    }

    /// Writes without blocking. Fails with `EWOULDBLOCK` if there is no room.
    fn write_nonblocking(&self, buf: &[u8]) -> io::Result<usize> {
        write_fd(self.as_raw_fd(), buf)
    }
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Owns a stream and cancels the operations still queued on it when dropped, before the descriptor is closed. Plain
/// streams closed with operations pending only have them canceled once the descriptor number is used again.
pub struct AsyncStream<S: Stream> {
    inner: S,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Puts `stream` in non-blocking mode, which every operation of this module requires.
pub fn ensure_nonblocking<S: Stream + ?Sized>(stream: &S) -> Result<(), Fail> {
    stream.set_nonblocking(true).map_err(|e| {
        warn!("ensure_nonblocking(): fd={:?}: {:?}", stream.as_raw_fd(), e);
        Fail::from(e)
    })
}

/// Reads up to `len` bytes into `buffer[offset..]`. The returned future completes with the number of bytes read, or
/// with an end-of-stream failure once the peer closed the stream.
pub fn read_some<S: Stream + ?Sized>(stream: &S, buffer: &SharedBuffer, offset: usize, len: usize) -> PromiseFuture<usize> {
    let (promise, future): (Promise<usize>, PromiseFuture<usize>) = promise();
    async_read_some(stream, buffer, offset, len, promise);
    future
}

/// Like [read_some], but delivers the outcome into `promise`.
pub fn async_read_some<S: Stream + ?Sized>(
    stream: &S,
    buffer: &SharedBuffer,
    offset: usize,
    len: usize,
    promise: Promise<usize>,
) {
    if let Err(e) = prepare(stream, buffer, offset, len) {
        let _ = promise.set_error(e);
        return;
    }
    if len == 0 {
        let _ = promise.set_value(0);
        return;
    }
    let result: io::Result<usize> = buffer.with_mut(|bytes| stream.read_nonblocking(&mut bytes[offset..offset + len]));
    match complete_read(result, len) {
        Some(result) => {
            let _ = promise.set(result);
        },
        None => {
            let fd: RawFd = stream.as_raw_fd();
            trace!("async_read_some(): fd={:?} would block, deferring {:?} bytes", fd, len);
            submit(
                fd,
                Interest::Read,
                Box::new(ReadSome::new(fd, buffer.clone(), offset, len, promise)),
            );
        },
    }
}

/// Writes up to `len` bytes from `buffer[offset..]`. The returned future completes with the number of bytes written.
pub fn write_some<S: Stream + ?Sized>(stream: &S, buffer: &SharedBuffer, offset: usize, len: usize) -> PromiseFuture<usize> {
    let (promise, future): (Promise<usize>, PromiseFuture<usize>) = promise();
    async_write_some(stream, buffer, offset, len, promise);
    future
}

/// Like [write_some], but delivers the outcome into `promise`.
pub fn async_write_some<S: Stream + ?Sized>(
    stream: &S,
    buffer: &SharedBuffer,
    offset: usize,
    len: usize,
    promise: Promise<usize>,
) {
    if let Err(e) = prepare(stream, buffer, offset, len) {
        let _ = promise.set_error(e);
        return;
    }
    if len == 0 {
        let _ = promise.set_value(0);
        return;
    }
    let result: io::Result<usize> = buffer.with(|bytes| stream.write_nonblocking(&bytes[offset..offset + len]));
    match complete_write(result) {
        Some(result) => {
            let _ = promise.set(result);
        },
        None => {
            let fd: RawFd = stream.as_raw_fd();
            trace!("async_write_some(): fd={:?} would block, deferring {:?} bytes", fd, len);
            submit(
                fd,
                Interest::Write,
                Box::new(WriteSome::new(fd, buffer.clone(), offset, len, promise)),
            );
        },
    }
}

/// Fails the operations queued on `stream` with a canceled error. Returns how many there were.
pub fn cancel<S: Stream + ?Sized>(stream: &S) -> usize {
    let fd: RawFd = stream.as_raw_fd();
    match ReactorRuntime::try_get() {
        Some(runtime) => runtime.cancel(fd),
        None => 0,
    }
}

/// Fills `buf` completely, suspending the calling fiber whenever the stream has no data. Fails with end of stream if
/// the peer closes the stream first.
pub async fn read<S: Stream + ?Sized>(stream: &S, buf: &mut [u8]) -> Result<usize, Fail> {
    ensure_nonblocking(stream)?;
    let mut nread: usize = 0;
    while nread < buf.len() {
        let requested: usize = buf.len() - nread;
        match complete_read(stream.read_nonblocking(&mut buf[nread..]), requested) {
            Some(result) => nread += result?,
            None => readable(stream.as_raw_fd()).await?,
        }
    }
    Ok(nread)
}

/// Writes all of `buf`, suspending the calling fiber whenever the stream has no room.
pub async fn write<S: Stream + ?Sized>(stream: &S, buf: &[u8]) -> Result<usize, Fail> {
    ensure_nonblocking(stream)?;
    let mut nwritten: usize = 0;
    while nwritten < buf.len() {
        match complete_write(stream.write_nonblocking(&buf[nwritten..])) {
            Some(result) => nwritten += result?,
            None => writable(stream.as_raw_fd()).await?,
        }
    }
    Ok(nwritten)
}

/// Completes once `fd` is readable or has an error pending.
pub fn readable(fd: RawFd) -> PromiseFuture<()> {
    ready(fd, Interest::Read)
}

/// Completes once `fd` is writable or has an error pending.
pub fn writable(fd: RawFd) -> PromiseFuture<()> {
    ready(fd, Interest::Write)
}

fn ready(fd: RawFd, interest: Interest) -> PromiseFuture<()> {
    let (promise, future): (Promise<()>, PromiseFuture<()>) = promise();
    submit(fd, interest, Box::new(Readiness::new(promise)));
    future
}

fn prepare<S: Stream + ?Sized>(stream: &S, buffer: &SharedBuffer, offset: usize, len: usize) -> Result<(), Fail> {
    match offset.checked_add(len) {
        Some(end) if end <= buffer.len() => (),
        _ => {
            let cause: String = format!(
                "buffer region out of range (offset={:?}, len={:?}, buffer_len={:?})",
                offset,
                len,
                buffer.len()
            );
            warn!("prepare(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        },
    }
    ensure_nonblocking(stream)
}

fn submit(fd: RawFd, interest: Interest, operation: Box<dyn IoOperation>) {
    match ReactorRuntime::get() {
        Ok(runtime) => runtime.submit(fd, interest, operation),
        Err(e) => operation.abort(e),
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<S: Stream> AsyncStream<S> {
    /// Takes ownership of `inner` and puts it in non-blocking mode.
    pub fn new(inner: S) -> Result<Self, Fail> {
        ensure_nonblocking(&inner)?;
        Ok(Self { inner })
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl<S: Stream> AsRawFd for AsyncStream<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl<S: Stream> Stream for AsyncStream<S> {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }

    fn read_nonblocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_nonblocking(buf)
    }

    fn write_nonblocking(&self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write_nonblocking(buf)
    }
}

impl<S: Stream> Deref for AsyncStream<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<S: Stream> Drop for AsyncStream<S> {
    fn drop(&mut self) {
        let canceled: usize = cancel(&self.inner);
        if canceled > 0 {
            debug!("drop(): fd={:?} closed with {:?} operations pending", self.inner.as_raw_fd(), canceled);
        }
    }
}


impl Stream for Socket {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        Socket::set_nonblocking(self, nonblocking)
    }
}

impl Stream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl Stream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
