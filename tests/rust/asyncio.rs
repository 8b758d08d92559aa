// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::cofiber::{
    asyncio::{
        self,
        net,
        AsyncStream,
    },
    runtime::memory::SharedBuffer,
    FailKind,
    PromiseFuture,
    Scheduler,
    SchedulerThread,
};
use ::socket2::{
    SockAddr,
    Socket,
};
use ::std::{
    io::{
        self,
        Read,
        Write,
    },
    net::{
        SocketAddr,
        TcpStream,
    },
    os::unix::{
        io::AsRawFd,
        net::UnixStream,
    },
    time::Duration,
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// A partial read stays pending until data arrives, then reports what was read.
#[test]
fn read_some_waits_for_data() -> anyhow::Result<()> {
    let (mut left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let buffer: SharedBuffer = SharedBuffer::new(32);
    let mut pending: PromiseFuture<usize> = asyncio::read_some(&right, &buffer, 0, 32);
    cofiber::ensure_eq!(pending.wait_for(Duration::from_millis(50))?, None);

    left.write_all(b"ping")?;
    cofiber::ensure_eq!(pending.wait_for(Duration::from_secs(5))?, Some(4));
    cofiber::ensure_eq!(&buffer.to_vec()[..4], b"ping");
    Ok(())
}

/// A pending read fails with end of stream when the peer closes, not with a generic I/O failure.
#[test]
fn pending_read_sees_end_of_stream() -> anyhow::Result<()> {
    let (left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let buffer: SharedBuffer = SharedBuffer::new(8);
    let mut pending: PromiseFuture<usize> = asyncio::read_some(&right, &buffer, 0, 8);
    cofiber::ensure_eq!(pending.wait_for(Duration::from_millis(20))?, None);
    drop(left);
    let kind: Option<FailKind> = match pending.wait_for(Duration::from_secs(5)) {
        Ok(_) => None,
        Err(e) => Some(e.kind),
    };
    cofiber::ensure_eq!(kind, Some(FailKind::EndOfStream));
    Ok(())
}

/// Writing to a stream whose peer is gone is a generic I/O failure.
#[test]
fn write_to_closed_peer_is_io_failure() -> anyhow::Result<()> {
    let (left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    drop(right);
    let buffer: SharedBuffer = SharedBuffer::from(&b"lost"[..]);
    let failure: Option<(FailKind, i32)> = asyncio::write_some(&left, &buffer, 0, 4).wait().err().map(|e| (e.kind, e.errno));
    cofiber::ensure_eq!(failure, Some((FailKind::Io, libc::EPIPE)));
    Ok(())
}

/// A partial write to a full stream is queued on the reactor and completes once the peer makes room.
#[test]
fn write_some_waits_for_room() -> anyhow::Result<()> {
    let (mut left, mut right): (UnixStream, UnixStream) = UnixStream::pair()?;
    left.set_nonblocking(true)?;
    let chunk: [u8; 4096] = [7; 4096];
    loop {
        match left.write(&chunk) {
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    let buffer: SharedBuffer = SharedBuffer::from(&chunk[..]);
    let mut pending: PromiseFuture<usize> = asyncio::write_some(&left, &buffer, 0, 4096);
    cofiber::ensure_eq!(pending.wait_for(Duration::from_millis(20))?, None);
    cofiber::ensure_eq!(buffer.handle_count(), 2);

    right.set_nonblocking(true)?;
    let mut sink: Vec<u8> = vec![0; 64 * 1024];
    loop {
        match right.read(&mut sink) {
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    let nwritten: Option<usize> = pending.wait_for(Duration::from_secs(5))?;
    cofiber::ensure_eq!(nwritten.is_some_and(|n| n > 0 && n <= 4096), true);
    cofiber::ensure_eq!(buffer.handle_count(), 1);
    Ok(())
}

/// A read left pending on a closed stream is canceled when its descriptor number is reused, and never receives the
/// new stream's data.
#[test]
fn reused_descriptor_keeps_streams_apart() -> anyhow::Result<()> {
    let (_old_peer, old): (UnixStream, UnixStream) = UnixStream::pair()?;
    let (mut new_peer, new): (UnixStream, UnixStream) = UnixStream::pair()?;
    let stale_buffer: SharedBuffer = SharedBuffer::new(6);
    let mut stale: PromiseFuture<usize> = asyncio::read_some(&old, &stale_buffer, 0, 6);
    cofiber::ensure_eq!(stale.wait_for(Duration::from_millis(20))?, None);

    // Closes the old stream and hands its descriptor number to the new one in one step.
    cofiber::ensure_eq!(unsafe { libc::dup2(new.as_raw_fd(), old.as_raw_fd()) }, old.as_raw_fd());
    let fresh_buffer: SharedBuffer = SharedBuffer::new(6);
    let mut fresh: PromiseFuture<usize> = asyncio::read_some(&old, &fresh_buffer, 0, 6);
    new_peer.write_all(b"secret")?;

    cofiber::ensure_eq!(fresh.wait_for(Duration::from_secs(5))?, Some(6));
    cofiber::ensure_eq!(fresh_buffer.to_vec(), b"secret".to_vec());
    let kind: Option<FailKind> = match stale.wait_for(Duration::from_secs(5)) {
        Ok(_) => None,
        Err(e) => Some(e.kind),
    };
    cofiber::ensure_eq!(kind, Some(FailKind::Canceled));
    cofiber::ensure_eq!(stale_buffer.to_vec(), vec![0; 6]);
    cofiber::ensure_eq!(stale_buffer.handle_count(), 1);
    Ok(())
}

/// Dropping an owned stream cancels its pending operations and releases their buffers.
#[test]
fn dropping_a_stream_cancels_its_operations() -> anyhow::Result<()> {
    let (_left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let stream: AsyncStream<UnixStream> = AsyncStream::new(right)?;
    let buffer: SharedBuffer = SharedBuffer::new(8);
    let mut pending: PromiseFuture<usize> = asyncio::read_some(&stream, &buffer, 0, 8);
    cofiber::ensure_eq!(pending.wait_for(Duration::from_millis(20))?, None);
    cofiber::ensure_eq!(buffer.handle_count(), 2);

    drop(stream);
    let kind: Option<FailKind> = match pending.wait_for(Duration::from_secs(5)) {
        Ok(_) => None,
        Err(e) => Some(e.kind),
    };
    cofiber::ensure_eq!(kind, Some(FailKind::Canceled));
    cofiber::ensure_eq!(buffer.handle_count(), 1);
    Ok(())
}

/// An echo server on a scheduler thread serves a client running on the test thread over loopback TCP.
#[test]
fn echo_over_loopback() -> anyhow::Result<()> {
    let any: SocketAddr = "127.0.0.1:0".parse()?;
    let listener: Socket = net::listen(&any, 8)?;
    let addr: SocketAddr = listener
        .local_addr()?
        .as_socket()
        .ok_or_else(|| anyhow::anyhow!("listener has no inet address"))?;

    let server: SchedulerThread = SchedulerThread::new("echo")?;
    let served: PromiseFuture<usize> = server.spawn("echo", move || async move {
        let (connection, _peer): (Socket, SockAddr) = net::accept(&listener).await?;
        let mut request: [u8; 5] = [0; 5];
        asyncio::read(&connection, &mut request).await?;
        asyncio::write(&connection, &request).await
    })?;

    let reply: Vec<u8> = Scheduler::block_on(async move {
        let client: Socket = net::socket(&addr)?;
        net::connect(&client, &addr).await?;
        let stream: TcpStream = client.into();
        asyncio::write(&stream, b"hello").await?;
        let mut reply: Vec<u8> = vec![0; 5];
        asyncio::read(&stream, &mut reply).await?;
        Ok::<Vec<u8>, cofiber::Fail>(reply)
    })??;

    cofiber::ensure_eq!(served.wait()?, 5);
    cofiber::ensure_eq!(reply, b"hello".to_vec());
    Ok(())
}

/// Every address resolved for a name carries the requested port.
#[test]
fn resolve_reports_every_endpoint() -> anyhow::Result<()> {
    let addrs: Vec<SocketAddr> = Scheduler::block_on(net::resolve("127.0.0.1", 4242))??;
    cofiber::ensure_eq!(addrs, vec!["127.0.0.1:4242".parse::<SocketAddr>()?]);
    Ok(())
}
