// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    asyncio::{
        ensure_nonblocking,
        readable,
        writable,
    },
    runtime::{
        fail::Fail,
        promise::{
            promise,
            Promise,
            PromiseFuture,
        },
        should_retry,
    },
};
use ::socket2::{
    Domain,
    Protocol,
    SockAddr,
    Socket,
    Type,
};
use ::std::{
    io,
    net::{
        SocketAddr,
        ToSocketAddrs,
    },
    os::unix::io::AsRawFd,
    thread,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates a non-blocking TCP socket for the address family of `addr`.
pub fn socket(addr: &SocketAddr) -> Result<Socket, Fail> {
    let socket: Socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    ensure_nonblocking(&socket)?;
    Ok(socket)
}

/// Creates a non-blocking TCP socket listening on `addr`.
pub fn listen(addr: &SocketAddr, backlog: i32) -> Result<Socket, Fail> {
    let socket: Socket = socket(addr)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(*addr))?;
    socket.listen(backlog)?;
    debug!("listen(): fd={:?}, addr={:?}", socket.as_raw_fd(), socket.local_addr()?.as_socket());
    Ok(socket)
}

/// Connects `socket` to `addr`, suspending the calling fiber until the connection is established or fails. The socket
/// is left in non-blocking mode either way.
pub async fn connect(socket: &Socket, addr: &SocketAddr) -> Result<(), Fail> {
    ensure_nonblocking(socket)?;
    match socket.connect(&SockAddr::from(*addr)) {
        Ok(()) => return Ok(()),
        Err(e) => match e.raw_os_error() {
            Some(errno) if should_retry(errno) => (),
            _ => {
                debug!("connect(): addr={:?}: {:?}", addr, e);
                return Err(Fail::from(e));
            },
        },
    }
    writable(socket.as_raw_fd()).await?;
    match socket.take_error()? {
        None => {
            trace!("connect(): fd={:?} connected to {:?}", socket.as_raw_fd(), addr);
            Ok(())
        },
        Some(e) => {
            debug!("connect(): addr={:?}: {:?}", addr, e);
            Err(Fail::from(e))
        },
    }
}

/// Accepts a connection on `listener`, suspending the calling fiber until one arrives. The accepted socket is in
/// non-blocking mode.
pub async fn accept(listener: &Socket) -> Result<(Socket, SockAddr), Fail> {
    ensure_nonblocking(listener)?;
    loop {
        match listener.accept() {
            Ok((socket, addr)) => {
                ensure_nonblocking(&socket)?;
                trace!("accept(): fd={:?} from {:?}", socket.as_raw_fd(), addr.as_socket());
                return Ok((socket, addr));
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => match e.raw_os_error() {
                Some(errno) if should_retry(errno) => readable(listener.as_raw_fd()).await?,
                _ => return Err(Fail::from(e)),
            },
        }
    }
}

/// Resolves `hostname` to every address it maps to, suspending the calling fiber until resolution finishes.
pub async fn resolve(hostname: &str, port: u16) -> Result<Vec<SocketAddr>, Fail> {
    let (promise, future): (Promise<Vec<SocketAddr>>, PromiseFuture<Vec<SocketAddr>>) = promise();
    let hostname: String = hostname.to_string();
    // Lookups block, so each runs on its own thread.
    thread::Builder::new().name("resolver".to_string()).spawn(move || {
        let result: Result<Vec<SocketAddr>, Fail> = match (hostname.as_str(), port).to_socket_addrs() {
            Ok(addrs) => Ok(addrs.collect()),
            Err(e) => {
                debug!("resolve(): hostname={:?}: {:?}", hostname, e);
                Err(Fail::from(e))
            },
        };
        let _ = promise.set(result);
    })?;
    future.await
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
