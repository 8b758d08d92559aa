// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::cofiber::{
    asyncio,
    reactor::ReactorRuntime,
    runtime::memory::SharedBuffer,
    FailKind,
    PromiseFuture,
};
use ::std::{
    os::unix::{
        io::AsRawFd,
        net::UnixStream,
    },
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

/// Tests in this file tear the process-wide runtime down, so they must not overlap.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Cleanup can run any number of times, and the next use starts a fresh runtime.
#[test]
fn cleanup_is_idempotent() -> anyhow::Result<()> {
    let _serial: MutexGuard<()> = serial();
    ReactorRuntime::cleanup()?;
    let first: Arc<ReactorRuntime> = ReactorRuntime::get()?;
    cofiber::ensure_eq!(Arc::ptr_eq(&first, &ReactorRuntime::get()?), true);
    ReactorRuntime::cleanup()?;
    ReactorRuntime::cleanup()?;

    let second: Arc<ReactorRuntime> = ReactorRuntime::get()?;
    cofiber::ensure_eq!(Arc::ptr_eq(&first, &second), false);
    cofiber::ensure_eq!(second.num_threads() >= 1, true);
    ReactorRuntime::cleanup()?;
    Ok(())
}

/// Operations still queued when the runtime is cleaned up fail with a canceled error and release their buffers.
#[test]
fn cleanup_cancels_pending_operations() -> anyhow::Result<()> {
    let _serial: MutexGuard<()> = serial();
    let (_left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let buffer: SharedBuffer = SharedBuffer::new(16);
    let mut pending: PromiseFuture<usize> = asyncio::read_some(&right, &buffer, 0, 16);
    cofiber::ensure_eq!(pending.wait_for(Duration::from_millis(20))?, None);
    cofiber::ensure_eq!(buffer.handle_count(), 2);

    ReactorRuntime::cleanup()?;
    let kind: Option<FailKind> = match pending.wait_for(Duration::from_secs(5)) {
        Ok(_) => None,
        Err(e) => Some(e.kind),
    };
    cofiber::ensure_eq!(kind, Some(FailKind::Canceled));
    cofiber::ensure_eq!(buffer.handle_count(), 1);
    Ok(())
}

/// A reactor thread cannot tear down the runtime it belongs to.
#[test]
fn cleanup_from_reactor_thread_is_refused() -> anyhow::Result<()> {
    let _serial: MutexGuard<()> = serial();
    let (_left, right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let runtime: Arc<ReactorRuntime> = ReactorRuntime::get()?;
    let refused: PromiseFuture<i32> = runtime
        .scheduler_for(right.as_raw_fd())
        .spawn("cleanup", || async {
            Ok(match ReactorRuntime::cleanup() {
                Ok(()) => 0,
                Err(e) => e.errno,
            })
        })?;
    cofiber::ensure_eq!(refused.wait()?, libc::EDEADLK);
    drop(runtime);
    ReactorRuntime::cleanup()?;
    Ok(())
}
