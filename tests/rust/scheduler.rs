// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::cofiber::{
    asyncio,
    promise,
    runtime::{
        spawn,
        yield_now,
    },
    Fail,
    FailKind,
    Promise,
    PromiseFuture,
    Scheduler,
    SchedulerHandle,
    SchedulerThread,
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::std::{
    io::Read,
    os::unix::net::UnixStream,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// A fiber that writes and then awaits another fiber resumes with that fiber's value.
#[test]
fn fiber_awaits_another_fiber() -> anyhow::Result<()> {
    let (left, mut right): (UnixStream, UnixStream) = UnixStream::pair()?;
    let worker: SchedulerThread = SchedulerThread::new("awaiter")?;
    let outer: PromiseFuture<u32> = worker.spawn("a", move || async move {
        asyncio::write(&left, b"12345").await?;
        let inner: PromiseFuture<u32> = spawn("b", || async { Ok(42) })?;
        inner.await
    })?;
    cofiber::ensure_eq!(outer.wait()?, 42);
    let mut written: [u8; 5] = [0; 5];
    right.read_exact(&mut written)?;
    cofiber::ensure_eq!(&written, b"12345");
    Ok(())
}

/// Fibers that were ready at the start of an iteration each run once before any of them runs again.
#[test]
fn yielding_fibers_take_turns() -> anyhow::Result<()> {
    let (_clock, handle): (_, SchedulerHandle) = common::manual_scheduler("turns")?;
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b"] {
        let log: Arc<Mutex<Vec<String>>> = log.clone();
        handle.spawn(name, move || async move {
            for round in 0..2 {
                if let Ok(mut log) = log.lock() {
                    log.push(format!("{}{}", name, round));
                }
                yield_now().await;
            }
            Ok(())
        })?;
    }
    common::drive(4)?;
    let log: Vec<String> = log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.clone();
    cofiber::ensure_eq!(log, vec!["a0", "b0", "a1", "b1"]);
    Ok(())
}

/// Shutting a scheduler down fails every task it still holds and refuses new ones.
#[test]
fn shutdown_fails_pending_tasks() -> anyhow::Result<()> {
    let worker: SchedulerThread = SchedulerThread::new("stopping")?;
    let mut promises: Vec<Promise<u32>> = Vec::new();
    let mut results: Vec<PromiseFuture<u32>> = Vec::new();
    for i in 0..3 {
        let (p, blocker): (Promise<u32>, PromiseFuture<u32>) = promise();
        promises.push(p);
        results.push(worker.spawn(&format!("pending{}", i), move || blocker)?);
    }

    worker.shutdown()?;
    for result in results {
        cofiber::ensure_eq!(result.wait().map_err(|e| e.kind), Err(FailKind::SchedulerStopped));
    }
    let refused: Result<PromiseFuture<u32>, Fail> = worker.spawn("late", || async { Ok(1) });
    cofiber::ensure_eq!(refused.err().map(|e| e.kind), Some(FailKind::SchedulerStopped));
    cofiber::ensure_eq!(worker.is_running(), false);
    worker.join()?;
    drop(promises);
    Ok(())
}

/// Tasks still queued when another thread requests shutdown fail instead of running, even if they would finish at
/// once.
#[test]
fn shutdown_fails_queued_tasks() -> anyhow::Result<()> {
    let worker: SchedulerThread = SchedulerThread::new("queued")?;
    let (started_tx, started_rx): (Sender<()>, Receiver<()>) = ::crossbeam_channel::bounded(1);
    let (gate_tx, gate_rx): (Sender<()>, Receiver<()>) = ::crossbeam_channel::bounded(1);
    // Holds the worker thread, so everything below stays in its inbox.
    let _blocker: PromiseFuture<()> = worker.spawn("blocker", move || async move {
        let _ = started_tx.send(());
        let _ = gate_rx.recv();
        Ok(())
    })?;
    started_rx.recv()?;

    let mut queued: Vec<PromiseFuture<u32>> = Vec::new();
    for i in 0..3 {
        queued.push(worker.spawn(&format!("queued{}", i), move || async move { Ok(i) })?);
    }
    let handle: SchedulerHandle = worker.handle();
    let stopper: JoinHandle<Result<(), Fail>> = thread::spawn(move || handle.shutdown());
    while worker.is_running() {
        thread::yield_now();
    }
    gate_tx.send(())?;
    stopper.join().map_err(|_| anyhow::anyhow!("stopper panicked"))??;

    let outcomes: Vec<Result<u32, FailKind>> = queued.into_iter().map(|f| f.wait().map_err(|e| e.kind)).collect();
    cofiber::ensure_eq!(outcomes, vec![Err(FailKind::SchedulerStopped); 3]);
    worker.join()?;
    Ok(())
}

/// A panic inside a task is reported through its future and does not take the scheduler down.
#[test]
fn panicking_task_fails_its_future() -> anyhow::Result<()> {
    let worker: SchedulerThread = SchedulerThread::new("panics")?;
    let exploded: PromiseFuture<u32> = worker.spawn("explode", || async {
        let answer: Option<u32> = None;
        match answer {
            Some(answer) => Ok(answer),
            None => panic!("no answer"),
        }
    })?;
    let failure: Fail = match exploded.wait() {
        Ok(_) => anyhow::bail!("task should have failed"),
        Err(e) => e,
    };
    cofiber::ensure_eq!(failure.kind, FailKind::Task);
    cofiber::ensure_eq!(failure.cause.contains("no answer"), true);

    let survivor: PromiseFuture<u32> = worker.spawn("survivor", || async { Ok(7) })?;
    cofiber::ensure_eq!(survivor.wait()?, 7);
    Ok(())
}

/// Tasks submitted from many threads all run on the owning thread.
#[test]
fn spawns_from_many_threads() -> anyhow::Result<()> {
    const NTHREADS: usize = 4;
    const NTASKS: usize = 100;
    let worker: SchedulerThread = SchedulerThread::new("crowd")?;
    let owner: thread::ThreadId = worker
        .spawn("owner", || async { Ok(thread::current().id()) })?
        .wait()?;
    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let mut submitters: Vec<JoinHandle<Result<(), Fail>>> = Vec::new();
    for _ in 0..NTHREADS {
        let handle: SchedulerHandle = worker.handle();
        let counter: Arc<AtomicUsize> = counter.clone();
        submitters.push(thread::spawn(move || {
            let mut results: Vec<PromiseFuture<bool>> = Vec::with_capacity(NTASKS);
            for _ in 0..NTASKS {
                let counter: Arc<AtomicUsize> = counter.clone();
                results.push(handle.spawn("count", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(thread::current().id() == owner)
                })?);
            }
            for result in results {
                if !result.wait()? {
                    return Err(Fail::new(libc::EINVAL, "task ran on a foreign thread"));
                }
            }
            Ok(())
        }));
    }
    for submitter in submitters {
        submitter.join().map_err(|_| anyhow::anyhow!("submitter panicked"))??;
    }
    cofiber::ensure_eq!(counter.load(Ordering::SeqCst), NTHREADS * NTASKS);
    Ok(())
}

/// Blocking on a future from inside a fiber is refused instead of deadlocking.
#[test]
fn blocking_inside_a_fiber_is_refused() -> anyhow::Result<()> {
    let worker: SchedulerThread = SchedulerThread::new("nested")?;
    let nested: PromiseFuture<i32> = worker.spawn("nested", || async {
        let inner: PromiseFuture<u32> = PromiseFuture::ready(Ok(1));
        Ok(match inner.wait() {
            Ok(_) => 0,
            Err(e) => e.errno,
        })
    })?;
    cofiber::ensure_eq!(nested.wait()?, libc::EDEADLK);
    cofiber::ensure_neq!(Scheduler::current(), worker.handle());
    Ok(())
}
