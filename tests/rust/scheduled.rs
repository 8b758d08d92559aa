// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::cofiber::{
    runtime::scheduler::ScheduledTaskWithResult,
    FailKind,
    PromiseFuture,
    SchedulerHandle,
    SchedulerThread,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Tests
//======================================================================================================================

/// A task whose fire time already passed runs on the next iteration.
#[test]
fn past_fire_time_fires_next_iteration() -> anyhow::Result<()> {
    let (clock, handle) = common::manual_scheduler("past")?;
    clock.advance(Duration::from_secs(10));
    let fire_time: Instant = handle.now() - Duration::from_secs(5);
    let task: Arc<ScheduledTaskWithResult<u32>> = handle.schedule("late", || async { Ok(5) }, fire_time)?;
    let result: PromiseFuture<u32> = task.get_result()?;
    cofiber::ensure_eq!(task.is_resolved(), false);
    common::drive(2)?;
    cofiber::ensure_eq!(task.is_resolved(), true);
    cofiber::ensure_eq!(result.wait()?, 5);
    Ok(())
}

/// Tasks that share a fire time run in the order they were registered.
#[test]
fn equal_fire_times_keep_registration_order() -> anyhow::Result<()> {
    let (clock, handle) = common::manual_scheduler("order")?;
    let fire_time: Instant = handle.now() + Duration::from_millis(50);
    let log: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut tasks: Vec<Arc<ScheduledTaskWithResult<()>>> = Vec::new();
    for i in 0..5 {
        let log: Arc<Mutex<Vec<usize>>> = log.clone();
        tasks.push(handle.schedule(
            "ordered",
            move || async move {
                if let Ok(mut log) = log.lock() {
                    log.push(i);
                }
                Ok(())
            },
            fire_time,
        )?);
    }
    // An earlier deadline registered last still runs first.
    let first: Arc<ScheduledTaskWithResult<()>> = {
        let log: Arc<Mutex<Vec<usize>>> = log.clone();
        handle.schedule(
            "first",
            move || async move {
                if let Ok(mut log) = log.lock() {
                    log.push(99);
                }
                Ok(())
            },
            fire_time - Duration::from_millis(1),
        )?
    };

    common::drive(2)?;
    cofiber::ensure_eq!(log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.is_empty(), true);
    clock.advance(Duration::from_millis(50));
    common::drive(2)?;
    cofiber::ensure_eq!(first.is_resolved(), true);
    cofiber::ensure_eq!(tasks.iter().all(|task| task.is_resolved()), true);
    cofiber::ensure_eq!(*log.lock().map_err(|_| anyhow::anyhow!("poisoned"))?, vec![99, 0, 1, 2, 3, 4]);
    Ok(())
}

/// Only the first cancel wins, and a canceled task never runs.
#[test]
fn cancel_wins_once() -> anyhow::Result<()> {
    let (clock, handle) = common::manual_scheduler("cancel")?;
    let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let flag: Arc<AtomicBool> = ran.clone();
    let task: Arc<ScheduledTaskWithResult<()>> = handle.schedule(
        "doomed",
        move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
        handle.now() + Duration::from_secs(1),
    )?;
    let result: PromiseFuture<()> = task.get_result()?;
    cofiber::ensure_eq!(task.get_result().err().map(|e| e.errno), Some(libc::EALREADY));

    cofiber::ensure_eq!(task.cancel(), true);
    cofiber::ensure_eq!(task.cancel(), false);
    clock.advance(Duration::from_secs(2));
    common::drive(2)?;
    cofiber::ensure_eq!(ran.load(Ordering::SeqCst), false);
    cofiber::ensure_eq!(result.wait().map_err(|e| e.kind), Err(FailKind::Canceled));
    Ok(())
}

/// Canceling a task that already fired has no effect.
#[test]
fn cancel_after_fire_loses() -> anyhow::Result<()> {
    let (clock, handle) = common::manual_scheduler("fired")?;
    let task: Arc<ScheduledTaskWithResult<&'static str>> =
        handle.schedule("quick", || async { Ok("done") }, handle.now() + Duration::from_millis(1))?;
    clock.advance(Duration::from_millis(1));
    common::drive(2)?;
    cofiber::ensure_eq!(task.cancel(), false);
    cofiber::ensure_eq!(task.get_result()?.wait()?, "done");
    Ok(())
}

/// Cancellation racing against firing from another thread resolves exactly one way every time.
#[test]
fn cancel_races_fire_exactly_once() -> anyhow::Result<()> {
    const ITERATIONS: usize = 200;
    let worker: SchedulerThread = SchedulerThread::new("race")?;
    let mut rng: SmallRng = SmallRng::seed_from_u64(42);
    let (mut canceled, mut fired): (usize, usize) = (0, 0);

    for _ in 0..ITERATIONS {
        let ran: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let flag: Arc<AtomicBool> = ran.clone();
        let delay: Duration = Duration::from_micros(rng.gen_range(0..200));
        let task: Arc<ScheduledTaskWithResult<()>> = worker.schedule(
            "racer",
            move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            },
            Instant::now() + delay,
        )?;
        let result: PromiseFuture<()> = task.get_result()?;

        let pause: Duration = Duration::from_micros(rng.gen_range(0..200));
        let canceler: JoinHandle<bool> = {
            let task: Arc<ScheduledTaskWithResult<()>> = task.clone();
            thread::spawn(move || {
                thread::sleep(pause);
                task.cancel()
            })
        };
        let won: bool = canceler.join().map_err(|_| anyhow::anyhow!("canceler panicked"))?;

        match result.wait() {
            Ok(()) => {
                cofiber::ensure_eq!(won, false);
                cofiber::ensure_eq!(ran.load(Ordering::SeqCst), true);
                fired += 1;
            },
            Err(e) => {
                cofiber::ensure_eq!(won, true);
                cofiber::ensure_eq!(e.kind, FailKind::Canceled);
                cofiber::ensure_eq!(ran.load(Ordering::SeqCst), false);
                canceled += 1;
            },
        }
        cofiber::ensure_eq!(task.cancel(), false);
    }
    cofiber::ensure_eq!(canceled + fired, ITERATIONS);
    Ok(())
}

/// Scheduled tasks still pending at shutdown fail with a scheduler-stopped error.
#[test]
fn shutdown_fails_scheduled_tasks() -> anyhow::Result<()> {
    let worker: SchedulerThread = SchedulerThread::new("timers")?;
    let handle: SchedulerHandle = worker.handle();
    let task: Arc<ScheduledTaskWithResult<()>> =
        handle.schedule("forever", || async { Ok(()) }, Instant::now() + Duration::from_secs(3600))?;
    let result: PromiseFuture<()> = task.get_result()?;
    worker.shutdown()?;
    cofiber::ensure_eq!(result.wait().map_err(|e| e.kind), Err(FailKind::SchedulerStopped));
    cofiber::ensure_eq!(task.cancel(), false);
    Ok(())
}
