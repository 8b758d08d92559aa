// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cooperative fiber scheduling runtime with a reactor-driven asynchronous I/O bridge.
//!
//! Every OS thread that runs fibers owns exactly one [runtime::scheduler::Scheduler]. Code submitted to a scheduler
//! is written in a blocking style on top of [runtime::promise::PromiseFuture]s, and each `.await` hands the OS thread
//! back to the scheduler so that other fibers can run. I/O readiness is detected by a process-wide
//! [reactor::ReactorRuntime] and delivered to the waiting fibers through promises.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod asyncio;
pub mod reactor;
pub mod runtime;

pub use self::runtime::{
    fail::{
        Fail,
        FailKind,
    },
    promise::{
        promise,
        Promise,
        PromiseFuture,
    },
    scheduler::{
        Scheduler,
        SchedulerHandle,
        SchedulerThread,
    },
};

//======================================================================================================================
// Macros
//======================================================================================================================

/// Ensures that two expressions are equal, otherwise returns an error with the location of the failed check.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    anyhow::bail!(r#"ensure failed: `(left == right)`
  left: `{:?}`,
 right: `{:?}` at {}:{}"#,
                        &*left_val, &*right_val, file!(), line!())
                }
            }
        }
    });
}

/// Ensures that two expressions are not equal, otherwise returns an error with the location of the failed check.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => ({
        match (&$left, &$right) {
            (left_val, right_val) => {
                if *left_val == *right_val {
                    anyhow::bail!(r#"ensure failed: `(left != right)`
  left: `{:?}`,
 right: `{:?}` at {}:{}"#,
                        &*left_val, &*right_val, file!(), line!())
                }
            }
        }
    });
}
