// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Epoll reactors and the process-wide runtime that drives them.

mod epoll;
mod operation;
mod runtime;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    epoll::{
        EpollDriver,
        Reactor,
    },
    operation::{
        complete_read,
        complete_write,
        read_fd,
        write_fd,
        Interest,
        IoOperation,
        ReadSome,
        Readiness,
        WriteSome,
    },
    runtime::ReactorRuntime,
};
