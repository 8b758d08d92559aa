// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::flexi_logger::{
    Logger,
    LoggerHandle,
};
use ::std::sync::{
    Mutex,
    Once,
    PoisonError,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

/// Keeps the logger alive for the lifetime of the process.
static LOGGER: Mutex<Option<LoggerHandle>> = Mutex::new(None);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes logging features. The log specification is read from `RUST_LOG` and defaults to off.
pub fn initialize() {
    INIT_LOG.call_once(|| {
        let handle: LoggerHandle = match Logger::try_with_env_or_str("off").and_then(|logger| logger.start()) {
            Ok(handle) => handle,
            // Another logger is already installed.
            Err(e) => {
                eprintln!("initialize(): failed to start logger: {}", e);
                return;
            },
        };
        *LOGGER.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    });
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
