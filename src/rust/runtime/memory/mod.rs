// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod shared_buffer;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::shared_buffer::SharedBuffer;
