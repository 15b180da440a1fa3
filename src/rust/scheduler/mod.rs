// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod context;
pub mod fiber;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;
pub mod waitlist;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    context::Context,
    fiber::{
        Fiber,
        FiberEntry,
        FiberId,
        FiberStatus,
        FiberValue,
    },
    registry::{
        InternalId,
        Registry,
    },
    scheduler::{
        Scheduler,
        Selection,
    },
};
