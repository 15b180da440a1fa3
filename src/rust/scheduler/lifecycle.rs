// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::fail::Fail,
    scheduler::{
        context::{
            Context,
            EntryFn,
        },
        fiber::{
            Fiber,
            FiberEntry,
            FiberId,
            FiberStatus,
        },
        registry::{
            InternalId,
            Registry,
            Removal,
        },
    },
};
use ::libc::c_void;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outcome of [destroy].
#[derive(Debug, PartialEq, Eq)]
pub enum Destroyed {
    /// The fiber is gone. The scan continues at this record.
    Next(InternalId),
    /// The fiber was the last one alive.
    Emptied,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Allocates the stack, context and record of a new fiber. The context starts at `trampoline(arg)` and falls back
/// to `link` if the trampoline ever returns. The record is not registered.
///
/// # Safety
///
/// `link` must outlive the new fiber and `arg` must be valid whenever the trampoline runs.
pub unsafe fn spawn(
    id: FiberId,
    stack_size: usize,
    trampoline: EntryFn,
    arg: *mut c_void,
    link: &Context,
    entry: FiberEntry,
) -> Result<Fiber, Fail> {
    let context: Context = match Context::new(stack_size, trampoline, arg, Some(link)) {
        Ok(context) => context,
        Err(e) => {
            error!("spawn(): cannot create context (id={:?}, error={:?})", id, e);
            return Err(e);
        },
    };
    trace!("spawn(): id={:?} stack_size={:?}", id, stack_size);
    Ok(Fiber::new(id, context, entry))
}

/// Unlinks a finished fiber from the registry and releases its stack, record and return value. Only the scheduler
/// calls this, from its own context, so the fiber being destroyed is never the one executing this code. Waiters must
/// have been released beforehand.
pub fn destroy(registry: &mut Registry, key: InternalId) -> Result<Destroyed, Fail> {
    match registry.get(key) {
        Some(fiber) if fiber.status() == FiberStatus::Finished && !fiber.has_waiters() => (),
        Some(fiber) if fiber.status() == FiberStatus::Finished => {
            let cause: String = format!("fiber still has waiters (id={:?})", fiber.id());
            error!("destroy(): {}", cause);
            return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
        },
        Some(fiber) => {
            let cause: String = format!("refusing to destroy a live fiber (id={:?})", fiber.id());
            error!("destroy(): {}", cause);
            return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
        },
        None => {
            let cause: String = format!("no fiber to destroy (key={:?})", key);
            error!("destroy(): {}", cause);
            return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
        },
    }

    match registry.remove(key)? {
        Removal::Next { fiber, next } => {
            debug!("destroy(): id={:?} remaining={:?}", fiber.id(), registry.len());
            // Dropping the record releases its stack.
            drop(fiber);
            Ok(Destroyed::Next(next))
        },
        Removal::Emptied { fiber } => {
            debug!("destroy(): id={:?} was the last fiber", fiber.id());
            drop(fiber);
            Ok(Destroyed::Emptied)
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
