// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Round-robin fiber scheduler.
//!
//! The scheduler runs on a context of its own, with a stack that belongs to no fiber. Fibers enter it when they
//! join, exit, or honour a preemption tick; it then walks the registry ring starting right after the current fiber:
//!
//! - a finished fiber has its remaining waiters released, is destroyed along with its return value, and the walk
//!   goes on;
//! - a waiting fiber whose join target has finished is woken up and picked;
//! - any other waiting fiber is skipped;
//! - a ready fiber is picked.
//!
//! The walk always terminates: finished fibers are removed as they are met, and a full lap over waiting fibers is
//! reported as [Selection::Idle].

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
            FiberId,
            FiberStatus,
            FiberValue,
        },
        lifecycle::{
            self,
            Destroyed,
        },
        registry::{
            InternalId,
            Registry,
        },
    },
};
use ::libc::c_void;

//======================================================================================================================
// Structures
//======================================================================================================================

/// What the scheduler decided to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum Selection {
    /// Hand the processor to this fiber.
    Run(InternalId),
    /// Every live fiber is waiting on another one. Nothing can make progress.
    Idle,
    /// The registry is empty.
    Shutdown,
}

/// Fiber scheduler.
pub struct Scheduler {
    /// Dedicated execution context. Built when the first fiber is created.
    context: Option<Context>,
    /// Set while the scheduler has nothing runnable.
    idle: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    pub fn new() -> Self {
        Self {
            context: None,
            idle: false,
        }
    }

    /// Builds the dedicated scheduler context. It runs `entry(arg)` and falls back to `link` if that ever returns.
    ///
    /// # Safety
    ///
    /// `link` must outlive the scheduler and `arg` must be valid whenever `entry` runs.
    pub unsafe fn start(&mut self, stack_size: usize, entry: EntryFn, arg: *mut c_void, link: &Context) -> Result<(), Fail> {
        if self.context.is_some() {
            return Ok(());
        }
        self.context = Some(Context::new(stack_size, entry, arg, Some(link))?);
        debug!("start(): scheduler context ready (stack_size={:?})", stack_size);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.context.is_some()
    }

    pub fn context(&self) -> Result<&Context, Fail> {
        match self.context.as_ref() {
            Some(context) => Ok(context),
            None => Err(Fail::new(libc::ENOTRECOVERABLE, "scheduler has not been started")),
        }
    }

    pub fn context_mut(&mut self) -> Result<&mut Context, Fail> {
        match self.context.as_mut() {
            Some(context) => Ok(context),
            None => Err(Fail::new(libc::ENOTRECOVERABLE, "scheduler has not been started")),
        }
    }

    /// Walks the ring from the fiber after the current one and picks the next fiber to run.
    pub fn select(&mut self, registry: &mut Registry) -> Result<Selection, Fail> {
        let mut candidate: InternalId = registry.next_of(registry.current_key())?;
        // Candidates seen since the last reclaim.
        let mut visited: usize = 0;

        loop {
            let (id, status, join_target): (FiberId, FiberStatus, Option<FiberId>) = match registry.get(candidate) {
                Some(fiber) => (fiber.id(), fiber.status(), fiber.join_target()),
                None => {
                    let cause: String = format!("ring points to a freed record (key={:?})", candidate);
                    error!("select(): {}", cause);
                    return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
                },
            };

            match status {
                FiberStatus::Finished => {
                    release_waiters(registry, candidate)?;
                    match lifecycle::destroy(registry, candidate)? {
                        Destroyed::Next(next) => candidate = next,
                        Destroyed::Emptied => {
                            info!("select(): every fiber has been reclaimed");
                            return Ok(Selection::Shutdown);
                        },
                    }
                    visited = 0;
                    continue;
                },
                FiberStatus::Waiting => {
                    if let Some(value) = join_target.and_then(|target| self.finished_value(registry, target)) {
                        if let Some(fiber) = registry.get_mut(candidate) {
                            fiber.wake(value);
                        }
                        trace!("select(): woke {:?} (join target {:?} finished)", id, join_target);
                        return Ok(self.run(candidate));
                    }
                },
                FiberStatus::Ready => return Ok(self.run(candidate)),
            }

            visited += 1;
            if visited > registry.len() {
                if !self.idle {
                    warn!("select(): no runnable fiber, every live fiber is waiting (count={:?})", registry.len());
                }
                self.idle = true;
                return Ok(Selection::Idle);
            }
            candidate = registry.next_of(candidate)?;
        }
    }

    fn run(&mut self, key: InternalId) -> Selection {
        self.idle = false;
        Selection::Run(key)
    }

    /// Return value of `target` if it has finished, whether or not it has been reclaimed yet.
    fn finished_value(&self, registry: &Registry, target: FiberId) -> Option<Option<FiberValue>> {
        match registry.by_id(target) {
            Some(fiber) if fiber.status() == FiberStatus::Finished => Some(fiber.retval()),
            Some(_) => None,
            // Identifiers are never reused, so a fiber that left the registry has finished. Its waiters were released
            // before it was destroyed, so nobody is owed its value anymore.
            None => Some(None),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Drains the wait-list of the finished fiber at `key`: every waiter still waiting on it becomes ready and receives
/// its return value. Returns how many fibers were woken up.
pub fn release_waiters(registry: &mut Registry, key: InternalId) -> Result<usize, Fail> {
    let (id, value, waiters) = match registry.get_mut(key) {
        Some(fiber) => (fiber.id(), fiber.retval(), fiber.take_waiters()),
        None => {
            let cause: String = format!("no fiber at this offset (key={:?})", key);
            error!("release_waiters(): {}", cause);
            return Err(Fail::new(libc::ENOTRECOVERABLE, &cause));
        },
    };

    let mut woken: usize = 0;
    for entry in waiters {
        match registry.by_id_mut(entry.waiter) {
            Some(waiter) if waiter.join_target() == Some(id) => {
                if waiter.wake(value.clone()) {
                    woken += 1;
                }
            },
            _ => trace!("release_waiters(): stale waiter {:?} on {:?}", entry.waiter, id),
        }
    }
    trace!("release_waiters(): id={:?} woken={:?}", id, woken);
    Ok(woken)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
