// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        fail::Fail,
        limits::ROOT_FIBER_ID,
        Fibers,
    },
    scheduler::{
        context::Context,
        registry::InternalId,
        waitlist::{
            WaitEntry,
            WaitList,
        },
    },
};
use ::std::{
    any::Any,
    cell::OnceCell,
    fmt,
    rc::Rc,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Identifier of a fiber. Identifiers are handed out in increasing order and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

/// Scheduling state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    /// Eligible to run.
    Ready,
    /// Blocked until its join target finishes.
    Waiting,
    /// Done. Will be reclaimed by the scheduler and never runs again.
    Finished,
}

/// Value a fiber hands to the fibers that join it. Every joiner receives the same shared value.
pub type FiberValue = Rc<dyn Any>;

/// Procedure a fiber runs. Returning from it is the same as calling [Fibers::exit] with the returned value.
pub type FiberEntry = Box<dyn FnOnce(&Fibers) -> Option<FiberValue>>;

/// Fiber record.
pub struct Fiber {
    id: FiberId,
    status: FiberStatus,
    context: Context,
    /// Written once, by the fiber itself, when it exits.
    retval: OnceCell<Option<FiberValue>>,
    /// Fiber we are waiting on.
    join_target: Option<FiberId>,
    /// Fibers waiting on us.
    waiters: WaitList,
    /// Value handed over by our join target when it woke us up.
    delivered: Option<Option<FiberValue>>,
    /// Entry procedure, until the fiber first runs.
    entry: Option<FiberEntry>,
    /// Neighbours in the registry ring.
    pub(super) next: InternalId,
    pub(super) prev: InternalId,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Fiber {
    /// Creates the record of a new fiber. The record is not linked anywhere yet.
    pub fn new(id: FiberId, context: Context, entry: FiberEntry) -> Self {
        Self {
            id,
            status: FiberStatus::Ready,
            context,
            retval: OnceCell::new(),
            join_target: None,
            waiters: WaitList::default(),
            delivered: None,
            entry: Some(entry),
            next: InternalId::from(0),
            prev: InternalId::from(0),
        }
    }

    /// Creates the record of the root fiber, which runs on the thread that created the runtime.
    pub fn root(context: Context) -> Self {
        Self {
            id: FiberId::root(),
            status: FiberStatus::Ready,
            context,
            retval: OnceCell::new(),
            join_target: None,
            waiters: WaitList::default(),
            delivered: None,
            entry: None,
            next: InternalId::from(0),
            prev: InternalId::from(0),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn status(&self) -> FiberStatus {
        self.status
    }

    pub fn join_target(&self) -> Option<FiberId> {
        self.join_target
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Takes the entry procedure. Only the first call returns something.
    pub fn take_entry(&mut self) -> Option<FiberEntry> {
        self.entry.take()
    }

    /// Return value, if the fiber has exited.
    pub fn retval(&self) -> Option<FiberValue> {
        self.retval.get().cloned().flatten()
    }

    /// Registers `waiter` as waiting on this fiber. Finished fibers accept no waiters.
    pub fn add_waiter(&mut self, waiter: FiberId) -> Result<(), Fail> {
        if self.status == FiberStatus::Finished {
            let cause: String = format!("fiber already finished (fiber={:?}, waiter={:?})", self.id, waiter);
            error!("add_waiter(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.waiters.push(waiter)
    }

    /// Removes every waiter, oldest first.
    pub fn take_waiters(&mut self) -> Vec<WaitEntry> {
        self.waiters.drain().collect()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.is_empty()
    }

    /// Ready → Waiting on `target`.
    pub fn wait_on(&mut self, target: FiberId) {
        debug_assert_eq!(self.status, FiberStatus::Ready);
        self.join_target = Some(target);
        self.delivered = None;
        self.status = FiberStatus::Waiting;
    }

    /// Waiting → Ready, handing over the return value of the join target. Returns false if we were not waiting.
    pub fn wake(&mut self, value: Option<FiberValue>) -> bool {
        if self.status != FiberStatus::Waiting {
            return false;
        }
        self.delivered = Some(value);
        self.status = FiberStatus::Ready;
        true
    }

    /// Clears join bookkeeping once the fiber resumes after a join, returning what its target delivered.
    pub fn take_delivered(&mut self) -> Option<FiberValue> {
        self.join_target = None;
        self.status = FiberStatus::Ready;
        self.delivered.take().flatten()
    }

    /// Records the return value and marks the fiber finished. A fiber finishes once.
    pub fn finish(&mut self, value: Option<FiberValue>) -> Result<(), Fail> {
        if self.retval.set(value).is_err() {
            let cause: String = format!("fiber already exited (fiber={:?})", self.id);
            error!("finish(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        self.join_target = None;
        self.status = FiberStatus::Finished;
        Ok(())
    }
}

impl FiberId {
    pub fn root() -> Self {
        Self(ROOT_FIBER_ID)
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_FIBER_ID
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl From<u64> for FiberId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<FiberId> for u64 {
    fn from(value: FiberId) -> Self {
        value.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("join_target", &self.join_target)
            .field("waiters", &self.waiters.len())
            .field("next", &self.next)
            .field("prev", &self.prev)
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
