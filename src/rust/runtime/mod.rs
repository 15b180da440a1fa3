// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fiber runtime.
//!
//! A [Runtime] owns every piece of scheduling state: the fiber registry, the scheduler and its dedicated context, and
//! the preemption driver. It is created by the thread that will host the fibers, which becomes the root fiber. Fibers
//! reach the runtime through the [Fibers] handle passed to their entry procedure.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod config;
pub mod fail;
pub mod limits;
pub mod logging;
pub mod timer;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::{
        config::{
            Config,
            RuntimeOptions,
        },
        fail::Fail,
        timer::PreemptionDriver,
    },
    scheduler::{
        context::{
            self,
            Context,
        },
        fiber::{
            Fiber,
            FiberEntry,
            FiberId,
            FiberStatus,
            FiberValue,
        },
        lifecycle,
        registry::{
            InternalId,
            Registry,
        },
        scheduler::{
            self as sched,
            Scheduler,
            Selection,
        },
    },
};
use ::libc::{
    c_uint,
    c_void,
};
use ::std::{
    any::Any,
    convert::Infallible,
    ops::Deref,
    panic::{
        self,
        AssertUnwindSafe,
    },
    process,
    ptr::NonNull,
    rc::Rc,
    thread,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduling state shared by the root fiber, every other fiber and the scheduler context.
pub struct RuntimeState {
    /// Every live fiber.
    registry: Registry,
    /// Round-robin scheduler.
    scheduler: Scheduler,
    /// Preemption tick.
    driver: PreemptionDriver,
    /// Settings this runtime was created with.
    options: RuntimeOptions,
    /// Identifier of the next fiber to be created.
    next_id: u64,
}

/// Handle through which fibers operate on the runtime.
///
/// The handle only lives on the thread that created the runtime, and only ever one fiber runs at a time, so each
/// operation has exclusive access to the scheduling state for as long as it does not switch away.
pub struct Fibers {
    state: NonNull<RuntimeState>,
}

/// Fiber runtime. Dropping it releases every fiber that is still alive.
pub struct Runtime {
    fibers: Fibers,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Runtime {
    /// Creates a runtime hosted by the calling thread. The calling thread becomes the root fiber.
    pub fn new(options: RuntimeOptions) -> Result<Self, Fail> {
        logging::initialize(&options.log_spec);

        let root: Fiber = Fiber::root(Context::capture()?);
        let driver: PreemptionDriver = PreemptionDriver::new(options.tick_source, options.quantum)?;
        info!(
            "new(): stack_size={:?} quantum={:?} tick_source={}",
            options.stack_size, options.quantum, options.tick_source
        );

        let state: Box<RuntimeState> = Box::new(RuntimeState {
            registry: Registry::new(root),
            scheduler: Scheduler::new(),
            driver,
            options,
            next_id: u64::from(FiberId::root()) + 1,
        });
        Ok(Self {
            fibers: Fibers {
                state: NonNull::from(Box::leak(state)),
            },
        })
    }

    /// Creates a runtime with the settings of a configuration file.
    pub fn from_config(config: &Config) -> Result<Self, Fail> {
        Self::new(config.options()?)
    }

    /// Creates a runtime with the built-in settings.
    pub fn with_defaults() -> Result<Self, Fail> {
        Self::new(RuntimeOptions::default())
    }

    /// Waits for every fiber to finish and be reclaimed, then releases the runtime.
    pub fn shutdown(self) -> Result<(), Fail> {
        loop {
            let pending: Vec<FiberId> = self
                .state()
                .registry
                .ids()
                .into_iter()
                .filter(|id| !id.is_root())
                .collect();
            if pending.is_empty() {
                break;
            }
            for id in pending {
                match self.join(id) {
                    Ok(_) => (),
                    // Finished and reclaimed while we were waiting on an earlier one.
                    Err(e) if e.errno == libc::ESRCH => (),
                    Err(e) => return Err(e),
                }
            }
            // Let the scheduler sweep fibers that finished without being reclaimed.
            self.yield_now()?;
        }
        info!("shutdown(): ticks={:?}", self.ticks());
        Ok(())
    }
}

impl Fibers {
    /// Creates a fiber that runs `entry` and returns its identifier. The value returned by `entry` is handed to every
    /// fiber that joins the new one, as if it had been passed to [Fibers::exit]. The fiber first runs the next time
    /// the scheduler picks it.
    pub fn create<F>(&self, entry: F) -> Result<FiberId, Fail>
    where
        F: FnOnce(&Fibers) -> Option<FiberValue> + 'static,
    {
        let arg: *mut c_void = self.state.as_ptr() as *mut c_void;
        let state: &mut RuntimeState = self.state();

        if !state.scheduler.is_started() {
            let root: &Context = state.registry.by_id(FiberId::root()).map(Fiber::context).ok_or_else(|| {
                let cause: &str = "root fiber is not registered";
                error!("create(): {}", cause);
                Fail::new(libc::ENOTRECOVERABLE, cause)
            })?;
            unsafe { state.scheduler.start(state.options.stack_size, scheduler_main, arg, root)? };
            state.driver.start()?;
        }

        let id: FiberId = FiberId::from(state.next_id);
        let entry: FiberEntry = Box::new(entry);
        let fiber: Fiber = {
            let link: &Context = state.scheduler.context()?;
            unsafe { lifecycle::spawn(id, state.options.stack_size, fiber_main, arg, link, entry)? }
        };

        state.driver.enter_critical();
        let inserted: Result<InternalId, Fail> = state.registry.insert(fiber);
        state.driver.leave_critical();
        inserted?;

        state.next_id += 1;
        debug!("create(): id={:?} count={:?}", id, state.registry.len());
        Ok(id)
    }

    /// Waits for fiber `id` to finish and returns the value it exited with.
    pub fn join(&self, id: FiberId) -> Result<Option<FiberValue>, Fail> {
        {
            let state: &mut RuntimeState = self.state();
            let current: FiberId = state.registry.current()?.id();

            let status: FiberStatus = match state.registry.status(id) {
                Some(status) => status,
                None => {
                    let cause: String = if u64::from(id) < state.next_id {
                        format!("fiber has already been reclaimed (id={:?})", id)
                    } else {
                        format!("no such fiber (id={:?})", id)
                    };
                    warn!("join(): {}", cause);
                    return Err(Fail::new(libc::ESRCH, &cause));
                },
            };

            if id == current {
                let cause: String = format!("fiber cannot join itself (id={:?})", id);
                warn!("join(): {}", cause);
                return Err(Fail::new(libc::EDEADLK, &cause));
            }

            if status == FiberStatus::Finished {
                return Ok(state.registry.by_id(id).and_then(Fiber::retval));
            }

            if state.driver.in_critical() {
                let cause: String = format!("cannot wait inside a critical section (id={:?})", current);
                error!("join(): {}", cause);
                return Err(Fail::new(libc::EBUSY, &cause));
            }

            state.driver.enter_critical();
            let registered: Result<(), Fail> = match state.registry.by_id_mut(id) {
                Some(target) => target.add_waiter(current),
                None => Err(Fail::new(libc::ENOTRECOVERABLE, "join target vanished")),
            };
            if registered.is_ok() {
                if let Ok(fiber) = state.registry.current_mut() {
                    fiber.wait_on(id);
                }
            }
            state.driver.leave_critical();
            registered?;
            trace!("join(): {:?} waits on {:?}", current, id);
        }

        self.enter_scheduler()?;

        let value: Option<FiberValue> = self.state().registry.current_mut()?.take_delivered();
        Ok(value)
    }

    /// Terminates the calling fiber with `value`, which is handed to every fiber that joined it. Never returns on
    /// success. Values owned by the caller's stack frames are not dropped.
    pub fn exit(&self, value: Option<FiberValue>) -> Result<Infallible, Fail> {
        let state: &mut RuntimeState = self.state();
        let current: &Fiber = state.registry.current()?;
        if current.is_root() {
            let cause: &str = "root fiber cannot exit";
            error!("exit(): {}", cause);
            return Err(Fail::new(libc::EPERM, cause));
        }
        if state.driver.in_critical() {
            let cause: String = format!("cannot exit inside a critical section (id={:?})", current.id());
            error!("exit(): {}", cause);
            return Err(Fail::new(libc::EBUSY, &cause));
        }
        let id: FiberId = current.id();
        let key: InternalId = state.registry.current_key();

        state.driver.enter_critical();
        let finished: Result<usize, Fail> = match state.registry.current_mut().and_then(|fiber| fiber.finish(value)) {
            Ok(()) => sched::release_waiters(&mut state.registry, key),
            Err(e) => Err(e),
        };
        state.driver.leave_critical();
        let woken: usize = finished?;
        debug!("exit(): id={:?} woken={:?}", id, woken);

        let scheduler: *const Context = state.scheduler.context()?;
        unsafe { Context::resume(scheduler) }
    }

    /// Number of live fibers, the root included.
    pub fn fiber_count(&self) -> usize {
        self.state().registry.len()
    }

    /// Identifier of the running fiber.
    pub fn current(&self) -> FiberId {
        match self.state().registry.current() {
            Ok(fiber) => fiber.id(),
            Err(e) => {
                error!("current(): {:?}", e);
                process::abort()
            },
        }
    }

    /// Status of a live fiber.
    pub fn status(&self, id: FiberId) -> Option<FiberStatus> {
        self.state().registry.status(id)
    }

    /// Hands the processor to the next fiber in line. Returns when the scheduler picks the caller again.
    pub fn yield_now(&self) -> Result<(), Fail> {
        if !self.state().scheduler.is_started() {
            // Nobody else to run.
            return Ok(());
        }
        self.enter_scheduler()
    }

    /// Yields if a preemption tick is pending. Returns whether the caller was preempted.
    pub fn preempt_point(&self) -> bool {
        if !self.state().driver.take_pending() {
            return false;
        }
        match self.enter_scheduler() {
            Ok(()) => true,
            Err(e) => {
                warn!("preempt_point(): {:?}", e);
                false
            },
        }
    }

    /// Runs `f` with preemption disabled. `f` must not join, exit or yield.
    pub fn critical_section<R>(&self, f: impl FnOnce() -> R) -> R {
        self.state().driver.enter_critical();
        let result: R = f();
        self.state().driver.leave_critical();
        result
    }

    /// Number of preemption ticks honoured so far.
    pub fn ticks(&self) -> u64 {
        self.state().driver.ticks()
    }

    /// Settings of this runtime.
    pub fn options(&self) -> &RuntimeOptions {
        &self.state().options
    }

    /// Saves the running fiber and continues in the scheduler context.
    fn enter_scheduler(&self) -> Result<(), Fail> {
        let state: &mut RuntimeState = self.state();
        if state.driver.in_critical() {
            let cause: &str = "cannot switch fibers inside a critical section";
            error!("enter_scheduler(): {}", cause);
            return Err(Fail::new(libc::EBUSY, cause));
        }
        let to: *const Context = state.scheduler.context()?;
        let from: *mut Context = state.registry.current_mut()?.context_mut();
        unsafe { Context::switch(from, to) };
        Ok(())
    }

    /// Grants access to the scheduling state. Callers must not hold on to the reference across a context switch.
    #[allow(clippy::mut_from_ref)]
    fn state(&self) -> &mut RuntimeState {
        unsafe { &mut *self.state.as_ptr() }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Wraps `v` in a value that can be handed to joiners.
pub fn value<T: Any>(v: T) -> FiberValue {
    Rc::new(v)
}

/// Borrows the contents of a fiber value as a `T`, if that is what it holds.
pub fn downcast<T: Any>(value: &FiberValue) -> Option<&T> {
    value.downcast_ref::<T>()
}

/// First frame of every fiber: runs the entry procedure, then exits with its result.
extern "C" fn fiber_main(hi: c_uint, lo: c_uint) {
    let fibers: Fibers = match NonNull::new(context::join_pointer(hi, lo) as *mut RuntimeState) {
        Some(state) => Fibers { state },
        None => {
            error!("fiber_main(): missing runtime state");
            process::abort()
        },
    };

    let (id, entry): (FiberId, Option<FiberEntry>) = match fibers.state().registry.current_mut() {
        Ok(fiber) => (fiber.id(), fiber.take_entry()),
        Err(e) => {
            error!("fiber_main(): {:?}", e);
            process::abort()
        },
    };
    trace!("fiber_main(): id={:?}", id);

    let value: Option<FiberValue> = match entry {
        Some(entry) => match panic::catch_unwind(AssertUnwindSafe(|| entry(&fibers))) {
            Ok(value) => value,
            Err(_) => {
                error!("fiber_main(): fiber panicked (id={:?})", id);
                None
            },
        },
        None => {
            warn!("fiber_main(): fiber has no entry procedure (id={:?})", id);
            None
        },
    };

    match fibers.exit(value) {
        Ok(never) => match never {},
        Err(e) => {
            error!("fiber_main(): cannot exit (id={:?}, error={:?})", id, e);
            process::abort()
        },
    }
}

/// Body of the scheduler context. Picks the next fiber and switches to it, forever.
extern "C" fn scheduler_main(hi: c_uint, lo: c_uint) {
    let shared: *mut RuntimeState = context::join_pointer(hi, lo) as *mut RuntimeState;
    if shared.is_null() {
        error!("scheduler_main(): missing runtime state");
        process::abort();
    }

    loop {
        let state: &mut RuntimeState = unsafe { &mut *shared };
        state.driver.suspend();

        match state.scheduler.select(&mut state.registry) {
            Ok(Selection::Run(key)) => {
                state.registry.set_current(key);
                let to: *const Context = match state.registry.get(key) {
                    Some(fiber) => fiber.context() as *const Context,
                    None => {
                        error!("scheduler_main(): selected fiber vanished (key={:?})", key);
                        process::abort()
                    },
                };
                let from: *mut Context = match state.scheduler.context_mut() {
                    Ok(context) => context as *mut Context,
                    Err(e) => {
                        error!("scheduler_main(): {:?}", e);
                        process::abort()
                    },
                };
                state.driver.rearm();
                unsafe { Context::switch(from, to) };
            },
            Ok(Selection::Idle) => thread::sleep(state.driver.quantum()),
            Ok(Selection::Shutdown) => {
                info!("scheduler_main(): no fibers left, exiting");
                process::exit(0)
            },
            Err(e) => {
                error!("scheduler_main(): registry is corrupted ({:?})", e);
                process::abort()
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for Runtime {
    type Target = Fibers;

    fn deref(&self) -> &Self::Target {
        &self.fibers
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let state: Box<RuntimeState> = unsafe { Box::from_raw(self.fibers.state.as_ptr()) };
        match state.registry.current() {
            Ok(fiber) if fiber.is_root() => (),
            _ => {
                error!("drop(): runtime released away from the root fiber");
                process::abort()
            },
        }
        if state.registry.len() > 1 {
            warn!("drop(): releasing live fibers (count={:?})", state.registry.len() - 1);
        }
        drop(state);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
