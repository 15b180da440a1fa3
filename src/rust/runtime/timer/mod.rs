// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Preemption driver.
//!
//! A tick source raises a notification every quantum. The notification handler never schedules anything: it only
//! records that a yield is pending. The running fiber honours the request at its next preemption point, which hands
//! control to the scheduler context.
//!
//! Critical sections stop the tick entirely and save whatever was left of the current quantum, so that a fiber does
//! not lose its turn to bookkeeping. Critical sections nest and only the outermost one touches the tick source.

mod interval;
mod thread;

//======================================================================================================================
// Exports
//======================================================================================================================

pub use self::{
    interval::IntervalTimer,
    thread::ThreadTicker,
};

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fmt,
    str::FromStr,
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Where preemption ticks come from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TickSource {
    /// A helper kernel thread that sleeps for a quantum and raises the pending flag.
    #[default]
    Thread,
    /// The process interval timer (`ITIMER_VIRTUAL`) delivering `SIGVTALRM`.
    IntervalTimer,
    /// No ticks at all: fibers only switch at join, exit and explicit yields.
    Disabled,
}

/// Tick source that never ticks.
pub struct NoTick;

/// Drives a tick source on behalf of the scheduler.
pub struct PreemptionDriver {
    /// Underlying tick source.
    tick: Box<dyn PreemptionTick>,
    /// Full length of a quantum.
    quantum: Duration,
    /// Has the driver been started? Nothing ticks before the first fiber is created.
    started: bool,
    /// Nesting depth of critical sections.
    depth: usize,
    /// Remainder of the quantum that was interrupted by the outermost critical section.
    saved: Option<Duration>,
    /// Number of ticks honoured so far.
    ticks: u64,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// The host facility that delivers a notification every quantum.
pub trait PreemptionTick {
    /// Starts ticking. The first notification arrives after `first`, then one every `interval`.
    fn arm(&mut self, first: Duration, interval: Duration) -> Result<(), Fail>;

    /// Stops ticking and returns how long was left until the next notification.
    fn stop(&mut self) -> Result<Duration, Fail>;

    /// Consumes the pending notification, if any.
    fn take_pending(&self) -> bool;
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl PreemptionDriver {
    /// Creates a driver for the given tick source. Nothing ticks until [PreemptionDriver::start] is called.
    pub fn new(source: TickSource, quantum: Duration) -> Result<Self, Fail> {
        let tick: Box<dyn PreemptionTick> = match source {
            TickSource::Thread => Box::new(ThreadTicker::new()?),
            TickSource::IntervalTimer => Box::new(IntervalTimer::new()?),
            TickSource::Disabled => Box::new(NoTick),
        };
        Ok(Self::with_tick(tick, quantum))
    }

    /// Creates a driver on top of an arbitrary tick source.
    pub fn with_tick(tick: Box<dyn PreemptionTick>, quantum: Duration) -> Self {
        Self {
            tick,
            quantum,
            started: false,
            depth: 0,
            saved: None,
            ticks: 0,
        }
    }

    /// Starts ticking at full quantum.
    pub fn start(&mut self) -> Result<(), Fail> {
        self.tick.arm(self.quantum, self.quantum)?;
        self.started = true;
        debug!("start(): preemption armed (quantum={:?})", self.quantum);
        Ok(())
    }

    /// Restarts the tick at full quantum. Called whenever a fiber is handed the processor.
    pub fn rearm(&mut self) {
        if !self.started {
            return;
        }
        // Whatever was pending belongs to the previous fiber.
        self.tick.take_pending();
        if let Err(e) = self.tick.arm(self.quantum, self.quantum) {
            warn!("rearm(): failed to arm tick source (error={:?})", e);
        }
    }

    /// Stops the tick on entry to the scheduler. The next [PreemptionDriver::rearm] starts a fresh quantum.
    pub fn suspend(&mut self) {
        debug_assert_eq!(self.depth, 0, "scheduler entered from within a critical section");
        self.saved = None;
        if !self.started {
            return;
        }
        if let Err(e) = self.tick.stop() {
            warn!("suspend(): failed to stop tick source (error={:?})", e);
        }
    }

    /// Enters a critical section.
    pub fn enter_critical(&mut self) {
        self.depth += 1;
        if self.depth > 1 || !self.started {
            return;
        }
        match self.tick.stop() {
            Ok(remaining) => self.saved = Some(remaining),
            Err(e) => warn!("enter_critical(): failed to stop tick source (error={:?})", e),
        }
    }

    /// Leaves a critical section, resuming the interrupted quantum when leaving the outermost one.
    pub fn leave_critical(&mut self) {
        debug_assert!(self.depth > 0, "unbalanced critical section");
        self.depth = self.depth.saturating_sub(1);
        if self.depth > 0 || !self.started {
            return;
        }
        let remaining: Duration = match self.saved.take() {
            // A quantum that ran out while ticking was stopped is due right away.
            Some(remaining) if !remaining.is_zero() => remaining,
            Some(_) => Duration::from_micros(1),
            None => self.quantum,
        };
        if let Err(e) = self.tick.arm(remaining, self.quantum) {
            warn!("leave_critical(): failed to arm tick source (error={:?})", e);
        }
    }

    /// Consumes a pending tick. Ticks are ignored inside critical sections.
    pub fn take_pending(&mut self) -> bool {
        if self.depth > 0 || !self.started {
            return false;
        }
        if self.tick.take_pending() {
            self.ticks += 1;
            return true;
        }
        false
    }

    /// Number of ticks honoured so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Full length of a quantum.
    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Are we inside a critical section?
    pub fn in_critical(&self) -> bool {
        self.depth > 0
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PreemptionTick for NoTick {
    fn arm(&mut self, _first: Duration, _interval: Duration) -> Result<(), Fail> {
        Ok(())
    }

    fn stop(&mut self) -> Result<Duration, Fail> {
        Ok(Duration::ZERO)
    }

    fn take_pending(&self) -> bool {
        false
    }
}

impl Drop for PreemptionDriver {
    fn drop(&mut self) {
        if self.started {
            if let Err(e) = self.tick.stop() {
                warn!("drop(): failed to stop tick source (error={:?})", e);
            }
        }
    }
}

impl FromStr for TickSource {
    type Err = Fail;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thread" => Ok(TickSource::Thread),
            "interval_timer" => Ok(TickSource::IntervalTimer),
            "disabled" => Ok(TickSource::Disabled),
            _ => {
                let cause: String = format!("unknown tick source (source={:?})", s);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

impl fmt::Display for TickSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickSource::Thread => write!(f, "thread"),
            TickSource::IntervalTimer => write!(f, "interval_timer"),
            TickSource::Disabled => write!(f, "disabled"),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
