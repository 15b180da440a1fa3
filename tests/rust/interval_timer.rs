// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The interval timer is a process-wide resource, so these tests live in a binary of their own and take turns.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fiberlib::{
    ensure_eq,
    Fibers,
    Runtime,
    TickSource,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        Mutex,
        MutexGuard,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Serializes tests that own the interval timer.
static TIMER: Mutex<()> = Mutex::new(());

//======================================================================================================================
// Helper Functions
//======================================================================================================================

fn exclusive() -> MutexGuard<'static, ()> {
    TIMER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Only one runtime at a time may drive preemption from the interval timer.
#[test]
fn interval_timer_is_exclusive() -> Result<()> {
    let _guard: MutexGuard<'static, ()> = exclusive();

    let first: Runtime = common::runtime(TickSource::IntervalTimer)?;
    ensure_eq!(common::errno(Runtime::new(common::options(TickSource::IntervalTimer))), Some(libc::EBUSY));

    // Other tick sources are unaffected.
    let cooperative: Runtime = common::runtime(TickSource::Disabled)?;
    drop(cooperative);

    first.shutdown()?;
    let second: Runtime = common::runtime(TickSource::IntervalTimer)?;
    second.shutdown()?;
    Ok(())
}

/// Busy fibers are preempted by virtual timer signals.
#[test]
fn busy_fibers_are_preempted_by_signals() -> Result<()> {
    let _guard: MutexGuard<'static, ()> = exclusive();
    let runtime: Runtime = common::runtime(TickSource::IntervalTimer)?;

    let counts: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..2 {
        let counts: Rc<RefCell<Vec<u32>>> = counts.clone();
        runtime.create(move |fibers: &Fibers| {
            let deadline: Instant = Instant::now() + Duration::from_secs(10);
            let mut preemptions: u32 = 0;
            while preemptions < 3 && Instant::now() < deadline {
                if fibers.preempt_point() {
                    preemptions += 1;
                }
            }
            counts.borrow_mut().push(preemptions);
            None
        })?;
    }

    while runtime.fiber_count() > 1 {
        runtime.yield_now()?;
    }
    ensure_eq!(*counts.borrow(), vec![3, 3]);
    ensure_eq!(runtime.ticks() >= 6, true);
    runtime.shutdown()?;
    Ok(())
}
