// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::fiberlib::{
    downcast,
    ensure_eq,
    value,
    FiberId,
    FiberValue,
    Fibers,
    Runtime,
    TickSource,
};
use ::std::{
    cell::RefCell,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound on how long a test fiber spins waiting for a tick.
const SPIN_LIMIT: Duration = Duration::from_secs(10);

/// Turns each busy fiber takes.
const TURNS: usize = 5;

//======================================================================================================================
// Tests
//======================================================================================================================

/// Two fibers that never yield on their own still take turns, one quantum at a time.
#[test]
fn busy_fibers_alternate_under_preemption() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Thread)?;
    let turns: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));

    let taken_by: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    for _ in 0..2 {
        let turns: Rc<RefCell<Vec<u64>>> = turns.clone();
        let taken_by: Rc<RefCell<Vec<usize>>> = taken_by.clone();
        runtime.create(move |fibers: &Fibers| {
            let me: u64 = u64::from(fibers.current());
            let deadline: Instant = Instant::now() + SPIN_LIMIT;
            let mut taken: usize = 0;
            while taken < TURNS && Instant::now() < deadline {
                if turns.borrow().last() != Some(&me) {
                    turns.borrow_mut().push(me);
                    taken += 1;
                }
                fibers.preempt_point();
            }
            taken_by.borrow_mut().push(taken);
            None
        })?;
    }

    // Either fiber may finish first, so wait for both to be reclaimed rather than joining them in turn.
    while runtime.fiber_count() > 1 {
        runtime.yield_now()?;
    }
    ensure_eq!(*taken_by.borrow(), vec![TURNS, TURNS]);

    let turns: Vec<u64> = turns.borrow().clone();
    ensure_eq!(turns.len(), 2 * TURNS);
    for (i, id) in turns.iter().enumerate() {
        ensure_eq!(*id, (i % 2) as u64 + 1);
    }
    ensure_eq!(runtime.ticks() >= (2 * TURNS - 2) as u64, true);
    runtime.shutdown()?;
    Ok(())
}

/// Ticks are held back inside critical sections and delivered shortly after leaving them.
#[test]
fn critical_section_defers_preemption() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Thread)?;
    let id: FiberId = runtime.create(|fibers: &Fibers| {
        let preempted_inside: bool = fibers.critical_section(|| {
            let until: Instant = Instant::now() + 3 * common::TEST_QUANTUM;
            let mut preempted: bool = false;
            while Instant::now() < until {
                preempted |= fibers.preempt_point();
            }
            preempted
        });

        let deadline: Instant = Instant::now() + SPIN_LIMIT;
        let mut preempted_after: bool = false;
        while !preempted_after && Instant::now() < deadline {
            preempted_after = fibers.preempt_point();
        }
        Some(value((preempted_inside, preempted_after)))
    })?;

    let retval: FiberValue = runtime.join(id)?.ok_or_else(|| anyhow::anyhow!("missing value"))?;
    ensure_eq!(downcast::<(bool, bool)>(&retval), Some(&(false, true)));
    runtime.shutdown()?;
    Ok(())
}

/// Without a tick source, only explicit yields switch fibers.
#[test]
fn disabled_tick_source_never_preempts() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Disabled)?;
    let id: FiberId = runtime.create(|fibers: &Fibers| {
        let until: Instant = Instant::now() + 3 * common::TEST_QUANTUM;
        let mut preempted: bool = false;
        while Instant::now() < until {
            preempted |= fibers.preempt_point();
        }
        Some(value(preempted))
    })?;

    let retval: FiberValue = runtime.join(id)?.ok_or_else(|| anyhow::anyhow!("missing value"))?;
    ensure_eq!(downcast::<bool>(&retval), Some(&false));
    ensure_eq!(runtime.ticks(), 0);
    runtime.shutdown()?;
    Ok(())
}
