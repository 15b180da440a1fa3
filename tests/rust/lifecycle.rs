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
    ensure_neq,
    value,
    Config,
    FiberId,
    FiberStatus,
    FiberValue,
    Fibers,
    Runtime,
    TickSource,
};
use ::rand::{
    rngs::SmallRng,
    Rng,
    SeedableRng,
};
use ::std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Helper Functions
//======================================================================================================================

/// Counts the fibers we created that the runtime still holds.
fn live(runtime: &Runtime, created: &[FiberId]) -> usize {
    created.iter().filter(|id| runtime.status(**id).is_some()).count()
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Identifiers are handed out in order and the fiber count tracks creation and reclaim.
#[test]
fn fiber_count_tracks_creation_and_reclaim() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Disabled)?;
    ensure_eq!(runtime.fiber_count(), 1);
    ensure_eq!(runtime.current(), FiberId::root());

    let mut created: Vec<FiberId> = Vec::new();
    for i in 0..3u64 {
        created.push(runtime.create(move |_: &Fibers| Some(value(i)))?);
    }
    ensure_eq!(created, vec![FiberId::from(1), FiberId::from(2), FiberId::from(3)]);
    ensure_eq!(runtime.fiber_count(), 4);
    for id in created.iter() {
        ensure_eq!(runtime.status(*id), Some(FiberStatus::Ready));
    }

    // One lap runs everybody, the next one reclaims them.
    runtime.yield_now()?;
    ensure_eq!(runtime.fiber_count(), 4);
    runtime.yield_now()?;
    ensure_eq!(runtime.fiber_count(), 1);
    ensure_eq!(live(&runtime, &created), 0);

    let next: FiberId = runtime.create(|_: &Fibers| None)?;
    ensure_eq!(next, FiberId::from(4));
    runtime.shutdown()?;
    Ok(())
}

/// Ten fibers: fiber 1 joins fiber 10, which spins until it is preempted, while the rest exit right away.
#[test]
fn ten_fibers_run_to_completion() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Thread)?;
    let order: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));

    for i in 1..=10u64 {
        let order: Rc<RefCell<Vec<u64>>> = order.clone();
        let id: FiberId = runtime.create(move |fibers: &Fibers| {
            match i {
                1 => {
                    if let Ok(Some(retval)) = fibers.join(FiberId::from(10)) {
                        order.borrow_mut().push(downcast::<u64>(&retval).copied().unwrap_or(0));
                    }
                },
                10 => {
                    let deadline: Instant = Instant::now() + Duration::from_secs(10);
                    while !fibers.preempt_point() && Instant::now() < deadline {}
                },
                _ => (),
            }
            order.borrow_mut().push(i);
            let _ = fibers.exit(Some(value(i)));
            None
        })?;
        ensure_eq!(id, FiberId::from(i));
    }

    let retval: FiberValue = runtime.join(FiberId::from(1))?.ok_or_else(|| anyhow::anyhow!("missing value"))?;
    ensure_eq!(downcast::<u64>(&retval), Some(&1));

    while runtime.fiber_count() > 1 {
        runtime.yield_now()?;
    }
    ensure_eq!(runtime.fiber_count(), 1);

    // Short-lived fibers finish in creation order, then fiber 10 hands its value to fiber 1.
    let order: Vec<u64> = order.borrow().clone();
    ensure_eq!(order, vec![2, 3, 4, 5, 6, 7, 8, 9, 10, 10, 1]);
    ensure_neq!(runtime.ticks(), 0);
    runtime.shutdown()?;
    Ok(())
}

/// Fibers may create and join fibers of their own.
#[test]
fn fibers_create_fibers() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Disabled)?;
    let parent: FiberId = runtime.create(|fibers: &Fibers| {
        let mut total: u32 = 0;
        let mut children: Vec<FiberId> = Vec::new();
        for n in 1..=4u32 {
            match fibers.create(move |_: &Fibers| Some(value(n * n))) {
                Ok(id) => children.push(id),
                Err(_) => return None,
            }
        }
        for id in children {
            if let Ok(Some(retval)) = fibers.join(id) {
                total += downcast::<u32>(&retval).copied().unwrap_or(0);
            }
        }
        Some(value(total))
    })?;

    let retval: FiberValue = runtime.join(parent)?.ok_or_else(|| anyhow::anyhow!("missing value"))?;
    ensure_eq!(downcast::<u32>(&retval), Some(&30));
    runtime.shutdown()?;
    Ok(())
}

/// The root fiber cannot exit, and trying to changes nothing.
#[test]
fn exit_on_root_is_rejected() -> Result<()> {
    let runtime: Runtime = common::runtime(TickSource::Disabled)?;
    runtime.create(|_: &Fibers| None)?;
    ensure_eq!(common::errno(runtime.exit(Some(value(1u8)))), Some(libc::EPERM));
    ensure_eq!(runtime.fiber_count(), 2);
    ensure_eq!(runtime.status(FiberId::root()), Some(FiberStatus::Ready));
    runtime.shutdown()?;
    Ok(())
}

/// Random interleavings of create, join and yield keep the fiber count consistent with what is alive. Every join on a
/// live fiber observes the value it exited with, and every join on a reclaimed one fails.
#[test]
fn random_sequences_keep_registry_consistent() -> Result<()> {
    let mut rng: SmallRng = SmallRng::seed_from_u64(42);
    let runtime: Runtime = common::runtime(TickSource::Disabled)?;
    let mut created: Vec<FiberId> = Vec::new();
    let mut expected: HashMap<FiberId, u64> = HashMap::new();

    for step in 0..200u64 {
        match rng.gen_range(0..3) {
            0 => {
                let yields: usize = rng.gen_range(0..4);
                let id: FiberId = runtime.create(move |fibers: &Fibers| {
                    for _ in 0..yields {
                        if fibers.yield_now().is_err() {
                            return None;
                        }
                    }
                    Some(value(step))
                })?;
                created.push(id);
                expected.insert(id, step);
            },
            1 if !created.is_empty() => {
                let id: FiberId = created[rng.gen_range(0..created.len())];
                if runtime.status(id).is_none() {
                    ensure_eq!(common::errno(runtime.join(id)), Some(libc::ESRCH));
                } else {
                    let retval: FiberValue = runtime.join(id)?.ok_or_else(|| anyhow::anyhow!("missing value"))?;
                    ensure_eq!(downcast::<u64>(&retval), expected.get(&id));
                    ensure_neq!(runtime.status(id), Some(FiberStatus::Ready));
                }
            },
            _ => runtime.yield_now()?,
        }
        ensure_eq!(runtime.fiber_count(), live(&runtime, &created) + 1);
        ensure_eq!(runtime.status(FiberId::root()), Some(FiberStatus::Ready));
    }

    runtime.shutdown()?;
    Ok(())
}

/// A fiber whose stack cannot be allocated is reported to the caller and leaves no trace behind.
#[test]
fn stack_allocation_failure_changes_nothing() -> Result<()> {
    let runtime: Runtime = Runtime::new(common::options(TickSource::Disabled).with_stack_size(usize::MAX / 2))?;
    ensure_eq!(common::errno(runtime.create(|_: &Fibers| None)), Some(libc::ENOMEM));
    ensure_eq!(common::errno(runtime.create(|_: &Fibers| None)), Some(libc::ENOMEM));
    ensure_eq!(runtime.fiber_count(), 1);
    ensure_eq!(runtime.status(FiberId::from(1)), None);
    ensure_eq!(common::errno(runtime.join(FiberId::from(1))), Some(libc::ESRCH));
    runtime.yield_now()?;
    ensure_eq!(runtime.current(), FiberId::root());
    drop(runtime);

    // Nothing was consumed: the first fiber of a working runtime is still fiber 1.
    let runtime: Runtime = common::runtime(TickSource::Disabled)?;
    ensure_eq!(runtime.create(|_: &Fibers| None)?, FiberId::from(1));
    runtime.shutdown()?;
    Ok(())
}

/// Runtimes can be configured from a YAML document.
#[test]
fn runtime_from_config() -> Result<()> {
    let config: Config = Config::from_yaml_str(
        "fiberlib:\n  stack_size: 262144\n  quantum_us: 5000\n  tick_source: disabled\n  log_spec: warn\n",
    )?;
    let runtime: Runtime = Runtime::from_config(&config)?;
    ensure_eq!(runtime.options().stack_size, 262144);
    ensure_eq!(runtime.options().quantum, Duration::from_micros(5000));
    ensure_eq!(runtime.options().tick_source, TickSource::Disabled);

    let id: FiberId = runtime.create(|_: &Fibers| Some(value(())))?;
    ensure_eq!(runtime.join(id)?.is_some(), true);
    runtime.shutdown()?;
    Ok(())
}
