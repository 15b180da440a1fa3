// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::fiberlib::{
    ensure_eq,
    FiberId,
    Fibers,
    Runtime,
    TickSource,
};
use ::std::{
    io,
    thread::{
        self,
        JoinHandle,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How long a runtime gets to finish before it is considered stuck.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);

//======================================================================================================================
// Helper Functions
//======================================================================================================================

/// Runs fibers 1 and 2 on a runtime of their own, with fiber 1 joining fiber 2 and, if `cycle` is set, fiber 2 joining
/// fiber 1. The root joins fiber 1 and reports on the returned channel once it is done.
fn run_joins(cycle: bool) -> Receiver<usize> {
    let (done_tx, done_rx): (Sender<usize>, Receiver<usize>) = crossbeam_channel::bounded(1);
    let spawned: io::Result<JoinHandle<()>> = thread::Builder::new()
        .name(format!("fibers-cycle-{}", cycle))
        .spawn(move || {
            let runtime: Runtime = match common::runtime(TickSource::Disabled) {
                Ok(runtime) => runtime,
                Err(_) => return,
            };
            let first: FiberId = FiberId::from(1);
            let second: FiberId = FiberId::from(2);
            let created: bool = runtime
                .create(move |fibers: &Fibers| {
                    let _ = fibers.join(second);
                    None
                })
                .and_then(|_| {
                    runtime.create(move |fibers: &Fibers| {
                        if cycle {
                            let _ = fibers.join(first);
                        }
                        None
                    })
                })
                .is_ok();
            if created && runtime.join(first).is_ok() {
                let _ = done_tx.send(runtime.fiber_count());
            }
        });
    if let Err(e) = spawned {
        eprintln!("run_joins(): cannot spawn runtime thread ({:?})", e);
    }
    done_rx
}

//======================================================================================================================
// Tests
//======================================================================================================================

/// Without a cycle the joins complete well within the liveness timeout.
#[test]
fn acyclic_joins_complete() -> Result<()> {
    let done: Receiver<usize> = run_joins(false);
    match done.recv_timeout(LIVENESS_TIMEOUT) {
        Ok(count) => ensure_eq!(count >= 1, true),
        Err(e) => anyhow::bail!("runtime did not finish ({:?})", e),
    }
    Ok(())
}

/// A join cycle is not broken: the root never gets to run again.
#[test]
fn join_cycle_deadlocks() -> Result<()> {
    let done: Receiver<usize> = run_joins(true);
    match done.recv_timeout(LIVENESS_TIMEOUT) {
        Err(RecvTimeoutError::Timeout) => Ok(()),
        Err(RecvTimeoutError::Disconnected) => anyhow::bail!("runtime thread failed"),
        Ok(_) => anyhow::bail!("join cycle did not deadlock"),
    }
}
