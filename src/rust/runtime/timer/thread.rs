// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    timer::PreemptionTick,
};
use ::crossbeam_channel::{
    Receiver,
    RecvTimeoutError,
    Sender,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Requests sent to the ticker thread.
enum TickCommand {
    Arm { first: Duration, interval: Duration },
    Stop,
    Shutdown,
}

/// Tick source backed by a helper kernel thread. The thread never touches fiber state: it only raises a shared flag
/// when a quantum elapses.
pub struct ThreadTicker {
    /// Control channel to the ticker thread.
    commands: Sender<TickCommand>,
    /// Raised by the ticker thread, consumed by the fiber side.
    pending: Arc<AtomicBool>,
    /// Mirror of the ticker's schedule: first deadline and interval. Lets us compute the remaining quantum without
    /// a round trip to the ticker thread.
    schedule: Option<(Instant, Duration)>,
    worker: Option<JoinHandle<()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ThreadTicker {
    /// Spawns the ticker thread. It stays idle until armed.
    pub fn new() -> Result<Self, Fail> {
        let (commands, rx): (Sender<TickCommand>, Receiver<TickCommand>) = crossbeam_channel::unbounded();
        let pending: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let flag: Arc<AtomicBool> = pending.clone();
        let worker: JoinHandle<()> = thread::Builder::new()
            .name("fiber-ticker".to_string())
            .spawn(move || Self::run(rx, flag))?;
        trace!("new(): ticker thread spawned");
        Ok(Self {
            commands,
            pending,
            schedule: None,
            worker: Some(worker),
        })
    }

    /// Body of the ticker thread.
    fn run(commands: Receiver<TickCommand>, pending: Arc<AtomicBool>) {
        let mut next: Option<Instant> = None;
        let mut interval: Duration = Duration::ZERO;
        loop {
            let command: TickCommand = match next {
                Some(deadline) => match commands.recv_deadline(deadline) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => {
                        pending.store(true, Ordering::Release);
                        next = Some(deadline + interval);
                        continue;
                    },
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            match command {
                TickCommand::Arm {
                    first,
                    interval: new_interval,
                } => {
                    next = Some(Instant::now() + first);
                    interval = new_interval;
                },
                TickCommand::Stop => next = None,
                TickCommand::Shutdown => break,
            }
        }
    }

    /// Time left until the next tick of the schedule started at `start` (first tick) repeating every `interval`.
    fn remaining(start: Instant, interval: Duration, now: Instant) -> Duration {
        if now < start {
            return start - now;
        }
        if interval.is_zero() {
            return Duration::ZERO;
        }
        let elapsed: u128 = (now - start).as_nanos() % interval.as_nanos();
        interval - Duration::from_nanos(elapsed as u64)
    }

    fn send(&self, command: TickCommand) -> Result<(), Fail> {
        if self.commands.send(command).is_err() {
            let cause: String = format!("ticker thread is gone");
            error!("send(): {}", cause);
            return Err(Fail::new(libc::EPIPE, &cause));
        }
        Ok(())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PreemptionTick for ThreadTicker {
    fn arm(&mut self, first: Duration, interval: Duration) -> Result<(), Fail> {
        self.schedule = Some((Instant::now() + first, interval));
        self.send(TickCommand::Arm { first, interval })
    }

    fn stop(&mut self) -> Result<Duration, Fail> {
        let remaining: Duration = match self.schedule.take() {
            Some((start, interval)) => Self::remaining(start, interval, Instant::now()),
            None => Duration::ZERO,
        };
        self.send(TickCommand::Stop)?;
        Ok(remaining)
    }

    fn take_pending(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl Drop for ThreadTicker {
    fn drop(&mut self) {
        if let Err(e) = self.send(TickCommand::Shutdown) {
            warn!("drop(): {:?}", e);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("drop(): ticker thread panicked");
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
