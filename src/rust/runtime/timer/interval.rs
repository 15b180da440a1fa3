// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    timer::PreemptionTick,
};
use ::libc::{
    c_int,
    itimerval,
    suseconds_t,
    time_t,
    timeval,
    ITIMER_VIRTUAL,
    SIGVTALRM,
};
use ::std::{
    io,
    mem,
    ptr,
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    time::Duration,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Set while some [IntervalTimer] owns the process interval timer.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Raised by the signal handler.
static PENDING: AtomicBool = AtomicBool::new(false);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Tick source backed by the process virtual interval timer. There is one such timer per process, so at most one
/// instance may exist at a time.
pub struct IntervalTimer {
    /// Signal disposition that was in place before us.
    previous: libc::sigaction,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IntervalTimer {
    /// Installs the `SIGVTALRM` handler. The timer itself stays disarmed.
    pub fn new() -> Result<Self, Fail> {
        if INSTALLED.swap(true, Ordering::AcqRel) {
            let cause: &str = "process interval timer is already in use";
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EBUSY, cause));
        }
        PENDING.store(false, Ordering::Release);

        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = on_tick as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        let ret: c_int = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(SIGVTALRM, &action, &mut previous)
        };
        if ret != 0 {
            INSTALLED.store(false, Ordering::Release);
            let e: io::Error = io::Error::last_os_error();
            error!("new(): failed to install signal handler (error={:?})", e);
            return Err(Fail::from(e));
        }
        trace!("new(): SIGVTALRM handler installed");
        Ok(Self { previous })
    }

    fn set(value: Duration, interval: Duration) -> Result<(), Fail> {
        let timer: itimerval = itimerval {
            it_interval: to_timeval(interval),
            it_value: to_timeval(value),
        };
        if unsafe { libc::setitimer(ITIMER_VIRTUAL, &timer, ptr::null_mut()) } != 0 {
            let e: io::Error = io::Error::last_os_error();
            error!("set(): setitimer failed (error={:?})", e);
            return Err(Fail::from(e));
        }
        Ok(())
    }

    fn get() -> Result<Duration, Fail> {
        let mut timer: itimerval = unsafe { mem::zeroed() };
        if unsafe { libc::getitimer(ITIMER_VIRTUAL, &mut timer) } != 0 {
            let e: io::Error = io::Error::last_os_error();
            error!("get(): getitimer failed (error={:?})", e);
            return Err(Fail::from(e));
        }
        Ok(from_timeval(&timer.it_value))
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Signal handler. Only async-signal-safe work is allowed here.
extern "C" fn on_tick(_signum: c_int) {
    PENDING.store(true, Ordering::Release);
}

fn to_timeval(duration: Duration) -> timeval {
    timeval {
        tv_sec: duration.as_secs() as time_t,
        tv_usec: duration.subsec_micros() as suseconds_t,
    }
}

fn from_timeval(tv: &timeval) -> Duration {
    Duration::from_secs(tv.tv_sec as u64) + Duration::from_micros(tv.tv_usec as u64)
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl PreemptionTick for IntervalTimer {
    fn arm(&mut self, first: Duration, interval: Duration) -> Result<(), Fail> {
        // A zero value would disarm the timer.
        let first: Duration = first.max(Duration::from_micros(1));
        Self::set(first, interval)
    }

    fn stop(&mut self) -> Result<Duration, Fail> {
        let remaining: Duration = Self::get()?;
        Self::set(Duration::ZERO, Duration::ZERO)?;
        Ok(remaining)
    }

    fn take_pending(&self) -> bool {
        PENDING.swap(false, Ordering::AcqRel)
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        if let Err(e) = Self::set(Duration::ZERO, Duration::ZERO) {
            warn!("drop(): failed to disarm interval timer (error={:?})", e);
        }
        if unsafe { libc::sigaction(SIGVTALRM, &self.previous, ptr::null_mut()) } != 0 {
            warn!("drop(): failed to restore signal disposition");
        }
        PENDING.store(false, Ordering::Release);
        INSTALLED.store(false, Ordering::Release);
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
