// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements timer-driven preemption of the running thread.
//!
//! The dispatch loop installs the `SIGALRM` handler before each dispatch.
//! The thread itself then arms a one-shot `ITIMER_REAL` timer for its time
//! slice, once it is ready to be preempted, so an expiry can never land
//! while the loop or a switch is running. If it expires before the thread
//! yields, the kernel delivers `SIGALRM`, and the handler yields on the
//! thread's behalf. The timer is disarmed whenever a thread leaves the CPU.
//!
//! The handler runs on the interrupted thread's stack, between two
//! arbitrary instructions. It must do nothing but yield: no allocation,
//! no logging, and no locks.

use super::Error;
use std::cell::Cell;
use std::convert::TryFrom;
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

/// Arms and disarms the preemption timer for a scheduler.
///
pub(crate) struct Preemption {
    // How long a thread runs before it is preempted,
    // or None if preemption is disabled.
    time_slice: Option<Duration>,

    // The disposition SIGALRM had before we installed
    // our handler. None until the handler is installed.
    previous: Cell<Option<libc::sigaction>>,

    // Why a thread last failed to arm the timer. This is
    // reported by the loop, as threads may not log.
    arm_error: Cell<Option<Error>>,
}

impl Preemption {
    pub fn new(time_slice: Option<Duration>) -> Self {
        Preemption {
            time_slice,
            previous: Cell::new(None),
            arm_error: Cell::new(None),
        }
    }

    /// Installs the signal handler, if preemption is enabled
    /// and that has not already been done.
    ///
    /// If this fails, the next thread runs without
    /// preemption. The next call tries again.
    ///
    pub fn install(&self) -> Result<(), Error> {
        if self.time_slice.is_none() || self.is_installed() {
            return Ok(());
        }

        let handler: extern "C" fn(libc::c_int) = handle_alarm;
        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        let ret = unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = handler as libc::sighandler_t;

            // The handler may switch away from the thread and
            // only return once the thread is resumed. Without
            // SA_NODEFER, SIGALRM would stay blocked for every
            // thread that runs in between.
            action.sa_flags = libc::SA_NODEFER | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGALRM, &action, &mut previous)
        };

        if ret != 0 {
            return Err(Error::PreemptionSetup(io::Error::last_os_error()));
        }

        self.previous.set(Some(previous));
        Ok(())
    }

    /// Returns whether our signal handler is installed.
    ///
    pub fn is_installed(&self) -> bool {
        self.previous.get().is_some()
    }

    /// Starts the countdown to preempting the thread that
    /// is running, if the handler is installed.
    ///
    /// This is called by the thread, so a failure is kept
    /// for [`take_arm_error`](Self::take_arm_error) rather
    /// than logged. The thread then runs without preemption
    /// until it yields.
    ///
    pub fn arm(&self) {
        let time_slice = match self.time_slice {
            Some(time_slice) if self.is_installed() => time_slice,
            _ => return,
        };

        if let Err(err) = set_timer(time_slice) {
            self.arm_error.set(Some(err));
        }
    }

    /// Returns the last failure to arm the timer, if any.
    ///
    pub fn take_arm_error(&self) -> Option<Error> {
        self.arm_error.take()
    }

    /// Stops any pending countdown.
    ///
    /// This is called from the signal handler, so it only
    /// makes the system call.
    ///
    pub fn disarm(&self) {
        if self.time_slice.is_some() {
            // Failing to disarm leaves a stray signal, which
            // the handler ignores outside of a thread.
            let _ = set_timer(Duration::ZERO);
        }
    }

    /// Restores the signal disposition that was in place
    /// before the handler was installed.
    ///
    pub fn uninstall(&self) -> Result<(), Error> {
        let previous = match self.previous.take() {
            Some(previous) => previous,
            None => return Ok(()),
        };

        let ret = unsafe { libc::sigaction(libc::SIGALRM, &previous, ptr::null_mut()) };
        if ret != 0 {
            return Err(Error::PreemptionSetup(io::Error::last_os_error()));
        }

        Ok(())
    }
}

/// Handles SIGALRM by preempting the current thread.
///
extern "C" fn handle_alarm(_signal: libc::c_int) {
    super::preempt();
}

/// Converts `duration` into a `timeval`, rounding non-zero
/// durations shorter than a microsecond up, as a zero value
/// would disarm the timer.
///
/// Fails with `EINVAL` if the whole seconds do not fit in a
/// `time_t`.
///
fn to_timeval(duration: Duration) -> Result<libc::timeval, Error> {
    let seconds = libc::time_t::try_from(duration.as_secs())
        .map_err(|_| Error::PreemptionSetup(io::Error::from_raw_os_error(libc::EINVAL)))?;

    let mut micros = duration.subsec_micros();
    if seconds == 0 && micros == 0 && duration > Duration::ZERO {
        micros = 1;
    }

    Ok(libc::timeval {
        tv_sec: seconds,
        tv_usec: libc::suseconds_t::from(micros),
    })
}

/// Sets the one-shot real-time timer to fire after
/// `duration`, or disarms it if `duration` is zero.
///
fn set_timer(duration: Duration) -> Result<(), Error> {
    let value = libc::itimerval {
        it_interval: to_timeval(Duration::ZERO)?,
        it_value: to_timeval(duration)?,
    };

    let ret = unsafe { libc::setitimer(libc::ITIMER_REAL, &value, ptr::null_mut()) };
    if ret != 0 {
        return Err(Error::PreemptionSetup(io::Error::last_os_error()));
    }

    Ok(())
}
