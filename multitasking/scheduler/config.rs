// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tunable parameters for a [`Scheduler`](super::Scheduler).

use std::time::Duration;

/// The number of pages in each thread stack, not
/// counting the guard page.
///
pub const DEFAULT_STACK_PAGES: usize = 2;

/// The amount of time a thread may run before it is
/// preempted.
///
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_secs(1);

/// The longest time slice the interval timer can count
/// down.
///
pub const MAX_TIME_SLICE: Duration = Duration::from_secs(libc::time_t::MAX as u64);

/// Configures the threads created by a scheduler and how
/// they are preempted.
///
/// Changes only affect threads registered afterwards.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    stack_pages: usize,
    time_slice: Option<Duration>,
    guard_page: bool,
}

impl Config {
    /// Returns the default configuration: two-page stacks
    /// with a guard page, preempted after one second.
    ///
    pub const fn new() -> Self {
        Config {
            stack_pages: DEFAULT_STACK_PAGES,
            time_slice: Some(DEFAULT_TIME_SLICE),
            guard_page: true,
        }
    }

    /// Sets the number of pages in each thread stack.
    ///
    /// Thread bodies run entirely on this stack, including
    /// any signal handler that preempts them, so bodies that
    /// format output or panic need more than the default.
    ///
    /// # Panics
    ///
    /// `with_stack_pages` panics if `pages` is zero.
    ///
    #[must_use]
    pub fn with_stack_pages(mut self, pages: usize) -> Self {
        assert!(pages > 0, "thread stacks need at least one page");
        self.stack_pages = pages;
        self
    }

    /// Sets how long a thread may run before it is forced
    /// to yield. `None` disables preemption, leaving threads
    /// to yield voluntarily.
    ///
    /// # Panics
    ///
    /// `with_time_slice` panics if given a zero duration,
    /// or one longer than [`MAX_TIME_SLICE`].
    ///
    #[must_use]
    pub fn with_time_slice(mut self, time_slice: Option<Duration>) -> Self {
        if let Some(duration) = time_slice {
            assert!(duration > Duration::ZERO, "time slice must be non-zero");
            assert!(
                duration <= MAX_TIME_SLICE,
                "time slice is too long for the interval timer"
            );
        }

        self.time_slice = time_slice;
        self
    }

    /// Sets whether each stack gets an inaccessible guard
    /// page below it, so an overflow faults immediately.
    ///
    #[must_use]
    pub fn with_guard_page(mut self, guard_page: bool) -> Self {
        self.guard_page = guard_page;
        self
    }

    /// Returns the number of pages in each thread stack.
    ///
    pub fn stack_pages(&self) -> usize {
        self.stack_pages
    }

    /// Returns the preemption time slice, if preemption is
    /// enabled.
    ///
    pub fn time_slice(&self) -> Option<Duration> {
        self.time_slice
    }

    /// Returns whether stacks get a guard page.
    ///
    pub fn guard_page(&self) -> bool {
        self.guard_page
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}
