// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a simple round robin scheduler for threads.
//!
//! ## Registration
//!
//! Threads are registered with [`Scheduler::register`], which allocates
//! the thread's stack and links the thread in at the head of the ring.
//! The ring is therefore in reverse registration order.
//!
//! ## Dispatching
//!
//! [`Scheduler::run`] repeatedly picks the next runnable thread, walking
//! the ring once from just after the thread that ran last, and switches to
//! it. Before any thread has run, the head stands in for the last thread,
//! so the first lap starts at the head's successor and reaches the head
//! last. Control comes back to the loop when the thread yields, is
//! preempted, or returns. Once a full lap finds nothing runnable, the
//! registry is destroyed and `run` returns.
//!
//! ## Shared state
//!
//! While `run` is executing, a pointer to the scheduler's [`Core`] is kept
//! in a thread-local so that [`yield_now`] and the preemption signal
//! handler can find it. The loop, the threads and the handler only ever
//! run one at a time, so the core uses plain cells rather than locks.

mod config;
mod preempt;

pub use self::config::{Config, DEFAULT_STACK_PAGES, DEFAULT_TIME_SLICE, MAX_TIME_SLICE};

use self::preempt::Preemption;
use crate::switch::{switch, Context};
use crate::thread::stacks::new_stack;
use crate::thread::{self, Entry, Thread, ThreadId, ThreadState};
use log::{debug, error, trace, warn};
use std::alloc::{GlobalAlloc, System};
use std::any::Any;
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

thread_local! {
    /// The core of the scheduler whose dispatch loop is
    /// running on this OS thread, if any.
    ///
    static ACTIVE: Cell<*const Core> = const { Cell::new(ptr::null()) };
}

/// Returns the core of the scheduler running on this OS
/// thread.
///
/// # Safety
///
/// The returned reference must not outlive the call to
/// [`Scheduler::run`] that installed it. Everything reached
/// from thread bodies or the signal handler satisfies this.
///
unsafe fn active<'core>() -> Option<&'core Core> {
    let core = ACTIVE.with(|active| active.get());
    core.as_ref()
}

/// Describes an error encountered by the scheduler.
///
#[derive(Debug)]
pub enum Error {
    /// There was not enough memory to register the
    /// thread or allocate its stack.
    OutOfMemory,

    /// The preemption signal handler or timer could not
    /// be set up. The affected thread runs without being
    /// preempted.
    PreemptionSetup(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::PreemptionSetup(err) => write!(f, "failed to set up preemption: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::OutOfMemory => None,
            Error::PreemptionSetup(err) => Some(err),
        }
    }
}

/// Describes why a thread last handed control back to
/// the dispatch loop.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// The thread called [`yield_now`].
    Yielded,

    /// The thread's time slice ran out.
    Preempted,

    /// The thread's entry function returned.
    Terminated,

    /// The thread's entry function panicked.
    Panicked,
}

/// Statistics from a call to [`Scheduler::run`].
///
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// The number of threads that were registered.
    pub threads: usize,

    /// The number of times a thread was switched in.
    pub dispatches: u64,

    /// The number of voluntary yields.
    pub yields: u64,

    /// The number of times a thread was preempted.
    pub preemptions: u64,

    /// The number of threads whose entry function
    /// panicked.
    pub panics: usize,
}

/// The state shared between the dispatch loop, the
/// running thread, and the preemption handler.
///
pub(crate) struct Core {
    // The ring of threads. The front is the head, which
    // is the most recently registered thread, and each
    // thread's successor is the next element, wrapping
    // around at the back.
    threads: VecDeque<Thread>,

    // The position of the thread running now, or that
    // ran most recently.
    current: Cell<Option<usize>>,

    // Where the dispatch loop resumes when a thread
    // leaves the CPU.
    loop_context: Context,

    // Whether the current thread is executing its own
    // code, rather than the loop or a switch being in
    // progress. The signal handler only preempts while
    // this is set.
    in_thread: AtomicBool,

    // Why the last thread left the CPU.
    last_exit: Cell<Exit>,

    preemption: Preemption,

    // The payload of the first thread to panic, which is
    // re-raised once the loop has drained.
    panic: Cell<Option<Box<dyn Any + Send>>>,
}

impl Core {
    fn new(config: &Config) -> Self {
        Core {
            threads: VecDeque::new(),
            current: Cell::new(None),
            loop_context: Context::new(),
            in_thread: AtomicBool::new(false),
            last_exit: Cell::new(Exit::Terminated),
            preemption: Preemption::new(config.time_slice()),
            panic: Cell::new(None),
        }
    }

    /// Returns the thread that is running, or that ran
    /// most recently.
    ///
    pub fn current_thread(&self) -> Option<&Thread> {
        self.current.get().and_then(|index| self.threads.get(index))
    }

    /// Returns the position of the next thread to run.
    ///
    /// The ring is walked once, starting just after the
    /// current thread, or just after the head if no thread
    /// has run yet. The current thread is considered last,
    /// so it only runs again if nothing else can. Returns
    /// `None` if no thread is runnable.
    ///
    fn next_runnable(&self) -> Option<usize> {
        let len = self.threads.len();
        let start = self.current.get().unwrap_or(0) + 1;

        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&index| self.threads[index].state().is_runnable())
    }

    /// Switches to the thread at `index`, returning when it
    /// leaves the CPU.
    ///
    fn dispatch(&self, index: usize) {
        let thread = &self.threads[index];
        let first_run = thread.state() == ThreadState::Unstarted;
        trace!(
            "dispatching thread {} ({}){}",
            thread.id(),
            thread.label(),
            if first_run { " for the first time" } else { "" }
        );

        if first_run {
            // Point the thread's context at the top of its
            // own stack, so switching to it calls
            // thread::start there.
            unsafe {
                thread.context().prepare(
                    thread.stack().bounds().top(),
                    thread::start,
                    self as *const Core as *const (),
                );
            }
        } else {
            debug_assert!(
                thread
                    .stack()
                    .bounds()
                    .contains(thread.context().stack_pointer()),
                "thread {} was saved outside its stack",
                thread.id()
            );
        }

        thread.set_state(ThreadState::Running);
        thread.count_dispatch();
        self.current.set(Some(index));

        unsafe { switch(&self.loop_context, thread.context()) };
    }

    /// Marks the current thread as executing its own code,
    /// then starts its time slice.
    ///
    /// The timer is only armed once the thread can be
    /// preempted, so the expiry cannot be lost to the loop.
    ///
    pub fn enter_thread(&self) {
        self.in_thread.store(true, Ordering::SeqCst);
        self.preemption.arm();
    }

    /// Marks the current thread as no longer preemptible
    /// and stops the preemption timer.
    ///
    fn leave_thread(&self) {
        self.in_thread.store(false, Ordering::SeqCst);
        self.preemption.disarm();
    }

    /// Returns whether a thread is executing its own code.
    ///
    fn in_thread(&self) -> bool {
        self.in_thread.load(Ordering::SeqCst)
    }

    /// Puts the current thread to sleep and switches back
    /// to the dispatch loop. This returns once the loop
    /// resumes the thread.
    ///
    /// This may be called from the signal handler, so it
    /// must not allocate or log.
    ///
    fn switch_out(&self, exit: Exit) {
        self.leave_thread();
        let thread = match self.current_thread() {
            Some(thread) => thread,
            None => return,
        };

        thread.set_state(ThreadState::Sleeping);
        self.last_exit.set(exit);
        unsafe { switch(thread.context(), &self.loop_context) };

        // We've been resumed.
        self.enter_thread();
    }

    /// Terminates the current thread and switches back to
    /// the dispatch loop for good.
    ///
    /// `outcome` is the result of the thread's entry
    /// function. If it panicked, the first such panic is
    /// kept to be re-raised by [`Scheduler::run`].
    ///
    pub fn exit_thread(&self, outcome: std::thread::Result<()>) -> ! {
        self.leave_thread();
        let thread = match self.current_thread() {
            Some(thread) => thread,
            None => {
                error!("thread exited with no current thread");
                process::abort();
            }
        };

        let exit = match outcome {
            Ok(()) => Exit::Terminated,
            Err(payload) => {
                error!("thread {} ({}) panicked", thread.id(), thread.label());
                let first = self.panic.take().unwrap_or(payload);
                self.panic.set(Some(first));
                Exit::Panicked
            }
        };

        thread.set_state(ThreadState::Terminated);
        self.last_exit.set(exit);
        unsafe { switch(thread.context(), &self.loop_context) };

        error!("terminated thread {} was resumed", thread.id());
        process::abort();
    }
}

/// A round-robin scheduler for cooperative threads that
/// share the calling OS thread.
///
pub struct Scheduler {
    config: Config,
    allocator: Box<dyn GlobalAlloc>,
    core: Core,
}

impl Scheduler {
    /// Returns a scheduler with the default configuration,
    /// allocating stacks from the system allocator.
    ///
    pub fn new() -> Self {
        Scheduler::with_config(Config::default())
    }

    /// Returns a scheduler with the given configuration,
    /// allocating stacks from the system allocator.
    ///
    pub fn with_config(config: Config) -> Self {
        Scheduler::with_allocator(config, System)
    }

    /// Returns a scheduler with the given configuration,
    /// allocating stacks from `allocator`.
    ///
    pub fn with_allocator<A>(config: Config, allocator: A) -> Self
    where
        A: GlobalAlloc + 'static,
    {
        Scheduler {
            config,
            allocator: Box::new(allocator),
            core: Core::new(&config),
        }
    }

    /// Returns the scheduler's configuration.
    ///
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a thread that will call `entry` with
    /// `label` once the scheduler runs.
    ///
    /// The thread's stack is allocated straight away. If
    /// that fails, [`Error::OutOfMemory`] is returned and
    /// the threads registered so far are unaffected.
    ///
    /// The new thread becomes the head of the ring. As the
    /// first lap starts after the head, it is the last
    /// thread to start.
    ///
    pub fn register<F>(&mut self, entry: F, label: &str) -> Result<ThreadId, Error>
    where
        F: FnOnce(&str) + 'static,
    {
        self.core
            .threads
            .try_reserve(1)
            .map_err(|_| Error::OutOfMemory)?;

        let stack = new_stack(
            &*self.allocator,
            self.config.stack_pages(),
            self.config.guard_page(),
        )?;

        let entry: Entry = Box::new(entry);
        let thread = Thread::new(label, entry, stack);
        let id = thread.id();
        let bounds = thread.stack().bounds();
        debug!(
            "registered thread {} ({}) with a {} page stack at {:p}-{:p}{}",
            id,
            label,
            bounds.num_pages(),
            bounds.start(),
            bounds.end(),
            if thread.stack().guard().is_some() {
                " and a guard page"
            } else {
                ""
            }
        );

        self.core.threads.push_front(thread);
        Ok(id)
    }

    /// Returns the number of registered threads.
    ///
    pub fn len(&self) -> usize {
        self.core.threads.len()
    }

    /// Returns whether no threads are registered.
    ///
    pub fn is_empty(&self) -> bool {
        self.core.threads.is_empty()
    }

    /// Returns the registered threads in ring order,
    /// starting at the head.
    ///
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.core.threads.iter().map(Thread::id).collect()
    }

    /// Returns the scheduling state of the given thread,
    /// or `None` if it is not registered.
    ///
    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.core
            .threads
            .iter()
            .find(|thread| thread.id() == id)
            .map(Thread::state)
    }

    /// Runs the registered threads until every one of them
    /// has returned, then releases them.
    ///
    /// With no threads registered, `run` returns at once. If
    /// a thread never returns and preemption is disabled or
    /// unavailable, neither does `run`.
    ///
    /// # Panics
    ///
    /// If any thread's entry function panicked, the first
    /// panic is resumed once all threads have finished and
    /// been released.
    ///
    pub fn run(&mut self) -> Summary {
        let mut summary = Summary {
            threads: self.core.threads.len(),
            ..Summary::default()
        };

        let core = &self.core;
        let previous = ACTIVE.with(|active| active.replace(core as *const Core));
        debug!("starting scheduler with {} threads", summary.threads);

        while let Some(index) = core.next_runnable() {
            if let Err(err) = core.preemption.install() {
                warn!("running thread without preemption: {}", err);
            }

            core.dispatch(index);
            summary.dispatches += 1;
            if let Some(err) = core.preemption.take_arm_error() {
                warn!("thread ran without preemption: {}", err);
            }

            let exit = core.last_exit.get();
            match exit {
                Exit::Yielded => summary.yields += 1,
                Exit::Preempted => summary.preemptions += 1,
                Exit::Terminated => {}
                Exit::Panicked => summary.panics += 1,
            }

            if let Some(thread) = core.current_thread() {
                trace!("thread {} ({}): {:?}", thread.id(), thread.label(), exit);
            }
        }

        ACTIVE.with(|active| active.set(previous));
        core.preemption.disarm();
        if let Err(err) = core.preemption.uninstall() {
            warn!("failed to restore SIGALRM handler: {}", err);
        }

        // If we were run from another scheduler's thread, the
        // interval timer it shares with us has been stopped.
        // Give that thread a fresh time slice.
        if let Some(outer) = unsafe { previous.as_ref() } {
            if outer.in_thread() {
                outer.preemption.arm();
            }
        }

        debug!(
            "scheduler drained: {} dispatches, {} yields, {} preemptions",
            summary.dispatches, summary.yields, summary.preemptions
        );

        let panic = core.panic.take();
        self.destroy_all();
        if let Some(payload) = panic {
            panic::resume_unwind(payload);
        }

        summary
    }

    /// Releases every registered thread and its stack.
    ///
    /// This is done automatically once [`run`](Self::run)
    /// finishes. Calling it again, or with no threads
    /// registered, does nothing.
    ///
    pub fn destroy_all(&mut self) {
        let count = self.core.threads.len();
        for thread in self.core.threads.drain(..) {
            trace!(
                "releasing thread {} ({}) after {} dispatches",
                thread.id(),
                thread.label(),
                thread.dispatches()
            );

            // Nothing runs on the stack any more: either
            // the thread terminated, or it never started.
            unsafe { thread.into_stack().free(&*self.allocator) };
        }

        self.core.current.set(None);
        if count > 0 {
            debug!("released {} threads", count);
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("threads", &self.core.threads)
            .finish()
    }
}

/// Gives up the rest of the current thread's turn.
///
/// The thread resumes from the call to `yield_now` once
/// the scheduler has given the other runnable threads a
/// turn.
///
/// # Panics
///
/// `yield_now` panics if it is not called from a thread
/// being run by a [`Scheduler`].
///
pub fn yield_now() {
    match unsafe { active() } {
        Some(core) if core.in_thread() => core.switch_out(Exit::Yielded),
        _ => panic!("yield_now called outside of a scheduled thread"),
    }
}

/// Returns the id of the thread calling `current`, or
/// `None` if it is not a thread being run by a
/// [`Scheduler`].
///
pub fn current() -> Option<ThreadId> {
    let core = unsafe { active() }?;
    if !core.in_thread() {
        return None;
    }

    core.current_thread().map(Thread::id)
}

/// Forces the current thread to yield, if a thread is
/// executing. This is called by the preemption signal
/// handler.
///
fn preempt() {
    if let Some(core) = unsafe { active() } {
        if core.in_thread() {
            core.switch_out(Exit::Preempted);
        }
    }
}
