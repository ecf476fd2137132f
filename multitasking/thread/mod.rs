// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the threads run by the scheduler.
//!
//! Each [`Thread`] is the control block for one logical thread: its entry
//! function and label, its own stack, the context it was last switched out
//! in, and its scheduling state. Threads move through their states in one
//! direction only:
//!
//! ```text
//! Unstarted -> Running -> { Sleeping <-> Running } -> Terminated
//! ```
//!
//! The thread's entry function is called exactly once, on the thread's own
//! stack, by [`start`]. When it returns, the thread is terminated and never
//! scheduled again.

pub(crate) mod stacks;

use crate::scheduler::Core;
use crate::switch::Context;
use crate::thread::stacks::Stack;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::Result as ThreadResult;

/// A thread's entry function, which receives the thread's
/// label.
///
pub(crate) type Entry = Box<dyn FnOnce(&str)>;

/// Uniquely identifies a thread within the process.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Allocates and returns the next available ThreadId.
    ///
    fn new() -> Self {
        static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread has not yet been run.
    Unstarted,

    /// The thread is executing.
    Running,

    /// The thread yielded and is waiting to be
    /// resumed.
    Sleeping,

    /// The thread's entry function has returned.
    Terminated,
}

impl ThreadState {
    /// Returns whether a thread in this state can be
    /// picked to run.
    ///
    pub fn is_runnable(self) -> bool {
        matches!(self, ThreadState::Unstarted | ThreadState::Sleeping)
    }

    /// Returns whether a thread may move from this state
    /// to `next`.
    ///
    pub fn can_become(self, next: ThreadState) -> bool {
        matches!(
            (self, next),
            (ThreadState::Unstarted, ThreadState::Running)
                | (ThreadState::Sleeping, ThreadState::Running)
                | (ThreadState::Running, ThreadState::Sleeping)
                | (ThreadState::Running, ThreadState::Terminated)
        )
    }
}

/// Contains the metadata for a thread of execution.
///
pub(crate) struct Thread {
    // This thread's unique id.
    id: ThreadId,

    // The caller's name for the thread, which is
    // passed to the entry function.
    label: String,

    // The thread's current state.
    state: Cell<ThreadState>,

    // The work to do. This is taken when the thread
    // starts, so it runs at most once.
    entry: Cell<Option<Entry>>,

    // The thread's stack, owned by the thread until
    // the registry is destroyed.
    stack: Stack,

    // Where the thread resumes. While the thread is
    // running, this is stale.
    context: Context,

    // The number of times the thread has been
    // switched in.
    dispatches: Cell<u64>,
}

impl Thread {
    /// Creates a thread that will run `entry` on `stack`.
    ///
    pub fn new(label: &str, entry: Entry, stack: Stack) -> Self {
        Thread {
            id: ThreadId::new(),
            label: label.to_owned(),
            state: Cell::new(ThreadState::Unstarted),
            entry: Cell::new(Some(entry)),
            stack,
            context: Context::new(),
            dispatches: Cell::new(0),
        }
    }

    /// Returns the thread's unique id.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the label the thread was registered with.
    ///
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the thread's current scheduling state.
    ///
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    /// Updates the thread's scheduling state.
    ///
    /// Moving between states in any order other than
    /// the documented lifecycle is a scheduler bug, and
    /// is caught in debug builds.
    ///
    pub fn set_state(&self, new_state: ThreadState) {
        debug_assert!(
            self.state().can_become(new_state),
            "thread {} cannot go from {:?} to {:?}",
            self.id,
            self.state(),
            new_state
        );
        self.state.set(new_state);
    }

    /// Returns the thread's stack.
    ///
    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    /// Returns the thread's saved context.
    ///
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Returns the number of times the thread has been
    /// switched in.
    ///
    pub fn dispatches(&self) -> u64 {
        self.dispatches.get()
    }

    /// Records that the thread is being switched in.
    ///
    pub fn count_dispatch(&self) {
        self.dispatches.set(self.dispatches.get() + 1);
    }

    /// Calls the thread's entry function, if it has not
    /// already been called.
    ///
    /// A panic in the entry function stops here, rather
    /// than unwinding off the top of the thread's stack,
    /// and its payload is returned.
    ///
    pub fn run_entry(&self) -> ThreadResult<()> {
        match self.entry.take() {
            Some(entry) => panic::catch_unwind(AssertUnwindSafe(|| entry(self.label()))),
            None => Ok(()),
        }
    }

    /// Consumes the thread, returning its stack so it
    /// can be released.
    ///
    pub fn into_stack(self) -> Stack {
        self.stack
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .field("stack", &self.stack.bounds())
            .field("dispatches", &self.dispatches())
            .finish()
    }
}

/// The first Rust code run on a new thread's stack.
///
/// `arg` is the scheduler core that switched to the thread.
/// `start` runs the current thread's entry function, then
/// hands the thread back to the scheduler to be terminated.
///
pub(crate) extern "sysv64" fn start(arg: *const ()) -> ! {
    let core = unsafe { &*(arg as *const Core) };
    core.enter_thread();
    let outcome = match core.current_thread() {
        Some(thread) => thread.run_entry(),
        None => Ok(()),
    };

    core.exit_thread(outcome)
}
