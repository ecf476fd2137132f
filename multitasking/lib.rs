// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements cooperative multitasking on a single operating system thread.
//!
//! Each registered thread gets its own small stack. The [`Scheduler`] runs
//! them one at a time, switching stacks by hand, until every thread has
//! returned from its entry function.
//!
//! ## Registering threads
//!
//! Threads are added with [`Scheduler::register`] before the scheduler is
//! started. Each registration allocates the thread's stack up front, so an
//! allocation failure is reported to the caller straight away and leaves the
//! other threads untouched.
//!
//! ## Running
//!
//! [`Scheduler::run`] takes over the calling thread. It picks threads in
//! round-robin order around the ring of registered threads, newest first.
//! The first lap starts just after the head, so the most recently
//! registered thread is the last to start. `run` returns once none of the
//! threads are left runnable. A running thread gives up
//! the CPU by calling [`yield_now`], or is forced to by the preemption timer
//! when its time slice runs out.
//!
//! ```no_run
//! use multitasking::{yield_now, Scheduler};
//!
//! let mut scheduler = Scheduler::new();
//! scheduler
//!     .register(
//!         |name| {
//!             println!("{}: first half", name);
//!             yield_now();
//!             println!("{}: second half", name);
//!         },
//!         "worker",
//!     )
//!     .expect("out of memory");
//!
//! scheduler.run();
//! ```

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("multitasking only supports x86_64 Linux");

pub mod scheduler;
mod switch;
pub mod thread;

pub use crate::scheduler::{current, yield_now, Config, Error, Scheduler, Summary};
pub use crate::thread::stacks::page_size;
pub use crate::thread::{ThreadId, ThreadState};
