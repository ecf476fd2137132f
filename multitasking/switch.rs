// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! A [`Context`] is nothing more than a saved stack pointer. Everything
//! else needed to resume a thread (its callee-saved registers, floating
//! point control state, and the address to resume at) is pushed onto the
//! thread's own stack by [`switch`] before the stack pointer is stored.

use core::arch::global_asm;
use core::cell::UnsafeCell;
use x86_64::VirtAddr;

global_asm!(include_str!("switch.s"));

// The following functions are implemented in switch.s.
//
extern "sysv64" {
    /// multitasking_switch_stack saves the current execution
    /// state onto the current stack, stores the stack pointer
    /// in `current_stack_pointer`, then restores the state
    /// saved at `new_stack_pointer`.
    ///
    fn multitasking_switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

    /// multitasking_start_thread is the first code executed on
    /// a prepared stack. It calls the entry point in R12 with
    /// the argument in R13.
    ///
    fn multitasking_start_thread() -> !;
}

/// The function run on a new stack by [`Context::prepare`].
///
/// It receives the argument passed to `prepare` and must
/// never return, as there is nothing to return to.
///
pub(crate) type EntryPoint = extern "sysv64" fn(arg: *const ()) -> !;

/// The initial MXCSR value: all exceptions masked, round to
/// nearest.
///
const DEFAULT_MXCSR: u64 = 0x1f80;

/// The initial x87 control word: all exceptions masked,
/// extended precision, round to nearest.
///
const DEFAULT_FPU_CONTROL: u64 = 0x037f;

/// A saved execution context.
///
#[derive(Debug)]
pub(crate) struct Context {
    // The stack pointer at the time the context was last
    // switched away from. While the context is executing,
    // this value is stale.
    stack_pointer: UnsafeCell<u64>,
}

/// push_stack writes `value` just below `rsp` and returns
/// the new stack pointer.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

impl Context {
    /// Returns an empty context. It can be switched away
    /// from, which fills it in, but must not be switched to
    /// until then, or until it has been prepared.
    ///
    pub const fn new() -> Self {
        Context {
            stack_pointer: UnsafeCell::new(0),
        }
    }

    /// Returns the saved stack pointer.
    ///
    pub fn stack_pointer(&self) -> VirtAddr {
        VirtAddr::new(unsafe { self.stack_pointer.get().read() })
    }

    /// Prepares the context to start executing `entry_point`
    /// with `arg` on the stack that ends at `stack_top`, the
    /// next time it is switched to.
    ///
    /// # Safety
    ///
    /// `stack_top` must be 16-byte aligned and the top of a
    /// writable region that is not in use, large enough for
    /// everything `entry_point` will do.
    ///
    pub unsafe fn prepare(&self, stack_top: VirtAddr, entry_point: EntryPoint, arg: *const ()) {
        debug_assert!(stack_top.is_aligned(16u64), "stack top {:p} is not aligned", stack_top);

        let mut rsp: *mut u64 = stack_top.as_mut_ptr();

        // Two zero words terminate the call chain for anything
        // walking the stack, and leave the stack pointer 16-byte
        // aligned when multitasking_start_thread makes its call.
        rsp = push_stack(rsp, 0);
        rsp = push_stack(rsp, 0);

        // The frame popped by multitasking_switch_stack.
        rsp = push_stack(rsp, multitasking_start_thread as *const () as u64); // Return address.
        rsp = push_stack(rsp, 0); // Initial RBP.
        rsp = push_stack(rsp, 0); // Initial RBX.
        rsp = push_stack(rsp, entry_point as *const () as u64); // R12.
        rsp = push_stack(rsp, arg as usize as u64); // R13.
        rsp = push_stack(rsp, 0); // Initial R14.
        rsp = push_stack(rsp, 0); // Initial R15.
        rsp = push_stack(rsp, DEFAULT_MXCSR | (DEFAULT_FPU_CONTROL << 32));

        self.stack_pointer.get().write(rsp as u64);
    }
}

/// Saves the current execution state into `current` and
/// resumes the state saved in `next`.
///
/// `switch` returns when something later switches back to
/// `current`.
///
/// # Safety
///
/// `next` must have been prepared or previously switched
/// away from, and its stack must still be live. `current`
/// and `next` must be different contexts.
///
pub(crate) unsafe fn switch(current: &Context, next: &Context) {
    multitasking_switch_stack(current.stack_pointer.get(), next.stack_pointer.get());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::stacks::new_stack;
    use std::alloc::System;
    use std::cell::Cell;

    struct PingPong {
        main: Context,
        side: Context,
        hits: Cell<u32>,
    }

    extern "sysv64" fn bounce(arg: *const ()) -> ! {
        let pair = unsafe { &*(arg as *const PingPong) };
        loop {
            pair.hits.set(pair.hits.get() + 1);
            unsafe { switch(&pair.side, &pair.main) };
        }
    }

    #[test]
    fn test_switch_round_trip() {
        let stack = new_stack(&System, 4, false).unwrap();
        let pair = PingPong {
            main: Context::new(),
            side: Context::new(),
            hits: Cell::new(0),
        };

        unsafe {
            pair.side.prepare(stack.bounds().top(), bounce, &pair as *const PingPong as *const ());
        }

        unsafe { switch(&pair.main, &pair.side) };
        assert_eq!(pair.hits.get(), 1);

        // The side context was saved inside its own stack.
        assert!(stack.bounds().contains(pair.side.stack_pointer()));

        unsafe { switch(&pair.main, &pair.side) };
        unsafe { switch(&pair.main, &pair.side) };
        assert_eq!(pair.hits.get(), 3);

        unsafe { stack.free(&System) };
    }

    #[test]
    #[allow(clippy::float_arithmetic)]
    fn test_floating_point_survives_switch() {
        struct Sum {
            main: Context,
            side: Context,
            value: Cell<f64>,
        }

        extern "sysv64" fn halve(arg: *const ()) -> ! {
            let sum = unsafe { &*(arg as *const Sum) };
            let mut x = 1.0f64;
            loop {
                x /= 2.0;
                sum.value.set(x);
                unsafe { switch(&sum.side, &sum.main) };
            }
        }

        let stack = new_stack(&System, 4, false).unwrap();
        let sum = Sum {
            main: Context::new(),
            side: Context::new(),
            value: Cell::new(0.0),
        };

        unsafe {
            sum.side.prepare(stack.bounds().top(), halve, &sum as *const Sum as *const ());
            switch(&sum.main, &sum.side);
            switch(&sum.main, &sum.side);
        }

        assert_eq!(sum.value.get(), 0.25);

        unsafe { stack.free(&System) };
    }
}
