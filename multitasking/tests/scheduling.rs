// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

use multitasking::{current, page_size, yield_now, Config, Scheduler, ThreadState};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Output = Rc<RefCell<Vec<String>>>;

fn cooperative() -> Config {
    Config::new().with_time_slice(None)
}

fn print(output: &Output, text: &str) {
    output.borrow_mut().push(text.to_owned());
}

#[test]
fn head_runs_after_yielding_thread() {
    let output: Output = Rc::new(RefCell::new(Vec::new()));
    let mut scheduler = Scheduler::with_config(cooperative());

    let t1 = output.clone();
    scheduler
        .register(
            move |_| {
                print(&t1, "a");
                yield_now();
                print(&t1, "b");
            },
            "T1",
        )
        .unwrap();

    let t2 = output.clone();
    scheduler.register(move |_| print(&t2, "c"), "T2").unwrap();

    let summary = scheduler.run();
    assert_eq!(output.borrow().concat(), "acb");
    assert_eq!(summary.threads, 2);
    assert_eq!(summary.dispatches, 3);
    assert_eq!(summary.yields, 1);
    assert_eq!(summary.preemptions, 0);
    assert!(scheduler.is_empty());
}

#[test]
fn many_threads_take_turns() {
    const THREADS: usize = 50;
    const TURNS: usize = 4;

    let order = Rc::new(RefCell::new(Vec::new()));
    let mut scheduler = Scheduler::with_config(cooperative());
    let mut ids = Vec::new();
    for i in 0..THREADS {
        let order = order.clone();
        let id = scheduler
            .register(
                move |_| {
                    for turn in 0..TURNS {
                        order.borrow_mut().push((turn, i));
                        yield_now();
                    }
                },
                &format!("worker-{}", i),
            )
            .unwrap();
        ids.push(id);
    }

    ids.reverse();
    assert_eq!(scheduler.thread_ids(), ids);

    let summary = scheduler.run();
    assert_eq!(summary.dispatches as usize, THREADS * (TURNS + 1));
    assert_eq!(summary.yields as usize, THREADS * TURNS);

    // Each lap visits every thread once, newest first,
    // except that the newest thread is the head and goes
    // last.
    let order = order.borrow();
    assert_eq!(order.len(), THREADS * TURNS);
    for (position, &(turn, i)) in order.iter().enumerate() {
        let ring_index = (position % THREADS + 1) % THREADS;
        assert_eq!(turn, position / THREADS);
        assert_eq!(i, THREADS - 1 - ring_index);
    }
}

#[test]
fn states_follow_thread_lifecycle() {
    let mut scheduler = Scheduler::with_config(cooperative());
    let observed = Rc::new(RefCell::new(Vec::new()));

    // The scheduler cannot be inspected while it runs, so
    // each thread records what it can see of itself.
    let seen = observed.clone();
    let first = scheduler
        .register(
            move |_| {
                seen.borrow_mut().push(current());
                yield_now();
                seen.borrow_mut().push(current());
            },
            "first",
        )
        .unwrap();

    assert_eq!(scheduler.state(first), Some(ThreadState::Unstarted));
    assert_eq!(current(), None);

    scheduler.run();
    assert_eq!(*observed.borrow(), vec![Some(first), Some(first)]);
    assert_eq!(scheduler.state(first), None);
}

#[test]
fn threads_that_never_yield_run_to_completion() {
    let counter = Rc::new(Cell::new(0u64));
    let mut scheduler = Scheduler::with_config(cooperative());
    for _ in 0..3 {
        let counter = counter.clone();
        scheduler
            .register(
                move |_| {
                    for _ in 0..1000 {
                        counter.set(counter.get() + 1);
                    }
                },
                "counter",
            )
            .unwrap();
    }

    let summary = scheduler.run();
    assert_eq!(counter.get(), 3000);
    assert_eq!(summary.dispatches, 3);
    assert_eq!(summary.yields, 0);
}

#[test]
fn stacks_are_independent() {
    // Each thread keeps a buffer on its own stack across
    // yields, so overlapping stacks would corrupt them.
    let config = cooperative().with_stack_pages(4);
    let mut scheduler = Scheduler::with_config(config);
    let sums = Rc::new(RefCell::new(Vec::new()));
    for seed in 1..=8u8 {
        let sums = sums.clone();
        scheduler
            .register(
                move |_| {
                    let mut buffer = [0u8; 1024];
                    for turn in 0..4u8 {
                        for byte in buffer.iter_mut() {
                            *byte = byte.wrapping_add(seed);
                        }

                        if turn < 3 {
                            yield_now();
                        }
                    }

                    let sum: u64 = buffer.iter().map(|&byte| u64::from(byte)).sum();
                    sums.borrow_mut().push((seed, sum));
                },
                "buffer",
            )
            .unwrap();
    }

    scheduler.run();
    let sums = sums.borrow();
    assert_eq!(sums.len(), 8);
    for &(seed, sum) in sums.iter() {
        assert_eq!(sum, 1024 * u64::from(seed.wrapping_mul(4)));
    }
}

#[test]
fn config_is_reported() {
    let config = cooperative().with_stack_pages(3).with_guard_page(false);
    let scheduler = Scheduler::with_config(config);
    assert_eq!(*scheduler.config(), config);
    assert!(page_size().is_power_of_two());
}
