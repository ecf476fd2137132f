// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

// This is a small program that shows the scheduler in
// action. A few threads print and yield in turn, while a
// CPU-bound thread that never yields is kept in check by
// the preemption timer.
//
// Set DEMO_LOG to a log level (such as "trace") to see
// the scheduler's own logging.

#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

use log::{info, LevelFilter, Log, Metadata, Record};
use multitasking::{current, yield_now, Config, Error, Scheduler};
use std::env;
use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const PRINTERS: [&str; 3] = ["alpha", "beta", "gamma"];
const ROUNDS: usize = 3;

/// The number of printing threads that have finished.
///
static FINISHED: AtomicUsize = AtomicUsize::new(0);

/// Writes log records to standard error.
///
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() {
    let level = env::var("DEMO_LOG")
        .ok()
        .and_then(|level| level.parse().ok())
        .unwrap_or(LevelFilter::Info);

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn printer(name: &str) {
    for round in 1..=ROUNDS {
        let id = current().map_or(0, |id| id.as_u64());
        println!("{} (thread {}): round {} of {}", name, id, round, ROUNDS);
        yield_now();
    }

    FINISHED.fetch_add(1, Ordering::SeqCst);
}

fn cruncher(name: &str) {
    // This never yields, so the other threads only get
    // to run when it is preempted.
    let mut iterations = 0u64;
    while FINISHED.load(Ordering::SeqCst) < PRINTERS.len() {
        iterations = iterations.wrapping_add(1);
        hint::spin_loop();
    }

    println!("{}: done after {} iterations", name, iterations);
}

fn main() -> Result<(), Error> {
    init_logging();

    let config = Config::new()
        .with_stack_pages(16)
        .with_time_slice(Some(Duration::from_millis(50)));
    let mut scheduler = Scheduler::with_config(config);

    for name in PRINTERS.iter() {
        scheduler.register(printer, name)?;
    }

    // Registered last, this is the head of the ring, so it
    // starts after the printers have had their first turn.
    scheduler.register(cruncher, "cruncher")?;

    info!("running {} threads", scheduler.len());
    let summary = scheduler.run();
    println!(
        "{} threads finished: {} dispatches, {} yields, {} preemptions",
        summary.threads, summary.dispatches, summary.yields, summary.preemptions
    );

    Ok(())
}
