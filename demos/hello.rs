//! Spawns a handful of fibers across a small carrier pool, has each one
//! sleep briefly and report back over a channel, then shuts the runtime
//! down once every fiber has checked in.
//!
//! Run with `cargo run --example hello`.

use carrierd::{sleep_ms, spawn, Runtime, RuntimeConfig};
use std::sync::mpsc;

fn main() {
    env_logger::init();

    let config = RuntimeConfig {
        carriers: 4,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::start(config).expect("failed to start carrierd runtime");

    let (tx, rx) = mpsc::channel::<usize>();

    const FIBER_COUNT: usize = 12;
    for n in 0..FIBER_COUNT {
        let tx = tx.clone();
        spawn(move || {
            sleep_ms((n as u64 % 5) * 10);
            println!("fiber {n} checking in from its carrier");
            tx.send(n).expect("main thread still listening");
        })
        .expect("spawn should not fail under normal operation");
    }
    drop(tx);

    let mut seen: Vec<usize> = (0..FIBER_COUNT).map(|_| rx.recv().expect("every fiber reports in")).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..FIBER_COUNT).collect::<Vec<_>>());

    runtime.shutdown().expect("clean shutdown");
}
