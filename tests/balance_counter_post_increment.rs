//! The balance counter in `spawn` is post-increment, matching the
//! scenario SPEC_FULL.md spells out: with two carriers and a counter
//! starting at 0, the very first spawn targets carrier 1 (1 % 2), not
//! carrier 0. Checked here via the spawned fiber's OS thread name, since
//! a fiber runs on the carrier thread that materialized it.

use carrierd::{spawn, Runtime, RuntimeConfig};
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn first_spawn_in_the_process_lands_on_carrier_one_of_two() {
    let config = RuntimeConfig {
        carriers: 2,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::start(config).expect("runtime starts");

    // Labeled so the two fibers can report in whichever order the
    // scheduler actually runs them in.
    let (tx, rx) = mpsc::channel::<(&'static str, String)>();

    // First spawn call in this process: counter 0 -> 1, target = 1 % 2 = 1.
    let first_tx = tx.clone();
    spawn(move || {
        let here = std::thread::current().name().unwrap_or("").to_string();

        // Second spawn call, issued from inside the first fiber (now
        // running on carrier 1): counter 1 -> 2, target = 2 % 2 = 0.
        let second_tx = first_tx.clone();
        spawn(move || {
            let here = std::thread::current().name().unwrap_or("").to_string();
            second_tx.send(("second", here)).unwrap();
        })
        .expect("spawn from inside a fiber succeeds");

        first_tx.send(("first", here)).unwrap();
    })
    .expect("off-carrier spawn succeeds");

    let mut landed = std::collections::HashMap::new();
    for _ in 0..2 {
        let (label, thread_name) = rx.recv_timeout(Duration::from_secs(5)).expect("both fibers report in");
        landed.insert(label, thread_name);
    }

    assert_eq!(landed["first"], "carrierd-1", "counter 0 -> 1, target = 1 % 2 = 1");
    assert_eq!(landed["second"], "carrierd-0", "counter 1 -> 2, target = 2 % 2 = 0");

    runtime.shutdown().expect("clean shutdown");
}
