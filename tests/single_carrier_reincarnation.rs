//! SPEC_FULL.md §4.2/§8 scenario S2: a single carrier with a backlog of
//! pending spawn requests reincarnates the same fiber's stack for the
//! second (and third) one while that fiber is the *only* RUNNING entry on
//! its scheduler. `yield_to_next` must treat "the scheduler's next pick is
//! the fiber already executing" as a no-op rather than attempting a real
//! context switch into its own not-yet-(re)initialized context.

use carrierd::{spawn, Runtime, RuntimeConfig};
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn reincarnation_as_the_sole_running_fiber_does_not_corrupt_the_stack() {
    let config = RuntimeConfig {
        carriers: 1,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::start(config).expect("runtime starts");

    let (tx, rx) = mpsc::channel::<usize>();

    // All three requests queue up behind the single carrier; the second and
    // third can only ever run by reusing the first fiber's stack through
    // reincarnation, with nothing else ever RUNNING alongside it on a
    // one-carrier runtime.
    for n in 0..3 {
        let tx = tx.clone();
        spawn(move || tx.send(n).unwrap()).expect("spawn should not fail under normal operation");
    }
    drop(tx);

    let mut seen: Vec<usize> = (0..3)
        .map(|_| {
            rx.recv_timeout(Duration::from_secs(5))
                .expect("every queued entrance eventually runs, reincarnated stack or not")
        })
        .collect();
    seen.sort_unstable();
    assert_eq!(
        seen,
        vec![0, 1, 2],
        "all three entrances must run exactly once despite sharing one reincarnated stack"
    );

    runtime.shutdown().expect("clean shutdown");
}
