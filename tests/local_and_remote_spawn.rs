//! End-to-end: a single process-wide `Runtime`, exercised from the thread
//! that started it (no carrier of its own) and then from fibers spawning
//! more fibers in turn. Only one `#[test]` may start a runtime per test
//! binary, since `carrierd` allows exactly one live `Runtime` per process.

use carrierd::{spawn, Runtime, RuntimeConfig, SpawnOutcome};
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn spawning_from_outside_and_inside_a_fiber_both_deliver() {
    let config = RuntimeConfig {
        carriers: 3,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::start(config).expect("runtime starts");

    let (tx, rx) = mpsc::channel::<&'static str>();

    // Spawned from this thread, which owns no carrier: must still run.
    let outcome = spawn({
        let tx = tx.clone();
        move || tx.send("outer").unwrap()
    })
    .expect("off-carrier spawn succeeds");
    assert_eq!(outcome, SpawnOutcome::Remote, "an off-carrier caller never has a local scheduler to materialize into");

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "outer");

    // A fiber spawning a child fiber, exercising both the local and
    // cross-carrier materialization paths depending on where the balance
    // counter lands.
    spawn({
        let tx = tx.clone();
        move || {
            spawn(move || tx.send("inner").unwrap()).expect("spawn from inside a fiber succeeds");
        }
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "inner");

    // Several more fibers in a row should all complete regardless of which
    // carrier the balance counter lands them on.
    let (count_tx, count_rx) = mpsc::channel::<usize>();
    for n in 0..20 {
        let count_tx = count_tx.clone();
        spawn(move || count_tx.send(n).unwrap()).unwrap();
    }
    drop(count_tx);
    let mut seen: Vec<usize> = (0..20).map(|_| count_rx.recv_timeout(Duration::from_secs(5)).expect("every fiber eventually reports in")).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());

    runtime.shutdown().expect("clean shutdown");
}
