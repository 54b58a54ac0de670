//! End-to-end: a burst of cross-carrier spawns, far larger than any single
//! `CpBuffer` drain would casually absorb, all eventually materialize and
//! run exactly once.

use carrierd::{Runtime, RuntimeConfig};
use pretty_assertions::assert_eq;
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn a_spawn_burst_all_lands_exactly_once() {
    let config = RuntimeConfig {
        carriers: 4,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::start(config).expect("runtime starts");

    const BURST: usize = 1_000;
    let (tx, rx) = mpsc::channel::<usize>();

    for n in 0..BURST {
        let tx = tx.clone();
        carrierd::spawn(move || tx.send(n).unwrap()).expect("spawn under burst load should not fail");
    }
    drop(tx);

    let mut seen: Vec<usize> = Vec::with_capacity(BURST);
    for _ in 0..BURST {
        seen.push(rx.recv_timeout(Duration::from_secs(10)).expect("every spawned fiber eventually reports in, even under a burst"));
    }
    seen.sort_unstable();
    assert_eq!(seen, (0..BURST).collect::<Vec<_>>(), "every fiber in the burst must run exactly once");

    runtime.shutdown().expect("clean shutdown");
}
