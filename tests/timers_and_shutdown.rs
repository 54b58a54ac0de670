//! End-to-end: timed waits resolve in expiry order regardless of spawn
//! order, and a runtime with fibers still in flight shuts down cleanly.

use carrierd::{sleep_ms, spawn, Runtime, RuntimeConfig};
use pretty_assertions::assert_eq;
use std::sync::mpsc;
use std::time::Duration;

#[test]
fn timers_resolve_in_expiry_order_and_shutdown_drains_cleanly() {
    let runtime = Runtime::start(RuntimeConfig::default()).expect("runtime starts");

    let (tx, rx) = mpsc::channel::<u64>();

    // Spawned in an order that deliberately does not match expiry order.
    for delay_ms in [40, 10, 30, 20] {
        let tx = tx.clone();
        spawn(move || {
            sleep_ms(delay_ms);
            tx.send(delay_ms).unwrap();
        })
        .unwrap();
    }
    drop(tx);

    let mut observed = Vec::new();
    for _ in 0..4 {
        observed.push(rx.recv_timeout(Duration::from_secs(5)).expect("every timer eventually fires"));
    }
    assert_eq!(observed, vec![10, 20, 30, 40], "fibers must wake in timer-expiry order, not spawn order");

    // A couple of fibers still asleep when shutdown is requested; shutdown
    // has no preemptive cancellation (see `SPEC_FULL.md` §5), so it must
    // wait for them to wake and finish rather than abandon them.
    for _ in 0..3 {
        spawn(move || sleep_ms(50)).unwrap();
    }

    runtime.shutdown().expect("shutdown joins every carrier once fibers parked on a timer wake and finish");
}
