//! The OS-thread loop each carrier runs for the lifetime of the runtime.
//!
//! A carrier never runs fiber code directly on its own stack past the
//! point it hands off: it refreshes the bus, materializes anything it
//! cherry-picked, and switches into whatever fiber round-robin picks next,
//! only regaining control when that fiber (or one it handed off to in
//! turn) yields back out.

use crate::runtime;
use std::sync::Arc;
use std::sync::Barrier;

/// Entry point for a carrier's OS thread. Blocks on `barrier` until every
/// other carrier has also reached this point, so that [`Runtime::start`]
/// never hands back to its caller with some carriers not yet ready to
/// receive spawns.
pub(crate) fn run(index: u32, barrier: Arc<Barrier>) {
    runtime::set_current_carrier(index);
    barrier.wait();

    let scheduler = runtime::scheduler_for(index);

    loop {
        scheduler.bus_refresh();

        if let Some(entrance) = scheduler.cherry_pick() {
            if let Err(err) = scheduler.materialize(entrance) {
                log::error!("carrierd: carrier {index} failed to materialize a spawn request: {err}");
            }
        }

        if let Some(target) = scheduler.resched_target() {
            scheduler.switch_into(target);
        }

        if scheduler.is_shutting_down() && scheduler.is_empty() {
            break;
        }
    }
}
