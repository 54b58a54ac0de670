//! Runtime bootstrap: carrier thread pool, process-wide scheduler table,
//! and the load-balanced entry point fibers are spawned through.
//!
//! There is exactly one [`Runtime`] alive at a time in a process. Its
//! schedulers live in a process-wide static ([`RUNTIME`]) rather than
//! behind a handle threaded through every call, because a fiber's
//! trampoline (see [`crate::fiber`]) needs to reach its owning scheduler
//! from deep inside a hand-switched stack with no argument-passing
//! mechanism beyond the one pointer baked in at creation time. Each
//! carrier thread records only its own index in a thread-local; everything
//! else is looked up from there.

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use crate::stack::StackAllocatorConfig;
use once_cell::sync::OnceCell;
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

/// Tunables consumed once by [`Runtime::start`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of OS carrier threads to start. Defaults to the number of
    /// available CPUs, with a floor of 1.
    pub carriers: usize,
    /// Guarded-stack sizing shared by every fiber on every carrier.
    pub stack: StackAllocatorConfig,
    /// Capacity of each carrier's readiness-event scratch buffer.
    pub event_buffer_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let carriers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        RuntimeConfig {
            carriers,
            stack: StackAllocatorConfig::default(),
            event_buffer_capacity: 64,
        }
    }
}

struct RuntimeShared {
    schedulers: Vec<Scheduler>,
    /// Round-robin cursor used to pick a spawn target when the caller
    /// doesn't care which carrier runs a fiber.
    balance_counter: AtomicUsize,
}

static RUNTIME: OnceCell<RuntimeShared> = OnceCell::new();

thread_local! {
    /// Set exactly once, right before a carrier's loop begins, by the
    /// thread that loop runs on. `None` on any thread that isn't a
    /// carrier (including the thread that called [`Runtime::start`]).
    static CURRENT_CARRIER: Cell<Option<u32>> = Cell::new(None);
}

pub(crate) fn set_current_carrier(index: u32) {
    CURRENT_CARRIER.with(|cell| cell.set(Some(index)));
}

/// The scheduler owned by whichever carrier thread is currently executing,
/// or `None` off-carrier (e.g. the thread that called [`Runtime::start`]).
pub(crate) fn current_scheduler() -> Option<&'static Scheduler> {
    let index = CURRENT_CARRIER.with(|cell| cell.get())?;
    Some(scheduler_for(index))
}

/// Looks up a scheduler by carrier index. Panics if called before
/// [`Runtime::start`] has returned, since no fiber or carrier exists
/// before that point to call it.
pub(crate) fn scheduler_for(index: u32) -> &'static Scheduler {
    &RUNTIME
        .get()
        .expect("carrierd runtime used before Runtime::start")
        .schedulers[index as usize]
}

/// A handle to a running runtime. Dropping it does not stop the carriers;
/// call [`Runtime::shutdown`] explicitly.
pub struct Runtime {
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Starts the carrier thread pool described by `config`. May only be
    /// called once per process.
    pub fn start(config: RuntimeConfig) -> Result<Runtime> {
        let carriers = config.carriers.max(1) as u32;

        let mut schedulers = Vec::with_capacity(carriers as usize);
        for index in 0..carriers {
            schedulers.push(Scheduler::new(
                index,
                carriers,
                config.stack,
                config.event_buffer_capacity,
            )?);
        }

        RUNTIME
            .set(RuntimeShared {
                schedulers,
                balance_counter: AtomicUsize::new(0),
            })
            .map_err(|_| ())
            .expect("Runtime::start called more than once in this process");

        let barrier = Arc::new(Barrier::new(carriers as usize + 1));
        let mut handles = Vec::with_capacity(carriers as usize);
        for index in 0..carriers {
            let barrier = Arc::clone(&barrier);
            let handle = std::thread::Builder::new()
                .name(format!("carrierd-{index}"))
                .spawn(move || crate::carrier::run(index, barrier))
                .expect("failed to spawn carrier thread");
            handles.push(handle);
        }
        barrier.wait();

        Ok(Runtime { handles })
    }

    /// Posts the cooperative-stop message to every carrier's inbox, joins
    /// all of them, then frees every scheduler's resources (stacks, message
    /// boxes, event bus). Blocks until the whole pool has stopped. Safe to
    /// call from any thread, including one that owns no carrier.
    ///
    /// Schedulers live in a process-wide `'static` table (see [`RUNTIME`])
    /// rather than behind an owned handle, so they never run through
    /// [`Drop`] on their own; this is the one place that frees their
    /// resources, done only after every carrier thread has been joined and
    /// is therefore guaranteed to have stopped touching scheduler state.
    pub fn shutdown(self) -> Result<()> {
        let shared = RUNTIME.get().expect("Runtime::shutdown without a running runtime");
        for index in 0..shared.schedulers.len() as u32 {
            scheduler_for(index).post_shutdown();
        }
        for handle in self.handles {
            handle.join().map_err(|_| Error::CarrierPanicked)?;
        }
        for index in 0..shared.schedulers.len() as u32 {
            scheduler_for(index).teardown_resources();
        }
        Ok(())
    }
}

/// Which carrier ended up running a fiber handed to [`spawn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    /// Materialized immediately on the calling carrier.
    Local,
    /// Posted to a remote carrier's inbox and will materialize on its next
    /// bus refresh.
    Remote,
}

/// Spawns `entrance` onto the runtime, load-balancing across carriers with
/// a round-robin counter.
///
/// Callable both from inside a running fiber (the common case — a fiber
/// spawning more work) and from a thread that owns no carrier at all, which
/// is how a program gets its very first fiber running after
/// [`Runtime::start`] returns. An off-carrier caller has no scheduler of
/// its own to materialize a fiber into directly, so its spawns always take
/// the cross-carrier post-and-notify path, even when the balance counter
/// picks a target that happens to equal some meaningless "self" index.
pub fn spawn<F>(entrance: F) -> Result<SpawnOutcome>
where
    F: FnOnce() + Send + 'static,
{
    let boxed: crate::fiber::Entrance = Box::new(entrance);
    let shared = RUNTIME.get().expect("carrierd runtime used before Runtime::start");
    let counter = shared.balance_counter.fetch_add(1, Ordering::AcqRel) + 1;
    let target_index = counter % shared.schedulers.len();

    match current_scheduler() {
        Some(scheduler) if target_index as u32 == scheduler.index => {
            scheduler.materialize(boxed).map(|_| SpawnOutcome::Local)
        }
        Some(scheduler) => {
            let target = scheduler_for(target_index as u32);
            scheduler.post_remote(target, boxed);
            Ok(SpawnOutcome::Remote)
        }
        None => {
            scheduler_for(target_index as u32).post_external(boxed);
            Ok(SpawnOutcome::Remote)
        }
    }
}

/// Suspends the currently running fiber for at least `duration_ms`. Must
/// be called from inside a running fiber.
pub fn sleep_ms(duration_ms: u64) {
    let scheduler = current_scheduler().expect("carrierd::sleep_ms called from outside a fiber");
    scheduler.suspend_current_on_timer(duration_ms);
}

/// Reserved voluntary-yield point for a long-running fiber. Left an
/// explicit no-op: the upstream source never specified what this should do
/// beyond the name, and this crate would rather ship a documented stub than
/// guess at semantics (see `SPEC_FULL.md` Open Questions).
pub fn blocking_point() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_point_is_a_harmless_no_op() {
        blocking_point();
    }

    #[test]
    fn spawn_outcome_variants_are_distinct() {
        assert_ne!(SpawnOutcome::Local, SpawnOutcome::Remote);
    }
}
