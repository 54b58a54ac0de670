//! Fiber control blocks and the trampoline that gives every fiber its
//! lifecycle loop.
//!
//! A fiber's control block is not a separate heap allocation: it is placed
//! directly into the user-metadata region at the top of its own stack (see
//! [`crate::stack`]), so creating and destroying a fiber is exactly one
//! `mmap`/`munmap` pair. [`create`] writes the block in place and arranges
//! the stack's initial machine context to resume at [`trampoline`]; nothing
//! ever moves the block afterward, so code holding a `FiberId` can always
//! recover a stable address for it by asking the owning scheduler.

use crate::context::Context;
use crate::error::Result;
use crate::runtime;
use crate::stack::{Metamark, StackAllocator, StackPolicy};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

/// A boxed, type-erased fiber body. Spawners hand one of these to
/// [`crate::spawn`]; it runs exactly once, to completion, on whichever
/// carrier picks it up.
pub type Entrance = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to a fiber, stable for its whole lifetime. Carries the
/// owning scheduler's index so a handle is never presented to the wrong
/// scheduler's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub(crate) scheduler_index: u32,
    pub(crate) slot: usize,
}

impl FiberId {
    #[cfg(test)]
    pub fn for_test(n: u32) -> Self {
        FiberId {
            scheduler_index: 0,
            slot: n as usize,
        }
    }
}

/// Coarse lifecycle state, readable by any carrier for diagnostics but only
/// ever written by the fiber's own trampoline and the owning scheduler. The
/// scheduler's own queue membership (is this id linked into the running
/// list right now?) is tracked separately and is the real source of truth
/// for scheduling decisions; this field is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Born = 0,
    Running = 1,
    Limbo = 2,
    Dying = 3,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Born,
            1 => Status::Running,
            2 => Status::Limbo,
            3 => Status::Dying,
            other => unreachable!("invalid fiber status byte {other}"),
        }
    }
}

/// The in-place control block living at the top of a fiber's own stack.
pub struct FiberControlBlock {
    id: FiberId,
    context: UnsafeCell<Context>,
    status: AtomicU8,
    entry: UnsafeCell<Option<Entrance>>,
}

// Only ever touched by the one carrier thread that owns the scheduler this
// fiber belongs to, except for `status`, which is read (never written)
// diagnostically from elsewhere.
unsafe impl Sync for FiberControlBlock {}

impl FiberControlBlock {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// # Safety
    /// Must only be called by the scheduler that owns this fiber, and never
    /// while the fiber is the currently executing context (its own saved
    /// `sp` would be stale the instant it resumes).
    pub(crate) unsafe fn context_mut(&self) -> &mut Context {
        &mut *self.context.get()
    }

    fn take_entry(&self) -> Entrance {
        unsafe { &mut *self.entry.get() }
            .take()
            .expect("fiber control block entered with no entrance queued")
    }

    fn rebind(&self, entrance: Entrance) {
        unsafe { *self.entry.get() = Some(entrance) };
    }
}

/// Reads the control block embedded in `metamark`'s user-metadata region.
///
/// # Safety
/// `metamark` must have been produced by [`create`] and still be alive.
pub(crate) unsafe fn control_block_of(metamark: &Metamark) -> &FiberControlBlock {
    &*(metamark.user_metadata.as_ptr() as *const FiberControlBlock)
}

/// # Safety
/// Same as [`control_block_of`]; additionally the caller must guarantee no
/// other live reference to this control block's context exists.
pub(crate) unsafe fn context_mut_of(metamark: &Metamark) -> &mut Context {
    control_block_of(metamark).context_mut()
}

unsafe fn drop_control_block(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut FiberControlBlock);
}

/// Allocates a stack, writes a fresh [`FiberControlBlock`] into its
/// user-metadata region, and arranges the stack's initial machine context
/// to resume at [`trampoline`] with `scheduler_index`/`slot` baked in.
pub(crate) fn create(
    scheduler_index: u32,
    id: FiberId,
    entrance: Entrance,
    allocator: &StackAllocator,
    policy: StackPolicy,
) -> Result<Metamark> {
    let mut metamark = allocator.allocate(policy)?;

    let block = FiberControlBlock {
        id,
        context: UnsafeCell::new(Context::empty()),
        status: AtomicU8::new(Status::Born as u8),
        entry: UnsafeCell::new(Some(entrance)),
    };
    unsafe {
        metamark.user_metadata.as_ptr().cast::<FiberControlBlock>().write(block);
        metamark.set_drop_glue(drop_control_block);

        let argument = TrampolineArg::pack(id);
        let context = Context::prepare(
            metamark.stack_base.as_ptr(),
            metamark.stack_bytes,
            trampoline,
            argument,
        );
        *control_block_of(&metamark).context.get() = context;
    }

    Ok(metamark)
}

/// The [`FiberId`] is packed into the trampoline's single pointer-sized
/// argument rather than passed as a raw pointer to the control block, so
/// that the trampoline always reaches its state through the owning
/// scheduler's arena rather than an address baked in at creation time.
struct TrampolineArg;

impl TrampolineArg {
    fn pack(id: FiberId) -> *mut u8 {
        let packed = ((id.scheduler_index as u64) << 32) | (id.slot as u64 & 0xffff_ffff);
        packed as usize as *mut u8
    }

    fn unpack(arg: *mut u8) -> FiberId {
        let packed = arg as usize as u64;
        FiberId {
            scheduler_index: (packed >> 32) as u32,
            slot: (packed & 0xffff_ffff) as usize,
        }
    }
}

/// Every fiber's stack begins execution here after the first context switch
/// into it. Runs the queued entrance to completion, then asks its owning
/// scheduler whether another spawn request is waiting to reuse this stack
/// (reincarnation) or whether to retire for good.
extern "C" fn trampoline(arg: *mut u8) -> ! {
    let id = TrampolineArg::unpack(arg);

    loop {
        let scheduler = runtime::scheduler_for(id.scheduler_index);
        let block = scheduler.control_block(id);
        block.set_status(Status::Running);

        let entrance = block.take_entry();
        entrance();

        scheduler.mark_limbo(id);

        match scheduler.cherry_pick() {
            Some(entrance) => {
                block.rebind(entrance);
                scheduler.reincarnate_and_yield(id);
                // Resumes here once this stack is reused for the rebound
                // entrance; loop back around to run it.
            }
            None => {
                scheduler.mark_dying(id);
                scheduler.retire_and_park(id);
            }
        }
    }
}
