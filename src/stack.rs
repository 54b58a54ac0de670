//! Guarded fiber stacks.
//!
//! Each stack is a single anonymous `mmap` mapping: a leading guard page
//! (`PROT_NONE`, so a stack overflow faults instead of silently corrupting
//! the neighboring mapping) followed by the usable, read/write region. The
//! top of the usable region is reserved for the fiber control block itself
//! (see [`fiber`](crate::fiber)): the allocator hands that header space back
//! to the caller as `user_metadata` rather than carving a second allocation,
//! so a fiber's control block and its stack share one lifetime and one
//! `mmap`/`munmap` pair.

use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::Mutex;

/// Bytes reserved at the top of every stack for the owning fiber's control
/// block. [`crate::fiber::FiberControlBlock`] must fit in this many bytes.
pub const USER_METADATA_BYTES: usize = 256;

/// Stack sizing policy. Only one policy exists today; the type remains so
/// that callers don't have to be touched again if per-fiber stack sizes are
/// ever introduced (not attempted here — see `Non-goals`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPolicy {
    Default,
}

/// Configuration consumed once by [`StackAllocator::new`].
#[derive(Debug, Clone, Copy)]
pub struct StackAllocatorConfig {
    /// Usable pages per stack, not counting the guard page.
    pub stack_pages: usize,
    /// Guard pages placed before the usable region.
    pub guard_pages: usize,
}

impl Default for StackAllocatorConfig {
    fn default() -> Self {
        StackAllocatorConfig {
            stack_pages: 32,
            guard_pages: 1,
        }
    }
}

/// The header record returned by [`StackAllocator::allocate`]. Locates a
/// stack and carries the reserved user-metadata region.
pub struct Metamark {
    /// Low address of the usable stack region (above the guard page).
    pub stack_base: NonNull<u8>,
    /// Usable stack bytes, not counting [`USER_METADATA_BYTES`].
    pub stack_bytes: usize,
    /// Reserved region at the top of the mapping for a fiber control block.
    pub user_metadata: NonNull<u8>,
    pub(crate) mapping_base: *mut libc::c_void,
    pub(crate) mapping_len: usize,
    /// Type-erased destructor for whatever was placed in `user_metadata`,
    /// invoked by `free`/`ruin` before the mapping is unmapped. `None` until
    /// the caller that placed a value there registers it.
    drop_glue: Option<unsafe fn(*mut u8)>,
}

unsafe impl Send for Metamark {}

impl Metamark {
    /// Registers the destructor for whatever the caller placed in
    /// `user_metadata`. Must be called at most once per metamark.
    ///
    /// # Safety
    /// `glue` must be safe to call with `self.user_metadata.as_ptr()` for as
    /// long as the metamark is alive and has not been freed.
    pub unsafe fn set_drop_glue(&mut self, glue: unsafe fn(*mut u8)) {
        debug_assert!(self.drop_glue.is_none(), "drop glue set twice");
        self.drop_glue = Some(glue);
    }
}

/// Owns every outstanding [`Metamark`] it has handed out, so it can free
/// them all at once from [`StackAllocator::ruin`].
pub struct StackAllocator {
    config: StackAllocatorConfig,
    page_size: usize,
    outstanding: Mutex<Vec<*mut libc::c_void>>,
}

// Metamarks are handed to exactly one fiber which lives on exactly one
// carrier; the allocator itself is only ever touched by its owning
// scheduler's carrier thread, but we still require Send/Sync so it can live
// behind an `Arc` in tests without ceremony.
unsafe impl Send for StackAllocator {}
unsafe impl Sync for StackAllocator {}

impl StackAllocator {
    pub fn new(config: StackAllocatorConfig) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        StackAllocator {
            config,
            page_size,
            outstanding: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> StackAllocatorConfig {
        self.config
    }

    /// Allocates a new guarded stack. Returns `Err` on exhaustion; no
    /// partial state is retained in that case.
    pub fn allocate(&self, _policy: StackPolicy) -> Result<Metamark> {
        if USER_METADATA_BYTES >= self.config.stack_pages * self.page_size {
            // A configured stack too small to host its own control block is
            // a resource-exhaustion condition, not just a debug-build bug:
            // `usable_len - USER_METADATA_BYTES` below would otherwise
            // underflow (wrapping to a bogus huge value with overflow checks
            // off, as in a release profile) instead of surfacing `Err` the
            // way §7 promises for this collaborator.
            return Err(Error::StackAllocation);
        }

        let guard_len = self.config.guard_pages * self.page_size;
        let usable_len = self.config.stack_pages * self.page_size;
        let total_len = guard_len + usable_len;

        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(Error::StackAllocation);
        }

        let usable_start = unsafe { (mapping as *mut u8).add(guard_len) };
        let protect_rc = unsafe {
            libc::mprotect(
                usable_start as *mut libc::c_void,
                usable_len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if protect_rc != 0 {
            unsafe { libc::munmap(mapping, total_len) };
            return Err(Error::StackAllocation);
        }

        let metadata_start = unsafe { usable_start.add(usable_len - USER_METADATA_BYTES) };
        let metamark = Metamark {
            stack_base: NonNull::new(usable_start).expect("mmap never returns null on success"),
            stack_bytes: usable_len - USER_METADATA_BYTES,
            user_metadata: NonNull::new(metadata_start).unwrap(),
            mapping_base: mapping,
            mapping_len: total_len,
            drop_glue: None,
        };

        self.outstanding.lock().unwrap().push(mapping);
        Ok(metamark)
    }

    /// Frees a single stack, running its registered drop glue first.
    pub fn free(&self, mut metamark: Metamark) {
        if let Some(glue) = metamark.drop_glue.take() {
            unsafe { glue(metamark.user_metadata.as_ptr()) };
        }
        let mut outstanding = self.outstanding.lock().unwrap();
        if let Some(pos) = outstanding.iter().position(|m| *m == metamark.mapping_base) {
            outstanding.swap_remove(pos);
        }
        unsafe { libc::munmap(metamark.mapping_base, metamark.mapping_len) };
    }

    /// Unmaps every stack this allocator ever handed out that hasn't been
    /// freed yet. Matches the source's `p7r_stack_allocator_ruin`, which
    /// destroys every outstanding fiber by destroying its stack directly:
    /// any not-yet-freed fiber's control block is leaked here rather than
    /// dropped in place, because at the point a scheduler is torn down its
    /// fibers are not running and there is no safe way to resume one just to
    /// let it unwind. Only called from `Scheduler::drop`.
    pub fn ruin(&self) {
        let mappings: Vec<_> = self.outstanding.lock().unwrap().drain(..).collect();
        for mapping in mappings {
            unsafe { libc::munmap(mapping, self.total_len_of(mapping)) };
        }
    }

    fn total_len_of(&self, _mapping: *mut libc::c_void) -> usize {
        (self.config.guard_pages + self.config.stack_pages) * self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let allocator = StackAllocator::new(StackAllocatorConfig::default());
        let metamark = allocator.allocate(StackPolicy::Default).unwrap();
        assert!(metamark.stack_bytes > 0);
        allocator.free(metamark);
    }

    #[test]
    fn ruin_frees_outstanding_stacks() {
        let allocator = StackAllocator::new(StackAllocatorConfig::default());
        for _ in 0..4 {
            allocator.allocate(StackPolicy::Default).unwrap();
        }
        assert_eq!(allocator.outstanding.lock().unwrap().len(), 4);
        allocator.ruin();
        assert_eq!(allocator.outstanding.lock().unwrap().len(), 0);
    }

    #[test]
    fn user_metadata_sits_above_usable_stack() {
        let allocator = StackAllocator::new(StackAllocatorConfig::default());
        let metamark = allocator.allocate(StackPolicy::Default).unwrap();
        let stack_end = unsafe { metamark.stack_base.as_ptr().add(metamark.stack_bytes) };
        assert_eq!(stack_end, metamark.user_metadata.as_ptr());
        allocator.free(metamark);
    }
}
