//! Raw machine-context switching.
//!
//! One hand-written assembly routine per supported architecture saves the
//! callee-saved registers of the currently running context onto its own
//! stack, swaps the stack pointer, and restores the target context's
//! registers from its stack. [`Context::prepare`] fabricates a fake initial
//! frame so that the first switch into a freshly created context "returns"
//! into a small trampoline stub instead of a real caller, which then tail
//! jumps into the Rust entry function with its argument in the ABI's first
//! integer register.
//!
//! Unsupported architectures fail to compile rather than silently
//! no-op — there is no safe software fallback for this primitive.

use std::mem::size_of;

/// Opaque saved machine context. Only ever touched by [`context_switch`] and
/// [`Context::prepare`]; the single field is the saved stack pointer.
#[repr(C)]
pub struct Context {
    sp: usize,
}

impl Context {
    /// An empty context, suitable only as the destination of the very first
    /// `from` side of a switch (e.g. a carrier's own OS context before it
    /// has ever switched into a fiber).
    pub fn empty() -> Self {
        Context { sp: 0 }
    }

    /// Arranges `[stack_base, stack_base + stack_bytes)` so that the first
    /// resumption of the returned context calls `entry(arg)` and never
    /// returns.
    ///
    /// # Safety
    /// The stack region must be valid, writable, exclusively owned memory
    /// that outlives the context, and must be large enough to hold the
    /// architecture's initial register frame (always well under one page).
    pub unsafe fn prepare(
        stack_base: *mut u8,
        stack_bytes: usize,
        entry: extern "C" fn(*mut u8) -> !,
        arg: *mut u8,
    ) -> Context {
        arch::prepare(stack_base, stack_bytes, entry, arg)
    }
}

/// Saves the registers of `from` onto its own stack and resumes `to`.
/// Returns once something later switches back into `from`.
///
/// # Safety
/// `to` must have been produced by [`Context::prepare`] and not be
/// concurrently resumed elsewhere, and `from` must be the context of the
/// code currently executing.
pub unsafe fn context_switch(from: &mut Context, to: &Context) {
    arch::context_switch(&mut from.sp, to.sp)
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Context;

    const FRAME_WORDS: usize = 7; // r15, r14, r13, r12, rbp, rbx, return-address
    const FRAME_BYTES: usize = FRAME_WORDS * size_of::<usize>();

    std::arch::global_asm!(
        ".global p7r_ctx_switch",
        "p7r_ctx_switch:",
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
        "p7r_trampoline_enter:",
        "mov rdi, r12",
        "jmp r13",
    );

    extern "C" {
        fn p7r_ctx_switch(from_sp_slot: *mut usize, to_sp: usize);
        fn p7r_trampoline_enter();
    }

    pub unsafe fn context_switch(from_sp: &mut usize, to_sp: usize) {
        p7r_ctx_switch(from_sp as *mut usize, to_sp);
    }

    pub unsafe fn prepare(
        stack_base: *mut u8,
        stack_bytes: usize,
        entry: extern "C" fn(*mut u8) -> !,
        arg: *mut u8,
    ) -> Context {
        let raw_top = (stack_base as usize + stack_bytes) & !0xF;
        // Land in the trampoline with rsp congruent to a just-`call`ed
        // function (8 mod 16), matching what the System V ABI expects.
        let entry_sp = raw_top - 8;
        let sp = entry_sp - FRAME_BYTES;

        let frame = sp as *mut usize;
        frame.add(0).write(0); // r15
        frame.add(1).write(0); // r14
        frame.add(2).write(entry as usize); // r13: rust entry fn
        frame.add(3).write(arg as usize); // r12: rust entry arg
        frame.add(4).write(0); // rbp
        frame.add(5).write(0); // rbx
        frame.add(6).write(p7r_trampoline_enter as usize); // return address

        Context { sp }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::Context;

    // x19..x28, x29 (fp), x30 (lr)
    const FRAME_WORDS: usize = 12;
    const FRAME_BYTES: usize = FRAME_WORDS * size_of::<usize>();

    std::arch::global_asm!(
        ".global p7r_ctx_switch",
        "p7r_ctx_switch:",
        "sub sp, sp, #96",
        "str x19, [sp, #0]",
        "str x20, [sp, #8]",
        "str x21, [sp, #16]",
        "str x22, [sp, #24]",
        "str x23, [sp, #32]",
        "str x24, [sp, #40]",
        "str x25, [sp, #48]",
        "str x26, [sp, #56]",
        "str x27, [sp, #64]",
        "str x28, [sp, #72]",
        "str x29, [sp, #80]",
        "str x30, [sp, #88]",
        "mov x2, sp",
        "str x2, [x0]",
        "mov sp, x1",
        "ldr x19, [sp, #0]",
        "ldr x20, [sp, #8]",
        "ldr x21, [sp, #16]",
        "ldr x22, [sp, #24]",
        "ldr x23, [sp, #32]",
        "ldr x24, [sp, #40]",
        "ldr x25, [sp, #48]",
        "ldr x26, [sp, #56]",
        "ldr x27, [sp, #64]",
        "ldr x28, [sp, #72]",
        "ldr x29, [sp, #80]",
        "ldr x30, [sp, #88]",
        "add sp, sp, #96",
        "ret",
        "p7r_trampoline_enter:",
        "mov x0, x19",
        "br x20",
    );

    extern "C" {
        fn p7r_ctx_switch(from_sp_slot: *mut usize, to_sp: usize);
        fn p7r_trampoline_enter();
    }

    pub unsafe fn context_switch(from_sp: &mut usize, to_sp: usize) {
        p7r_ctx_switch(from_sp as *mut usize, to_sp);
    }

    pub unsafe fn prepare(
        stack_base: *mut u8,
        stack_bytes: usize,
        entry: extern "C" fn(*mut u8) -> !,
        arg: *mut u8,
    ) -> Context {
        let top = (stack_base as usize + stack_bytes) & !0xF;
        let sp = top - FRAME_BYTES;

        let frame = sp as *mut usize;
        frame.add(0).write(arg as usize); // x19: rust entry arg
        frame.add(1).write(entry as usize); // x20: rust entry fn
        for i in 2..10 {
            frame.add(i).write(0); // x21..x28
        }
        frame.add(10).write(0); // x29 (fp)
        frame.add(11).write(p7r_trampoline_enter as usize); // x30 (lr)

        Context { sp }
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
    compile_error!("carrierd's context-switch primitive has no implementation for this architecture");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static VISITS: AtomicUsize = AtomicUsize::new(0);
    static mut RETURN_CTX: *mut Context = std::ptr::null_mut();

    extern "C" fn record_and_return(arg: *mut u8) -> ! {
        VISITS.fetch_add(arg as usize, Ordering::SeqCst);
        unsafe {
            let mut empty = Context::empty();
            context_switch(&mut empty, &*RETURN_CTX);
        }
        unreachable!("the main thread never switches back into a finished test context");
    }

    #[test]
    fn switch_into_fresh_context_and_back() {
        VISITS.store(0, Ordering::SeqCst);

        let mut stack = vec![0u8; 64 * 1024].into_boxed_slice();
        let stack_base = stack.as_mut_ptr();
        let stack_bytes = stack.len();

        let mut main_ctx = Context::empty();
        let fiber_ctx = unsafe {
            Context::prepare(stack_base, stack_bytes, record_and_return, 7 as *mut u8)
        };

        unsafe {
            RETURN_CTX = &mut main_ctx as *mut Context;
            context_switch(&mut main_ctx, &fiber_ctx);
        }

        assert_eq!(VISITS.load(Ordering::SeqCst), 7);
    }
}
