//! Machine-context save/restore.
//!
//! A [`Context`] is nothing but a saved stack pointer: switching to it means
//! "jump into whatever this stack was doing when it was last switched away
//! from". The callee-saved registers live *on the stack itself*, pushed by
//! the switch routine, so the only thing that needs to survive a switch in a
//! dedicated field is the stack pointer.
//!
//! The switch routine is hand-written per architecture in [`global_asm!`],
//! since it must not touch the red zone, must save exactly the registers the
//! platform ABI calls callee-saved, and must never be inlined or reordered
//! by the optimizer.

use std::arch::global_asm;

/// An opaque, previously-suspended machine context.
///
/// `sp` points at the lowest address of the block of callee-saved registers
/// pushed by [`context_switch`] (or synthesized by [`Context::new`]).
#[derive(Debug)]
#[repr(transparent)]
pub struct Context {
    sp: *mut u8,
}

// The context is just a pointer into a stack this crate owns exclusively;
// moving it between threads is how fibers migrate between workers.
unsafe impl Send for Context {}

/// Function a freshly initialized context starts executing at once switched
/// into for the first time.
pub type Trampoline = unsafe extern "C" fn(arg: *mut ()) -> !;

impl Context {
    /// An empty context that must never be switched into; used as a
    /// placeholder before a stack is attached.
    pub const fn empty() -> Self {
        Self {
            sp: std::ptr::null_mut(),
        }
    }

    /// Lays out an initial machine context on `stack` such that the first
    /// switch into it calls `entry(arg)`.
    ///
    /// # Safety
    /// `stack` must point at a writable region of at least
    /// [`arch::MIN_STACK_RESERVE`] bytes, and must not be referenced by any
    /// other live `Context`.
    pub unsafe fn new(stack: *mut u8, stack_len: usize, entry: Trampoline, arg: *mut ()) -> Self {
        Self {
            sp: arch::init(stack, stack_len, entry, arg),
        }
    }

    /// Switches execution from `from` to `to`.
    ///
    /// On return, `from` has been resumed by some other call to `switch`
    /// (possibly on another thread than the one that suspended it).
    ///
    /// # Safety
    /// `to` must be a context that is currently suspended (never running,
    /// never freed), and `from` must be the context of the fiber actually
    /// executing on this stack right now.
    #[inline(always)]
    pub unsafe fn switch(from: &mut Context, to: &Context) {
        context_switch(&mut from.sp, to.sp);
    }
}

extern "C" {
    /// Saves the current callee-saved registers below the stack pointer
    /// pointed to by `from`, writes the new stack pointer into `*from`,
    /// switches `rsp`/`sp` to `to`, and restores the registers found there.
    fn context_switch(from: *mut *mut u8, to: *mut u8);
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::Trampoline;
    use std::arch::global_asm;

    /// 6 callee-saved GPRs + return address, rounded up generously.
    pub const MIN_STACK_RESERVE: usize = 256;

    // Number of 8-byte slots reserved below the top of the stack: 6
    // callee-saved registers, a return address (the trampoline shim), and
    // two argument words (entry fn pointer, entry arg) the shim consumes.
    const SLOTS: usize = 9;

    pub unsafe fn init(stack: *mut u8, stack_len: usize, entry: Trampoline, arg: *mut ()) -> *mut u8 {
        let top = (stack as usize + stack_len) & !0xf_usize;
        let base = (top - SLOTS * 8) as *mut u64;
        // The 6 callee-saved register slots are never read meaningfully:
        // this is the *first* switch into the context, so whatever
        // `context_switch`'s restore sequence pops into rbx/rbp/r12-r15 is
        // discarded the moment the fiber body starts running.
        for i in 0..6 {
            *base.add(i) = 0;
        }
        *base.add(6) = fiber_trampoline_shim as usize as u64;
        *base.add(7) = entry as usize as u64;
        *base.add(8) = arg as u64;
        base as *mut u8
    }

    extern "C" {
        fn fiber_trampoline_shim();
    }

    global_asm!(
        r#"
        .text
        .globl context_switch
        context_switch:
            push rbp
            push rbx
            push r12
            push r13
            push r14
            push r15
            mov [rdi], rsp
            mov rsp, rsi
            pop r15
            pop r14
            pop r13
            pop r12
            pop rbx
            pop rbp
            ret
        "#
    );

    global_asm!(
        r#"
        .text
        .globl fiber_trampoline_shim
        fiber_trampoline_shim:
            pop rax
            pop rdi
            call rax
        "#
    );
    // `call` rather than `jmp`: after the six pops above plus `ret`'s own
    // implicit pop, rsp is 16-byte aligned here (it equals `top`, and
    // `top` was rounded down to a 16-byte boundary in `init`), which is
    // the alignment the ABI expects *before* a `call`. A bare `jmp` would
    // leave `entry` running with rsp misaligned by 8 relative to what its
    // prologue assumes. `entry` never returns, so the pushed return
    // address is never used.
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::Trampoline;
    use std::arch::global_asm;

    pub const MIN_STACK_RESERVE: usize = 256;

    // x19-x28 (10), fp/lr (2), d8-d15 (8) = 20 slots of callee-saved
    // register storage, plus entry fn + arg stored just above that block
    // (see `context_switch`, which only sub/adds sp by the 160 bytes the
    // register block actually occupies).
    const SLOTS: usize = 22;

    pub unsafe fn init(stack: *mut u8, stack_len: usize, entry: Trampoline, arg: *mut ()) -> *mut u8 {
        let top = (stack as usize + stack_len) & !0xf_usize;
        let base = (top - SLOTS * 8) as *mut u64;
        for i in 0..20 {
            *base.add(i) = 0;
        }
        // `lr` is the second half of the x29/x30 pair, stored at byte
        // offset 88 (slot 11) by `stp x29, x30, [sp, #80]` in
        // `context_switch` below; point it at the shim rather than a real
        // return site so the first `ret` after this context is resumed
        // lands there instead of jumping through a zeroed register.
        *base.add(11) = fiber_trampoline_shim as usize as u64;
        *base.add(20) = entry as usize as u64;
        *base.add(21) = arg as u64;
        base as *mut u8
    }

    extern "C" {
        fn fiber_trampoline_shim();
    }

    global_asm!(
        r#"
        .text
        .globl context_switch
        context_switch:
            sub sp, sp, #160
            stp x19, x20, [sp, #0]
            stp x21, x22, [sp, #16]
            stp x23, x24, [sp, #32]
            stp x25, x26, [sp, #48]
            stp x27, x28, [sp, #64]
            stp x29, x30, [sp, #80]
            stp d8,  d9,  [sp, #96]
            stp d10, d11, [sp, #112]
            stp d12, d13, [sp, #128]
            stp d14, d15, [sp, #144]
            mov x2, sp
            str x2, [x0]
            mov sp, x1
            ldp x19, x20, [sp, #0]
            ldp x21, x22, [sp, #16]
            ldp x23, x24, [sp, #32]
            ldp x25, x26, [sp, #48]
            ldp x27, x28, [sp, #64]
            ldp x29, x30, [sp, #80]
            ldp d8,  d9,  [sp, #96]
            ldp d10, d11, [sp, #112]
            ldp d12, d13, [sp, #128]
            ldp d14, d15, [sp, #144]
            add sp, sp, #160
            ret
        "#
    );

    global_asm!(
        r#"
        .text
        .globl fiber_trampoline_shim
        fiber_trampoline_shim:
            ldp x1, x0, [sp], #16
            br x1
        "#
    );
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is not implemented for this architecture");
