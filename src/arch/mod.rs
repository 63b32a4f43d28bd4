//! Architecture-specific register conventions.
//!
//! Each architecture has its own file in the `arch` folder which is referenced
//! here. All architectures expose the same interface to the rest of the
//! crate: register numbering, which registers survive a call, and how a
//! frame-pointer chain is laid out on the stack.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86;
        use x86 as imp;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        use aarch64 as imp;
    } else {
        mod unsupported;
        use unsupported as imp;
    }
}

/// Number of general purpose registers tracked by a
/// [`RegisterSnapshot`](crate::RegisterSnapshot).
pub const NUM_REGS: usize = imp::NUM_REGS;

/// The frame pointer register.
pub const FP_REG: u16 = imp::FP_REG;

/// The stack pointer register. Its value is tracked separately from the
/// other registers and it never holds a GC reference.
pub const SP_REG: u16 = imp::SP_REG;

/// The register holding a method's return value.
pub const RETURN_REG: u16 = imp::RETURN_REG;

/// Callee-saved registers other than the frame pointer, in transition-frame
/// flag-bit order.
pub const CALLEE_SAVED_REGS: &[u16] = imp::CALLEE_SAVED_REGS;

/// Is `reg` preserved across calls?
pub fn is_callee_saved(reg: u16) -> bool {
    reg == FP_REG || CALLEE_SAVED_REGS.contains(&reg)
}

// The frame pointer points at the saved frame pointer of the next older
// frame, and the return address sits one word above it.
pub const NEXT_OLDER_FP_FROM_FP_OFFSET: usize = imp::NEXT_OLDER_FP_FROM_FP_OFFSET;

// SP of caller is FP in callee plus size of FP/return address pair.
pub const NEXT_OLDER_SP_FROM_FP_OFFSET: usize = imp::NEXT_OLDER_SP_FROM_FP_OFFSET;

pub fn assert_fp_is_aligned(fp: usize) {
    imp::assert_fp_is_aligned(fp)
}

const _: () = {
    assert!(NEXT_OLDER_FP_FROM_FP_OFFSET == 0);
    assert!((FP_REG as usize) < NUM_REGS);
    assert!((RETURN_REG as usize) < NUM_REGS);
    // Bit 15 of the transition frame flags is reserved for the return
    // register.
    assert!(CALLEE_SAVED_REGS.len() < 15);
};
