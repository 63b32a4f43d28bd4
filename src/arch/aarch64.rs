//! AArch64 register conventions (x0 ... x30).

pub const NUM_REGS: usize = 31;

pub const RETURN_REG: u16 = 0;
pub const FP_REG: u16 = 29;

// The stack pointer is not one of x0-x30; use an out-of-range number so it
// can never alias a general purpose register.
pub const SP_REG: u16 = 31;

// x19-x28
pub const CALLEE_SAVED_REGS: &[u16] = &[19, 20, 21, 22, 23, 24, 25, 26, 27, 28];

// And the current frame pointer points to the next older frame pointer.
pub const NEXT_OLDER_FP_FROM_FP_OFFSET: usize = 0;

// SP of caller is FP in callee plus size of FP/LR pair.
pub const NEXT_OLDER_SP_FROM_FP_OFFSET: usize = 16;

pub fn assert_fp_is_aligned(fp: usize) {
    assert_eq!(fp % 16, 0, "stack should always be aligned to 16");
}
