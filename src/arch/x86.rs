//! x86-64 register conventions (System V numbering: rax = 0 ... r15 = 15).

pub const NUM_REGS: usize = 16;

pub const RETURN_REG: u16 = 0; // rax
pub const SP_REG: u16 = 4; // rsp
pub const FP_REG: u16 = 5; // rbp

// rbx, r12-r15
pub const CALLEE_SAVED_REGS: &[u16] = &[3, 12, 13, 14, 15];

// And the current frame pointer points to the next older frame pointer.
pub const NEXT_OLDER_FP_FROM_FP_OFFSET: usize = 0;

// SP of caller is FP in callee plus size of FP/return address pair.
pub const NEXT_OLDER_SP_FROM_FP_OFFSET: usize = 16;

/// Frame pointers are aligned if they're aligned to twice the size of a
/// pointer.
pub fn assert_fp_is_aligned(fp: usize) {
    let align = 2 * size_of::<usize>();
    assert_eq!(fp % align, 0, "stack should always be aligned to {align}");
}
