compile_error!("\
framewalk does not know the register conventions of this architecture;
a new `arch` module describing them is required
");

pub const NUM_REGS: usize = 0;

pub const RETURN_REG: u16 = 0;
pub const SP_REG: u16 = 0;
pub const FP_REG: u16 = 0;

pub const CALLEE_SAVED_REGS: &[u16] = &[];

pub const NEXT_OLDER_FP_FROM_FP_OFFSET: usize = 0;

pub const NEXT_OLDER_SP_FROM_FP_OFFSET: usize = 0;

pub fn assert_fp_is_aligned(_fp: usize) {
    panic!()
}
