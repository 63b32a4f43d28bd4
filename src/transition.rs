//! Records saved at managed/native boundaries.

use crate::arch;
use crate::code_manager::GcRootReporter;
use crate::regs::RegisterSnapshot;
use crate::return_kind::ReturnValueKind;
use bitflags::bitflags;
use core::ptr::NonNull;

bitflags! {
    /// Flag word of a [`TransitionFrame`].
    ///
    /// Bit `i` below 15 means callee-saved register `CALLEE_SAVED_REGS[i]`
    /// is preserved in the frame. The return-kind bits line up with
    /// [`ReturnValueKind`] shifted by [`RETURN_KIND_SHIFT`](crate::RETURN_KIND_SHIFT).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TransitionFrameFlags: u64 {
        /// The return register is preserved in the frame.
        const RETURN_REG_PRESERVED = 1 << 15;
        /// The preserved return register holds an object reference.
        const RETURN_IS_GCREF = 1 << 16;
        /// The preserved return register holds an interior reference.
        const RETURN_IS_BYREF = 1 << 17;

        // Callee-saved register bits.
        const _ = (1 << 15) - 1;
    }
}

impl TransitionFrameFlags {
    /// The flag for callee-saved register `CALLEE_SAVED_REGS[index]`.
    pub fn callee_saved(index: usize) -> TransitionFrameFlags {
        assert!(index < arch::CALLEE_SAVED_REGS.len());
        TransitionFrameFlags::from_bits_retain(1 << index)
    }
}

/// Number of register slots in a [`TransitionFrame`]: every callee-saved
/// register plus the return register.
pub const TRANSITION_FRAME_REG_SLOTS: usize = arch::CALLEE_SAVED_REGS.len() + 1;

/// Register state saved where managed code calls out to native code, or
/// where a thread is parked by a return-address hijack.
///
/// The layout is a contract between the code generator, which fills it in,
/// and the walker, which resumes walking from it. Preserved registers are
/// stored compactly in flag-bit order: the slot of a register is the number
/// of preserved registers with a lower flag bit.
#[repr(C)]
#[derive(Clone, Debug)]
pub struct TransitionFrame {
    return_address: usize,
    frame_pointer: usize,
    stack_pointer: usize,
    flags: u64,
    preserved_regs: [usize; TRANSITION_FRAME_REG_SLOTS],
}

impl TransitionFrame {
    /// A frame that preserves no registers besides the frame pointer.
    pub fn new(return_address: usize, frame_pointer: usize, stack_pointer: usize) -> TransitionFrame {
        TransitionFrame {
            return_address,
            frame_pointer,
            stack_pointer,
            flags: 0,
            preserved_regs: [0; TRANSITION_FRAME_REG_SLOTS],
        }
    }

    /// Address execution returns to when leaving native code.
    pub fn return_address(&self) -> usize {
        self.return_address
    }

    /// Frame pointer of the managed caller.
    pub fn frame_pointer(&self) -> usize {
        self.frame_pointer
    }

    /// Stack pointer of the managed caller at the call.
    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    /// The flag word.
    pub fn flags(&self) -> TransitionFrameFlags {
        TransitionFrameFlags::from_bits_retain(self.flags)
    }

    /// What the preserved return register holds.
    pub fn return_value_kind(&self) -> ReturnValueKind {
        ReturnValueKind::from_transition_flags(self.flags())
    }

    /// Record the classification of the preserved return register.
    pub fn set_return_value_kind(&mut self, kind: ReturnValueKind) {
        let bits = kind
            .to_transition_flags()
            .unwrap_or_else(|| fail_fast!("cannot record an unknown return kind"));
        let mask = TransitionFrameFlags::RETURN_IS_GCREF | TransitionFrameFlags::RETURN_IS_BYREF;
        self.flags = (self.flags() - mask | bits).bits();
    }

    fn flag_and_slot(&self, reg: u16) -> Option<(TransitionFrameFlags, usize)> {
        let flag = if reg == arch::RETURN_REG {
            TransitionFrameFlags::RETURN_REG_PRESERVED
        } else {
            let index = arch::CALLEE_SAVED_REGS.iter().position(|r| *r == reg)?;
            TransitionFrameFlags::callee_saved(index)
        };
        let lower = self.flags & (flag.bits() - 1) & ((1 << 16) - 1);
        Some((flag, lower.count_ones() as usize))
    }

    /// Preserve `value` for `reg`, which must be the return register or a
    /// callee-saved register other than the frame pointer.
    pub fn preserve(&mut self, reg: u16, value: usize) {
        let Some((flag, slot)) = self.flag_and_slot(reg) else {
            fail_fast!("register {reg} cannot be preserved in a transition frame");
        };
        if self.flags().contains(flag) {
            self.preserved_regs[slot] = value;
            return;
        }
        let used = (self.flags & ((1 << 16) - 1)).count_ones() as usize;
        self.preserved_regs.copy_within(slot..used, slot + 1);
        self.preserved_regs[slot] = value;
        self.flags |= flag.bits();
    }

    /// The preserved value of `reg`, if any.
    pub fn preserved(&self, reg: u16) -> Option<usize> {
        let (flag, slot) = self.flag_and_slot(reg)?;
        self.flags()
            .contains(flag)
            .then(|| self.preserved_regs[slot])
    }

    /// Fail fast if the flag word claims callee-saved registers that do not
    /// exist, which would place preserved registers outside the frame.
    fn check_flags(&self) {
        let callee_saved = self.flags & ((1 << 15) - 1);
        if callee_saved >> arch::CALLEE_SAVED_REGS.len() != 0 {
            fail_fast!(
                "transition frame {:p} preserves unknown callee-saved registers: flags {:#x}",
                self,
                self.flags
            );
        }
    }

    /// Reconstruct the register state of the managed frame that made the
    /// transition.
    ///
    /// # Safety
    ///
    /// `frame` must point to a live transition frame that stays valid for as
    /// long as the returned snapshot is in use.
    pub unsafe fn load_snapshot(frame: NonNull<TransitionFrame>) -> RegisterSnapshot {
        let ptr = frame.as_ptr();
        // SAFETY: the caller guarantees `frame` is live.
        unsafe {
            let this = &*ptr;
            this.check_flags();
            let mut regs = RegisterSnapshot::new(this.return_address, this.stack_pointer);
            regs.set_ip(
                this.return_address,
                Some(NonNull::new_unchecked(&raw mut (*ptr).return_address)),
            );
            regs.set_location(
                arch::FP_REG,
                Some(NonNull::new_unchecked(&raw mut (*ptr).frame_pointer)),
            );
            let base = (&raw mut (*ptr).preserved_regs).cast::<usize>();
            for reg in arch::CALLEE_SAVED_REGS.iter().copied().chain([arch::RETURN_REG]) {
                if let Some((flag, slot)) = this.flag_and_slot(reg) {
                    if this.flags().contains(flag) {
                        regs.set_location(reg, Some(NonNull::new_unchecked(base.add(slot))));
                    }
                }
            }
            log::trace!(
                "loaded transition frame {ptr:p}: ip = {:#x}, sp = {:#x}",
                this.return_address,
                this.stack_pointer
            );
            regs
        }
    }

    /// Report the preserved return register as a GC root if it holds a
    /// reference.
    ///
    /// # Safety
    ///
    /// `frame` must point to a live transition frame.
    pub unsafe fn enum_return_value_root(
        frame: NonNull<TransitionFrame>,
        reporter: &mut dyn GcRootReporter,
    ) {
        let ptr = frame.as_ptr();
        // SAFETY: the caller guarantees `frame` is live.
        unsafe {
            let this = &*ptr;
            this.check_flags();
            let kind = this.return_value_kind();
            if kind == ReturnValueKind::Unknown {
                fail_fast!("transition frame {ptr:p} has an invalid return kind");
            }
            let Some(flags) = kind.gc_ref_flags() else {
                return;
            };
            let Some((flag, slot)) = this.flag_and_slot(arch::RETURN_REG) else {
                return;
            };
            if !this.flags().contains(flag) {
                fail_fast!("transition frame {ptr:p} classifies a return register it did not preserve");
            }
            let base = (&raw mut (*ptr).preserved_regs).cast::<usize>();
            reporter.report(NonNull::new_unchecked(base.add(slot)), flags);
        }
    }
}
