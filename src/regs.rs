//! Register state of a single frame.

use crate::arch;
use core::ptr::NonNull;

/// The register state of exactly one frame.
///
/// Besides the instruction and stack pointer, the snapshot records for each
/// general purpose register the *address* where its current value lives:
/// a slot of a thread context for the active frame, or the save slot a
/// callee's prologue spilled it to for ancestor frames. Recording locations
/// rather than values lets a moving collector update references held in
/// callee-saved registers of any frame on the stack.
///
/// A snapshot is owned by one walk and is never shared between walks.
#[derive(Clone, Debug)]
pub struct RegisterSnapshot {
    ip: usize,
    sp: usize,
    ip_location: Option<NonNull<usize>>,
    locations: [Option<NonNull<usize>>; arch::NUM_REGS],
}

impl RegisterSnapshot {
    /// A snapshot with the given instruction and stack pointer, and no
    /// register locations known.
    pub fn new(ip: usize, sp: usize) -> RegisterSnapshot {
        RegisterSnapshot {
            ip,
            sp,
            ip_location: None,
            locations: [None; arch::NUM_REGS],
        }
    }

    /// A snapshot of an active frame whose registers were captured into
    /// `context`, indexed by register number.
    ///
    /// # Safety
    ///
    /// `context` must stay valid for reads and writes for as long as this
    /// snapshot, or any snapshot unwound from it, is in use.
    pub unsafe fn from_context(
        ip: usize,
        sp: usize,
        context: NonNull<[usize; arch::NUM_REGS]>,
    ) -> RegisterSnapshot {
        let mut regs = RegisterSnapshot::new(ip, sp);
        let base = context.cast::<usize>();
        for (reg, location) in regs.locations.iter_mut().enumerate() {
            if reg == usize::from(arch::SP_REG) {
                continue;
            }
            // SAFETY: `reg < NUM_REGS`, so the slot is inside `context`.
            *location = Some(unsafe { base.add(reg) });
        }
        regs
    }

    /// The instruction pointer.
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// The stack pointer.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Where the instruction pointer was loaded from: the return-address
    /// slot of the callee for ancestor frames.
    pub fn ip_location(&self) -> Option<NonNull<usize>> {
        self.ip_location
    }

    /// Where the current value of `reg` lives, if known.
    pub fn location(&self, reg: u16) -> Option<NonNull<usize>> {
        self.locations.get(usize::from(reg)).copied().flatten()
    }

    /// The current value of `reg`, if its location is known.
    pub fn value(&self, reg: u16) -> Option<usize> {
        // SAFETY: locations are only installed through `from_context`,
        // `set_location` and the unwinder, all of which require the
        // location to be readable for the lifetime of the walk.
        self.location(reg).map(|loc| unsafe { loc.as_ptr().read() })
    }

    /// The value of the frame pointer register, if known.
    pub fn fp(&self) -> Option<usize> {
        self.value(arch::FP_REG)
    }

    /// Set the instruction pointer and the slot it was loaded from.
    pub fn set_ip(&mut self, ip: usize, location: Option<NonNull<usize>>) {
        self.ip = ip;
        self.ip_location = location;
    }

    /// Set the stack pointer.
    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }

    /// Record where the value of `reg` lives.
    ///
    /// # Safety
    ///
    /// `location`, if any, must stay valid for reads and writes for as long
    /// as this snapshot, or any snapshot unwound from it, is in use.
    ///
    /// # Panics
    ///
    /// Panics if `reg` is not a general purpose register of this
    /// architecture.
    pub unsafe fn set_location(&mut self, reg: u16, location: Option<NonNull<usize>>) {
        assert!(reg != arch::SP_REG, "the stack pointer has no location");
        self.locations[usize::from(reg)] = location;
    }

    /// Forget the locations of every register that does not survive a call.
    pub fn clear_scratch(&mut self) {
        for (reg, location) in self.locations.iter_mut().enumerate() {
            if !arch::is_callee_saved(reg as u16) {
                *location = None;
            }
        }
    }

    /// Forget the locations of every register except the frame pointer.
    pub(crate) fn clear_all_but_fp(&mut self) {
        for (reg, location) in self.locations.iter_mut().enumerate() {
            if reg != usize::from(arch::FP_REG) {
                *location = None;
            }
        }
    }
}
