//! Return-address hijacking.
//!
//! To bring a thread running managed code to a safe point, the runtime
//! redirects the return address of its active frame to a trampoline. When
//! the method returns, the trampoline saves the return register into a
//! transition frame classified with the method's [`ReturnValueKind`] and
//! parks the thread.
//!
//! The thread is expected to be suspended while a hijack is installed, but
//! the snapshot describing it may be stale. The slot is therefore only
//! updated with a compare-and-exchange against the return address the
//! caller observed when the snapshot was taken: if the method has returned
//! since, the slot holds something else and nothing is written.

use crate::registry::CodeManagerRegistry;
use crate::regs::RegisterSnapshot;
use crate::return_kind::ReturnValueKind;
use crate::scratch::MethodInfo;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

/// An installed return-address hijack.
#[derive(Debug)]
#[must_use = "a hijack must be restored if the thread is not stopped by it"]
pub struct Hijack {
    slot: NonNull<usize>,
    original: usize,
    trampoline: usize,
    kind: ReturnValueKind,
}

// SAFETY: the slot is only accessed atomically.
unsafe impl Send for Hijack {}

/// View `slot` as an atomic.
///
/// # Safety
///
/// `slot` must be a live, aligned stack slot.
unsafe fn atomic<'a>(slot: NonNull<usize>) -> &'a AtomicUsize {
    // SAFETY: forwarded to our caller.
    unsafe { AtomicUsize::from_ptr(slot.as_ptr()) }
}

impl Hijack {
    /// Redirect the return of the active frame described by `regs` to
    /// `trampoline`.
    ///
    /// `return_address` is the frame's return address as observed when
    /// `regs` was captured, for example the instruction pointer of the next
    /// frame of a walk started from `regs`.
    ///
    /// Returns `None` if the frame is not managed code, cannot be hijacked
    /// at its current instruction, is already hijacked, or its return
    /// address slot no longer holds `return_address`.
    ///
    /// # Safety
    ///
    /// `regs` must describe the active frame of a suspended thread, and the
    /// thread's stack must stay mapped until the hijack is either taken or
    /// restored.
    pub unsafe fn install(
        registry: &CodeManagerRegistry<'_>,
        regs: &RegisterSnapshot,
        return_address: usize,
        trampoline: usize,
    ) -> Option<Hijack> {
        if return_address == trampoline {
            log::debug!("frame at {:#x} is already hijacked", regs.ip());
            return None;
        }
        let mut info = MethodInfo::new();
        let manager = registry.find_method_info(regs.ip(), &mut info)?;
        let slot = manager.return_address_hijack_info(&info, regs)?;
        let kind = manager.return_value_kind(&info, regs);
        // SAFETY: the code manager hands out a slot of the active frame.
        let cell = unsafe { atomic(slot) };
        if let Err(current) =
            cell.compare_exchange(return_address, trampoline, Ordering::AcqRel, Ordering::Acquire)
        {
            log::debug!(
                "return address slot {slot:p} holds {current:#x}, expected {return_address:#x}; not hijacking"
            );
            return None;
        }
        let original = return_address;
        log::debug!(
            "hijacked return of frame at {:#x}: {original:#x} -> {trampoline:#x} ({kind:?})",
            regs.ip()
        );
        Some(Hijack {
            slot,
            original,
            trampoline,
            kind,
        })
    }

    /// The slot holding the redirected return address.
    pub fn slot(&self) -> NonNull<usize> {
        self.slot
    }

    /// The return address that was replaced.
    pub fn original_return_address(&self) -> usize {
        self.original
    }

    /// What the hijacked method leaves in the return register.
    pub fn return_value_kind(&self) -> ReturnValueKind {
        self.kind
    }

    /// Put the original return address back.
    ///
    /// Returns `false` if the slot no longer holds the trampoline address,
    /// because the thread already returned through it.
    ///
    /// # Safety
    ///
    /// The thread's stack must still be mapped.
    pub unsafe fn restore(self) -> bool {
        // SAFETY: forwarded to our caller.
        let cell = unsafe { atomic(self.slot) };
        let restored = cell
            .compare_exchange(self.trampoline, self.original, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        log::debug!("restored hijack at {:p}: {restored}", self.slot);
        restored
    }
}
