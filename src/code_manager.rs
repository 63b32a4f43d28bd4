//! The interface between the generic walker and a code generator's metadata.

use crate::associated::AssociatedData;
use crate::classlib::{ClasslibFunction, ClasslibFunctionId};
use crate::regs::RegisterSnapshot;
use crate::return_kind::ReturnValueKind;
use crate::scratch::{EhEnumState, MethodInfo};
use crate::transition::TransitionFrame;
use bitflags::bitflags;
use core::ptr::NonNull;

bitflags! {
    /// How a reported GC root must be treated by the collector.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GcRefFlags: u32 {
        /// The reference may point into the middle of an object.
        const INTERIOR = 1;
        /// The referenced object must not be relocated.
        const PINNED = 2;
    }
}

bitflags! {
    /// Options for [`CodeManager::unwind_stack_frame`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UnwindFlags: u32 {
        /// Do not unwind out of a method entered from native code; return
        /// the transition frame it saved instead.
        const STOP_ON_TRANSITION_FRAME = 1 << 0;
        /// Only reconstruct the instruction, stack and frame pointers.
        ///
        /// The resulting snapshot is good enough to continue a diagnostic
        /// walk but must not be used to enumerate roots.
        const FAST = 1 << 1;
    }
}

/// Receives the GC roots found by [`CodeManager::enum_gc_refs`].
pub trait GcRootReporter {
    /// Report the reference stored at `slot`.
    fn report(&mut self, slot: NonNull<usize>, flags: GcRefFlags);
}

impl<F> GcRootReporter for F
where
    F: FnMut(NonNull<usize>, GcRefFlags),
{
    fn report(&mut self, slot: NonNull<usize>, flags: GcRefFlags) {
        self(slot, flags)
    }
}

/// The kind of an exception-handling clause.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EhClauseKind {
    /// Catches exceptions of a target type.
    Typed = 0,
    /// Runs while unwinding; also used for `finally` blocks.
    Fault = 1,
    /// Catches exceptions accepted by a filter.
    Filter = 2,
    /// Never matches.
    Unused = 3,
}

/// An exception-handling clause as seen by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EhClause {
    /// The clause kind.
    pub kind: EhClauseKind,
    /// Start of the protected range, relative to the method start.
    pub try_start_offset: u32,
    /// End (exclusive) of the protected range, relative to the method start.
    pub try_end_offset: u32,
    /// Absolute address of the handler.
    pub handler_address: usize,
    /// Absolute address of the filter, for [`EhClauseKind::Filter`].
    pub filter_address: Option<usize>,
    /// Handle of the caught type, for [`EhClauseKind::Typed`].
    pub target_type: Option<usize>,
}

impl EhClause {
    /// Does the protected range contain the method-relative `offset`?
    pub fn covers(&self, offset: u32) -> bool {
        self.try_start_offset <= offset && offset < self.try_end_offset
    }
}

/// Errors returned by [`CodeManager::unwind_stack_frame`].
#[derive(Debug, thiserror::Error)]
pub enum UnwindError {
    /// The frame is inside a prologue or epilogue.
    #[error("code at {pc:#x} is inside a prologue or epilogue and cannot be unwound")]
    NotUnwindable {
        /// The offending program counter.
        pc: usize,
    },
    /// A register needed to unwind has no known location in the snapshot.
    #[error("register {reg} needed to unwind the frame at {pc:#x} has no known location")]
    MissingRegister {
        /// The frame's program counter.
        pc: usize,
        /// The register.
        reg: u16,
    },
}

/// Interpretation of the frames of one region of machine code.
///
/// Each code generator contributes an implementation and registers it for
/// the address ranges it owns with a
/// [`CodeManagerRegistry`](crate::CodeManagerRegistry). Every per-frame
/// operation receives a [`MethodInfo`] that this manager populated in
/// [`CodeManager::find_method_info`] for the frame's program counter; passing
/// one produced for another address or by another manager is a caller error
/// and fails fast.
///
/// None of the methods may allocate or block: they are called from fault
/// handlers and while other threads are suspended.
///
/// # Safety
///
/// This trait is `unsafe` because the walker dereferences the locations it
/// returns. The register locations installed by
/// [`CodeManager::unwind_stack_frame`], the slots handed to a
/// [`GcRootReporter`], the return-address slot from
/// [`CodeManager::return_address_hijack_info`] and the transition frames
/// returned by unwinding must all point to live memory of the walked thread.
/// Incorrect values will cause walking to segfault or otherwise result in UB.
pub unsafe trait CodeManager: Send + Sync {
    /// Is `pc` an address at which GC information is complete?
    ///
    /// This is conservative: it may return `false` for an address that is
    /// actually safe, but never `true` for one that is not.
    fn is_safe_point(&self, pc: usize) -> bool;

    /// Resolve `pc` to its method, storing the result in `info`.
    ///
    /// Returns `false` if `pc` is not owned by this manager.
    fn find_method_info(&self, pc: usize, info: &mut MethodInfo) -> bool;

    /// Is the method a funclet running on its parent's frame?
    fn is_funclet(&self, info: &MethodInfo) -> bool;

    /// The canonical frame pointer of the frame: for funclets, the frame
    /// pointer of the parent method. `None` for methods without one.
    fn frame_pointer(&self, info: &MethodInfo, regs: &RegisterSnapshot) -> Option<usize>;

    /// Report every GC reference live at `safe_point_pc`.
    ///
    /// `is_active_frame` is true for the innermost frame of a walk, where
    /// registers that do not survive calls may hold live references.
    fn enum_gc_refs(
        &self,
        info: &MethodInfo,
        safe_point_pc: usize,
        regs: &RegisterSnapshot,
        reporter: &mut dyn GcRootReporter,
        is_active_frame: bool,
    );

    /// Unwind `regs` from the frame described by `info` to its caller.
    ///
    /// Returns the previous transition frame when the unwound method was
    /// entered from native code, so the caller can continue the walk from
    /// it. With [`UnwindFlags::STOP_ON_TRANSITION_FRAME`] such a method is
    /// not unwound at all and `regs` is left untouched.
    fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        flags: UnwindFlags,
        regs: &mut RegisterSnapshot,
    ) -> Result<Option<NonNull<TransitionFrame>>, UnwindError>;

    /// Upper bound of the outgoing argument area that must be scanned
    /// conservatively while the frame is in the middle of a call.
    fn conservative_outgoing_args_bound(&self, info: &MethodInfo, regs: &RegisterSnapshot) -> usize;

    /// Can the frame at `pc` be unwound? False inside prologues and
    /// epilogues.
    fn is_unwindable(&self, pc: usize) -> bool;

    /// The slot holding the frame's return address, or `None` if returning
    /// from this frame cannot be intercepted safely.
    fn return_address_hijack_info(
        &self,
        info: &MethodInfo,
        regs: &RegisterSnapshot,
    ) -> Option<NonNull<usize>>;

    /// What the method leaves in the return register.
    fn return_value_kind(&self, info: &MethodInfo, regs: &RegisterSnapshot) -> ReturnValueKind;

    /// Map the address of a hardware fault to a nearby safe point with the
    /// same exception-handling context.
    fn remap_hardware_fault_to_safe_point(&self, info: &MethodInfo, pc: usize) -> usize;

    /// Begin enumerating the method's exception-handling clauses.
    ///
    /// Returns the method start address, or `None` if it has no clauses.
    fn eh_enum_init(&self, info: &MethodInfo, state: &mut EhEnumState) -> Option<usize>;

    /// The next clause, innermost first.
    fn eh_enum_next(&self, state: &mut EhEnumState) -> Option<EhClause>;

    /// Address of the first instruction of the method.
    fn method_start_address(&self, info: &MethodInfo) -> usize;

    /// Handle of the loaded module containing this code.
    fn os_module_handle(&self) -> usize;

    /// The runtime-library function registered for `id`.
    fn classlib_function(&self, id: ClasslibFunctionId) -> Option<ClasslibFunction>;

    /// The side data of the method containing `pc`.
    fn associated_data(&self, pc: usize) -> Option<AssociatedData<'_>>;
}
