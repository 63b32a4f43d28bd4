//! Table-driven code manager for ahead-of-time compiled code.
//!
//! The manager interprets a `.framewalk.info` section (see
//! [`framewalk_environ`]) describing one text section already mapped in
//! memory. All lookups are zero-copy reads of the section.

use crate::arch;
use crate::associated::AssociatedData;
use crate::classlib::{ClasslibFunction, ClasslibFunctionId, ClasslibFunctions};
use crate::code_manager::{
    CodeManager, EhClause, EhClauseKind, GcRefFlags, GcRootReporter, UnwindError, UnwindFlags,
};
use crate::regs::RegisterSnapshot;
use crate::return_kind::ReturnValueKind;
use crate::scratch::{EhEnumState, MethodInfo};
use crate::transition::TransitionFrame;
use anyhow::{Context, Result, bail};
use core::ops::Range;
use core::ptr::NonNull;
use framewalk_environ::{
    ClauseKind, CodeInfo, FrameLayout, GcSlot, Method, MethodReturnKind, SlotFlags, SlotLocation,
};
use std::sync::Arc;

const WORD: usize = size_of::<usize>();

/// What an [`AotCodeManager`] stores in a [`MethodInfo`].
#[derive(Clone, Copy, Debug)]
struct AotMethodInfo {
    owner: usize,
    pc: usize,
    method: u32,
}

/// What an [`AotCodeManager`] stores in an [`EhEnumState`].
#[derive(Clone, Copy, Debug)]
struct AotEhState {
    owner: usize,
    method: u32,
    /// Storage index of the last clause returned, or `u32::MAX` before the
    /// first.
    last: u32,
}

/// Code manager for one ahead-of-time compiled text section.
pub struct AotCodeManager<'a> {
    text: Range<usize>,
    info: CodeInfo<'a>,
    type_handles: &'a [usize],
    os_module_handle: usize,
    classlib: Arc<ClasslibFunctions>,
}

fn frame_addr(base: usize, offset: i32) -> usize {
    base.wrapping_add_signed(offset as isize)
}

/// Read the word at `addr`.
///
/// # Safety
///
/// `addr` must be a readable, aligned stack slot of the walked thread.
unsafe fn read_word(addr: usize) -> usize {
    unsafe { *(addr as *const usize) }
}

fn slot_ptr(addr: usize) -> NonNull<usize> {
    match NonNull::new(addr as *mut usize) {
        Some(ptr) => ptr,
        None => fail_fast!("computed a null stack slot address"),
    }
}

impl<'a> AotCodeManager<'a> {
    /// Create a manager for the text section mapped at `text`, described by
    /// the `code_info` section.
    ///
    /// `type_handles` resolves the type indices of typed clauses.
    pub fn new(
        text: Range<usize>,
        code_info: &'a [u8],
        type_handles: &'a [usize],
        classlib: Arc<ClasslibFunctions>,
    ) -> Result<AotCodeManager<'a>> {
        if text.is_empty() {
            bail!("text section {text:#x?} is empty");
        }
        let text_len = u32::try_from(text.len()).context("text section is larger than 4GiB")?;
        let info = CodeInfo::parse(code_info, text_len)?;
        for method in info.methods() {
            check_method(&method, type_handles.len())
                .with_context(|| format!("method {} at {:#x} is not supported", method.index(), method.start()))?;
        }
        log::debug!(
            "loaded code info for {text:#x?}: {} methods",
            info.method_count()
        );
        Ok(AotCodeManager {
            text,
            info,
            type_handles,
            os_module_handle: 0,
            classlib,
        })
    }

    /// Set the handle returned by [`CodeManager::os_module_handle`].
    pub fn with_os_module_handle(mut self, handle: usize) -> AotCodeManager<'a> {
        self.os_module_handle = handle;
        self
    }

    /// Address range of the text section.
    pub fn text_range(&self) -> Range<usize> {
        self.text.clone()
    }

    /// The parsed tables.
    pub fn code_info(&self) -> &CodeInfo<'a> {
        &self.info
    }

    fn owner(&self) -> usize {
        self as *const Self as usize
    }

    fn text_offset(&self, pc: usize) -> Option<u32> {
        if self.text.contains(&pc) {
            u32::try_from(pc - self.text.start).ok()
        } else {
            None
        }
    }

    fn method_at(&self, pc: usize) -> Option<Method<'a>> {
        self.info.lookup_method(self.text_offset(pc)?)
    }

    fn method_start(&self, method: &Method<'a>) -> usize {
        self.text.start + method.start() as usize
    }

    /// Decode a `MethodInfo` populated by this manager.
    fn resolve(&self, info: &MethodInfo) -> (Method<'a>, usize) {
        let raw = info.get::<AotMethodInfo>();
        if raw.owner != self.owner() {
            fail_fast!("MethodInfo for {:#x} was populated by another code manager", raw.pc);
        }
        (self.info.method(raw.method as usize), raw.pc)
    }

    /// Method-relative offset of `pc`, which must be inside `method`.
    fn method_offset(&self, method: &Method<'a>, pc: usize) -> u32 {
        let start = self.method_start(method);
        match pc.checked_sub(start).and_then(|o| u32::try_from(o).ok()) {
            Some(offset) if offset < method.len() => offset,
            _ => fail_fast!(
                "{pc:#x} is outside method {} at {start:#x}",
                method.index()
            ),
        }
    }

    fn is_established(&self, method: &Method<'a>, pc: usize) -> bool {
        !method.is_in_prolog_or_epilog(self.method_offset(method, pc))
    }

    /// The address the method's own frame is addressed from: the frame
    /// pointer or the stack pointer.
    fn frame_base(&self, method: &Method<'a>, regs: &RegisterSnapshot) -> Result<usize, UnwindError> {
        match method.frame_layout() {
            FrameLayout::FramePointer => regs.fp().ok_or(UnwindError::MissingRegister {
                pc: regs.ip(),
                reg: arch::FP_REG,
            }),
            FrameLayout::StackPointer { .. } => Ok(regs.sp()),
        }
    }

    /// Location of the return address and the caller's stack pointer.
    fn return_slot(&self, method: &Method<'a>, regs: &RegisterSnapshot) -> Result<(usize, usize), UnwindError> {
        let base = self.frame_base(method, regs)?;
        Ok(match method.frame_layout() {
            FrameLayout::FramePointer => {
                arch::assert_fp_is_aligned(base);
                (base + WORD, base + arch::NEXT_OLDER_SP_FROM_FP_OFFSET)
            }
            FrameLayout::StackPointer { frame_size } => {
                let ra = base + frame_size as usize;
                (ra, ra + WORD)
            }
        })
    }

    fn reverse_pinvoke_slot(&self, method: &Method<'a>, regs: &RegisterSnapshot) -> Option<usize> {
        let offset = method.reverse_pinvoke_slot()?;
        let fp = regs
            .fp()
            .unwrap_or_else(|| fail_fast!("reverse transition method without a frame pointer"));
        Some(frame_addr(fp, offset))
    }

    fn slot_address(
        &self,
        info: &MethodInfo,
        method: &Method<'a>,
        slot: &GcSlot,
        regs: &RegisterSnapshot,
        is_active_frame: bool,
    ) -> Option<NonNull<usize>> {
        let addr = match slot.location {
            SlotLocation::Register(reg) => {
                if !is_active_frame && !arch::is_callee_saved(reg) {
                    return None;
                }
                return match regs.location(reg) {
                    Some(location) => Some(location),
                    None => fail_fast!(
                        "register {reg} holds a GC reference at {:#x} but its location is unknown",
                        regs.ip()
                    ),
                };
            }
            SlotLocation::Sp(offset) => frame_addr(regs.sp(), offset),
            SlotLocation::Fp(offset) => match self.frame_pointer(info, regs) {
                Some(fp) => frame_addr(fp, offset),
                None => fail_fast!("frame-pointer relative GC slot at {:#x} without a frame pointer", regs.ip()),
            },
            SlotLocation::CallerSp(offset) => match self.return_slot(method, regs) {
                Ok((_, caller_sp)) => frame_addr(caller_sp, offset),
                Err(e) => fail_fast!("{e}"),
            },
        };
        Some(slot_ptr(addr))
    }

    fn clause(&self, method: &Method<'a>, index: usize) -> EhClause {
        let clause = method.clause(index);
        let method_start = self.method_start(method);
        EhClause {
            kind: match clause.kind {
                ClauseKind::Typed => EhClauseKind::Typed,
                ClauseKind::Fault => EhClauseKind::Fault,
                ClauseKind::Filter => EhClauseKind::Filter,
                ClauseKind::Unused => EhClauseKind::Unused,
            },
            try_start_offset: clause.try_range.start,
            try_end_offset: clause.try_range.end,
            handler_address: method_start + clause.handler as usize,
            filter_address: clause.filter.map(|f| method_start + f as usize),
            target_type: clause.type_index.map(|t| self.type_handles[t as usize]),
        }
    }
}

/// Architecture-level checks the table format itself cannot perform.
fn check_method(method: &Method<'_>, type_handles: usize) -> Result<()> {
    let frame_pointer = method.frame_layout() == FrameLayout::FramePointer;
    for saved in method.saved_regs() {
        if !arch::is_callee_saved(saved.reg) {
            bail!("register {} is not callee-saved", saved.reg);
        }
        if frame_pointer && saved.reg == arch::FP_REG {
            bail!("frame-pointer frames save the frame pointer implicitly");
        }
    }
    for i in 0..method.slot_count() {
        let slot = method.slot(i);
        if let SlotLocation::Register(reg) = slot.location {
            if usize::from(reg) >= arch::NUM_REGS || reg == arch::SP_REG {
                bail!("GC slot in invalid register {reg}");
            }
        }
        if matches!(slot.location, SlotLocation::Fp(_)) && !frame_pointer && !method.is_funclet() {
            bail!("frame-pointer relative GC slot {:?} in a frame without a frame pointer", slot.location);
        }
    }
    if let Some(parent) = method.parent() {
        if parent.frame_layout() != FrameLayout::FramePointer {
            bail!("funclet parent {} has no frame pointer", parent.index());
        }
    }
    for i in 0..method.clause_count() {
        if let Some(t) = method.clause(i).type_index {
            if t as usize >= type_handles {
                bail!("clause {i} refers to unknown type {t}");
            }
        }
    }
    if let Some(data) = method.associated_data() {
        AssociatedData::parse(data)?;
    }
    Ok(())
}

// SAFETY: every location handed out is computed from the frame layout
// recorded by the code generator for the frame's own method, relative to
// stack and frame pointers that the walk already trusts.
unsafe impl CodeManager for AotCodeManager<'_> {
    fn is_safe_point(&self, pc: usize) -> bool {
        match self.method_at(pc) {
            Some(method) => {
                let offset = self.method_offset(&method, pc);
                self.is_established(&method, pc) && method.find_safepoint(offset).is_ok()
            }
            None => false,
        }
    }

    fn find_method_info(&self, pc: usize, info: &mut MethodInfo) -> bool {
        let Some(method) = self.method_at(pc) else {
            return false;
        };
        log::trace!("{pc:#x} is in method {} at {:#x}", method.index(), self.method_start(&method));
        info.set(AotMethodInfo {
            owner: self.owner(),
            pc,
            method: method.index() as u32,
        });
        true
    }

    fn is_funclet(&self, info: &MethodInfo) -> bool {
        self.resolve(info).0.is_funclet()
    }

    fn frame_pointer(&self, info: &MethodInfo, regs: &RegisterSnapshot) -> Option<usize> {
        let (method, pc) = self.resolve(info);
        if method.is_funclet() {
            return regs.fp();
        }
        match method.frame_layout() {
            FrameLayout::FramePointer if self.is_established(&method, pc) => regs.fp(),
            _ => None,
        }
    }

    fn enum_gc_refs(
        &self,
        info: &MethodInfo,
        safe_point_pc: usize,
        regs: &RegisterSnapshot,
        reporter: &mut dyn GcRootReporter,
        is_active_frame: bool,
    ) {
        let (method, _) = self.resolve(info);
        let offset = self.method_offset(&method, safe_point_pc);
        let Ok(index) = method.find_safepoint(offset) else {
            fail_fast!("{safe_point_pc:#x} is not a safe point of method {}", method.index());
        };
        log::trace!(
            "enumerating roots of method {} at {safe_point_pc:#x} (active = {is_active_frame})",
            method.index()
        );

        let mut report = |slot: GcSlot| {
            let Some(ptr) = self.slot_address(info, &method, &slot, regs, is_active_frame) else {
                return;
            };
            let mut flags = GcRefFlags::empty();
            if slot.flags.contains(SlotFlags::INTERIOR) {
                flags |= GcRefFlags::INTERIOR;
            }
            if slot.flags.contains(SlotFlags::PINNED) {
                flags |= GcRefFlags::PINNED;
            }
            log::trace!("  root {:?} at {ptr:p} {flags:?}", slot.location);
            reporter.report(ptr, flags);
        };
        for slot in method.untracked_slots() {
            report(slot);
        }
        for slot in method.safepoint(index).live_slots() {
            report(method.slot(slot as usize));
        }
    }

    fn unwind_stack_frame(
        &self,
        info: &MethodInfo,
        flags: UnwindFlags,
        regs: &mut RegisterSnapshot,
    ) -> Result<Option<NonNull<TransitionFrame>>, UnwindError> {
        let (method, pc) = self.resolve(info);
        if !self.is_established(&method, pc) {
            return Err(UnwindError::NotUnwindable { pc });
        }

        let previous_transition = self
            .reverse_pinvoke_slot(&method, regs)
            // SAFETY: the slot is part of the method's own frame.
            .and_then(|slot| NonNull::new(unsafe { read_word(slot) } as *mut TransitionFrame));
        if flags.contains(UnwindFlags::STOP_ON_TRANSITION_FRAME) && previous_transition.is_some() {
            log::trace!("stopping at transition frame {previous_transition:?}");
            return Ok(previous_transition);
        }

        let base = self.frame_base(&method, regs)?;
        let (ra_slot, caller_sp) = self.return_slot(&method, regs)?;
        let caller_fp_slot = match method.frame_layout() {
            FrameLayout::FramePointer => Some(base + arch::NEXT_OLDER_FP_FROM_FP_OFFSET * WORD),
            FrameLayout::StackPointer { .. } => None,
        };

        if flags.contains(UnwindFlags::FAST) {
            regs.clear_all_but_fp();
        } else {
            regs.clear_scratch();
        }
        // SAFETY: all locations are slots of the frame being unwound.
        unsafe {
            if let Some(slot) = caller_fp_slot {
                regs.set_location(arch::FP_REG, Some(slot_ptr(slot)));
            }
            for saved in method.saved_regs() {
                if flags.contains(UnwindFlags::FAST) && saved.reg != arch::FP_REG {
                    continue;
                }
                regs.set_location(saved.reg, Some(slot_ptr(frame_addr(base, saved.offset))));
            }
            regs.set_ip(read_word(ra_slot), Some(slot_ptr(ra_slot)));
        }
        regs.set_sp(caller_sp);
        log::trace!(
            "unwound method {} at {pc:#x} to ip = {:#x}, sp = {caller_sp:#x}",
            method.index(),
            regs.ip()
        );
        Ok(previous_transition)
    }

    fn conservative_outgoing_args_bound(&self, info: &MethodInfo, regs: &RegisterSnapshot) -> usize {
        let (method, _) = self.resolve(info);
        if let Some(slot) = self.reverse_pinvoke_slot(&method, regs) {
            return slot;
        }
        // The return address is not an outgoing argument.
        match self.return_slot(&method, regs) {
            Ok((ra_slot, _)) => ra_slot,
            Err(e) => fail_fast!("{e}"),
        }
    }

    fn is_unwindable(&self, pc: usize) -> bool {
        match self.method_at(pc) {
            Some(method) => self.is_established(&method, pc),
            None => false,
        }
    }

    fn return_address_hijack_info(
        &self,
        info: &MethodInfo,
        regs: &RegisterSnapshot,
    ) -> Option<NonNull<usize>> {
        let (method, pc) = self.resolve(info);
        if method.is_funclet() || method.reverse_pinvoke_slot().is_some() || !self.is_established(&method, pc) {
            return None;
        }
        let (ra_slot, _) = self.return_slot(&method, regs).ok()?;
        Some(slot_ptr(ra_slot))
    }

    fn return_value_kind(&self, info: &MethodInfo, _regs: &RegisterSnapshot) -> ReturnValueKind {
        match self.resolve(info).0.return_kind() {
            MethodReturnKind::Scalar => ReturnValueKind::Scalar,
            MethodReturnKind::Object => ReturnValueKind::Object,
            MethodReturnKind::Byref => ReturnValueKind::Byref,
        }
    }

    fn remap_hardware_fault_to_safe_point(&self, info: &MethodInfo, pc: usize) -> usize {
        let (method, _) = self.resolve(info);
        let offset = self.method_offset(&method, pc);
        let next = match method.find_safepoint(offset) {
            Ok(_) => return pc,
            Err(next) => next,
        };
        let context = method.innermost_clause_covering(offset);
        let same_context = |i: usize| {
            let candidate = method.safepoint(i).offset();
            (method.innermost_clause_covering(candidate) == context).then_some(candidate)
        };
        let found = (0..next)
            .rev()
            .find_map(same_context)
            .or_else(|| (next..method.safepoint_count()).find_map(same_context));
        match found {
            Some(candidate) => {
                let remapped = self.method_start(&method) + candidate as usize;
                log::trace!("remapped fault at {pc:#x} to safe point {remapped:#x}");
                remapped
            }
            None => pc,
        }
    }

    fn eh_enum_init(&self, info: &MethodInfo, state: &mut EhEnumState) -> Option<usize> {
        let (method, _) = self.resolve(info);
        if method.clause_count() == 0 {
            return None;
        }
        state.set(AotEhState {
            owner: self.owner(),
            method: method.index() as u32,
            last: u32::MAX,
        });
        Some(self.method_start(&method))
    }

    fn eh_enum_next(&self, state: &mut EhEnumState) -> Option<EhClause> {
        let cursor = state.get_mut::<AotEhState>();
        if cursor.owner != self.owner() {
            fail_fast!("EhEnumState was initialized by another code manager");
        }
        let method = self.info.method(cursor.method as usize);

        // Innermost first: ascending try end, then descending try start, then
        // storage order. Properly nested ranges make this a total order that
        // matches lexical nesting.
        let key = |i: usize| {
            let clause = method.clause(i);
            (clause.try_range.end, u32::MAX - clause.try_range.start, i)
        };
        let last = (cursor.last != u32::MAX).then(|| key(cursor.last as usize));
        let next = (0..method.clause_count())
            .map(key)
            .filter(|k| last.is_none_or(|last| *k > last))
            .min()?;
        cursor.last = next.2 as u32;
        Some(self.clause(&method, next.2))
    }

    fn method_start_address(&self, info: &MethodInfo) -> usize {
        self.method_start(&self.resolve(info).0)
    }

    fn os_module_handle(&self) -> usize {
        self.os_module_handle
    }

    fn classlib_function(&self, id: ClasslibFunctionId) -> Option<ClasslibFunction> {
        self.classlib.get(id)
    }

    fn associated_data(&self, pc: usize) -> Option<AssociatedData<'_>> {
        let data = self.method_at(pc)?.associated_data()?;
        AssociatedData::parse(data).ok()
    }
}
