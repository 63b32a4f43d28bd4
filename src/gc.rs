//! Reporting the stack roots of a suspended thread.

use crate::code_manager::GcRootReporter;
use crate::registry::CodeManagerRegistry;
use crate::regs::RegisterSnapshot;
use crate::stackwalk::{BoundaryPolicy, StackFrameIterator, WalkConfig, WalkState};
use crate::transition::TransitionFrame;
use core::ops::Range;
use core::ptr::NonNull;

/// Report every GC root of the thread whose active frame is `regs`.
///
/// The thread must be stopped at a safe point of its active frame; ancestor
/// frames are suspended at the return address of a call, which is always a
/// safe point. Walks cross native code through transition frames regardless
/// of `config`'s boundary policy, and the return value preserved in each
/// transition frame is reported as well.
///
/// Returns the number of managed frames visited.
///
/// # Safety
///
/// Same as [`StackFrameIterator::new`].
pub unsafe fn enumerate_stack_roots(
    registry: &CodeManagerRegistry<'_>,
    regs: RegisterSnapshot,
    config: &WalkConfig,
    reporter: &mut dyn GcRootReporter,
) -> usize {
    let mut config = config.clone();
    config.boundary_policy(BoundaryPolicy::Stop);
    // SAFETY: forwarded to our caller.
    let iter = unsafe { StackFrameIterator::new(registry, regs, &config) };
    if iter.is_active_frame() && !iter.code_manager().is_some_and(|m| m.is_safe_point(iter.regs().ip())) {
        fail_fast!(
            "cannot enumerate roots of a thread stopped at {:#x}, which is not a safe point",
            iter.regs().ip()
        );
    }
    report_frames(iter, reporter)
}

/// Report every GC root of a thread parked in native code at `frame`,
/// starting with the return value the transition frame preserves.
///
/// Returns the number of managed frames visited.
///
/// # Safety
///
/// Same as [`StackFrameIterator::from_transition_frame`].
pub unsafe fn enumerate_roots_from_transition_frame(
    registry: &CodeManagerRegistry<'_>,
    frame: NonNull<TransitionFrame>,
    config: &WalkConfig,
    reporter: &mut dyn GcRootReporter,
) -> usize {
    let mut config = config.clone();
    config.boundary_policy(BoundaryPolicy::Stop);
    // SAFETY: forwarded to our caller.
    unsafe { TransitionFrame::enum_return_value_root(frame, reporter) };
    // SAFETY: forwarded to our caller.
    let iter = unsafe { StackFrameIterator::from_transition_frame(registry, frame, &config) };
    report_frames(iter, reporter)
}

fn report_frames(mut iter: StackFrameIterator<'_, '_>, reporter: &mut dyn GcRootReporter) -> usize {
    loop {
        match iter.state() {
            WalkState::AtActiveFrame | WalkState::AtAncestorFrame => {
                let Some(manager) = iter.code_manager() else {
                    break;
                };
                let pc = iter.regs().ip();
                manager.enum_gc_refs(
                    iter.method_info(),
                    pc,
                    iter.regs(),
                    reporter,
                    iter.is_active_frame(),
                );
                iter.next();
            }
            WalkState::CrossedNativeBoundary => {
                if let Some(frame) = iter.transition_frame() {
                    // SAFETY: the frame was handed out by a code manager of
                    // the walked thread, which stays suspended.
                    unsafe { TransitionFrame::enum_return_value_root(frame, reporter) };
                }
                iter.resume();
            }
            WalkState::ResolvingFrame | WalkState::Exhausted => break,
        }
    }
    log::debug!("enumerated stack roots of {} frames", iter.frame_count());
    iter.frame_count()
}

/// Address range of the current frame's outgoing argument area, which must
/// be scanned conservatively while the frame is in the middle of a call.
///
/// Empty when the walk is not at a managed frame.
pub fn conservative_scan_range(iter: &StackFrameIterator<'_, '_>) -> Range<usize> {
    let sp = iter.regs().sp();
    match iter.code_manager() {
        Some(manager) => sp..manager.conservative_outgoing_args_bound(iter.method_info(), iter.regs()),
        None => sp..sp,
    }
}
