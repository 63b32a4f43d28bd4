//! Two-pass exception dispatch over the managed frames of a thread.
//!
//! The first pass walks from the throw site towards older frames looking for
//! a clause that accepts the exception: a typed clause whose target type
//! matches, or a filter clause whose filter returns true. Nothing is unwound
//! during the first pass. The second pass walks the same frames again up to
//! the catching frame and runs every fault clause on the way, innermost
//! first, before control transfers to the handler.

use crate::code_manager::{CodeManager, EhClause, EhClauseKind};
use crate::registry::CodeManagerRegistry;
use crate::regs::RegisterSnapshot;
use crate::scratch::{EhEnumState, MethodInfo};
use crate::stackwalk::{BoundaryPolicy, StackFrameIterator, WalkConfig};
use core::ops::ControlFlow;

/// Decides whether a clause accepts the exception being dispatched.
pub trait ExceptionMatcher {
    /// Is the exception an instance of the type with handle `target_type`?
    fn matches_type(&mut self, target_type: usize) -> bool;

    /// Run the filter of `clause` in `frame` and return its verdict.
    ///
    /// Called at most once per clause and dispatch.
    fn run_filter(&mut self, clause: &EhClause, frame: &DispatchFrame<'_>) -> bool;
}

/// A managed frame visited during dispatch.
pub struct DispatchFrame<'a> {
    manager: &'a dyn CodeManager,
    info: &'a MethodInfo,
    regs: &'a RegisterSnapshot,
    index: usize,
    offset: u32,
}

impl<'a> DispatchFrame<'a> {
    /// The code manager owning the frame.
    pub fn code_manager(&self) -> &'a dyn CodeManager {
        self.manager
    }

    /// The frame's method metadata.
    pub fn method_info(&self) -> &'a MethodInfo {
        self.info
    }

    /// The frame's register state.
    pub fn regs(&self) -> &'a RegisterSnapshot {
        self.regs
    }

    /// Position of the frame in the walk, starting at 1.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Method-relative offset used to decide which clauses cover the frame.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// The canonical frame pointer of the frame.
    pub fn frame_pointer(&self) -> Option<usize> {
        self.manager.frame_pointer(self.info, self.regs)
    }
}

/// Where control resumes once an exception has been caught.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handler {
    /// Address of the handler.
    pub pc: usize,
    /// Stack pointer of the catching frame.
    pub sp: usize,
    /// Canonical frame pointer of the catching frame, if it has one.
    pub fp: Option<usize>,
    /// The clause that caught the exception.
    pub clause: EhClause,
    /// Position of the catching frame in the walk, starting at 1.
    pub frame_index: usize,
}

/// Visit the clauses covering each managed frame of the walk, innermost
/// first, until `f` breaks.
fn visit_covering_clauses<R>(
    mut iter: StackFrameIterator<'_, '_>,
    mut f: impl FnMut(&EhClause, &DispatchFrame<'_>) -> ControlFlow<R>,
) -> Option<R> {
    let mut state = EhEnumState::new();
    while iter.is_valid() {
        let Some(manager) = iter.code_manager() else {
            break;
        };
        let info = iter.method_info();
        if let Some(method_start) = manager.eh_enum_init(info, &mut state) {
            let offset = u32::try_from(iter.lookup_pc() - method_start)
                .unwrap_or_else(|_| fail_fast!("frame at {:#x} is outside its method", iter.regs().ip()));
            let frame = DispatchFrame {
                manager,
                info,
                regs: iter.regs(),
                index: iter.frame_count(),
                offset,
            };
            while let Some(clause) = manager.eh_enum_next(&mut state) {
                if !clause.covers(offset) {
                    continue;
                }
                log::trace!("frame {} at offset {offset:#x}: {clause:?}", frame.index);
                if let ControlFlow::Break(r) = f(&clause, &frame) {
                    return Some(r);
                }
            }
            state.clear();
        }
        iter.next();
    }
    None
}

fn dispatch_config(config: &WalkConfig) -> WalkConfig {
    let mut config = config.clone();
    config.boundary_policy(BoundaryPolicy::Resume);
    config
}

impl Handler {
    /// First pass: find the clause that will catch the exception.
    ///
    /// Returns `None` if the exception is unhandled.
    ///
    /// # Safety
    ///
    /// Same as [`StackFrameIterator::new`].
    pub unsafe fn find(
        registry: &CodeManagerRegistry<'_>,
        regs: RegisterSnapshot,
        config: &WalkConfig,
        matcher: &mut dyn ExceptionMatcher,
    ) -> Option<Handler> {
        let config = dispatch_config(config);
        // SAFETY: forwarded to our caller.
        let iter = unsafe { StackFrameIterator::new(registry, regs, &config) };
        let handler = visit_covering_clauses(iter, |clause, frame| {
            let caught = match clause.kind {
                EhClauseKind::Typed => match clause.target_type {
                    Some(target_type) => matcher.matches_type(target_type),
                    None => false,
                },
                EhClauseKind::Filter => matcher.run_filter(clause, frame),
                EhClauseKind::Fault | EhClauseKind::Unused => false,
            };
            if !caught {
                return ControlFlow::Continue(());
            }
            ControlFlow::Break(Handler {
                pc: clause.handler_address,
                sp: frame.regs().sp(),
                fp: frame.frame_pointer(),
                clause: *clause,
                frame_index: frame.index(),
            })
        });
        match &handler {
            Some(h) => log::debug!("exception caught by {:?} clause in frame {}", h.clause.kind, h.frame_index),
            None => log::debug!("exception is unhandled"),
        }
        handler
    }
}

/// Second pass: call `f` for every fault clause between the throw site and
/// `handler`, innermost first.
///
/// In the catching frame only the fault clauses nested inside the catching
/// clause run. With no handler, every fault clause on the stack runs.
///
/// # Safety
///
/// Same as [`StackFrameIterator::new`]. `regs` must be the snapshot the
/// first pass started from.
pub unsafe fn run_fault_clauses(
    registry: &CodeManagerRegistry<'_>,
    regs: RegisterSnapshot,
    config: &WalkConfig,
    handler: Option<&Handler>,
    mut f: impl FnMut(&EhClause, &DispatchFrame<'_>),
) {
    let config = dispatch_config(config);
    // SAFETY: forwarded to our caller.
    let iter = unsafe { StackFrameIterator::new(registry, regs, &config) };
    visit_covering_clauses(iter, |clause, frame| {
        if let Some(handler) = handler {
            if frame.index() > handler.frame_index {
                return ControlFlow::Break(());
            }
            if frame.index() == handler.frame_index && *clause == handler.clause {
                return ControlFlow::Break(());
            }
        }
        if clause.kind == EhClauseKind::Fault {
            f(clause, frame);
        }
        ControlFlow::Continue(())
    });
}
