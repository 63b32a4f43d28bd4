//! Generic stack walking across every registered code manager.
//!
//! A walk starts either from the register state of a thread's active frame
//! or from a transition frame a thread left when it called into native
//! code. Each step resolves the current instruction pointer with the
//! registry, lets the caller inspect the frame, and asks the owning code
//! manager to unwind to the caller:
//!
//! ```plain
//!            resolve fails
//! Resolving ------------------------------------------> Exhausted
//!     |                                                     ^
//!     | resolve succeeds                                    |
//!     v            unwind                                   |
//! AtActiveFrame ---------> Resolving --> AtAncestorFrame ---+
//!     |                                   |      ^    |
//!     |                                   +------+    |
//!     | unwind returns a transition frame             |
//!     +----------------------------------> CrossedNativeBoundary
//!                                                     |
//!                                  BoundaryPolicy::Resume: reload from the
//!                                  transition frame and resolve again
//! ```
//!
//! Native frames between a transition frame and the managed code that
//! entered native code are never interpreted.

use crate::code_manager::{CodeManager, UnwindError, UnwindFlags};
use crate::registry::CodeManagerRegistry;
use crate::regs::RegisterSnapshot;
use crate::scratch::MethodInfo;
use crate::transition::TransitionFrame;
use core::ops::ControlFlow;
use core::ptr::NonNull;

/// What a walk does when it reaches a transition frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BoundaryPolicy {
    /// Stop in [`WalkState::CrossedNativeBoundary`].
    #[default]
    Stop,
    /// Skip the native frames and continue with the managed frames that
    /// called into native code.
    Resume,
}

/// Configuration of a stack walk.
///
/// This uses the builder pattern: settings are changed through `&mut self`
/// methods which can be chained.
#[derive(Clone, Debug)]
pub struct WalkConfig {
    max_frames: usize,
    boundary_policy: BoundaryPolicy,
    stop_on_transition_frames: bool,
    check_stack_order: bool,
}

impl WalkConfig {
    /// The default configuration.
    pub fn new() -> WalkConfig {
        WalkConfig {
            max_frames: 1 << 16,
            boundary_policy: BoundaryPolicy::Stop,
            stop_on_transition_frames: true,
            check_stack_order: true,
        }
    }

    /// Maximum number of managed frames a walk may visit before it is
    /// considered corrupt and fails fast.
    ///
    /// Defaults to 65536.
    pub fn max_frames(&mut self, frames: usize) -> &mut Self {
        self.max_frames = frames;
        self
    }

    /// What to do at managed/native boundaries.
    ///
    /// Defaults to [`BoundaryPolicy::Stop`].
    pub fn boundary_policy(&mut self, policy: BoundaryPolicy) -> &mut Self {
        self.boundary_policy = policy;
        self
    }

    /// Whether methods entered from native code hand back their saved
    /// transition frame instead of being unwound into native code.
    ///
    /// Defaults to `true`.
    pub fn stop_on_transition_frames(&mut self, enable: bool) -> &mut Self {
        self.stop_on_transition_frames = enable;
        self
    }

    /// Whether to fail fast when unwinding does not move the stack pointer
    /// towards older frames.
    ///
    /// Defaults to `true`.
    pub fn check_stack_order(&mut self, enable: bool) -> &mut Self {
        self.check_stack_order = enable;
        self
    }

    fn unwind_flags(&self) -> UnwindFlags {
        if self.stop_on_transition_frames {
            UnwindFlags::STOP_ON_TRANSITION_FRAME
        } else {
            UnwindFlags::empty()
        }
    }
}

impl Default for WalkConfig {
    fn default() -> WalkConfig {
        WalkConfig::new()
    }
}

/// Where a walk currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WalkState {
    /// Resolving the instruction pointer to a method.
    ResolvingFrame,
    /// At the innermost frame of the walk.
    AtActiveFrame,
    /// At a frame suspended in a call.
    AtAncestorFrame,
    /// At a transition frame into native code.
    CrossedNativeBoundary,
    /// No further managed frame.
    Exhausted,
}

/// A walk over the managed frames of one thread.
///
/// The iterator owns the walk's [`RegisterSnapshot`] and [`MethodInfo`];
/// neither is ever shared with another walk.
pub struct StackFrameIterator<'r, 'a> {
    registry: &'r CodeManagerRegistry<'a>,
    config: WalkConfig,
    flags: UnwindFlags,
    regs: RegisterSnapshot,
    info: MethodInfo,
    manager: Option<&'a dyn CodeManager>,
    state: WalkState,
    next_is_active: bool,
    transition: Option<NonNull<TransitionFrame>>,
    frames: usize,
}

impl<'r, 'a> StackFrameIterator<'r, 'a> {
    /// Start a walk at the active frame described by `regs`.
    ///
    /// # Safety
    ///
    /// `regs` must describe a frame of a thread that is suspended (or is the
    /// current thread, below this call) and all its register locations must
    /// stay valid for the duration of the walk. Walking a bogus snapshot
    /// reads arbitrary memory.
    pub unsafe fn new(
        registry: &'r CodeManagerRegistry<'a>,
        regs: RegisterSnapshot,
        config: &WalkConfig,
    ) -> StackFrameIterator<'r, 'a> {
        let mut iter = StackFrameIterator {
            registry,
            config: config.clone(),
            flags: config.unwind_flags(),
            regs,
            info: MethodInfo::new(),
            manager: None,
            state: WalkState::ResolvingFrame,
            next_is_active: true,
            transition: None,
            frames: 0,
        };
        log::trace!("=== Starting stack walk at ip = {:#x}, sp = {:#x} ===", iter.regs.ip(), iter.regs.sp());
        iter.resolve();
        iter
    }

    /// Start a walk at the managed frame that made the transition `frame`.
    ///
    /// Every frame of such a walk is an ancestor frame.
    ///
    /// # Safety
    ///
    /// `frame` must point to a live transition frame of a thread that stays
    /// parked in native code for the duration of the walk.
    pub unsafe fn from_transition_frame(
        registry: &'r CodeManagerRegistry<'a>,
        frame: NonNull<TransitionFrame>,
        config: &WalkConfig,
    ) -> StackFrameIterator<'r, 'a> {
        // SAFETY: forwarded to our caller.
        let regs = unsafe { TransitionFrame::load_snapshot(frame) };
        // SAFETY: the snapshot points into the live transition frame.
        let mut iter = unsafe { StackFrameIterator::new_ancestor(registry, regs, config) };
        iter.transition = Some(frame);
        iter
    }

    /// Start a walk whose first frame is already suspended in a call.
    unsafe fn new_ancestor(
        registry: &'r CodeManagerRegistry<'a>,
        regs: RegisterSnapshot,
        config: &WalkConfig,
    ) -> StackFrameIterator<'r, 'a> {
        let mut iter = StackFrameIterator {
            registry,
            config: config.clone(),
            flags: config.unwind_flags(),
            regs,
            info: MethodInfo::new(),
            manager: None,
            state: WalkState::ResolvingFrame,
            next_is_active: false,
            transition: None,
            frames: 0,
        };
        iter.resolve();
        iter
    }

    pub(crate) fn set_unwind_flags(&mut self, flags: UnwindFlags) {
        self.flags |= flags;
    }

    fn resolve(&mut self) {
        debug_assert_eq!(self.state, WalkState::ResolvingFrame);
        let pc = self.regs.ip();
        self.manager = self.registry.find_method_info(pc, &mut self.info);
        self.state = match self.manager {
            Some(_) if self.next_is_active => WalkState::AtActiveFrame,
            Some(_) => WalkState::AtAncestorFrame,
            None => {
                self.info.clear();
                log::trace!("=== Stack walk exhausted at {pc:#x} ===");
                WalkState::Exhausted
            }
        };
        self.next_is_active = false;
        if self.manager.is_some() {
            self.frames += 1;
            if self.frames > self.config.max_frames {
                fail_fast!(
                    "stack walk visited more than {} frames; the stack is corrupt",
                    self.config.max_frames
                );
            }
            log::trace!("--- Frame {}: {:?} ---", self.frames, self.state);
            log::trace!("pc = {pc:#x}");
            log::trace!("sp = {:#x}", self.regs.sp());
        }
    }

    /// The current state.
    pub fn state(&self) -> WalkState {
        self.state
    }

    /// Is the walk at a managed frame?
    pub fn is_valid(&self) -> bool {
        matches!(self.state, WalkState::AtActiveFrame | WalkState::AtAncestorFrame)
    }

    /// Is the current frame the innermost frame of the walk?
    pub fn is_active_frame(&self) -> bool {
        self.state == WalkState::AtActiveFrame
    }

    /// Register state of the current frame.
    pub fn regs(&self) -> &RegisterSnapshot {
        &self.regs
    }

    /// Metadata of the current frame's method.
    pub fn method_info(&self) -> &MethodInfo {
        &self.info
    }

    /// The code manager owning the current frame.
    pub fn code_manager(&self) -> Option<&'a dyn CodeManager> {
        if self.is_valid() { self.manager } else { None }
    }

    /// The transition frame the walk stopped at, or started from.
    pub fn transition_frame(&self) -> Option<NonNull<TransitionFrame>> {
        self.transition
    }

    /// Number of managed frames visited so far.
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    /// The instruction pointer to look up per-frame data with: the
    /// instruction pointer itself for the active frame, and the return
    /// address minus one for ancestors, so that a call ending a region is
    /// still inside it.
    pub fn lookup_pc(&self) -> usize {
        if self.is_active_frame() {
            self.regs.ip()
        } else {
            self.regs.ip() - 1
        }
    }

    /// Advance to the next managed frame.
    ///
    /// Returns `true` if the walk is now at a managed frame.
    pub fn next(&mut self) -> bool {
        match self.state {
            WalkState::AtActiveFrame | WalkState::AtAncestorFrame => self.unwind(),
            WalkState::CrossedNativeBoundary => {
                if !self.resume() {
                    return false;
                }
            }
            WalkState::ResolvingFrame | WalkState::Exhausted => return false,
        }
        self.is_valid()
    }

    fn unwind(&mut self) {
        let Some(manager) = self.manager else {
            fail_fast!("stack walk has no code manager in state {:?}", self.state);
        };
        let sp = self.regs.sp();
        let transition = match manager.unwind_stack_frame(&self.info, self.flags, &mut self.regs) {
            Ok(transition) => transition,
            Err(e @ UnwindError::NotUnwindable { .. }) => {
                fail_fast!("stack walk reached a frame that cannot be unwound: {e}")
            }
            Err(e) => fail_fast!("failed to unwind frame at {:#x}: {e}", self.regs.ip()),
        };

        if let Some(frame) = transition {
            log::debug!("stack walk crossed into native code at transition frame {frame:p}");
            self.transition = Some(frame);
            self.state = WalkState::CrossedNativeBoundary;
            if self.config.boundary_policy == BoundaryPolicy::Resume {
                self.resume();
            }
            return;
        }

        if self.config.check_stack_order {
            // The stack grows down, so the caller's stack pointer must be
            // greater than the callee's.
            if self.regs.sp() <= sp {
                fail_fast!(
                    "unwinding moved the stack pointer from {sp:#x} to {:#x}; the stack is corrupt",
                    self.regs.sp()
                );
            }
        }
        self.state = WalkState::ResolvingFrame;
        self.resolve();
    }

    /// Continue a walk stopped at a transition frame with the managed frame
    /// that entered native code.
    ///
    /// Returns `false` if the walk is not at a transition frame.
    pub fn resume(&mut self) -> bool {
        if self.state != WalkState::CrossedNativeBoundary {
            return false;
        }
        let Some(frame) = self.transition else {
            return false;
        };
        // SAFETY: transition frames handed out by code managers belong to
        // the walked thread, which stays suspended during the walk.
        self.regs = unsafe { TransitionFrame::load_snapshot(frame) };
        self.next_is_active = false;
        self.state = WalkState::ResolvingFrame;
        self.resolve();
        true
    }
}

/// A frame visited by [`visit_frames`].
#[derive(Debug)]
pub struct Frame {
    /// The program counter; a return address for all but the active frame.
    pub pc: usize,
    /// The stack pointer.
    pub sp: usize,
    /// The canonical frame pointer, if the method has one.
    pub fp: Option<usize>,
    /// Address of the first instruction of the method.
    pub method_start: usize,
    /// Is the method a funclet?
    pub is_funclet: bool,
}

/// Visit every managed frame reachable from `regs`, crossing into older
/// activations through transition frames, for diagnostic backtraces.
///
/// Frames are unwound with [`UnwindFlags::FAST`], so only the instruction,
/// stack and frame pointers are reconstructed.
///
/// # Safety
///
/// Same as [`StackFrameIterator::new`].
pub unsafe fn visit_frames<R>(
    registry: &CodeManagerRegistry<'_>,
    regs: RegisterSnapshot,
    mut f: impl FnMut(Frame) -> ControlFlow<R>,
) -> ControlFlow<R> {
    let mut config = WalkConfig::new();
    config.boundary_policy(BoundaryPolicy::Resume);
    // SAFETY: forwarded to our caller.
    let mut iter = unsafe { StackFrameIterator::new(registry, regs, &config) };
    iter.set_unwind_flags(UnwindFlags::FAST);
    while iter.is_valid() {
        let Some(manager) = iter.code_manager() else {
            break;
        };
        let info = iter.method_info();
        f(Frame {
            pc: iter.regs().ip(),
            sp: iter.regs().sp(),
            fp: manager.frame_pointer(info, iter.regs()),
            method_start: manager.method_start_address(info),
            is_funclet: manager.is_funclet(info),
        })?;
        iter.next();
    }
    ControlFlow::Continue(())
}
