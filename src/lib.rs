//! Backend-independent stack walking for managed code.
//!
//! A managed runtime may host machine code produced by several code
//! generators at once. Each code region registers a [`CodeManager`] that
//! knows how to interpret the frames of its own methods: resolve a program
//! counter to per-method metadata, unwind one frame, report the GC roots live
//! at a safe point and enumerate exception-handling clauses.
//!
//! Everything above that interface is generic: the [`StackFrameIterator`]
//! drives a walk across all registered code, and the GC, exception,
//! hijacking and fault drivers in this crate are clients of that walk. All
//! per-frame operations are allocation free and take no locks, so they can
//! run inside a fault handler or against a suspended thread.
//!
//! [`AotCodeManager`] is a table-driven implementation of the interface over
//! the section format defined in `framewalk-environ`.

#![deny(missing_docs)]

/// Log and panic on a violated runtime invariant.
macro_rules! fail_fast {
    ($($arg:tt)*) => {
        $crate::fail_fast(format_args!($($arg)*))
    };
}

mod aot;
mod arch;
mod associated;
mod classlib;
mod code_manager;
mod fault;
mod gc;
mod hijack;
mod registry;
mod regs;
mod return_kind;
mod scratch;
mod stackwalk;
mod throw;
mod transition;

pub use crate::aot::*;
pub use crate::arch::{CALLEE_SAVED_REGS, FP_REG, NUM_REGS, RETURN_REG, SP_REG, is_callee_saved};
pub use crate::associated::*;
pub use crate::classlib::*;
pub use crate::code_manager::*;
pub use crate::fault::*;
pub use crate::gc::*;
pub use crate::hijack::*;
pub use crate::registry::*;
pub use crate::regs::*;
pub use crate::return_kind::*;
pub use crate::scratch::*;
pub use crate::stackwalk::*;
pub use crate::throw::*;
pub use crate::transition::*;

pub use framewalk_environ as environ;

#[cold]
#[track_caller]
fn fail_fast(args: core::fmt::Arguments<'_>) -> ! {
    log::error!("fatal runtime error: {args}");
    panic!("fatal runtime error: {args}")
}
