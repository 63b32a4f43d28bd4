//! Converting hardware faults in managed code into managed exceptions.

use crate::classlib::{ClasslibFunction, ClasslibFunctionId};
use crate::registry::CodeManagerRegistry;
use crate::scratch::MethodInfo;

/// A hardware fault that cannot become a managed exception.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnrecoverableFault {
    /// The faulting instruction is not managed code.
    #[error("hardware fault at {pc:#x} is outside managed code")]
    OutsideManagedCode {
        /// The faulting program counter.
        pc: usize,
    },
    /// No safe point with the same exception-handling context is near the
    /// faulting instruction.
    #[error("hardware fault at {pc:#x} cannot be mapped to a safe point")]
    NoSafePoint {
        /// The faulting program counter.
        pc: usize,
    },
}

/// A hardware fault in managed code, ready to be raised as an exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManagedFault {
    /// The faulting program counter.
    pub pc: usize,
    /// The safe point the exception is raised at.
    pub remapped_pc: usize,
    /// Start address of the faulting method.
    pub method_start: usize,
    /// The runtime-library function creating the exception object.
    pub exception_factory: ClasslibFunction,
}

/// Map a hardware fault at `pc` to the safe point an exception is raised
/// from.
///
/// Fails fast if the owning code manager's runtime library did not register
/// [`ClasslibFunctionId::GetRuntimeException`].
pub fn remap_hardware_fault(
    registry: &CodeManagerRegistry<'_>,
    pc: usize,
) -> Result<ManagedFault, UnrecoverableFault> {
    let mut info = MethodInfo::new();
    let manager = registry
        .find_method_info(pc, &mut info)
        .ok_or(UnrecoverableFault::OutsideManagedCode { pc })?;
    let remapped_pc = manager.remap_hardware_fault_to_safe_point(&info, pc);
    if !manager.is_safe_point(remapped_pc) {
        log::debug!("no safe point for hardware fault at {pc:#x}");
        return Err(UnrecoverableFault::NoSafePoint { pc });
    }
    let exception_factory = match manager.classlib_function(ClasslibFunctionId::GetRuntimeException) {
        Some(f) => f,
        None => fail_fast!(
            "runtime library did not register `{}`",
            ClasslibFunctionId::GetRuntimeException.name()
        ),
    };
    log::debug!("hardware fault at {pc:#x} raised at safe point {remapped_pc:#x}");
    Ok(ManagedFault {
        pc,
        remapped_pc,
        method_start: manager.method_start_address(&info),
        exception_factory,
    })
}
