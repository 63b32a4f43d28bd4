//! Registry of the code managers of every loaded code region.

use crate::code_manager::CodeManager;
use crate::scratch::MethodInfo;
use core::fmt;
use core::ops::Range;
use std::sync::{Mutex, PoisonError};

/// Errors from [`CodeManagerRegistry::register`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The range is empty.
    #[error("cannot register empty code range {0:#x?}")]
    EmptyRange(Range<usize>),
    /// The range overlaps one registered earlier.
    #[error("code range {new:#x?} overlaps registered range {existing:#x?}")]
    Overlap {
        /// The rejected range.
        new: Range<usize>,
        /// The registered range it overlaps.
        existing: Range<usize>,
    },
}

struct RegisteredCode<'a> {
    range: Range<usize>,
    manager: &'a dyn CodeManager,
}

/// Append-only map from code address ranges to the managers that own them.
///
/// Lookups never lock and can run concurrently with registration, from fault
/// handlers and while other threads are suspended. Registrations serialize
/// among themselves so that overlap checks see every earlier range.
pub struct CodeManagerRegistry<'a> {
    code: boxcar::Vec<RegisteredCode<'a>>,
    register_lock: Mutex<()>,
}

impl<'a> CodeManagerRegistry<'a> {
    /// An empty registry.
    pub fn new() -> CodeManagerRegistry<'a> {
        CodeManagerRegistry {
            code: boxcar::Vec::new(),
            register_lock: Mutex::new(()),
        }
    }

    /// Register `manager` as the owner of `range`, returning its
    /// registration index.
    pub fn register(
        &self,
        range: Range<usize>,
        manager: &'a dyn CodeManager,
    ) -> Result<usize, RegistryError> {
        if range.is_empty() {
            return Err(RegistryError::EmptyRange(range));
        }
        let _guard = self.register_lock.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, existing) in self.code.iter() {
            if range.start < existing.range.end && existing.range.start < range.end {
                return Err(RegistryError::Overlap {
                    new: range,
                    existing: existing.range.clone(),
                });
            }
        }
        log::debug!("registering code manager for {range:#x?}");
        Ok(self.code.push(RegisteredCode { range, manager }))
    }

    /// Number of registered code regions.
    pub fn len(&self) -> usize {
        self.code.count()
    }

    /// Is the registry empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The manager whose registered range contains `pc`.
    pub fn lookup(&self, pc: usize) -> Option<&'a dyn CodeManager> {
        self.code
            .iter()
            .find(|(_, code)| code.range.contains(&pc))
            .map(|(_, code)| code.manager)
    }

    /// Resolve `pc` with the managers registered for it, in registration
    /// order, returning the one that populated `info`.
    pub fn find_method_info(&self, pc: usize, info: &mut MethodInfo) -> Option<&'a dyn CodeManager> {
        for (_, code) in self.code.iter() {
            if code.range.contains(&pc) && code.manager.find_method_info(pc, info) {
                log::trace!("resolved {pc:#x} in code region {:#x?}", code.range);
                return Some(code.manager);
            }
        }
        log::trace!("no code manager resolves {pc:#x}");
        None
    }
}

impl Default for CodeManagerRegistry<'_> {
    fn default() -> Self {
        CodeManagerRegistry::new()
    }
}

impl fmt::Debug for CodeManagerRegistry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.code.iter().map(|(_, code)| code.range.clone()))
            .finish()
    }
}
