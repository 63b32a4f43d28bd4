//! Runtime-library callbacks.
//!
//! The walker never calls into a particular runtime library directly. The
//! hosting runtime registers one function per well-known operation at
//! startup, and code managers hand these out through
//! [`CodeManager::classlib_function`](crate::CodeManager::classlib_function).

use core::fmt;
use core::num::NonZeroUsize;

/// Helper macro to iterate over all classlib functions and their stable ids.
///
/// Mandatory functions are marked with `required`.
macro_rules! foreach_classlib_function {
    ($mac:ident) => {
        $mac! {
            /// Creates the exception object for a runtime failure.
            GetRuntimeException = 0, required;
            /// Terminates the process.
            FailFast = 1, required;
            /// Called when an exception escapes every frame.
            UnhandledExceptionHandler = 2, optional;
            /// Appends a frame to an exception's stack trace.
            AppendExceptionStackFrame = 3, optional;
            /// Returns the type handle of `System.Array`.
            GetSystemArrayEEType = 5, optional;
            /// Notifies the first pass of a dispatch.
            OnFirstChanceException = 6, optional;
            /// Notifies an unhandled exception.
            OnUnhandledException = 7, optional;
            /// Objective-C interop: tagged memory lookup.
            ObjectiveCMarshalTryGetTaggedMemory = 8, optional;
            /// Objective-C interop: tracked-reference callback.
            ObjectiveCMarshalGetIsTrackedReferenceCallback = 9, optional;
            /// Objective-C interop: finalizer-queue callback.
            ObjectiveCMarshalGetOnEnteredFinalizerQueueCallback = 10, optional;
            /// Objective-C interop: unhandled exception propagation handler.
            ObjectiveCMarshalGetUnhandledExceptionPropagationHandler = 11, optional;
        }
    };
}

macro_rules! declare_ids {
    ($($(#[$attr:meta])* $name:ident = $id:literal, $req:ident;)*) => {
        /// Well-known runtime-library operations, with stable numeric ids.
        ///
        /// Id 4 is unused.
        #[repr(u32)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum ClasslibFunctionId {
            $($(#[$attr])* $name = $id,)*
        }

        impl ClasslibFunctionId {
            /// Every id, in ascending order.
            pub const ALL: &'static [ClasslibFunctionId] = &[$(ClasslibFunctionId::$name,)*];

            /// The id with the given numeric value.
            pub fn from_u32(id: u32) -> Option<ClasslibFunctionId> {
                match id {
                    $($id => Some(ClasslibFunctionId::$name),)*
                    _ => None,
                }
            }

            /// The function's name.
            pub fn name(self) -> &'static str {
                match self {
                    $(ClasslibFunctionId::$name => stringify!($name),)*
                }
            }

            /// Must the runtime library register this function?
            pub fn is_required(self) -> bool {
                match self {
                    $(ClasslibFunctionId::$name => declare_ids!(@required $req),)*
                }
            }
        }
    };

    (@required required) => (true);
    (@required optional) => (false);
}

foreach_classlib_function!(declare_ids);

const TABLE_LEN: usize = 12;

/// Address of a runtime-library function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClasslibFunction(NonZeroUsize);

impl ClasslibFunction {
    /// Wrap a non-null function address.
    pub fn new(addr: usize) -> Option<ClasslibFunction> {
        NonZeroUsize::new(addr).map(ClasslibFunction)
    }

    /// The function address.
    pub fn addr(self) -> usize {
        self.0.get()
    }
}

/// The callback table of one runtime library.
///
/// Built once at initialization and read-only afterwards; share it between
/// code managers with an `Arc`.
#[derive(Clone, Default)]
pub struct ClasslibFunctions {
    table: [Option<ClasslibFunction>; TABLE_LEN],
}

impl ClasslibFunctions {
    /// An empty table.
    pub fn new() -> ClasslibFunctions {
        ClasslibFunctions::default()
    }

    /// Register `function` for `id`, replacing any previous registration.
    pub fn with(mut self, id: ClasslibFunctionId, function: ClasslibFunction) -> ClasslibFunctions {
        log::debug!("registering classlib function {} at {:#x}", id.name(), function.addr());
        self.table[id as usize] = Some(function);
        self
    }

    /// The function registered for `id`, if any.
    pub fn get(&self, id: ClasslibFunctionId) -> Option<ClasslibFunction> {
        self.table[id as usize]
    }

    /// The function registered for `id`; fails fast if there is none.
    pub fn require(&self, id: ClasslibFunctionId) -> ClasslibFunction {
        match self.get(id) {
            Some(f) => f,
            None => fail_fast!("runtime library did not register `{}`", id.name()),
        }
    }

    /// Ids that are mandatory but not registered.
    pub fn missing_required(&self) -> impl Iterator<Item = ClasslibFunctionId> + '_ {
        ClasslibFunctionId::ALL
            .iter()
            .copied()
            .filter(|id| id.is_required() && self.get(*id).is_none())
    }
}

impl fmt::Debug for ClasslibFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for id in ClasslibFunctionId::ALL {
            if let Some(function) = self.get(*id) {
                map.entry(&id.name(), &format_args!("{:#x}", function.addr()));
            }
        }
        map.finish()
    }
}
