//! Fixed-size, caller-allocated scratch values handed to code managers.
//!
//! A walk allocates one [`MethodInfo`] and, when dispatching exceptions, one
//! [`EhEnumState`] on its own stack. Code managers store their private
//! representation inside; the size of that representation is checked at
//! compile time and its type is checked on every read, so a value produced by
//! one backend can never be misinterpreted by another.

use core::any::TypeId;
use core::fmt;
use core::mem::MaybeUninit;

/// Maximum size of a code manager's per-method representation.
pub const METHOD_INFO_SIZE: usize = 5 * size_of::<usize>() + 8 * size_of::<u32>();

/// Maximum size of a code manager's exception-clause cursor.
pub const EH_ENUM_STATE_SIZE: usize = 2 * size_of::<usize>() + 2 * size_of::<u32>();

/// Maximum alignment of values stored in scratch storage.
pub const SCRATCH_ALIGN: usize = 8;

#[repr(C, align(8))]
#[derive(Clone, Copy)]
struct Storage<const N: usize> {
    bytes: [MaybeUninit<u8>; N],
    tag: Option<TypeId>,
}

impl<const N: usize> Storage<N> {
    const fn new() -> Self {
        Storage {
            bytes: [MaybeUninit::uninit(); N],
            tag: None,
        }
    }

    fn set<T: Copy + 'static>(&mut self, value: T) {
        const {
            assert!(size_of::<T>() <= N, "value does not fit in scratch storage");
            assert!(align_of::<T>() <= SCRATCH_ALIGN, "value is over-aligned for scratch storage");
        }
        // SAFETY: size and alignment were checked above, and `bytes` is the
        // first field of an 8-byte aligned `repr(C)` struct.
        unsafe { self.bytes.as_mut_ptr().cast::<T>().write(value) };
        self.tag = Some(TypeId::of::<T>());
    }

    fn get<T: Copy + 'static>(&self, what: &str) -> T {
        self.check::<T>(what);
        // SAFETY: the tag proves a `T` was written by `set`.
        unsafe { self.bytes.as_ptr().cast::<T>().read() }
    }

    fn get_mut<T: Copy + 'static>(&mut self, what: &str) -> &mut T {
        self.check::<T>(what);
        // SAFETY: the tag proves a `T` was written by `set`.
        unsafe { &mut *self.bytes.as_mut_ptr().cast::<T>() }
    }

    fn check<T: 'static>(&self, what: &str) {
        if self.tag != Some(TypeId::of::<T>()) {
            fail_fast!(
                "{what} does not hold a `{}`; it was populated by a different code manager or not at all",
                core::any::type_name::<T>()
            );
        }
    }
}

macro_rules! scratch_types {
    ($($(#[$attr:meta])* $name:ident($size:ident);)*) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy)]
            pub struct $name(Storage<$size>);

            impl $name {
                /// Empty scratch storage.
                pub const fn new() -> Self {
                    $name(Storage::new())
                }

                /// Store a code manager's representation, replacing any
                /// previous contents.
                pub fn set<T: Copy + 'static>(&mut self, value: T) {
                    self.0.set(value)
                }

                /// Read back the representation stored by [`Self::set`].
                ///
                /// Fails fast if the storage holds a different type.
                pub fn get<T: Copy + 'static>(&self) -> T {
                    self.0.get(stringify!($name))
                }

                /// Mutable access to the representation stored by
                /// [`Self::set`].
                ///
                /// Fails fast if the storage holds a different type.
                pub fn get_mut<T: Copy + 'static>(&mut self) -> &mut T {
                    self.0.get_mut(stringify!($name))
                }

                /// Does the storage currently hold a `T`?
                pub fn holds<T: 'static>(&self) -> bool {
                    self.0.tag == Some(TypeId::of::<T>())
                }

                /// Forget the stored value.
                pub fn clear(&mut self) {
                    self.0.tag = None;
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    $name::new()
                }
            }

            impl fmt::Debug for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.debug_struct(stringify!($name))
                        .field("populated", &self.0.tag.is_some())
                        .finish()
                }
            }
        )*
    };
}

scratch_types! {
    /// Per-frame method metadata produced by
    /// [`CodeManager::find_method_info`](crate::CodeManager::find_method_info).
    ///
    /// A `MethodInfo` is only valid for the program counter that produced it
    /// and must be re-resolved for every frame.
    MethodInfo(METHOD_INFO_SIZE);

    /// Cursor over a method's exception-handling clauses, initialized by
    /// [`CodeManager::eh_enum_init`](crate::CodeManager::eh_enum_init).
    EhEnumState(EH_ENUM_STATE_SIZE);
}
