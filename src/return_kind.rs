//! Classification of the return register.

use crate::code_manager::GcRefFlags;
use crate::transition::TransitionFrameFlags;

/// Shift that maps a [`ReturnValueKind`] onto the return-kind bits of
/// [`TransitionFrameFlags`].
pub const RETURN_KIND_SHIFT: u32 = 16;

/// What a method's return register holds once it returns.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnValueKind {
    /// Not a GC reference.
    Scalar = 0,
    /// An object reference.
    Object = 1,
    /// An interior reference.
    Byref = 2,
    /// Not known; never recorded in a transition frame.
    Unknown = 0xFF,
}

const RETURN_KIND_MASK: u64 =
    TransitionFrameFlags::RETURN_IS_GCREF.bits() | TransitionFrameFlags::RETURN_IS_BYREF.bits();

const _: () = {
    assert!((ReturnValueKind::Scalar as u64) << RETURN_KIND_SHIFT == 0);
    assert!(
        (ReturnValueKind::Object as u64) << RETURN_KIND_SHIFT
            == TransitionFrameFlags::RETURN_IS_GCREF.bits()
    );
    assert!(
        (ReturnValueKind::Byref as u64) << RETURN_KIND_SHIFT
            == TransitionFrameFlags::RETURN_IS_BYREF.bits()
    );
};

impl ReturnValueKind {
    /// The transition-frame flag bits recording this kind, or `None` for
    /// [`ReturnValueKind::Unknown`].
    pub fn to_transition_flags(self) -> Option<TransitionFrameFlags> {
        match self {
            ReturnValueKind::Unknown => None,
            kind => Some(TransitionFrameFlags::from_bits_retain(
                u64::from(kind as u8) << RETURN_KIND_SHIFT,
            )),
        }
    }

    /// Decode the return-kind bits of a transition frame's flag word.
    ///
    /// A flag word with both bits set yields [`ReturnValueKind::Unknown`].
    pub fn from_transition_flags(flags: TransitionFrameFlags) -> ReturnValueKind {
        match (flags.bits() & RETURN_KIND_MASK) >> RETURN_KIND_SHIFT {
            0 => ReturnValueKind::Scalar,
            1 => ReturnValueKind::Object,
            2 => ReturnValueKind::Byref,
            _ => ReturnValueKind::Unknown,
        }
    }

    /// How a return register of this kind is reported to the collector, or
    /// `None` if it does not hold a reference.
    pub fn gc_ref_flags(self) -> Option<GcRefFlags> {
        match self {
            ReturnValueKind::Object => Some(GcRefFlags::empty()),
            ReturnValueKind::Byref => Some(GcRefFlags::INTERIOR),
            ReturnValueKind::Scalar | ReturnValueKind::Unknown => None,
        }
    }
}
