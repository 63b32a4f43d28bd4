//! Per-method associated data.
//!
//! The blob starts with a flags byte; each flag that is set contributes a
//! payload, in flag-bit order:
//!
//! ```plain
//! flags:  u8
//! HAS_UNBOXING_STUB_TARGET: u32 little-endian offset of the unboxed target
//!                           method, relative to the start of the text section
//! ```
//!
//! Flags this version does not understand may shift later payloads, so a
//! blob carrying one is rejected rather than partially interpreted.

use bitflags::bitflags;

bitflags! {
    /// Flags in the first byte of an associated-data blob.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AssociatedDataFlags: u8 {
        /// The method is an unboxing stub; the payload names the method it
        /// forwards to.
        const HAS_UNBOXING_STUB_TARGET = 1;
    }
}

/// Errors from [`AssociatedData::parse`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AssociatedDataError {
    /// The blob is empty.
    #[error("associated data is empty")]
    Empty,
    /// The blob sets flags this version does not understand.
    #[error("associated data has unknown flags {0:#04x}")]
    UnknownFlags(u8),
    /// The blob is shorter or longer than its flags require.
    #[error("associated data is {actual} bytes but its flags require {expected}")]
    BadLength {
        /// Length implied by the flags.
        expected: usize,
        /// Actual length.
        actual: usize,
    },
}

/// A validated associated-data blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssociatedData<'a> {
    flags: AssociatedDataFlags,
    bytes: &'a [u8],
}

impl<'a> AssociatedData<'a> {
    /// Validate `bytes` as an associated-data blob.
    pub fn parse(bytes: &'a [u8]) -> Result<AssociatedData<'a>, AssociatedDataError> {
        let (&raw_flags, payload) = bytes.split_first().ok_or(AssociatedDataError::Empty)?;
        let flags = AssociatedDataFlags::from_bits(raw_flags)
            .ok_or(AssociatedDataError::UnknownFlags(raw_flags))?;
        let mut expected = 1;
        if flags.contains(AssociatedDataFlags::HAS_UNBOXING_STUB_TARGET) {
            expected += size_of::<u32>();
        }
        if 1 + payload.len() != expected {
            return Err(AssociatedDataError::BadLength {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(AssociatedData { flags, bytes })
    }

    /// The flags byte.
    pub fn flags(&self) -> AssociatedDataFlags {
        self.flags
    }

    /// The raw blob, including the flags byte.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Text-section offset of the method an unboxing stub forwards to.
    pub fn unboxing_stub_target(&self) -> Option<u32> {
        if !self.flags.contains(AssociatedDataFlags::HAS_UNBOXING_STUB_TARGET) {
            return None;
        }
        let payload: [u8; 4] = self.bytes[1..5].try_into().ok()?;
        Some(u32::from_le_bytes(payload))
    }

    /// Encode a blob for an unboxing stub forwarding to `target`.
    pub fn encode_unboxing_stub_target(target: u32) -> Vec<u8> {
        let mut bytes = vec![AssociatedDataFlags::HAS_UNBOXING_STUB_TARGET.bits()];
        bytes.extend_from_slice(&target.to_le_bytes());
        bytes
    }
}
