//! Code-info section parser and lookup logic.
//!
//! This module interprets the section produced by
//! [`crate::CodeInfoBuilder`]. The section is a header of element counts
//! followed by fixed-size little-endian records:
//!
//! ```plain
//! counts:      [methods, saved_regs, epilogs, slots, safepoints, live, clauses, assoc_bytes]
//! methods:     [MethodRecord; methods]        // sorted by start offset
//! saved_regs:  [SavedRegRecord; saved_regs]
//! epilogs:     [EpilogRecord; epilogs]
//! slots:       [GcSlotRecord; slots]
//! safepoints:  [SafepointRecord; safepoints]
//! live:        [u32; live]                    // method-local slot indices
//! clauses:     [ClauseRecord; clauses]
//! assoc_bytes: [u8; assoc_bytes]
//! ```
//!
//! Every method record stores the *exclusive end* index of its share of each
//! pool; the start index is implicit as the previous method's end, or zero
//! for the first method. Safepoints store the end of their live-slot list the
//! same way.

use anyhow::{Result, anyhow, bail};
use bitflags::bitflags;
use core::ops::Range;
use object::{Bytes, I32Bytes, LittleEndian, Pod, U32Bytes};

pub(crate) type U32 = U32Bytes<LittleEndian>;
pub(crate) type I32 = I32Bytes<LittleEndian>;

/// Encoded "no value" for optional `u32` record fields.
pub(crate) const NONE: u32 = u32::MAX;

bitflags! {
    /// Per-method attributes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u32 {
        /// The method is a funclet (catch, filter, finally or fault handler)
        /// running on its parent's frame.
        const FUNCLET = 1 << 0;
        /// The method establishes a frame-pointer based frame.
        const FRAME_POINTER = 1 << 1;
        /// The method is entered from native code and saves the previous
        /// transition frame in its own frame.
        const REVERSE_PINVOKE = 1 << 2;
        /// The method returns an object reference in the return register.
        const RETURNS_OBJECT = 1 << 8;
        /// The method returns an interior reference in the return register.
        const RETURNS_BYREF = 1 << 9;
    }
}

/// What a method leaves in the return register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MethodReturnKind {
    /// No GC reference.
    #[default]
    Scalar,
    /// An object reference.
    Object,
    /// An interior reference.
    Byref,
}

impl MethodReturnKind {
    pub(crate) fn to_flags(self) -> MethodFlags {
        match self {
            MethodReturnKind::Scalar => MethodFlags::empty(),
            MethodReturnKind::Object => MethodFlags::RETURNS_OBJECT,
            MethodReturnKind::Byref => MethodFlags::RETURNS_BYREF,
        }
    }

    fn from_flags(flags: MethodFlags) -> MethodReturnKind {
        if flags.contains(MethodFlags::RETURNS_OBJECT) {
            MethodReturnKind::Object
        } else if flags.contains(MethodFlags::RETURNS_BYREF) {
            MethodReturnKind::Byref
        } else {
            MethodReturnKind::Scalar
        }
    }
}

/// How a method's frame is laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameLayout {
    /// The frame pointer points at the saved caller frame pointer, which is
    /// immediately followed by the return address. Saved registers are
    /// addressed relative to the frame pointer.
    FramePointer,
    /// No frame pointer is established. The return address lives
    /// `frame_size` bytes above the stack pointer, and saved registers are
    /// addressed relative to the stack pointer.
    StackPointer {
        /// Distance from the stack pointer to the return address slot.
        frame_size: u32,
    },
}

/// A callee-saved register spilled by a method's prologue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SavedReg {
    /// Architecture register number.
    pub reg: u16,
    /// Byte offset of the save slot from the frame pointer (frame-pointer
    /// frames) or the stack pointer (stack-pointer frames).
    pub offset: i32,
}

/// Where a GC slot lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotLocation {
    /// In a register.
    Register(u16),
    /// At a byte offset from the stack pointer.
    Sp(i32),
    /// At a byte offset from the frame pointer.
    Fp(i32),
    /// At a byte offset from the caller's stack pointer (incoming arguments).
    CallerSp(i32),
}

impl SlotLocation {
    fn encode(self) -> (u32, i32) {
        match self {
            SlotLocation::Register(reg) => (0, i32::from(reg)),
            SlotLocation::Sp(offset) => (1, offset),
            SlotLocation::Fp(offset) => (2, offset),
            SlotLocation::CallerSp(offset) => (3, offset),
        }
    }

    fn decode(kind: u32, value: i32) -> Option<SlotLocation> {
        Some(match kind {
            0 => SlotLocation::Register(u16::try_from(value).ok()?),
            1 => SlotLocation::Sp(value),
            2 => SlotLocation::Fp(value),
            3 => SlotLocation::CallerSp(value),
            _ => return None,
        })
    }
}

bitflags! {
    /// Attributes of a GC slot.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct SlotFlags: u32 {
        /// The slot may point into the middle of an object.
        const INTERIOR = 1 << 0;
        /// The referenced object must not move.
        const PINNED = 1 << 1;
        /// The slot is live at every safepoint of the method and is never
        /// listed in a live set.
        const UNTRACKED = 1 << 2;
    }
}

/// A location that may hold a GC reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GcSlot {
    /// Where the reference lives.
    pub location: SlotLocation,
    /// How the reference must be reported.
    pub flags: SlotFlags,
}

/// The kind of an exception-handling clause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClauseKind {
    /// Catches exceptions assignable to a target type.
    Typed = 0,
    /// Runs during the second pass for every exception (also used for
    /// `finally`).
    Fault = 1,
    /// Catches exceptions for which a filter funclet returns true.
    Filter = 2,
    /// Placeholder clause that never matches.
    Unused = 3,
}

impl ClauseKind {
    fn from_u32(kind: u32) -> Option<ClauseKind> {
        Some(match kind {
            0 => ClauseKind::Typed,
            1 => ClauseKind::Fault,
            2 => ClauseKind::Filter,
            3 => ClauseKind::Unused,
            _ => return None,
        })
    }
}

/// A decoded exception-handling clause. All offsets are relative to the
/// start of the owning method.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Clause {
    /// The clause kind.
    pub kind: ClauseKind,
    /// Protected range `[start, end)`.
    pub try_range: Range<u32>,
    /// Offset of the handler entry point.
    pub handler: u32,
    /// Offset of the filter entry point, for [`ClauseKind::Filter`] only.
    pub filter: Option<u32>,
    /// Index into the image's type handle table, for [`ClauseKind::Typed`]
    /// only.
    pub type_index: Option<u32>,
}

impl Clause {
    /// Does the protected range strictly or equally contain `other`'s?
    pub fn encloses(&self, other: &Clause) -> bool {
        self.try_range.start <= other.try_range.start && other.try_range.end <= self.try_range.end
    }

    /// Is `offset` inside the protected range?
    pub fn covers(&self, offset: u32) -> bool {
        self.try_range.contains(&offset)
    }
}

macro_rules! pod_records {
    ($($(#[$attr:meta])* $name:ident { $($field:ident: $ty:ty,)* })*) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Debug)]
            #[repr(C)]
            pub struct $name {
                $(pub(crate) $field: $ty,)*
            }

            // SAFETY: the record is `repr(C)` and made only of unaligned
            // little-endian integers, so every bit pattern is valid and
            // there is no padding.
            unsafe impl Pod for $name {}
        )*
    };
}

pod_records! {
    /// Serialized form of one method.
    MethodRecord {
        start: U32,
        end: U32,
        flags: U32,
        parent: U32,
        prolog_size: U32,
        frame_size: U32,
        reverse_pinvoke_slot: I32,
        saved_regs_end: U32,
        epilogs_end: U32,
        slots_end: U32,
        safepoints_end: U32,
        clauses_end: U32,
        associated_data_end: U32,
    }

    /// Serialized form of a [`SavedReg`].
    SavedRegRecord {
        reg: U32,
        offset: I32,
    }

    /// Serialized epilog range, relative to the method start.
    EpilogRecord {
        start: U32,
        size: U32,
    }

    /// Serialized form of a [`GcSlot`]: low byte is the location kind, the
    /// remaining bits are [`SlotFlags`].
    GcSlotRecord {
        kind: U32,
        value: I32,
    }

    /// Serialized safepoint: method-relative offset and the exclusive end of
    /// its live-slot list.
    SafepointRecord {
        offset: U32,
        live_end: U32,
    }

    /// Serialized form of a [`Clause`].
    ClauseRecord {
        kind: U32,
        try_start: U32,
        try_end: U32,
        handler: U32,
        filter: U32,
        type_index: U32,
    }
}

pub(crate) fn to_usize(value: u32) -> usize {
    usize::try_from(value).unwrap()
}

/// A parsed, validated code-info section.
///
/// This holds slices into the section data and is cheap to copy; all
/// queries are allocation free.
#[derive(Clone, Copy, Debug)]
pub struct CodeInfo<'a> {
    methods: &'a [MethodRecord],
    saved_regs: &'a [SavedRegRecord],
    epilogs: &'a [EpilogRecord],
    slots: &'a [GcSlotRecord],
    safepoints: &'a [SafepointRecord],
    live: &'a [U32],
    clauses: &'a [ClauseRecord],
    associated_data: &'a [u8],
}

fn read_count(data: &mut Bytes<'_>, what: &str) -> Result<usize> {
    let count = data
        .read::<U32>()
        .map_err(|_| anyhow!("Unable to read {what} count prefix"))?;
    Ok(usize::try_from(count.get(LittleEndian))?)
}

fn read_slice<'a, T: Pod>(data: &'a [u8], count: usize, what: &str) -> Result<(&'a [T], &'a [u8])> {
    object::slice_from_bytes::<T>(data, count).map_err(|_| anyhow!("Unable to read {what} slice"))
}

impl<'a> CodeInfo<'a> {
    /// Parse and validate a code-info section describing a text section of
    /// `text_len` bytes.
    pub fn parse(data: &'a [u8], text_len: u32) -> Result<CodeInfo<'a>> {
        let mut bytes = Bytes(data);
        let num_methods = read_count(&mut bytes, "method")?;
        let num_saved_regs = read_count(&mut bytes, "saved register")?;
        let num_epilogs = read_count(&mut bytes, "epilog")?;
        let num_slots = read_count(&mut bytes, "GC slot")?;
        let num_safepoints = read_count(&mut bytes, "safepoint")?;
        let num_live = read_count(&mut bytes, "live slot")?;
        let num_clauses = read_count(&mut bytes, "clause")?;
        let num_associated = read_count(&mut bytes, "associated data")?;

        let (methods, rest) = read_slice(bytes.0, num_methods, "method")?;
        let (saved_regs, rest) = read_slice(rest, num_saved_regs, "saved register")?;
        let (epilogs, rest) = read_slice(rest, num_epilogs, "epilog")?;
        let (slots, rest) = read_slice(rest, num_slots, "GC slot")?;
        let (safepoints, rest) = read_slice(rest, num_safepoints, "safepoint")?;
        let (live, rest) = read_slice(rest, num_live, "live slot")?;
        let (clauses, rest) = read_slice(rest, num_clauses, "clause")?;
        let (associated_data, rest) = rest
            .split_at_checked(num_associated)
            .ok_or_else(|| anyhow!("Unable to read associated data pool"))?;

        if !rest.is_empty() {
            bail!("Unexpected data at end of code info section");
        }

        let info = CodeInfo {
            methods,
            saved_regs,
            epilogs,
            slots,
            safepoints,
            live,
            clauses,
            associated_data,
        };
        info.validate(text_len)?;
        log::trace!(
            "parsed code info: {num_methods} methods, {num_safepoints} safepoints, {num_clauses} clauses"
        );
        Ok(info)
    }

    /// Number of methods described by this section.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Get the method at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn method(&self, index: usize) -> Method<'a> {
        Method {
            info: *self,
            index,
            record: &self.methods[index],
        }
    }

    /// Iterate over all methods in text order.
    pub fn methods(&self) -> impl ExactSizeIterator<Item = Method<'a>> + '_ {
        (0..self.methods.len()).map(|i| self.method(i))
    }

    /// Find the method whose code contains `text_offset`.
    pub fn lookup_method(&self, text_offset: u32) -> Option<Method<'a>> {
        let index = match self
            .methods
            .binary_search_by_key(&text_offset, |m| m.start.get(LittleEndian))
        {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let method = self.method(index);
        if text_offset < method.end() {
            Some(method)
        } else {
            None
        }
    }

    fn validate(&self, text_len: u32) -> Result<()> {
        check_pool_ends(self.methods, |m| m.saved_regs_end.get(LittleEndian), self.saved_regs.len(), "saved register")?;
        check_pool_ends(self.methods, |m| m.epilogs_end.get(LittleEndian), self.epilogs.len(), "epilog")?;
        check_pool_ends(self.methods, |m| m.slots_end.get(LittleEndian), self.slots.len(), "GC slot")?;
        check_pool_ends(self.methods, |m| m.safepoints_end.get(LittleEndian), self.safepoints.len(), "safepoint")?;
        check_pool_ends(self.methods, |m| m.clauses_end.get(LittleEndian), self.clauses.len(), "clause")?;
        check_pool_ends(
            self.methods,
            |m| m.associated_data_end.get(LittleEndian),
            self.associated_data.len(),
            "associated data",
        )?;
        check_pool_ends(self.safepoints, |s| s.live_end.get(LittleEndian), self.live.len(), "live slot")?;

        let mut previous_end = 0;
        for method in self.methods() {
            if method.start() < previous_end {
                bail!("method {} at {:#x} overlaps its predecessor", method.index(), method.start());
            }
            if method.start() >= method.end() || method.end() > text_len {
                bail!("method {} has invalid code range {:#x?}", method.index(), method.range());
            }
            previous_end = method.end();
            self.validate_method(&method)
                .map_err(|e| e.context(format!("invalid method {} at {:#x}", method.index(), method.start())))?;
        }
        Ok(())
    }

    fn validate_method(&self, method: &Method<'a>) -> Result<()> {
        let raw_flags = method.record.flags.get(LittleEndian);
        let flags = MethodFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("unknown method flags {raw_flags:#x}"))?;
        if flags.contains(MethodFlags::RETURNS_OBJECT | MethodFlags::RETURNS_BYREF) {
            bail!("method cannot return both an object and a byref");
        }

        let parent = method.record.parent.get(LittleEndian);
        if flags.contains(MethodFlags::FUNCLET) {
            let parent = to_usize(parent);
            if parent >= self.methods.len() || parent == method.index() {
                bail!("funclet has invalid parent {parent}");
            }
            if self.method(parent).is_funclet() {
                bail!("funclet parent {parent} is itself a funclet");
            }
            if flags.contains(MethodFlags::FRAME_POINTER) {
                bail!("funclets keep their parent's frame pointer and cannot establish one");
            }
        } else if parent != NONE {
            bail!("only funclets may have a parent method");
        }
        if flags.contains(MethodFlags::REVERSE_PINVOKE) && !flags.contains(MethodFlags::FRAME_POINTER) {
            bail!("reverse transition methods require a frame pointer");
        }

        let len = method.len();
        if method.prolog_size() > len {
            bail!("prologue is larger than the method");
        }
        for epilog in method.epilogs() {
            if epilog.is_empty() || epilog.end > len {
                bail!("epilog {epilog:#x?} is outside the method");
            }
        }

        let saved_regs = &self.saved_regs[method.saved_regs_range()];
        for (i, a) in saved_regs.iter().enumerate() {
            if u16::try_from(a.reg.get(LittleEndian)).is_err() {
                bail!("saved register number out of range");
            }
            if saved_regs[..i].iter().any(|b| b.reg.get(LittleEndian) == a.reg.get(LittleEndian)) {
                bail!("register {} saved twice", a.reg.get(LittleEndian));
            }
        }

        let slot_count = method.slot_count();
        for i in 0..slot_count {
            let record = &self.slots[method.slots_range().start + i];
            let slot = decode_slot(record)?;
            for j in 0..i {
                if method.slot(j).location == slot.location {
                    bail!("GC slot {:?} listed twice", slot.location);
                }
            }
        }

        let mut previous_offset = None;
        for i in 0..method.safepoint_count() {
            let safepoint = method.safepoint(i);
            if safepoint.offset() >= len {
                bail!("safepoint at {:#x} is outside the method", safepoint.offset());
            }
            if previous_offset.is_some_and(|prev| prev >= safepoint.offset()) {
                bail!("safepoints are not strictly sorted at {:#x}", safepoint.offset());
            }
            previous_offset = Some(safepoint.offset());
            if method.is_in_prolog_or_epilog(safepoint.offset()) {
                bail!("safepoint at {:#x} is inside the prologue or an epilog", safepoint.offset());
            }

            let mut previous_slot = None;
            for slot in safepoint.live_slots() {
                if previous_slot.is_some_and(|prev| prev >= slot) {
                    bail!("live slots at {:#x} are not strictly sorted", safepoint.offset());
                }
                previous_slot = Some(slot);
                if to_usize(slot) >= slot_count {
                    bail!("live slot {slot} at {:#x} is out of range", safepoint.offset());
                }
                if method.slot(to_usize(slot)).flags.contains(SlotFlags::UNTRACKED) {
                    bail!("untracked slot {slot} listed in a live set");
                }
            }
        }

        for i in 0..method.clause_count() {
            let record = &self.clauses[method.clauses_range().start + i];
            let clause = decode_clause(record)?;
            if clause.try_range.is_empty() || clause.try_range.end > len {
                bail!("try range {:#x?} is outside the method", clause.try_range);
            }
            if clause.handler >= len || clause.filter.is_some_and(|f| f >= len) {
                bail!("handler of try range {:#x?} is outside the method", clause.try_range);
            }
            for j in 0..i {
                let other = method.clause(j);
                let disjoint = clause.try_range.end <= other.try_range.start
                    || other.try_range.end <= clause.try_range.start;
                if !disjoint && !clause.encloses(&other) && !other.encloses(&clause) {
                    bail!(
                        "try ranges {:#x?} and {:#x?} overlap without nesting",
                        clause.try_range,
                        other.try_range
                    );
                }
            }
        }
        Ok(())
    }
}

fn check_pool_ends<T>(records: &[T], end: impl Fn(&T) -> u32, pool_len: usize, what: &str) -> Result<()> {
    let mut previous = 0;
    for record in records {
        let end = to_usize(end(record));
        if end < previous || end > pool_len {
            bail!("{what} pool index {end} is out of order or out of bounds");
        }
        previous = end;
    }
    if previous != pool_len {
        bail!("{what} pool has {} trailing entries", pool_len - previous);
    }
    Ok(())
}

fn decode_slot(record: &GcSlotRecord) -> Result<GcSlot> {
    let kind = record.kind.get(LittleEndian);
    let flags = SlotFlags::from_bits(kind >> 8).ok_or_else(|| anyhow!("unknown GC slot flags {kind:#x}"))?;
    let location = SlotLocation::decode(kind & 0xff, record.value.get(LittleEndian))
        .ok_or_else(|| anyhow!("invalid GC slot location {kind:#x}"))?;
    Ok(GcSlot { location, flags })
}

pub(crate) fn encode_slot(slot: &GcSlot) -> GcSlotRecord {
    let (kind, value) = slot.location.encode();
    GcSlotRecord {
        kind: U32::new(LittleEndian, kind | (slot.flags.bits() << 8)),
        value: I32::new(LittleEndian, value),
    }
}

fn decode_clause(record: &ClauseRecord) -> Result<Clause> {
    let raw_kind = record.kind.get(LittleEndian);
    let kind = ClauseKind::from_u32(raw_kind).ok_or_else(|| anyhow!("unknown clause kind {raw_kind}"))?;
    let filter = Some(record.filter.get(LittleEndian)).filter(|f| *f != NONE);
    let type_index = Some(record.type_index.get(LittleEndian)).filter(|t| *t != NONE);
    if (kind == ClauseKind::Filter) != filter.is_some() {
        bail!("only filter clauses carry a filter entry point");
    }
    if (kind == ClauseKind::Typed) != type_index.is_some() {
        bail!("only typed clauses carry a target type");
    }
    Ok(Clause {
        kind,
        try_range: record.try_start.get(LittleEndian)..record.try_end.get(LittleEndian),
        handler: record.handler.get(LittleEndian),
        filter,
        type_index,
    })
}

pub(crate) fn encode_clause(clause: &Clause) -> ClauseRecord {
    ClauseRecord {
        kind: U32::new(LittleEndian, clause.kind as u32),
        try_start: U32::new(LittleEndian, clause.try_range.start),
        try_end: U32::new(LittleEndian, clause.try_range.end),
        handler: U32::new(LittleEndian, clause.handler),
        filter: U32::new(LittleEndian, clause.filter.unwrap_or(NONE)),
        type_index: U32::new(LittleEndian, clause.type_index.unwrap_or(NONE)),
    }
}

/// One method of a [`CodeInfo`] section.
#[derive(Clone, Copy, Debug)]
pub struct Method<'a> {
    info: CodeInfo<'a>,
    index: usize,
    record: &'a MethodRecord,
}

impl<'a> Method<'a> {
    /// Index of this method within its section.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Text offset of the first instruction.
    pub fn start(&self) -> u32 {
        self.record.start.get(LittleEndian)
    }

    /// Text offset one past the last instruction.
    pub fn end(&self) -> u32 {
        self.record.end.get(LittleEndian)
    }

    /// Text range covered by this method.
    pub fn range(&self) -> Range<u32> {
        self.start()..self.end()
    }

    /// Size of the method's code in bytes.
    pub fn len(&self) -> u32 {
        self.end() - self.start()
    }

    /// Attribute flags.
    pub fn flags(&self) -> MethodFlags {
        MethodFlags::from_bits_truncate(self.record.flags.get(LittleEndian))
    }

    /// Is this a funclet?
    pub fn is_funclet(&self) -> bool {
        self.flags().contains(MethodFlags::FUNCLET)
    }

    /// The method whose frame a funclet runs on.
    pub fn parent(&self) -> Option<Method<'a>> {
        if self.is_funclet() {
            Some(self.info.method(to_usize(self.record.parent.get(LittleEndian))))
        } else {
            None
        }
    }

    /// Size of the prologue in bytes.
    pub fn prolog_size(&self) -> u32 {
        self.record.prolog_size.get(LittleEndian)
    }

    /// Frame layout.
    pub fn frame_layout(&self) -> FrameLayout {
        if self.flags().contains(MethodFlags::FRAME_POINTER) {
            FrameLayout::FramePointer
        } else {
            FrameLayout::StackPointer {
                frame_size: self.record.frame_size.get(LittleEndian),
            }
        }
    }

    /// Frame-pointer relative slot holding the saved transition frame, for
    /// methods entered from native code.
    pub fn reverse_pinvoke_slot(&self) -> Option<i32> {
        if self.flags().contains(MethodFlags::REVERSE_PINVOKE) {
            Some(self.record.reverse_pinvoke_slot.get(LittleEndian))
        } else {
            None
        }
    }

    /// What the method leaves in the return register.
    pub fn return_kind(&self) -> MethodReturnKind {
        MethodReturnKind::from_flags(self.flags())
    }

    fn pool_range(&self, end_of: impl Fn(&MethodRecord) -> u32) -> Range<usize> {
        let start = match self.index {
            0 => 0,
            i => end_of(&self.info.methods[i - 1]),
        };
        to_usize(start)..to_usize(end_of(self.record))
    }

    fn saved_regs_range(&self) -> Range<usize> {
        self.pool_range(|m| m.saved_regs_end.get(LittleEndian))
    }

    fn slots_range(&self) -> Range<usize> {
        self.pool_range(|m| m.slots_end.get(LittleEndian))
    }

    fn safepoints_range(&self) -> Range<usize> {
        self.pool_range(|m| m.safepoints_end.get(LittleEndian))
    }

    fn clauses_range(&self) -> Range<usize> {
        self.pool_range(|m| m.clauses_end.get(LittleEndian))
    }

    /// Callee-saved registers spilled by the prologue.
    pub fn saved_regs(&self) -> impl ExactSizeIterator<Item = SavedReg> + 'a {
        self.info.saved_regs[self.saved_regs_range()].iter().map(|r| SavedReg {
            reg: r.reg.get(LittleEndian) as u16,
            offset: r.offset.get(LittleEndian),
        })
    }

    /// Method-relative epilog ranges.
    pub fn epilogs(&self) -> impl ExactSizeIterator<Item = Range<u32>> + 'a {
        let range = self.pool_range(|m| m.epilogs_end.get(LittleEndian));
        self.info.epilogs[range].iter().map(|e| {
            let start = e.start.get(LittleEndian);
            start..start.saturating_add(e.size.get(LittleEndian))
        })
    }

    /// Is the method-relative `offset` inside the prologue or an epilog?
    pub fn is_in_prolog_or_epilog(&self, offset: u32) -> bool {
        offset < self.prolog_size() || self.epilogs().any(|e| e.contains(&offset))
    }

    /// Number of GC slots.
    pub fn slot_count(&self) -> usize {
        self.slots_range().len()
    }

    /// Decode GC slot `index`.
    pub fn slot(&self, index: usize) -> GcSlot {
        let range = self.slots_range();
        assert!(index < range.len(), "GC slot {index} out of range");
        decode_slot(&self.info.slots[range.start + index]).expect("validated at parse time")
    }

    /// Iterate over the slots live at every safepoint.
    pub fn untracked_slots(&self) -> impl Iterator<Item = GcSlot> + '_ {
        (0..self.slot_count())
            .map(|i| self.slot(i))
            .filter(|s| s.flags.contains(SlotFlags::UNTRACKED))
    }

    /// Number of safepoints.
    pub fn safepoint_count(&self) -> usize {
        self.safepoints_range().len()
    }

    /// Get safepoint `index`.
    pub fn safepoint(&self, index: usize) -> Safepoint<'a> {
        let range = self.safepoints_range();
        assert!(index < range.len(), "safepoint {index} out of range");
        let global = range.start + index;
        let live_start = match global {
            0 => 0,
            g => to_usize(self.info.safepoints[g - 1].live_end.get(LittleEndian)),
        };
        let record = &self.info.safepoints[global];
        let live_end = to_usize(record.live_end.get(LittleEndian));
        Safepoint {
            offset: record.offset.get(LittleEndian),
            live: &self.info.live[live_start..live_end],
        }
    }

    /// Binary-search the safepoints for a method-relative `offset`.
    ///
    /// Like `slice::binary_search`, returns `Ok(index)` for an exact match
    /// and `Err(insertion_index)` otherwise.
    pub fn find_safepoint(&self, offset: u32) -> Result<usize, usize> {
        let range = self.safepoints_range();
        self.info.safepoints[range].binary_search_by_key(&offset, |s| s.offset.get(LittleEndian))
    }

    /// Number of exception-handling clauses.
    pub fn clause_count(&self) -> usize {
        self.clauses_range().len()
    }

    /// Decode clause `index` in storage order.
    pub fn clause(&self, index: usize) -> Clause {
        let range = self.clauses_range();
        assert!(index < range.len(), "clause {index} out of range");
        decode_clause(&self.info.clauses[range.start + index]).expect("validated at parse time")
    }

    /// The innermost clause whose try range covers `offset`, as a storage
    /// index. Clauses sharing a try range resolve to the first one stored.
    pub fn innermost_clause_covering(&self, offset: u32) -> Option<usize> {
        let mut best: Option<(usize, Clause)> = None;
        for i in 0..self.clause_count() {
            let clause = self.clause(i);
            if !clause.covers(offset) {
                continue;
            }
            match &best {
                Some((_, b)) if !b.encloses(&clause) || b.try_range == clause.try_range => {}
                _ => best = Some((i, clause)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// Raw associated data blob, if any.
    pub fn associated_data(&self) -> Option<&'a [u8]> {
        let range = self.pool_range(|m| m.associated_data_end.get(LittleEndian));
        if range.is_empty() {
            None
        } else {
            Some(&self.info.associated_data[range])
        }
    }
}

/// A decoded safepoint.
#[derive(Clone, Copy, Debug)]
pub struct Safepoint<'a> {
    offset: u32,
    live: &'a [U32],
}

impl<'a> Safepoint<'a> {
    /// Method-relative code offset.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Method-local indices of the tracked slots live here, sorted.
    pub fn live_slots(&self) -> impl ExactSizeIterator<Item = u32> + 'a {
        self.live.iter().map(|s| s.get(LittleEndian))
    }
}
