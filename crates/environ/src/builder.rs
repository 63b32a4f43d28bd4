//! Construction of code-info sections.

use crate::code_info::{
    CodeInfo, EpilogRecord, I32, MethodRecord, NONE, SafepointRecord, SavedRegRecord, U32,
    encode_clause, encode_slot,
};
use crate::{Clause, FrameLayout, GcSlot, MethodFlags, MethodReturnKind, SavedReg};
use anyhow::{Result, bail};
use core::ops::Range;
use object::LittleEndian;

/// Description of one compiled method, as handed to [`CodeInfoBuilder`].
///
/// All offsets except `range` are relative to the start of the method.
#[derive(Clone, Debug)]
pub struct MethodDesc {
    /// Text-section range of the method's code.
    pub range: Range<u32>,
    /// Frame layout.
    pub frame: FrameLayout,
    /// Size of the prologue in bytes.
    pub prolog_size: u32,
    /// Epilog ranges.
    pub epilogs: Vec<Range<u32>>,
    /// Registers spilled by the prologue.
    pub saved_regs: Vec<SavedReg>,
    /// For funclets, the index of the method owning the frame.
    pub funclet_parent: Option<u32>,
    /// For methods entered from native code, the frame-pointer relative slot
    /// holding the previous transition frame.
    pub reverse_pinvoke_slot: Option<i32>,
    /// What the method leaves in the return register.
    pub return_kind: MethodReturnKind,
    /// Every location that may hold a GC reference.
    pub slots: Vec<GcSlot>,
    /// Safepoints, sorted by offset.
    pub safepoints: Vec<SafepointDesc>,
    /// Exception-handling clauses in any order.
    pub clauses: Vec<Clause>,
    /// Optional self-describing side blob.
    pub associated_data: Option<Vec<u8>>,
}

impl MethodDesc {
    /// A method with a frame-pointer frame and no GC or EH information.
    pub fn new(range: Range<u32>) -> MethodDesc {
        MethodDesc {
            range,
            frame: FrameLayout::FramePointer,
            prolog_size: 0,
            epilogs: Vec::new(),
            saved_regs: Vec::new(),
            funclet_parent: None,
            reverse_pinvoke_slot: None,
            return_kind: MethodReturnKind::Scalar,
            slots: Vec::new(),
            safepoints: Vec::new(),
            clauses: Vec::new(),
            associated_data: None,
        }
    }
}

/// A safepoint and the tracked slots live at it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SafepointDesc {
    /// Method-relative offset.
    pub offset: u32,
    /// Indices into [`MethodDesc::slots`].
    pub live: Vec<u32>,
}

/// Collector for the code-info section of one code image.
///
/// Methods must be added in ascending text order. The section is validated
/// with [`CodeInfo::parse`] before it is handed out, so a successfully built
/// section is always accepted at load time.
#[derive(Clone, Debug, Default)]
pub struct CodeInfoBuilder {
    methods: Vec<MethodRecord>,
    saved_regs: Vec<SavedRegRecord>,
    epilogs: Vec<EpilogRecord>,
    slots: Vec<crate::code_info::GcSlotRecord>,
    safepoints: Vec<SafepointRecord>,
    live: Vec<U32>,
    clauses: Vec<crate::code_info::ClauseRecord>,
    associated_data: Vec<u8>,
    last_end: u32,
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap()
}

impl CodeInfoBuilder {
    /// Append a method, returning its index.
    pub fn add_method(&mut self, desc: &MethodDesc) -> Result<u32> {
        if desc.range.start < self.last_end {
            bail!(
                "methods must be added in ascending order: {:#x} < {:#x}",
                desc.range.start,
                self.last_end
            );
        }
        self.last_end = desc.range.end;

        let mut flags = desc.return_kind.to_flags();
        let frame_size = match desc.frame {
            FrameLayout::FramePointer => {
                flags |= MethodFlags::FRAME_POINTER;
                0
            }
            FrameLayout::StackPointer { frame_size } => frame_size,
        };
        if desc.funclet_parent.is_some() {
            flags |= MethodFlags::FUNCLET;
        }
        if desc.reverse_pinvoke_slot.is_some() {
            flags |= MethodFlags::REVERSE_PINVOKE;
        }

        for reg in &desc.saved_regs {
            self.saved_regs.push(SavedRegRecord {
                reg: U32::new(LittleEndian, u32::from(reg.reg)),
                offset: I32::new(LittleEndian, reg.offset),
            });
        }
        for epilog in &desc.epilogs {
            self.epilogs.push(EpilogRecord {
                start: U32::new(LittleEndian, epilog.start),
                size: U32::new(LittleEndian, epilog.end.saturating_sub(epilog.start)),
            });
        }
        self.slots.extend(desc.slots.iter().map(encode_slot));
        for safepoint in &desc.safepoints {
            self.live
                .extend(safepoint.live.iter().map(|s| U32::new(LittleEndian, *s)));
            self.safepoints.push(SafepointRecord {
                offset: U32::new(LittleEndian, safepoint.offset),
                live_end: U32::new(LittleEndian, len_u32(self.live.len())),
            });
        }
        self.clauses.extend(desc.clauses.iter().map(encode_clause));
        if let Some(data) = &desc.associated_data {
            self.associated_data.extend_from_slice(data);
        }

        let index = len_u32(self.methods.len());
        self.methods.push(MethodRecord {
            start: U32::new(LittleEndian, desc.range.start),
            end: U32::new(LittleEndian, desc.range.end),
            flags: U32::new(LittleEndian, flags.bits()),
            parent: U32::new(LittleEndian, desc.funclet_parent.unwrap_or(NONE)),
            prolog_size: U32::new(LittleEndian, desc.prolog_size),
            frame_size: U32::new(LittleEndian, frame_size),
            reverse_pinvoke_slot: I32::new(LittleEndian, desc.reverse_pinvoke_slot.unwrap_or(0)),
            saved_regs_end: U32::new(LittleEndian, len_u32(self.saved_regs.len())),
            epilogs_end: U32::new(LittleEndian, len_u32(self.epilogs.len())),
            slots_end: U32::new(LittleEndian, len_u32(self.slots.len())),
            safepoints_end: U32::new(LittleEndian, len_u32(self.safepoints.len())),
            clauses_end: U32::new(LittleEndian, len_u32(self.clauses.len())),
            associated_data_end: U32::new(LittleEndian, len_u32(self.associated_data.len())),
        });
        log::trace!("code info: added method {index} at {:#x?}", desc.range);
        Ok(index)
    }

    /// Serialize the section, taking a closure to consume slices.
    pub fn serialize<F: FnMut(&[u8])>(&self, mut f: F) {
        for count in [
            self.methods.len(),
            self.saved_regs.len(),
            self.epilogs.len(),
            self.slots.len(),
            self.safepoints.len(),
            self.live.len(),
            self.clauses.len(),
            self.associated_data.len(),
        ] {
            f(&len_u32(count).to_le_bytes());
        }
        f(object::bytes_of_slice(&self.methods));
        f(object::bytes_of_slice(&self.saved_regs));
        f(object::bytes_of_slice(&self.epilogs));
        f(object::bytes_of_slice(&self.slots));
        f(object::bytes_of_slice(&self.safepoints));
        f(object::bytes_of_slice(&self.live));
        f(object::bytes_of_slice(&self.clauses));
        f(&self.associated_data);
    }

    /// Serialize and validate the section for a text section of `text_len`
    /// bytes.
    pub fn finish(&self, text_len: u32) -> Result<Vec<u8>> {
        let mut bytes = vec![];
        self.serialize(|slice| bytes.extend_from_slice(slice));
        CodeInfo::parse(&bytes, text_len)?;
        Ok(bytes)
    }
}
