//! Synthetic call chains for driving the walker without executing code.
//!
//! Code addresses point into a text range that is never mapped; only the
//! stack is real memory.

use anyhow::Result;
use framewalk::environ::{
    Clause, ClauseKind, CodeInfoBuilder, FrameLayout, GcSlot, MethodDesc, MethodReturnKind,
    SafepointDesc, SavedReg, SlotFlags, SlotLocation,
};
use framewalk::*;
use std::ptr::NonNull;
use std::sync::Arc;

pub const TEXT: usize = 0x4000_0000;
pub const TEXT_LEN: usize = 0x1000;
pub const NATIVE_RA: usize = 0x1234_5678;
pub const W: usize = size_of::<usize>();

/// A 16-byte aligned stack addressed in words from its lowest address.
pub struct FakeStack {
    mem: NonNull<[u128]>,
}

impl FakeStack {
    pub fn new(words: usize) -> FakeStack {
        let mem = vec![0u128; words.div_ceil(2)].into_boxed_slice();
        FakeStack {
            mem: NonNull::from(Box::leak(mem)),
        }
    }

    pub fn len(&self) -> usize {
        self.mem.len() * 2
    }

    /// Address of word `index`.
    pub fn addr(&self, index: usize) -> usize {
        assert!(index <= self.len());
        self.mem.cast::<usize>().as_ptr() as usize + index * W
    }

    fn slot(&self, index: usize) -> *mut usize {
        assert!(index < self.len());
        unsafe { self.mem.cast::<usize>().as_ptr().add(index) }
    }

    pub fn write(&self, index: usize, value: usize) {
        unsafe { self.slot(index).write(value) }
    }

    pub fn read(&self, index: usize) -> usize {
        unsafe { self.slot(index).read() }
    }

    pub fn ptr(&self, index: usize) -> NonNull<usize> {
        NonNull::new(self.slot(index)).unwrap()
    }
}

impl Drop for FakeStack {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.mem.as_ptr())) }
    }
}

/// A thread context captured at the active frame.
pub struct Context {
    regs: NonNull<[usize; NUM_REGS]>,
}

impl Context {
    pub fn new() -> Context {
        Context {
            regs: NonNull::from(Box::leak(Box::new([0; NUM_REGS]))),
        }
    }

    pub fn set(&self, reg: u16, value: usize) {
        unsafe { (*self.regs.as_ptr())[usize::from(reg)] = value }
    }

    pub fn ptr(&self, reg: u16) -> NonNull<usize> {
        assert!(usize::from(reg) < NUM_REGS);
        unsafe { self.regs.cast::<usize>().add(usize::from(reg)) }
    }

    pub fn snapshot(&self, ip: usize, sp: usize) -> RegisterSnapshot {
        unsafe { RegisterSnapshot::from_context(ip, sp, self.regs) }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.regs.as_ptr())) }
    }
}

/// Text offsets of the methods in [`chain_image`].
pub mod method {
    /// Leaf, frame pointer frame.
    pub const LEAF: usize = 0x000;
    /// Middle, stack pointer frame of 32 bytes.
    pub const MIDDLE: usize = 0x100;
    /// Entered from native code, frame pointer frame.
    pub const ENTRY: usize = 0x200;
    /// An older activation, resumed through a transition frame.
    pub const OLDER: usize = 0x300;
    /// A funclet of `ENTRY`.
    pub const FUNCLET: usize = 0x400;
    /// Method with nested clauses and no frame.
    pub const NESTED: usize = 0x500;
}

/// Active pc in the leaf; a safe point.
pub const LEAF_PC: usize = TEXT + method::LEAF + 0x20;
/// Return address into the middle method.
pub const MIDDLE_RA: usize = TEXT + method::MIDDLE + 0x30;
/// Return address into the entry method.
pub const ENTRY_RA: usize = TEXT + method::ENTRY + 0x50;
/// Return address into the older activation.
pub const OLDER_RA: usize = TEXT + method::OLDER + 0x30;

pub const TYPE_A: usize = 0xa000;
pub const TYPE_B: usize = 0xb000;

fn slot(location: SlotLocation, flags: SlotFlags) -> GcSlot {
    GcSlot { location, flags }
}

fn safepoint(offset: u32, live: &[u32]) -> SafepointDesc {
    SafepointDesc {
        offset,
        live: live.to_vec(),
    }
}

fn clause(kind: ClauseKind, try_range: std::ops::Range<u32>, handler: u32) -> Clause {
    Clause {
        kind,
        try_range,
        handler,
        filter: (kind == ClauseKind::Filter).then_some(handler - 0x4),
        type_index: None,
    }
}

fn typed(try_range: std::ops::Range<u32>, handler: u32, type_index: u32) -> Clause {
    Clause {
        type_index: Some(type_index),
        ..clause(ClauseKind::Typed, try_range, handler)
    }
}

pub const CSR: u16 = CALLEE_SAVED_REGS[0];

/// The tables of a five-method image exercising every frame kind.
pub fn chain_image() -> Result<Vec<u8>> {
    let mut builder = CodeInfoBuilder::default();
    let range = |start: usize| start as u32..start as u32 + 0x100;

    // Leaf: saves CSR at fp - 8, keeps an object at fp - 16, and at its one
    // call site also holds references in CSR and the return register.
    let mut leaf = MethodDesc::new(range(method::LEAF));
    leaf.prolog_size = 8;
    leaf.epilogs = vec![0xf0..0x100];
    leaf.saved_regs = vec![SavedReg { reg: CSR, offset: -8 }];
    leaf.slots = vec![
        slot(SlotLocation::Fp(-16), SlotFlags::empty()),
        slot(SlotLocation::Register(CSR), SlotFlags::INTERIOR),
        slot(SlotLocation::Register(RETURN_REG), SlotFlags::empty()),
    ];
    leaf.safepoints = vec![safepoint(0x20, &[0, 1, 2]), safepoint(0x40, &[0]), safepoint(0x60, &[])];
    leaf.clauses = vec![clause(ClauseKind::Fault, 0x18..0x50, 0x80)];
    leaf.return_kind = MethodReturnKind::Object;
    builder.add_method(&leaf)?;

    // Middle: 32 byte frame, pinned untracked local at sp + 8, CSR holds a
    // reference across the call, as does the return register (dead in an
    // ancestor frame).
    let mut middle = MethodDesc::new(range(method::MIDDLE));
    middle.frame = FrameLayout::StackPointer { frame_size: 32 };
    middle.prolog_size = 4;
    middle.slots = vec![
        slot(SlotLocation::Sp(8), SlotFlags::PINNED | SlotFlags::UNTRACKED),
        slot(SlotLocation::Register(CSR), SlotFlags::empty()),
        slot(SlotLocation::Register(RETURN_REG), SlotFlags::empty()),
    ];
    middle.safepoints = vec![safepoint(0x30, &[1, 2])];
    middle.clauses = vec![
        typed(0x10..0x30, 0x90, 0),
        clause(ClauseKind::Fault, 0x10..0x40, 0xa0),
        typed(0x10..0x40, 0xb0, 1),
    ];
    builder.add_method(&middle)?;

    // Entry: entered from native code; the previous transition frame is
    // saved at fp - 8.
    let mut entry = MethodDesc::new(range(method::ENTRY));
    entry.prolog_size = 8;
    entry.reverse_pinvoke_slot = Some(-8);
    entry.slots = vec![
        slot(SlotLocation::Fp(-16), SlotFlags::empty()),
        slot(SlotLocation::CallerSp(0), SlotFlags::INTERIOR),
    ];
    entry.safepoints = vec![safepoint(0x50, &[0, 1])];
    entry.clauses = vec![
        clause(ClauseKind::Filter, 0x40..0x60, 0xc0),
        typed(0x40..0x60, 0xd0, 1),
    ];
    builder.add_method(&entry)?;

    let mut older = MethodDesc::new(range(method::OLDER));
    older.prolog_size = 8;
    older.slots = vec![slot(SlotLocation::Fp(-8), SlotFlags::empty())];
    older.safepoints = vec![safepoint(0x30, &[0])];
    older.clauses = vec![typed(0x20..0x30, 0x80, 0)];
    builder.add_method(&older)?;

    // Funclet of the entry method, addressing the parent's frame.
    let mut funclet = MethodDesc::new(range(method::FUNCLET));
    funclet.frame = FrameLayout::StackPointer { frame_size: 8 };
    funclet.funclet_parent = Some(2);
    funclet.saved_regs = vec![SavedReg { reg: FP_REG, offset: 0 }];
    funclet.slots = vec![slot(SlotLocation::Fp(-16), SlotFlags::empty())];
    funclet.safepoints = vec![safepoint(0x10, &[0])];
    builder.add_method(&funclet)?;

    // Nested clauses stored outermost first, plus a disjoint pair and two
    // clauses sharing a try range. Safe points inside and outside them.
    let mut nested = MethodDesc::new(range(method::NESTED));
    nested.frame = FrameLayout::StackPointer { frame_size: 0 };
    nested.clauses = vec![
        clause(ClauseKind::Fault, 0x10..0x80, 0xe0),
        typed(0x20..0x70, 0xe4, 0),
        clause(ClauseKind::Fault, 0x30..0x40, 0xe8),
        typed(0x30..0x40, 0xec, 1),
        clause(ClauseKind::Fault, 0x50..0x60, 0xf0),
        clause(ClauseKind::Unused, 0x90..0xa0, 0xf4),
    ];
    nested.safepoints = vec![
        safepoint(0x08, &[]),
        safepoint(0x24, &[]),
        safepoint(0x34, &[]),
        safepoint(0x48, &[]),
        safepoint(0x5c, &[]),
        safepoint(0x88, &[]),
    ];
    nested.associated_data = Some(AssociatedData::encode_unboxing_stub_target(method::LEAF as u32));
    builder.add_method(&nested)?;

    builder.finish(TEXT_LEN as u32)
}

pub fn classlib() -> Arc<ClasslibFunctions> {
    Arc::new(
        ClasslibFunctions::new()
            .with(ClasslibFunctionId::GetRuntimeException, ClasslibFunction::new(0x7000).unwrap())
            .with(ClasslibFunctionId::FailFast, ClasslibFunction::new(0x7010).unwrap()),
    )
}

pub const TYPE_HANDLES: &[usize] = &[TYPE_A, TYPE_B];

pub fn manager(code_info: &[u8]) -> Result<AotCodeManager<'_>> {
    Ok(AotCodeManager::new(TEXT..TEXT + TEXT_LEN, code_info, TYPE_HANDLES, classlib())?
        .with_os_module_handle(0x5000))
}

/// References stored on the fake stack, identifiable when reported.
pub mod refs {
    pub const LEAF_LOCAL: usize = 0x1_0001;
    pub const LEAF_CSR: usize = 0x1_0002;
    pub const LEAF_RET: usize = 0x1_0003;
    pub const MIDDLE_CSR: usize = 0x1_0004;
    pub const MIDDLE_PINNED: usize = 0x1_0005;
    pub const ENTRY_LOCAL: usize = 0x1_0006;
    pub const ENTRY_ARG: usize = 0x1_0007;
    pub const OLDER_LOCAL: usize = 0x1_0008;
    pub const OLDER_RET: usize = 0x1_0009;
}

/// Stack of leaf <- middle <- entry <- native, optionally with an older
/// managed activation below the native frames.
///
/// ```plain
/// word  contents
///  0    leaf sp
///  2    leaf local          (fp - 16)
///  3    saved CSR           (fp - 8)
///  4    caller fp           <- leaf fp
///  5    MIDDLE_RA
///  6                        <- middle sp
///  7    middle pinned local (sp + 8)
/// 10    ENTRY_RA            (sp + 32)
/// 11                        <- entry sp
/// 12    entry local         (fp - 16)
/// 13    transition frame    (fp - 8)
/// 14    0                   <- entry fp
/// 15    NATIVE_RA
/// 16    entry incoming arg  (caller sp)
/// 18                        <- older sp
/// 19    older local         (fp - 8)
/// 20    0                   <- older fp
/// 21    NATIVE_RA
/// ```
pub struct CallChain {
    pub stack: FakeStack,
    pub context: Context,
    pub transition: Option<Box<TransitionFrame>>,
}

impl CallChain {
    pub fn new(with_older_activation: bool) -> CallChain {
        let stack = FakeStack::new(24);
        let context = Context::new();

        stack.write(2, refs::LEAF_LOCAL);
        stack.write(3, refs::MIDDLE_CSR);
        stack.write(4, stack.addr(14));
        stack.write(5, MIDDLE_RA);
        stack.write(7, refs::MIDDLE_PINNED);
        stack.write(10, ENTRY_RA);
        stack.write(12, refs::ENTRY_LOCAL);
        stack.write(14, 0);
        stack.write(15, NATIVE_RA);
        stack.write(16, refs::ENTRY_ARG);
        stack.write(19, refs::OLDER_LOCAL);
        stack.write(20, 0);
        stack.write(21, NATIVE_RA);

        context.set(FP_REG, stack.addr(4));
        context.set(CSR, refs::LEAF_CSR);
        context.set(RETURN_REG, refs::LEAF_RET);

        let transition = with_older_activation.then(|| {
            let mut frame = Box::new(TransitionFrame::new(OLDER_RA, stack.addr(20), stack.addr(18)));
            frame.preserve(RETURN_REG, refs::OLDER_RET);
            frame.set_return_value_kind(ReturnValueKind::Object);
            frame
        });
        let saved = transition
            .as_ref()
            .map_or(0, |frame| &**frame as *const TransitionFrame as usize);
        stack.write(13, saved);

        CallChain {
            stack,
            context,
            transition,
        }
    }

    /// Snapshot of the leaf frame stopped at `LEAF_PC`.
    pub fn snapshot(&self) -> RegisterSnapshot {
        self.at(LEAF_PC)
    }

    /// Snapshot of the leaf frame stopped at `pc`.
    pub fn at(&self, pc: usize) -> RegisterSnapshot {
        self.context.snapshot(pc, self.stack.addr(0))
    }

    pub fn transition_ptr(&self) -> Option<NonNull<TransitionFrame>> {
        self.transition.as_deref().map(NonNull::from)
    }
}
