use crate::fake_stack::*;
use anyhow::Result;
use framewalk::*;
use std::collections::HashMap;
use std::ptr::NonNull;

/// Collects reported roots, failing the test on duplicates.
#[derive(Default)]
struct Roots(HashMap<usize, (usize, GcRefFlags)>);

impl Roots {
    fn reporter(&mut self) -> impl FnMut(NonNull<usize>, GcRefFlags) + '_ {
        move |slot, flags| {
            let value = unsafe { slot.as_ptr().read() };
            let previous = self.0.insert(slot.as_ptr() as usize, (value, flags));
            assert!(previous.is_none(), "slot {slot:p} reported twice");
        }
    }

    fn values(&self) -> HashMap<usize, GcRefFlags> {
        self.0.values().copied().collect()
    }
}

fn registry<'a>(manager: &'a AotCodeManager<'a>) -> Result<CodeManagerRegistry<'a>> {
    let registry = CodeManagerRegistry::new();
    registry.register(manager.text_range(), manager)?;
    Ok(registry)
}

#[test]
fn report_every_frame() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(false);

    let mut roots = Roots::default();
    let frames = unsafe {
        enumerate_stack_roots(&registry, chain.snapshot(), &WalkConfig::new(), &mut roots.reporter())
    };
    assert_eq!(frames, 3);

    let expected = HashMap::from([
        (chain.stack.addr(2), (refs::LEAF_LOCAL, GcRefFlags::empty())),
        (chain.context.ptr(CSR).as_ptr() as usize, (refs::LEAF_CSR, GcRefFlags::INTERIOR)),
        (chain.context.ptr(RETURN_REG).as_ptr() as usize, (refs::LEAF_RET, GcRefFlags::empty())),
        // The middle frame's return register is dead across its call.
        (chain.stack.addr(3), (refs::MIDDLE_CSR, GcRefFlags::empty())),
        (chain.stack.addr(7), (refs::MIDDLE_PINNED, GcRefFlags::PINNED)),
        (chain.stack.addr(12), (refs::ENTRY_LOCAL, GcRefFlags::empty())),
        (chain.stack.addr(16), (refs::ENTRY_ARG, GcRefFlags::INTERIOR)),
    ]);
    assert_eq!(roots.0, expected);
    Ok(())
}

#[test]
fn report_across_transition_frames() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(true);

    let mut roots = Roots::default();
    let frames = unsafe {
        enumerate_stack_roots(&registry, chain.snapshot(), &WalkConfig::new(), &mut roots.reporter())
    };
    assert_eq!(frames, 4);
    let values = roots.values();
    assert_eq!(values.len(), 9);
    assert_eq!(values[&refs::OLDER_LOCAL], GcRefFlags::empty());
    assert_eq!(values[&refs::OLDER_RET], GcRefFlags::empty());
    assert_eq!(values[&refs::ENTRY_ARG], GcRefFlags::INTERIOR);
    Ok(())
}

#[test]
fn report_from_parked_thread() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let mut chain = CallChain::new(true);
    chain
        .transition
        .as_mut()
        .unwrap()
        .set_return_value_kind(ReturnValueKind::Byref);

    let frame = chain.transition_ptr().unwrap();
    let mut roots = Roots::default();
    let frames = unsafe {
        enumerate_roots_from_transition_frame(&registry, frame, &WalkConfig::new(), &mut roots.reporter())
    };
    assert_eq!(frames, 1);
    assert_eq!(
        roots.values(),
        HashMap::from([
            (refs::OLDER_RET, GcRefFlags::INTERIOR),
            (refs::OLDER_LOCAL, GcRefFlags::empty()),
        ])
    );
    Ok(())
}

#[test]
fn every_safe_point_enumerates() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(false);

    for offset in 0..0x100 {
        let pc = TEXT + method::LEAF + offset;
        if !manager.is_safe_point(pc) {
            continue;
        }
        let mut roots = Roots::default();
        let regs = chain.at(pc);
        let iter = unsafe { StackFrameIterator::new(&registry, regs, &WalkConfig::new()) };
        let leaf = iter.code_manager().unwrap();
        leaf.enum_gc_refs(iter.method_info(), pc, iter.regs(), &mut roots.reporter(), true);
        let values = roots.values();
        assert!(values.contains_key(&refs::LEAF_LOCAL) || offset == 0x60);
        assert_eq!(values.contains_key(&refs::LEAF_RET), offset == 0x20);
    }
    assert!(!manager.is_safe_point(TEXT + method::LEAF + 0x21));
    assert!(!manager.is_safe_point(NATIVE_RA));
    Ok(())
}

#[test]
fn safe_points_are_unwindable() -> Result<()> {
    let code_info = chain_image()?;
    let manager = manager(&code_info)?;

    let safe_points = (TEXT..TEXT + TEXT_LEN)
        .filter(|&pc| manager.is_safe_point(pc))
        .inspect(|&pc| assert!(manager.is_unwindable(pc), "safe point {pc:#x} is not unwindable"))
        .count();
    assert_eq!(safe_points, 13);
    Ok(())
}

#[test]
fn conservative_range_of_active_frame() -> Result<()> {
    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(false);

    let mut iter = unsafe { StackFrameIterator::new(&registry, chain.snapshot(), &WalkConfig::new()) };
    assert_eq!(conservative_scan_range(&iter), chain.stack.addr(0)..chain.stack.addr(5));
    iter.next();
    assert_eq!(conservative_scan_range(&iter), chain.stack.addr(6)..chain.stack.addr(10));
    iter.next();
    assert_eq!(conservative_scan_range(&iter), chain.stack.addr(11)..chain.stack.addr(13));
    iter.next();
    assert!(conservative_scan_range(&iter).is_empty());
    Ok(())
}

#[test]
#[should_panic(expected = "not a safe point")]
fn active_frame_must_be_at_safe_point() {
    let code_info = chain_image().unwrap();
    let manager = manager(&code_info).unwrap();
    let registry = registry(&manager).unwrap();
    let chain = CallChain::new(false);

    let mut reporter = |_: NonNull<usize>, _: GcRefFlags| {};
    unsafe {
        enumerate_stack_roots(&registry, chain.at(LEAF_PC + 1), &WalkConfig::new(), &mut reporter);
    }
}
