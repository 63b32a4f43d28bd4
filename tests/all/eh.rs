use crate::fake_stack::*;
use anyhow::Result;
use framewalk::*;

struct Matcher {
    thrown: usize,
    filter_result: bool,
    filters_run: Vec<usize>,
}

impl Matcher {
    fn new(thrown: usize, filter_result: bool) -> Matcher {
        Matcher {
            thrown,
            filter_result,
            filters_run: Vec::new(),
        }
    }
}

impl ExceptionMatcher for Matcher {
    fn matches_type(&mut self, target_type: usize) -> bool {
        target_type == self.thrown
    }

    fn run_filter(&mut self, clause: &EhClause, frame: &DispatchFrame<'_>) -> bool {
        assert_eq!(clause.kind, EhClauseKind::Filter);
        assert!(!frame.code_manager().is_funclet(frame.method_info()));
        self.filters_run.push(clause.filter_address.unwrap());
        self.filter_result
    }
}

fn registry<'a>(manager: &'a AotCodeManager<'a>) -> Result<CodeManagerRegistry<'a>> {
    let registry = CodeManagerRegistry::new();
    registry.register(manager.text_range(), manager)?;
    Ok(registry)
}

/// Handler addresses of the fault clauses run by the second pass.
fn faults_run(
    registry: &CodeManagerRegistry<'_>,
    chain: &CallChain,
    handler: Option<&Handler>,
) -> Vec<(usize, usize)> {
    let mut run = Vec::new();
    unsafe {
        run_fault_clauses(registry, chain.snapshot(), &WalkConfig::new(), handler, |clause, frame| {
            run.push((frame.index(), clause.handler_address));
        });
    }
    run
}

#[test]
fn enumerate_innermost_first() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;

    let mut info = MethodInfo::new();
    assert!(manager.find_method_info(TEXT + method::NESTED + 0x34, &mut info));
    let mut state = EhEnumState::new();
    assert_eq!(manager.eh_enum_init(&info, &mut state), Some(TEXT + method::NESTED));
    let mut clauses = Vec::new();
    while let Some(clause) = manager.eh_enum_next(&mut state) {
        clauses.push((clause.kind, clause.try_start_offset..clause.try_end_offset));
    }
    assert_eq!(
        clauses,
        [
            (EhClauseKind::Fault, 0x30..0x40),
            (EhClauseKind::Typed, 0x30..0x40),
            (EhClauseKind::Fault, 0x50..0x60),
            (EhClauseKind::Typed, 0x20..0x70),
            (EhClauseKind::Fault, 0x10..0x80),
            (EhClauseKind::Unused, 0x90..0xa0),
        ]
    );
    assert_eq!(manager.eh_enum_next(&mut state), None);

    // A method without clauses has nothing to enumerate.
    assert!(manager.find_method_info(TEXT + method::FUNCLET, &mut info));
    assert_eq!(manager.eh_enum_init(&info, &mut EhEnumState::new()), None);
    Ok(())
}

#[test]
fn clause_addresses() -> Result<()> {
    let code_info = chain_image()?;
    let manager = manager(&code_info)?;

    let mut info = MethodInfo::new();
    assert!(manager.find_method_info(ENTRY_RA, &mut info));
    let mut state = EhEnumState::new();
    let start = manager.eh_enum_init(&info, &mut state).unwrap();
    let filter = manager.eh_enum_next(&mut state).unwrap();
    assert_eq!(filter.kind, EhClauseKind::Filter);
    assert_eq!(filter.handler_address, start + 0xc0);
    assert_eq!(filter.filter_address, Some(start + 0xbc));
    assert_eq!(filter.target_type, None);
    let typed = manager.eh_enum_next(&mut state).unwrap();
    assert_eq!(typed.kind, EhClauseKind::Typed);
    assert_eq!(typed.target_type, Some(TYPE_B));
    assert_eq!(typed.filter_address, None);
    assert!(typed.covers(0x4f));
    assert!(!typed.covers(0x60));
    Ok(())
}

#[test]
fn catch_in_ancestor_frame() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(false);

    let mut matcher = Matcher::new(TYPE_B, false);
    let handler = unsafe { Handler::find(&registry, chain.snapshot(), &WalkConfig::new(), &mut matcher) }
        .expect("exception is caught");
    assert_eq!(handler.frame_index, 2);
    assert_eq!(handler.pc, TEXT + method::MIDDLE + 0xb0);
    assert_eq!(handler.sp, chain.stack.addr(6));
    assert_eq!(handler.fp, None);
    assert_eq!(handler.clause.target_type, Some(TYPE_B));
    assert!(matcher.filters_run.is_empty());

    // Fault clauses of the leaf and the middle frame's fault clause nested
    // inside the catching clause run; nothing older does.
    assert_eq!(
        faults_run(&registry, &chain, Some(&handler)),
        [(1, TEXT + method::LEAF + 0x80), (2, TEXT + method::MIDDLE + 0xa0)]
    );
    Ok(())
}

#[test]
fn innermost_clause_wins() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(false);

    let mut matcher = Matcher::new(TYPE_A, true);
    let handler = unsafe { Handler::find(&registry, chain.snapshot(), &WalkConfig::new(), &mut matcher) }.unwrap();
    assert_eq!(handler.frame_index, 2);
    assert_eq!(handler.pc, TEXT + method::MIDDLE + 0x90);
    assert_eq!(faults_run(&registry, &chain, Some(&handler)), [(1, TEXT + method::LEAF + 0x80)]);
    Ok(())
}

#[test]
fn filter_runs_once() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(true);

    let mut matcher = Matcher::new(0xc000, true);
    let handler = unsafe { Handler::find(&registry, chain.snapshot(), &WalkConfig::new(), &mut matcher) }.unwrap();
    assert_eq!(matcher.filters_run, [TEXT + method::ENTRY + 0xbc]);
    assert_eq!(handler.frame_index, 3);
    assert_eq!(handler.clause.kind, EhClauseKind::Filter);
    assert_eq!(handler.pc, TEXT + method::ENTRY + 0xc0);
    assert_eq!(handler.sp, chain.stack.addr(11));
    assert_eq!(handler.fp, Some(chain.stack.addr(14)));
    Ok(())
}

#[test]
fn catch_in_older_activation() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(true);

    // Start the dispatch at the entry frame so the middle frame's typed
    // clauses are not in the way.
    let mut iter = unsafe { StackFrameIterator::new(&registry, chain.snapshot(), &WalkConfig::new()) };
    iter.next();
    iter.next();
    let regs = iter.regs().clone();

    let mut matcher = Matcher::new(TYPE_A, false);
    let handler = unsafe { Handler::find(&registry, regs, &WalkConfig::new(), &mut matcher) }.unwrap();
    assert_eq!(matcher.filters_run.len(), 1);
    assert_eq!(handler.frame_index, 2);
    assert_eq!(handler.pc, TEXT + method::OLDER + 0x80);
    assert_eq!(handler.sp, chain.stack.addr(18));
    assert_eq!(handler.fp, Some(chain.stack.addr(20)));
    Ok(())
}

#[test]
fn unhandled_exception_runs_every_fault() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let manager = manager(&code_info)?;
    let registry = registry(&manager)?;
    let chain = CallChain::new(true);

    let mut matcher = Matcher::new(0xc000, false);
    let handler = unsafe { Handler::find(&registry, chain.snapshot(), &WalkConfig::new(), &mut matcher) };
    assert_eq!(handler, None);
    assert_eq!(matcher.filters_run.len(), 1);
    assert_eq!(
        faults_run(&registry, &chain, None),
        [(1, TEXT + method::LEAF + 0x80), (2, TEXT + method::MIDDLE + 0xa0)]
    );
    Ok(())
}
