use gimli::X86_64;
use prism_unwind::lsda::{DW_EH_PE_UDATA4, LsdaBuilder};
use prism_unwind::stackmap::{StackMapEncoder, decode};
use prism_unwind::{
    Action, AddressRange, CodeRegion, ExcInfo, FrameClassifier, FrameInfo, FrameKind, FrameVisit,
    PythonFrame, RegionTable, RegisterFile, ReturnContext, RuntimeHooks, SnapshotCursor,
    SnapshotFrame, SnapshotMemory, Statement, Tier, UnwindConfig, UnwindEngine, UnwindError,
    ValueLocation, error::fatal_report,
};
use std::cell::RefCell;
use std::sync::Arc;

const INTERP: AddressRange = AddressRange::new(0x5000, 0x6000);
const GEN_ENTRY: AddressRange = AddressRange::new(0x6000, 0x6040);

// Test hooks: function ids come from the region, interpreted frames are
// named by base pointer.
#[derive(Default)]
struct TestHooks {
    cleaned: RefCell<Vec<u64>>,
    contexts: Vec<(u64, u64)>,
}

impl RuntimeHooks for TestHooks {
    fn frame_info(&self, frame: &PythonFrame) -> Option<FrameInfo> {
        match frame.region() {
            Some(region) => Some(FrameInfo::new(
                region.function_id(),
                format!("compiled_{}", region.function_id()),
                "app.py",
            )),
            None => Some(FrameInfo::new(0, format!("interp_{:x}", frame.bp()), "app.py")),
        }
    }

    fn current_statement(&self, frame: &PythonFrame) -> Option<Statement> {
        Some(Statement {
            id: 1,
            line: (frame.ip() & 0xff) as u32,
        })
    }

    fn cleanup_frame(&self, frame: &PythonFrame) {
        self.cleaned.borrow_mut().push(frame.bp());
    }

    fn generator_return_context(&self, bp: u64) -> Option<u64> {
        self.contexts.iter().find(|(b, _)| *b == bp).map(|(_, c)| *c)
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine_with(regions: Vec<CodeRegion>, hooks: TestHooks) -> UnwindEngine<TestHooks> {
    let table = Arc::new(RegionTable::new());
    for region in regions {
        table.register(region).unwrap();
    }
    let classifier = FrameClassifier::new(table)
        .with_interpreter(INTERP)
        .with_generator_entry(GEN_ENTRY);
    UnwindEngine::new(classifier, hooks, UnwindConfig::default())
}

// =============================================================================
// Classification
// =============================================================================

#[test]
fn test_classify_registered_region() {
    let engine = engine_with(
        vec![CodeRegion::new(0x1000, 0x100, Tier::Optimized, 1)],
        TestHooks::default(),
    );
    assert!(matches!(engine.classify(0x1050), FrameKind::Compiled(_)));
    assert_eq!(engine.classify(0x2000), FrameKind::Foreign);
    assert_eq!(engine.classify(0x5100), FrameKind::Interpreted);
    assert_eq!(engine.classify(0x6010), FrameKind::GeneratorEntry);
}

#[test]
fn test_classify_is_stable_until_retire() {
    let engine = engine_with(
        vec![CodeRegion::new(0x1000, 0x100, Tier::Baseline, 1)],
        TestHooks::default(),
    );
    assert_eq!(engine.classify(0x1010), engine.classify(0x1010));
    engine.regions().retire(0x1000).unwrap();
    assert_eq!(engine.classify(0x1010), FrameKind::Foreign);
}

// =============================================================================
// Stack maps
// =============================================================================

#[test]
fn test_direct_location_reads_frame_slot() {
    let mut enc = StackMapEncoder::new();
    enc.add_function(0x1000, 16);
    enc.add_record(
        1,
        0x20,
        &[ValueLocation::Direct {
            reg: X86_64::RBP,
            offset: 16,
        }],
        &[],
    );
    let map = decode(&enc.finish()).unwrap();
    let record = map.record_at_offset(0x20).unwrap();

    let mut regs = RegisterFile::new();
    regs.set(X86_64::RBP, 0x7000).unwrap();
    let mut memory = SnapshotMemory::new();
    memory.write_word(0x7010, 0x1122_3344_5566_7788);

    assert_eq!(
        record.locations[0].resolve(&regs, map.constants(), &memory),
        Ok(0x1122_3344_5566_7788)
    );
}

// =============================================================================
// Walking
// =============================================================================

#[test]
fn test_walk_compiled_interpreted_foreign() {
    let engine = engine_with(
        vec![CodeRegion::new(0x1000, 0x100, Tier::Optimized, 1)],
        TestHooks::default(),
    );
    let mut cursor = SnapshotCursor::new(vec![
        SnapshotFrame::new(0x1020, 0x7000, 0x7100),
        SnapshotFrame::new(0x5020, 0x7110, 0x7200),
        SnapshotFrame::new(0x9020, 0x7210, 0x7300),
    ]);

    let mut visited = Vec::new();
    engine
        .for_each_frame(&mut cursor, |frame| {
            visited.push((frame.is_compiled(), frame.bp()));
            FrameVisit::Continue
        })
        .unwrap();
    assert_eq!(visited, vec![(true, 0x7100), (false, 0x7200)]);
}

#[test]
fn test_traceback_through_generator() {
    init_logging();
    let hooks = TestHooks {
        contexts: vec![(0x7200, 0x9000)],
        ..Default::default()
    };
    let engine = engine_with(vec![], hooks);

    let mut memory = SnapshotMemory::new();
    memory.write_context(
        0x9000,
        &ReturnContext {
            rbx: 5,
            rbp: 0x8100,
            rip: 0x5033,
            ..Default::default()
        },
    );
    let mut cursor = SnapshotCursor::with_memory(
        vec![
            SnapshotFrame::new(0x5011, 0x7000, 0x7100),
            SnapshotFrame::new(0x6008, 0x7110, 0x7200),
            SnapshotFrame::new(0x5022, 0x7210, 0x7300),
            SnapshotFrame::new(0x5033, 0x8000, 0x8100),
        ],
        memory,
    );

    let traceback = engine.current_traceback(&mut cursor).unwrap();
    let names: Vec<&str> = traceback.entries().iter().map(|e| &*e.name).collect();
    assert_eq!(names, vec!["interp_7100", "interp_8100"]);
    assert_eq!(
        traceback.to_string(),
        "Traceback (most recent call last):\n\
         \x20 File \"app.py\", line 51, in interp_8100\n\
         \x20 File \"app.py\", line 17, in interp_7100\n"
    );
}

// =============================================================================
// Unwinding
// =============================================================================

fn landing_regions() -> Vec<CodeRegion> {
    let mut inner = LsdaBuilder::new(DW_EH_PE_UDATA4);
    inner.call_site(0x10, 0x10, Some(0xa0), None);

    let mut outer = LsdaBuilder::new(DW_EH_PE_UDATA4);
    let chain = outer.action_chain(&[0, 0, 3]);
    outer.call_site(0x00, 0x10, None, None);
    outer.call_site(0x30, 0x10, Some(0xc0), Some(chain));

    vec![
        CodeRegion::new(0x1000, 0x100, Tier::Baseline, 1).with_lsda(inner.finish()),
        CodeRegion::new(0x2000, 0x100, Tier::Optimized, 2).with_lsda(outer.finish()),
    ]
}

#[test]
fn test_full_episode_cleanup_then_catch() {
    init_logging();
    let engine = engine_with(landing_regions(), TestHooks::default());
    let mut session = engine.new_session();
    let exc = ExcInfo::new(1, 0xABC0, 0);

    let mut cursor = SnapshotCursor::new(vec![
        SnapshotFrame::new(0x9100, 0x6e00, 0x6e80),
        SnapshotFrame::new(0x1015, 0x7000, 0x7100),
        SnapshotFrame::new(0x5040, 0x7110, 0x7200),
        SnapshotFrame::new(0x2035, 0x7210, 0x7300),
    ]);
    let landed = unsafe {
        engine
            .driver()
            .try_raise_exception(&mut cursor, &mut session, exc)
    }
    .unwrap();
    assert_eq!((landed.ip, landed.action), (0x10a0, Action::Cleanup));
    let payload = cursor.landing().unwrap().regs.get(X86_64::RAX).unwrap();
    assert_eq!(payload, session.exception_address());
    // SAFETY: the session is live and holds the exception.
    assert_eq!(unsafe { *(payload as *const ExcInfo) }, exc);

    let mut after = cursor.after_landing().unwrap();
    let landed = unsafe {
        engine
            .driver()
            .try_resume_unwind_from_cleanup(&mut after, &mut session)
    }
    .unwrap();
    assert_eq!((landed.ip, landed.selector()), (0x20c0, 3));
    assert_eq!(landed.bp, 0x7300);

    assert!(!session.is_active());
    assert_eq!(session.traceback().len(), 3);
    assert_eq!(*engine.hooks().cleaned.borrow(), vec![0x7100, 0x7200]);

    let stats = engine.stats();
    assert_eq!(stats.sessions_begun(), 1);
    assert_eq!(stats.sessions_ended(), 1);
    assert_eq!(stats.cleanup_landings(), 1);
    assert_eq!(stats.catch_landings(), 1);
}

#[test]
fn test_outer_frame_with_quiet_call_site() {
    let engine = engine_with(landing_regions(), TestHooks::default());
    let mut session = engine.new_session();
    let mut cursor = SnapshotCursor::new(vec![
        SnapshotFrame::new(0x2008, 0x7000, 0x7100),
        SnapshotFrame::new(0x2035, 0x7110, 0x7200),
    ]);
    let landed = unsafe {
        engine
            .driver()
            .try_raise_exception(&mut cursor, &mut session, ExcInfo::new(1, 2, 3))
    }
    .unwrap();
    assert_eq!(landed.bp, 0x7200);
}

#[test]
fn test_landing_pad_outside_function_rejected() {
    let mut lsda = LsdaBuilder::new(DW_EH_PE_UDATA4);
    lsda.call_site(0x10, 0x10, Some(0x1000), None);
    let engine = engine_with(
        vec![CodeRegion::new(0x1000, 0x100, Tier::Baseline, 1).with_lsda(lsda.finish())],
        TestHooks::default(),
    );
    let mut session = engine.new_session();
    let mut cursor = SnapshotCursor::new(vec![SnapshotFrame::new(0x1015, 0x7000, 0x7100)]);

    let err = unsafe {
        engine
            .driver()
            .try_raise_exception(&mut cursor, &mut session, ExcInfo::new(1, 2, 3))
    }
    .unwrap_err();
    assert!(matches!(err, UnwindError::LandingPadOutOfRange { .. }));
    assert!(cursor.landing().is_none());

    let report = fatal_report(&err, Some(&session), Some(&**engine.regions()));
    assert!(report.contains("landing pad 0x2000"));
    assert!(report.contains("code regions: 1"));

    let region = engine.regions().lookup(0x1000).unwrap();
    assert!(region.validate().is_err());
}

#[test]
fn test_unhandled_exception_exhausts_stack() {
    let engine = engine_with(vec![], TestHooks::default());
    let mut session = engine.new_session();
    let mut cursor = SnapshotCursor::new(vec![
        SnapshotFrame::new(0x5010, 0x7000, 0x7100),
        SnapshotFrame::new(0x5020, 0x7110, 0x7200),
    ]);
    let err = unsafe {
        engine
            .driver()
            .try_raise_exception(&mut cursor, &mut session, ExcInfo::new(1, 2, 3))
    };
    assert_eq!(err, Err(UnwindError::NoHandler { frames: 2 }));
    assert_eq!(session.traceback().len(), 2);
}
