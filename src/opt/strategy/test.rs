use super::*;

#[test]
fn ilgen_strategy_members_support_ilgen_opts() {
    for entry in ILGEN_STRATEGY {
        match entry.step {
            Step::Opt(id) => assert!(id.caps().supports_ilgen_opts, "{}", id.name()),
            Step::Group(g) => panic!("group {} in ilgen strategy", g.name()),
        }
    }
}

#[test]
fn custom_strategy_round_trips_ids_and_must_be_done() {
    let words = [
        OptId::TreeSimplification as u32,
        OptId::DeadTreesElimination as u32 | CUSTOM_MUST_BE_DONE,
        END_CUSTOM_STRATEGY,
        OptId::Inlining as u32, // past the terminator, ignored
    ];
    let entries = decode_custom(&words).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].step, Step::Opt(OptId::TreeSimplification));
    assert!(!entries[0].must_be_done());
    assert_eq!(entries[1].step, Step::Opt(OptId::DeadTreesElimination));
    assert!(entries[1].must_be_done());
}

#[test]
fn custom_strategy_with_unknown_id_is_refused() {
    let words = [0x4242u32, END_CUSTOM_STRATEGY];
    assert!(matches!(
        decode_custom(&words),
        Err(CompilationFailure::InvalidStrategy(0x4242))
    ));
}

#[test]
fn mark_last_run_guards_are_recognized() {
    assert!(Guard::MarkLastRun.marks_last_run());
    assert!(Guard::IfEnabledMarkLastRun.marks_last_run());
    assert!(Guard::IfLoopsMarkLastRun.marks_last_run());
    assert!(!Guard::IfEnabled.marks_last_run());
}
