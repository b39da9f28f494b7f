use std::cell::Cell;
use std::rc::Rc;

use super::*;
use crate::compile::{Compilation, CompilationFailure, Hotness, Options};
use crate::il::{Method, NodeId, Opcode, SymKind};

fn entry(id: OptId, guard: Guard) -> StrategyEntry {
    StrategyEntry { step: Step::Opt(id), guard, must_be_done: false }
}

fn group_entry(id: OptGroup, guard: Guard) -> StrategyEntry {
    StrategyEntry { step: Step::Group(id), guard, must_be_done: false }
}

struct Nop;

impl OptimizationPass for Nop {
    fn perform(&mut self, _ctx: &mut OptContext<'_>) -> i32 {
        0
    }
}

/// Counts whole-method invocations through a shared cell.
struct Counting(Rc<Cell<u32>>);

impl OptimizationPass for Counting {
    fn perform(&mut self, _ctx: &mut OptContext<'_>) -> i32 {
        self.0.set(self.0.get() + 1);
        0
    }
}

fn counting_factory(counter: &Rc<Cell<u32>>) -> PassFactory {
    let counter = Rc::clone(counter);
    Box::new(move || Box::new(Counting(Rc::clone(&counter))))
}

/// `add(const a, const b)` under a store becomes `const (a + b)`.
struct FoldConstants;

impl OptimizationPass for FoldConstants {
    fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32 {
        let method = ctx.method_mut();
        let Some(block) = method.cfg().entry() else {
            return 0;
        };
        let roots = method.cfg().block(block).trees.clone();
        let mut folded = 0;
        for root in roots {
            let children = method.node(root).children.clone();
            for child in children {
                let (lhs, rhs) = {
                    let node = method.node(child);
                    if !matches!(node.op, Opcode::IAdd) || node.children.len() != 2 {
                        continue;
                    }
                    (node.children[0], node.children[1])
                };
                let (Opcode::IConst(a), Opcode::IConst(b)) =
                    (method.node(lhs).op.clone(), method.node(rhs).op.clone())
                else {
                    continue;
                };
                method.node_mut(child).op = Opcode::IConst(a + b);
                method.node_mut(child).children.clear();
                method.release_node(lhs);
                method.release_node(rhs);
                folded += 1;
            }
        }
        folded
    }
}

/// One block holding a bare return, enough for tree-consuming passes to
/// fire.
fn method_with_entry_tree() -> Method {
    let mut method = Method::new();
    let block = method.cfg_mut().add_block();
    let ret = method.create_node(Opcode::Return, vec![]);
    method.cfg_mut().block_mut(block).trees.push(ret);
    method
}

fn one_block_add_method() -> (Method, NodeId) {
    let mut method = Method::new();
    let t = method.add_symref(SymKind::Auto);
    let block = method.cfg_mut().add_block();
    let lhs = method.create_node(Opcode::IConst(2), vec![]);
    let rhs = method.create_node(Opcode::IConst(3), vec![]);
    let add = method.create_node(Opcode::IAdd, vec![lhs, rhs]);
    let store = method.create_node(Opcode::Store(t), vec![add]);
    method.cfg_mut().block_mut(block).trees.push(store);
    (method, add)
}

#[test]
fn constant_folding_through_a_single_pass_strategy() {
    let (method, add) = one_block_add_method();
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [entry(OptId::TreeSimplification, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::TreeSimplification, Box::new(|| Box::new(FoldConstants)));

    let nodes_before = comp.method().node_count();
    optimizer.optimize(&mut comp).unwrap();

    assert!(matches!(comp.method().node(add).op, Opcode::IConst(5)));
    assert!(comp.method().node_count() <= nodes_before - 1);
    assert_eq!(optimizer.cache().value_number_invalidations(), 1);
    assert!(comp.method().cfg().has_frequencies());
}

#[test]
fn false_guard_creates_no_pass_instance() {
    let mut method = Method::new();
    let a = method.cfg_mut().add_block();
    let b = method.cfg_mut().add_block();
    method.cfg_mut().add_edge(a, b);
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [entry(OptId::InductionVariableAnalysis, Guard::IfLoops)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    let created = Rc::new(Cell::new(0u32));
    let created_in_factory = Rc::clone(&created);
    optimizer.register_pass(
        OptId::InductionVariableAnalysis,
        Box::new(move || {
            created_in_factory.set(created_in_factory.get() + 1);
            Box::new(Nop)
        }),
    );

    let cost = optimizer.optimize(&mut comp).unwrap();

    assert_eq!(cost, 0);
    assert_eq!(created.get(), 0);
    assert!(!optimizer.manager(OptId::InductionVariableAnalysis).requested());
}

struct NestedOptimize;

impl OptimizationPass for NestedOptimize {
    fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32 {
        let before = ctx.comp.current_optimizer();
        assert!(before.is_some());
        let mut inner = Optimizer::new(ctx.comp, StrategySource::Explicit(&[])).unwrap();
        inner.optimize(ctx.comp).unwrap();
        assert_eq!(ctx.comp.current_optimizer(), before);
        0
    }
}

#[test]
fn optimize_preserves_the_outer_optimizer_pointer() {
    let method = method_with_entry_tree();
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [entry(OptId::TreeSimplification, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::TreeSimplification, Box::new(|| Box::new(NestedOptimize)));

    assert_eq!(comp.current_optimizer(), None);
    optimizer.optimize(&mut comp).unwrap();
    assert_eq!(comp.current_optimizer(), None);
}

#[test]
fn mark_last_run_bars_further_runs() {
    let method = method_with_entry_tree();
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [
        entry(OptId::DeadTreesElimination, Guard::MarkLastRun),
        entry(OptId::DeadTreesElimination, Guard::Always),
    ];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    let runs = Rc::new(Cell::new(0u32));
    optimizer.register_pass(OptId::DeadTreesElimination, counting_factory(&runs));

    optimizer.optimize(&mut comp).unwrap();

    assert_eq!(runs.get(), 1);
    assert!(optimizer.manager(OptId::DeadTreesElimination).last_run_performed());
}

struct AssertUseDefs;

impl OptimizationPass for AssertUseDefs {
    fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32 {
        assert!(ctx.cache.use_defs().is_some());
        0
    }
}

#[test]
fn use_defs_are_valid_on_entry_when_required() {
    let mut method = Method::new();
    let t = method.add_symref(SymKind::Auto);
    let block = method.cfg_mut().add_block();
    let value = method.create_node(Opcode::IConst(1), vec![]);
    let store = method.create_node(Opcode::Store(t), vec![value]);
    method.cfg_mut().block_mut(block).trees.push(store);
    let mut comp = Compilation::new(method, Options::default());

    // localValuePropagation declares requires-use-defs (local flavor).
    let strategy = [entry(OptId::LocalValuePropagation, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::LocalValuePropagation, Box::new(|| Box::new(AssertUseDefs)));

    optimizer.optimize(&mut comp).unwrap();
    assert!(optimizer.cache().use_defs().is_some());
}

struct AssertIdentitySnapshot;

impl OptimizationPass for AssertIdentitySnapshot {
    fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32 {
        let OptContext { comp, cache, .. } = ctx;
        let count = comp.method().symref_count();
        let snapshot = cache.symref_snapshot(comp.method());
        assert_eq!(snapshot, (0..count).collect::<Vec<_>>().as_slice());
        0
    }
}

#[test]
fn symref_table_stays_identity_across_non_growing_passes() {
    let mut method = method_with_entry_tree();
    method.add_symref(SymKind::Auto);
    method.add_symref(SymKind::Static);
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [
        entry(OptId::TreeSimplification, Guard::Always),
        entry(OptId::DeadTreesElimination, Guard::Always),
    ];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer
        .register_pass(OptId::TreeSimplification, Box::new(|| Box::new(AssertIdentitySnapshot)));
    optimizer
        .register_pass(OptId::DeadTreesElimination, Box::new(|| Box::new(AssertIdentitySnapshot)));

    optimizer.optimize(&mut comp).unwrap();
}

/// Requests itself on both blocks for the first three dispatches, then
/// stops; drives the each-local-analysis re-entry protocol.
struct BlockRequester {
    dispatches: Rc<Cell<u32>>,
}

impl OptimizationPass for BlockRequester {
    fn pre_perform_on_blocks(&mut self, _ctx: &mut OptContext<'_>) {
        self.dispatches.set(self.dispatches.get() + 1);
    }

    fn perform(&mut self, _ctx: &mut OptContext<'_>) -> i32 {
        0
    }

    fn perform_on_block(&mut self, block: crate::il::BlockId, ctx: &mut OptContext<'_>) -> i32 {
        if self.dispatches.get() < 4 {
            ctx.request_opt_on_block(OptId::LocalValuePropagation, block);
        }
        1
    }
}

#[test]
fn local_analysis_group_reenters_until_no_blocks_pend() {
    let mut method = Method::new();
    let a = method.cfg_mut().add_block();
    let b = method.cfg_mut().add_block();
    method.cfg_mut().add_edge(a, b);
    let ret = method.create_node(Opcode::Return, vec![]);
    method.cfg_mut().block_mut(b).trees.push(ret);
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [group_entry(OptGroup::EachLocalAnalysis, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    let dispatches = Rc::new(Cell::new(0u32));
    let dispatches_in_factory = Rc::clone(&dispatches);
    optimizer.register_pass(
        OptId::LocalValuePropagation,
        Box::new(move || {
            Box::new(BlockRequester { dispatches: Rc::clone(&dispatches_in_factory) })
        }),
    );
    optimizer.manager_mut(OptId::LocalValuePropagation).request_on_block(a);
    optimizer.manager_mut(OptId::LocalValuePropagation).request_on_block(b);

    optimizer.optimize(&mut comp).unwrap();

    // Blocks pend on three rounds, none on the fourth: exactly four
    // dispatches, below the five-iteration cap.
    assert_eq!(dispatches.get(), 4);
    assert!(!optimizer.manager(OptId::LocalValuePropagation).has_requested_blocks());
}

#[test]
fn loop_budget_overflow_fails_with_excessive_complexity() {
    let mut method = Method::new();
    let cfg = method.cfg_mut();
    let mut prev = cfg.add_block();
    for _ in 0..2_001 {
        let next = cfg.add_block();
        cfg.add_edge(prev, next);
        cfg.add_edge(next, next);
        prev = next;
    }
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [entry(OptId::LoopCanonicalization, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::LoopCanonicalization, Box::new(|| Box::new(Nop)));

    let result = optimizer.optimize(&mut comp);
    assert!(matches!(result, Err(CompilationFailure::ExcessiveComplexity { loops: 2_001, .. })));
}

#[test]
fn process_huge_methods_overrides_the_complexity_gate() {
    let mut method = Method::new();
    let cfg = method.cfg_mut();
    let mut prev = cfg.add_block();
    for _ in 0..2_001 {
        let next = cfg.add_block();
        cfg.add_edge(prev, next);
        cfg.add_edge(next, next);
        prev = next;
    }
    let mut comp = Compilation::new(method, Options::default());
    comp.options.process_huge_methods = true;

    let strategy = [entry(OptId::LoopCanonicalization, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::LoopCanonicalization, Box::new(|| Box::new(Nop)));

    optimizer.optimize(&mut comp).unwrap();
}

struct RequestInterrupt;

impl OptimizationPass for RequestInterrupt {
    fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32 {
        ctx.comp.request_interrupt();
        0
    }
}

#[test]
fn cancellation_is_observed_at_the_next_pass_boundary() {
    let method = method_with_entry_tree();
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [
        entry(OptId::TreeSimplification, Guard::Always),
        entry(OptId::DeadTreesElimination, Guard::Always),
    ];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::TreeSimplification, Box::new(|| Box::new(RequestInterrupt)));
    let runs = Rc::new(Cell::new(0u32));
    optimizer.register_pass(OptId::DeadTreesElimination, counting_factory(&runs));

    let result = optimizer.optimize(&mut comp);

    assert!(matches!(result, Err(CompilationFailure::CompilationInterrupted)));
    assert_eq!(runs.get(), 0);
}

#[test]
fn demanded_hotness_above_the_tier_fails_the_compilation() {
    let mut method = Method::new();
    method.cfg_mut().add_block();
    let mut comp = Compilation::new(method, Options::default());
    comp.hotness = Hotness::Warm;
    comp.demand_hotness(Hotness::Scorching);

    let mut optimizer = Optimizer::new(&comp, StrategySource::Hotness).unwrap();
    let result = optimizer.optimize(&mut comp);

    assert!(matches!(
        result,
        Err(CompilationFailure::InsufficientlyAggressiveCompilation {
            required: Hotness::Scorching
        })
    ));
}

#[test]
fn empty_strategy_is_a_valid_no_op() {
    let mut method = Method::new();
    method.cfg_mut().add_block();
    let mut comp = Compilation::new(method, Options::default());

    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&[])).unwrap();
    assert_eq!(optimizer.optimize(&mut comp).unwrap(), 0);
    assert_eq!(comp.current_optimizer(), None);
}

#[test]
fn index_window_skips_passes_unless_must_be_done() {
    let method = method_with_entry_tree();
    let mut comp = Compilation::new(method, Options::default());
    comp.options.first_opt_index = 2;

    let strategy = [
        entry(OptId::TreeSimplification, Guard::Always), // index 1: gated out
        entry(OptId::DeadTreesElimination, Guard::Always), // index 2: runs
        StrategyEntry {
            step: Step::Opt(OptId::RedundantGotoElimination),
            guard: Guard::MustBeDone,
            must_be_done: false,
        },
    ];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    let simplify_runs = Rc::new(Cell::new(0u32));
    let dead_runs = Rc::new(Cell::new(0u32));
    let goto_runs = Rc::new(Cell::new(0u32));
    optimizer.register_pass(OptId::TreeSimplification, counting_factory(&simplify_runs));
    optimizer.register_pass(OptId::DeadTreesElimination, counting_factory(&dead_runs));
    optimizer.register_pass(OptId::RedundantGotoElimination, counting_factory(&goto_runs));

    comp.options.last_opt_index = 2;
    optimizer.optimize(&mut comp).unwrap();

    assert_eq!(simplify_runs.get(), 0);
    assert_eq!(dead_runs.get(), 1);
    // Index 3 is past the window but the entry is must-be-done.
    assert_eq!(goto_runs.get(), 1);
}

#[test]
fn custom_strategy_with_bad_word_refuses_construction() {
    let mut method = Method::new();
    method.cfg_mut().add_block();
    let comp = Compilation::new(method, Options::default());

    let words = [0xbeefu32, END_CUSTOM_STRATEGY];
    assert!(matches!(
        Optimizer::new(&comp, StrategySource::Custom(&words)),
        Err(CompilationFailure::InvalidStrategy(0xbeef))
    ));
}

#[test]
fn treeless_methods_skip_passes_that_need_trees() {
    let mut method = Method::new();
    method.cfg_mut().add_block();
    let mut comp = Compilation::new(method, Options::default());

    let strategy = [
        entry(OptId::DeadTreesElimination, Guard::Always),
        entry(OptId::RedundantGotoElimination, Guard::Always),
    ];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    let dead_runs = Rc::new(Cell::new(0u32));
    let goto_runs = Rc::new(Cell::new(0u32));
    optimizer.register_pass(OptId::DeadTreesElimination, counting_factory(&dead_runs));
    optimizer.register_pass(OptId::RedundantGotoElimination, counting_factory(&goto_runs));

    optimizer.optimize(&mut comp).unwrap();

    assert_eq!(dead_runs.get(), 0);
    // CFG-shape passes declare does-not-require-trees and still run.
    assert_eq!(goto_runs.get(), 1);
}

#[test]
fn accurate_node_count_is_resynchronized_before_dispatch() {
    let mut method = method_with_entry_tree();
    // Orphan node left behind by an earlier rewrite.
    method.create_node(Opcode::IConst(9), vec![]);
    let mut comp = Compilation::new(method, Options::default());

    // partialRedundancyElimination declares accurate-node-count-required.
    let strategy = [entry(OptId::PartialRedundancyElimination, Guard::Always)];
    let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
    optimizer.register_pass(OptId::PartialRedundancyElimination, Box::new(|| Box::new(Nop)));

    assert_eq!(comp.method().node_count(), 2);
    optimizer.optimize(&mut comp).unwrap();
    assert_eq!(comp.method().node_count(), 1);
}

#[test]
fn ilgen_optimizer_uses_the_ilgen_strategy() {
    let mut method = Method::new();
    method.cfg_mut().add_block();
    let comp = Compilation::new(method, Options::default());

    let optimizer = Optimizer::new(&comp, StrategySource::IlGen).unwrap();
    assert!(optimizer.is_il_gen());
    assert_eq!(optimizer.strategy(), ILGEN_STRATEGY);
}
