//! The optimizer: strategy-driven pass sequencing.
//!
//! One [`Optimizer`] drives one compilation at a time. It walks a strategy,
//! evaluates each entry's guard against the method's current shape and the
//! per-optimization request state, materializes the analyses the selected
//! pass declares, dispatches the pass (whole-method or per-block), then
//! reconciles the analysis cache against whatever the pass changed.
//! Optimizers nest: an inner `optimize()` saves and restores the
//! compilation's current-optimizer slot.
//!
//! ## Example
//!
//! ```rust
//! use jitframe::compile::{Compilation, Options};
//! use jitframe::il::{Method, Opcode};
//! use jitframe::opt::{Optimizer, OptimizationPass, OptContext, OptId, StrategySource};
//!
//! struct Nop;
//! impl OptimizationPass for Nop {
//!     fn perform(&mut self, _ctx: &mut OptContext<'_>) -> i32 {
//!         0
//!     }
//! }
//!
//! let mut method = Method::new();
//! let block = method.cfg_mut().add_block();
//! let ret = method.create_node(Opcode::Return, vec![]);
//! method.cfg_mut().block_mut(block).trees.push(ret);
//! let mut comp = Compilation::new(method, Options::default());
//!
//! let mut optimizer = Optimizer::new(&comp, StrategySource::Hotness).unwrap();
//! optimizer.register_pass(OptId::TreeSimplification, Box::new(|| Box::new(Nop)));
//! optimizer.optimize(&mut comp).unwrap();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::analysis::{AnalysisCache, CacheMarks, UseDefRequest, ValueNumberKind};
use crate::compile::{Compilation, CompilationFailure, Hotness, OsrMode};

pub mod manager;
pub mod pass;
pub mod strategy;

pub use manager::OptManager;
pub use pass::{OptContext, OptimizationPass, PassFactory};
pub use strategy::{
    decode_custom, Guard, OptCaps, OptGroup, OptId, Step, StrategyEntry, COLD_STRATEGY,
    CUSTOM_MUST_BE_DONE, END_CUSTOM_STRATEGY, HOT_STRATEGY, ILGEN_STRATEGY, NO_OPT_STRATEGY,
    WARM_STRATEGY,
};

use manager::{slot, SLOT_COUNT};

#[cfg(test)]
mod test;

/// Where the strategy comes from.
pub enum StrategySource<'a> {
    /// The fixed IL-generation strategy; every member must declare
    /// supports-ilgen-opts.
    IlGen,
    /// The built-in table for the compilation's hotness tier.
    Hotness,
    /// A caller-supplied strategy (e.g. a frontend hook).
    Explicit(&'a [StrategyEntry]),
    /// A packed custom strategy, see [`strategy::decode_custom`].
    Custom(&'a [u32]),
}

struct ComplexityLimits {
    blocks: u32,
    loops: u32,
}

/// Block and loop budgets; doubled at hot tiers and again on an opt server,
/// where larger methods are worth the queue time.
fn complexity_limits(comp: &Compilation) -> ComplexityLimits {
    let mut limits = ComplexityLimits { blocks: 6_000, loops: 2_000 };
    if comp.method_hotness() >= Hotness::Hot {
        limits.blocks *= 2;
        limits.loops *= 2;
    }
    if comp.is_opt_server() {
        limits.blocks *= 2;
        limits.loops *= 2;
    }
    limits
}

static NEXT_OPTIMIZER_ID: AtomicU64 = AtomicU64::new(1);

pub struct Optimizer {
    id: u64,
    il_gen: bool,
    strategy: Vec<StrategyEntry>,
    managers: Vec<OptManager>,
    factories: Vec<Option<PassFactory>>,
    cache: AnalysisCache,
    /// Global optimization index: counts every entry seen, skipped ones
    /// included; the first/last-index window gates on it.
    opt_index: u32,
}

impl Optimizer {
    pub fn new(comp: &Compilation, source: StrategySource<'_>) -> Result<Self, CompilationFailure> {
        let (il_gen, strategy) = match source {
            StrategySource::IlGen => (true, ILGEN_STRATEGY.to_vec()),
            StrategySource::Hotness => {
                (false, strategy_for_hotness(comp.method_hotness()).to_vec())
            }
            StrategySource::Explicit(entries) => (false, entries.to_vec()),
            StrategySource::Custom(words) => (false, strategy::decode_custom(words)?),
        };
        if il_gen {
            verify_ilgen(&strategy)?;
        }
        Ok(Self {
            id: NEXT_OPTIMIZER_ID.fetch_add(1, Ordering::Relaxed),
            il_gen,
            strategy,
            managers: (0..SLOT_COUNT).map(|_| OptManager::default()).collect(),
            factories: (0..OptId::COUNT).map(|_| None).collect(),
            cache: AnalysisCache::new(),
            opt_index: 0,
        })
    }

    pub fn is_il_gen(&self) -> bool {
        self.il_gen
    }

    pub fn strategy(&self) -> &[StrategyEntry] {
        &self.strategy
    }

    pub fn opt_index(&self) -> u32 {
        self.opt_index
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.cache
    }

    pub fn register_pass(&mut self, id: OptId, factory: PassFactory) {
        self.factories[id as usize] = Some(factory);
    }

    pub fn manager(&self, id: OptId) -> &OptManager {
        &self.managers[slot(Step::Opt(id))]
    }

    pub fn manager_mut(&mut self, id: OptId) -> &mut OptManager {
        &mut self.managers[slot(Step::Opt(id))]
    }

    pub fn group_manager_mut(&mut self, group: OptGroup) -> &mut OptManager {
        &mut self.managers[slot(Step::Group(group))]
    }

    /// Runs the whole strategy. The method's IL is mutated in place; typed
    /// failures abort the compilation and are never swallowed here.
    pub fn optimize(&mut self, comp: &mut Compilation) -> Result<i32, CompilationFailure> {
        if let Some(required) = comp.demanded_hotness() {
            if required > comp.method_hotness() {
                return Err(CompilationFailure::InsufficientlyAggressiveCompilation { required });
            }
        }

        let outer = comp.current_optimizer();
        comp.set_current_optimizer(Some(self.id));
        let result = self.run_strategy(comp);
        comp.set_current_optimizer(outer);
        result
    }

    fn run_strategy(&mut self, comp: &mut Compilation) -> Result<i32, CompilationFailure> {
        let first = comp.options.first_opt_index;
        let last = comp.options.last_opt_index;
        let timing = comp.options.time_opts;
        let mut cost = 0;
        for i in 0..self.strategy.len() {
            let entry = self.strategy[i];
            cost += self.perform_optimization(comp, entry, first, last, timing)?;
        }
        Ok(cost)
    }

    /// Dispatches one strategy entry. Returns a rough cost estimate, zero
    /// when the entry did not fire.
    pub fn perform_optimization(
        &mut self,
        comp: &mut Compilation,
        entry: StrategyEntry,
        first_index: u32,
        last_index: u32,
        timing: bool,
    ) -> Result<i32, CompilationFailure> {
        self.opt_index += 1;
        let index = self.opt_index;
        match entry.step {
            Step::Group(id) => self.perform_group(comp, id, entry, first_index, last_index, timing),
            Step::Opt(id) => {
                self.perform_opt(comp, id, entry, index, first_index, last_index, timing)
            }
        }
    }

    fn perform_group(
        &mut self,
        comp: &mut Compilation,
        id: OptGroup,
        entry: StrategyEntry,
        first_index: u32,
        last_index: u32,
        timing: bool,
    ) -> Result<i32, CompilationFailure> {
        let slot_idx = slot(Step::Group(id));
        if self.managers[slot_idx].last_run_performed() {
            return Ok(0);
        }
        // Guards evaluate once per group entry; the body then runs to
        // completion however the method shape changes underneath it.
        if !guard_allows(entry.guard, comp, &self.managers[slot_idx]) {
            return Ok(0);
        }

        let body = id.body();
        let mut cost = 0;
        let mut iterations = 0;
        loop {
            iterations += 1;
            for &sub in body {
                cost += self.perform_optimization(comp, sub, first_index, last_index, timing)?;
            }
            // The local-analysis group re-enters while its members keep
            // requesting blocks, up to the iteration cap.
            let again = id == OptGroup::EachLocalAnalysis
                && iterations < OptGroup::LOCAL_ANALYSIS_ITERATION_CAP
                && body.iter().any(|sub| match sub.step {
                    Step::Opt(opt) => self.managers[slot(Step::Opt(opt))].has_requested_blocks(),
                    Step::Group(_) => false,
                });
            if !again {
                break;
            }
        }
        tracing::trace!(target: "jitframe::opt", group = id.name(), iterations, "group done");

        let manager = &mut self.managers[slot_idx];
        manager.clear_request();
        if entry.guard.marks_last_run() {
            manager.set_last_run_performed();
        }
        Ok(cost)
    }

    fn perform_opt(
        &mut self,
        comp: &mut Compilation,
        id: OptId,
        entry: StrategyEntry,
        index: u32,
        first_index: u32,
        last_index: u32,
        timing: bool,
    ) -> Result<i32, CompilationFailure> {
        let caps = id.caps();
        let name = id.name();
        let slot_idx = slot(Step::Opt(id));

        if self.managers[slot_idx].last_run_performed() {
            return Ok(0);
        }

        let allowed = guard_allows(entry.guard, comp, &self.managers[slot_idx]);
        let per_block =
            entry.guard.consults_enabledness() && self.managers[slot_idx].has_requested_blocks();
        if !allowed {
            debug_assert!(
                !self.managers[slot_idx].has_requested_blocks(),
                "{name} disabled with blocks still requested"
            );
            return Ok(0);
        }

        if (index < first_index || index > last_index) && !entry.must_be_done() {
            return Ok(0);
        }

        // Latched when the first structure build came in close to the loop
        // budget; versioning or unrolling would blow it.
        if caps.can_create_loops && self.cache.loop_creating_opts_disabled() {
            return Ok(0);
        }

        if comp.options.disabled_opts.iter().any(|needle| name.contains(needle.as_str())) {
            return Ok(0);
        }
        if !comp.options.enabled_opts.is_empty()
            && !comp.options.enabled_opts.iter().any(|needle| name.contains(needle.as_str()))
        {
            return Ok(0);
        }
        if comp.options.break_on_opt.iter().any(|needle| name.contains(needle.as_str())) {
            tracing::warn!(target: "jitframe::opt", opt = name, index, "break-on-opt hit");
        }

        // CFG-shape passes run before any trees exist; everything else
        // needs at least one tree to look at.
        if !caps.does_not_require_trees && !comp.method().has_trees() {
            return Ok(0);
        }

        let Some(factory) = &self.factories[id as usize] else {
            tracing::trace!(target: "jitframe::opt", opt = name, "no factory registered");
            return Ok(0);
        };
        let mut pass = factory();

        {
            let ctx = OptContext {
                comp: &mut *comp,
                cache: &mut self.cache,
                managers: &mut self.managers,
                current: entry.step,
            };
            if !pass.should_perform(&ctx) {
                return Ok(0);
            }
        }

        let limits = complexity_limits(comp);
        if !caps.does_not_require_alias_sets {
            self.cache.ensure_alias_sets(comp.method());
        }
        if caps.requires_structure {
            comp.report_analysis_phase("regionStructure");
            self.cache.ensure_structure(comp.method_mut(), limits.loops);
        }
        if caps.requires_use_defs() || caps.prefers_global_use_defs {
            comp.report_analysis_phase("useDefInfo");
            self.cache.ensure_use_defs(
                comp.method(),
                UseDefRequest {
                    requires_globals: caps.requires_global_use_defs,
                    prefers_globals: caps.prefers_global_use_defs,
                    loads_as_defs: caps.loads_as_defs,
                    cannot_omit_trivial_defs: caps.cannot_omit_trivial_defs,
                    conversion_regs_only: comp.options.conversion_regs_only,
                },
            );
        }
        if caps.requires_value_numbering() || caps.prefers_global_value_numbering {
            comp.report_analysis_phase("valueNumberInfo");
            let kind = if comp.options.prepartitioned_value_numbering {
                ValueNumberKind::PartitionBased
            } else {
                ValueNumberKind::HashBased
            };
            let globals =
                caps.requires_global_value_numbering || caps.prefers_global_value_numbering;
            self.cache.ensure_value_numbers(comp.method(), kind, globals);
        }

        if !comp.method().cfg().has_frequencies() && !caps.do_not_set_frequencies {
            comp.method_mut().cfg_mut().set_frequencies();
        }

        if caps.requires_structure && !comp.options.process_huge_methods {
            let blocks = self
                .cache
                .block_count()
                .unwrap_or_else(|| comp.method().cfg().block_count());
            let loops = self.cache.loop_count().unwrap_or(0);
            if blocks > limits.blocks || loops > limits.loops {
                return Err(CompilationFailure::ExcessiveComplexity { blocks, loops });
            }
        }

        comp.report_optimization_phase(name, true);
        let started = timing.then(Instant::now);
        // A stale running count would skew both the watermarks and the
        // invalidation decisions after the pass.
        if caps.accurate_node_count_required {
            comp.method_mut().recount_nodes();
        }
        let marks = CacheMarks::capture(comp.method());
        if self.managers[slot_idx].trace() || comp.options.trace_opt_details {
            tracing::debug!(target: "jitframe::opt", opt = name, index, per_block, "dispatch");
        }

        let blocks_to_run = per_block.then(|| self.managers[slot_idx].take_requested_blocks());
        self.managers[slot_idx].clear_request();

        let mut cost = 0;
        {
            let mut ctx = OptContext {
                comp: &mut *comp,
                cache: &mut self.cache,
                managers: &mut self.managers,
                current: entry.step,
            };
            match blocks_to_run {
                Some(blocks) => {
                    pass.pre_perform_on_blocks(&mut ctx);
                    for block in blocks {
                        // Only live extended-block headers; requests may
                        // have gone stale since they were queued.
                        let run = ctx.comp.method().cfg().block(block).is_extended_block_header();
                        if run {
                            cost += pass.perform_on_block(block, &mut ctx);
                        }
                    }
                    pass.post_perform_on_blocks(&mut ctx);
                }
                None => {
                    pass.pre_perform(&mut ctx);
                    cost += pass.perform(&mut ctx);
                    pass.post_perform(&mut ctx);
                }
            }
        }

        if entry.guard.marks_last_run() {
            self.managers[slot_idx].set_last_run_performed();
        }

        self.cache.reconcile_after_pass(
            comp.method_mut(),
            marks,
            caps.maintains_use_defs,
            caps.can_add_symrefs,
        );

        if comp.method().cfg().might_have_unreachable_blocks() {
            let removed = comp.method_mut().cfg_mut().remove_unreachable_blocks();
            if removed > 0 {
                self.cache.invalidate_structure(comp.method_mut());
            }
        }

        if comp.compilation_should_be_interrupted() {
            return Err(CompilationFailure::CompilationInterrupted);
        }

        if let Some(start) = started {
            let micros = start.elapsed().as_micros() as u64;
            tracing::debug!(target: "jitframe::opt", opt = name, micros, "timed");
        }
        comp.report_optimization_phase(name, false);
        Ok(cost.max(1))
    }
}

fn strategy_for_hotness(hotness: Hotness) -> &'static [StrategyEntry] {
    match hotness {
        Hotness::NoOpt => NO_OPT_STRATEGY,
        Hotness::Cold => COLD_STRATEGY,
        Hotness::Warm => WARM_STRATEGY,
        Hotness::Hot | Hotness::VeryHot | Hotness::Scorching => HOT_STRATEGY,
    }
}

fn verify_ilgen(strategy: &[StrategyEntry]) -> Result<(), CompilationFailure> {
    for entry in strategy {
        match entry.step {
            Step::Opt(id) => {
                if !id.caps().supports_ilgen_opts {
                    return Err(CompilationFailure::InvalidStrategy(id as u32));
                }
            }
            Step::Group(group) => verify_ilgen(group.body())?,
        }
    }
    Ok(())
}

fn guard_allows(guard: Guard, comp: &Compilation, manager: &OptManager) -> bool {
    let cfg = comp.method().cfg();
    let shape = comp.method().shape;
    let blocks = cfg.block_count();
    let loops = cfg.may_have_loops();
    let requested = manager.requested();

    match guard {
        Guard::Always | Guard::MustBeDone | Guard::MarkLastRun => true,
        Guard::IfLoops | Guard::IfLoopsMarkLastRun => loops,
        Guard::IfNoLoops => !loops,
        Guard::IfMoreThanOneBlock => blocks > 1,
        Guard::IfOneBlock => blocks == 1,
        Guard::IfProfiling => comp.profiling,
        Guard::IfNotProfiling => !comp.profiling,
        Guard::IfNotJitProfiling => !comp.jit_profiling,
        Guard::IfNews => shape.has_news,
        Guard::IfOptServer => comp.opt_server,
        Guard::IfMonitors => shape.may_contain_monitors,
        Guard::IfEnabledAndMonitors => requested && shape.may_contain_monitors,
        Guard::IfEnabledAndOptServer => requested && comp.opt_server,
        Guard::IfNotClassLoadPhase => !comp.class_load_phase,
        Guard::IfNotClassLoadPhaseAndNotProfiling => !comp.class_load_phase && !comp.profiling,
        Guard::IfEnabled | Guard::IfEnabledMarkLastRun => requested,
        Guard::IfEnabledAndLoops => requested && loops,
        Guard::IfEnabledAndMoreThanOneBlock | Guard::IfEnabledAndMoreThanOneBlockMarkLastRun => {
            requested && blocks > 1
        }
        Guard::IfEnabledAndNoLoops => requested && !loops,
        Guard::IfEnabledAndProfiling => requested && comp.profiling,
        Guard::IfEnabledAndNotProfiling => requested && !comp.profiling,
        Guard::IfEnabledAndNotJitProfiling => requested && !comp.jit_profiling,
        Guard::IfNoLoopsOrEnabledAndLoops => !loops || requested,
        Guard::IfLoopsAndNotProfiling => loops && !comp.profiling,
        Guard::IfFullInliningUnderOsrDebug => {
            comp.options.full_inlining_under_osr_debug && comp.osr != OsrMode::None
        }
        Guard::IfNotFullInliningUnderOsrDebug => {
            !(comp.options.full_inlining_under_osr_debug && comp.osr != OsrMode::None)
        }
        Guard::IfOsr => comp.osr != OsrMode::None,
        Guard::IfVoluntaryOsr => comp.osr == OsrMode::Voluntary,
        Guard::IfInvoluntaryOsr => comp.osr == OsrMode::Involuntary,
        Guard::IfAotAndEnabled => comp.options.aot && requested,
        Guard::IfMethodHandleInvokes => shape.has_method_handle_invokes,
        Guard::IfNotQuickStart => !comp.options.quick_start,
        Guard::IfEAOpportunities | Guard::IfEAOpportunitiesMarkLastRun => {
            shape.has_escape_analysis_opportunities
        }
        Guard::IfEAOpportunitiesAndNotOptServer => {
            shape.has_escape_analysis_opportunities && !comp.opt_server
        }
        Guard::IfAggressiveLiveness => shape.has_aggressive_liveness,
        Guard::IfVectorApi => shape.has_vector_api,
    }
}
