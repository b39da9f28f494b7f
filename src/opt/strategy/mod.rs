//! Optimization identity, guards and strategies.
//!
//! A strategy is an ordered recipe: each entry names a primitive
//! optimization or a group (whose body is another strategy) plus a guard
//! predicate deciding at run time whether the entry fires. The tables at the
//! bottom are the built-in recipes per hotness tier; hosts may also supply
//! an explicit slice or a packed custom encoding.

#[cfg(test)]
mod test;

use crate::compile::CompilationFailure;

/// Primitive optimizations the driver knows how to schedule.
///
/// The discriminant is the wire id used by packed custom strategies.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum OptId {
    TreeSimplification = 0,
    LocalCommonSubexpressionElimination,
    LocalValuePropagation,
    LocalDeadStoreElimination,
    LocalReordering,
    LocalLiveRangeReduction,
    TrivialDeadTreeRemoval,
    DeadTreesElimination,
    BasicBlockExtension,
    BasicBlockHoisting,
    TrivialBlockExtension,
    RedundantGotoElimination,
    ColdBlockOutlining,
    CatchBlockRemoval,
    CompactNullChecks,
    GlobalValuePropagation,
    GlobalCopyPropagation,
    GlobalDeadStoreElimination,
    PartialRedundancyElimination,
    TrivialInlining,
    Inlining,
    EscapeAnalysis,
    RedundantMonitorElimination,
    LoopCanonicalization,
    LoopVersioner,
    LoopUnroller,
    LoopReduction,
    InductionVariableAnalysis,
    AsyncCheckInsertion,
    ProfileGenerator,
    SwitchAnalyzer,
    OsrGuardInsertion,
    VirtualGuardTailSplitter,
    MethodHandleTransformer,
    VectorApiExpansion,
}

impl OptId {
    pub const COUNT: usize = OptId::VectorApiExpansion as usize + 1;

    pub fn from_u16(id: u16) -> Option<Self> {
        (id < Self::COUNT as u16).then(|| {
            // Discriminants are dense from zero.
            unsafe { std::mem::transmute::<u16, OptId>(id) }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TreeSimplification => "treeSimplification",
            Self::LocalCommonSubexpressionElimination => "localCSE",
            Self::LocalValuePropagation => "localValuePropagation",
            Self::LocalDeadStoreElimination => "localDeadStoreElimination",
            Self::LocalReordering => "localReordering",
            Self::LocalLiveRangeReduction => "localLiveRangeReduction",
            Self::TrivialDeadTreeRemoval => "trivialDeadTreeRemoval",
            Self::DeadTreesElimination => "deadTreesElimination",
            Self::BasicBlockExtension => "basicBlockExtension",
            Self::BasicBlockHoisting => "basicBlockHoisting",
            Self::TrivialBlockExtension => "trivialBlockExtension",
            Self::RedundantGotoElimination => "redundantGotoElimination",
            Self::ColdBlockOutlining => "coldBlockOutlining",
            Self::CatchBlockRemoval => "catchBlockRemoval",
            Self::CompactNullChecks => "compactNullChecks",
            Self::GlobalValuePropagation => "globalValuePropagation",
            Self::GlobalCopyPropagation => "globalCopyPropagation",
            Self::GlobalDeadStoreElimination => "globalDeadStoreElimination",
            Self::PartialRedundancyElimination => "partialRedundancyElimination",
            Self::TrivialInlining => "trivialInlining",
            Self::Inlining => "inlining",
            Self::EscapeAnalysis => "escapeAnalysis",
            Self::RedundantMonitorElimination => "redundantMonitorElimination",
            Self::LoopCanonicalization => "loopCanonicalization",
            Self::LoopVersioner => "loopVersioner",
            Self::LoopUnroller => "loopUnroller",
            Self::LoopReduction => "loopReduction",
            Self::InductionVariableAnalysis => "inductionVariableAnalysis",
            Self::AsyncCheckInsertion => "asyncCheckInsertion",
            Self::ProfileGenerator => "profileGenerator",
            Self::SwitchAnalyzer => "switchAnalyzer",
            Self::OsrGuardInsertion => "osrGuardInsertion",
            Self::VirtualGuardTailSplitter => "virtualGuardTailSplitter",
            Self::MethodHandleTransformer => "methodHandleTransformer",
            Self::VectorApiExpansion => "vectorApiExpansion",
        }
    }

    pub fn caps(self) -> OptCaps {
        // Local passes tolerate IL-generation-level trees; the structure
        // and use-def consumers do not.
        match self {
            Self::TreeSimplification => OptCaps {
                supports_ilgen_opts: true,
                maintains_use_defs: true,
                ..OptCaps::NONE
            },
            Self::LocalCommonSubexpressionElimination => OptCaps {
                requires_local_value_numbering: true,
                supports_ilgen_opts: true,
                ..OptCaps::NONE
            },
            Self::LocalValuePropagation => OptCaps {
                requires_local_use_defs: true,
                supports_ilgen_opts: true,
                ..OptCaps::NONE
            },
            Self::LocalDeadStoreElimination => OptCaps {
                requires_local_use_defs: true,
                cannot_omit_trivial_defs: true,
                supports_ilgen_opts: true,
                ..OptCaps::NONE
            },
            Self::LocalReordering | Self::LocalLiveRangeReduction => OptCaps {
                requires_local_use_defs: true,
                ..OptCaps::NONE
            },
            Self::TrivialDeadTreeRemoval => OptCaps {
                supports_ilgen_opts: true,
                maintains_use_defs: true,
                does_not_require_alias_sets: true,
                ..OptCaps::NONE
            },
            Self::DeadTreesElimination => OptCaps {
                maintains_use_defs: true,
                does_not_require_alias_sets: true,
                ..OptCaps::NONE
            },
            Self::BasicBlockExtension
            | Self::TrivialBlockExtension
            | Self::RedundantGotoElimination
            | Self::CatchBlockRemoval => OptCaps {
                does_not_require_alias_sets: true,
                does_not_require_trees: true,
                do_not_set_frequencies: true,
                ..OptCaps::NONE
            },
            Self::BasicBlockHoisting | Self::ColdBlockOutlining => OptCaps {
                requires_structure: true,
                does_not_require_trees: true,
                ..OptCaps::NONE
            },
            Self::CompactNullChecks => OptCaps {
                requires_local_use_defs: true,
                loads_as_defs: true,
                ..OptCaps::NONE
            },
            Self::GlobalValuePropagation => OptCaps {
                requires_structure: true,
                requires_global_use_defs: true,
                requires_global_value_numbering: true,
                can_add_symrefs: true,
                ..OptCaps::NONE
            },
            Self::GlobalCopyPropagation => OptCaps {
                requires_global_use_defs: true,
                prefers_global_value_numbering: true,
                ..OptCaps::NONE
            },
            Self::GlobalDeadStoreElimination => OptCaps {
                requires_global_use_defs: true,
                cannot_omit_trivial_defs: true,
                loads_as_defs: true,
                ..OptCaps::NONE
            },
            Self::PartialRedundancyElimination => OptCaps {
                requires_structure: true,
                requires_global_value_numbering: true,
                accurate_node_count_required: true,
                ..OptCaps::NONE
            },
            Self::TrivialInlining | Self::Inlining => OptCaps {
                can_add_symrefs: true,
                do_not_set_frequencies: true,
                ..OptCaps::NONE
            },
            Self::EscapeAnalysis => OptCaps {
                requires_structure: true,
                requires_global_use_defs: true,
                requires_global_value_numbering: true,
                can_add_symrefs: true,
                ..OptCaps::NONE
            },
            Self::RedundantMonitorElimination => OptCaps {
                requires_structure: true,
                requires_global_value_numbering: true,
                ..OptCaps::NONE
            },
            Self::LoopCanonicalization => OptCaps {
                requires_structure: true,
                does_not_require_trees: true,
                ..OptCaps::NONE
            },
            Self::LoopReduction => OptCaps {
                requires_structure: true,
                ..OptCaps::NONE
            },
            Self::LoopVersioner | Self::LoopUnroller => OptCaps {
                requires_structure: true,
                can_create_loops: true,
                can_add_symrefs: true,
                ..OptCaps::NONE
            },
            Self::InductionVariableAnalysis => OptCaps {
                requires_structure: true,
                requires_global_use_defs: true,
                prefers_global_use_defs: true,
                ..OptCaps::NONE
            },
            Self::AsyncCheckInsertion | Self::OsrGuardInsertion => OptCaps {
                requires_structure: true,
                do_not_set_frequencies: true,
                ..OptCaps::NONE
            },
            Self::ProfileGenerator => OptCaps {
                do_not_set_frequencies: true,
                can_add_symrefs: true,
                ..OptCaps::NONE
            },
            Self::SwitchAnalyzer | Self::VirtualGuardTailSplitter => OptCaps {
                does_not_require_alias_sets: true,
                ..OptCaps::NONE
            },
            Self::MethodHandleTransformer | Self::VectorApiExpansion => OptCaps {
                supports_ilgen_opts: true,
                can_add_symrefs: true,
                ..OptCaps::NONE
            },
        }
    }
}

/// Optimization groups: identifiers whose body is another strategy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u16)]
pub enum OptGroup {
    EachLocalAnalysis = 0,
    LoopOpts,
    EarlyGlobal,
    FinalGlobal,
    CheapObjectAllocation,
}

impl OptGroup {
    pub const COUNT: usize = OptGroup::CheapObjectAllocation as usize + 1;

    /// How often the each-local-analysis group re-enters its body while
    /// sub-passes still have pending blocks.
    pub const LOCAL_ANALYSIS_ITERATION_CAP: u32 = 5;

    pub fn name(self) -> &'static str {
        match self {
            Self::EachLocalAnalysis => "eachLocalAnalysisPassGroup",
            Self::LoopOpts => "loopOptsGroup",
            Self::EarlyGlobal => "earlyGlobalGroup",
            Self::FinalGlobal => "finalGlobalGroup",
            Self::CheapObjectAllocation => "cheapObjectAllocationGroup",
        }
    }

    pub fn body(self) -> &'static [StrategyEntry] {
        match self {
            Self::EachLocalAnalysis => EACH_LOCAL_ANALYSIS_GROUP,
            Self::LoopOpts => LOOP_OPTS_GROUP,
            Self::EarlyGlobal => EARLY_GLOBAL_GROUP,
            Self::FinalGlobal => FINAL_GLOBAL_GROUP,
            Self::CheapObjectAllocation => CHEAP_OBJECT_ALLOCATION_GROUP,
        }
    }
}

/// Capability flags an optimization declares; the driver materializes the
/// analyses and obeys the maintenance contracts accordingly.
#[derive(Clone, Copy, Default, Debug)]
pub struct OptCaps {
    pub requires_structure: bool,
    pub requires_local_use_defs: bool,
    pub requires_global_use_defs: bool,
    pub requires_local_value_numbering: bool,
    pub requires_global_value_numbering: bool,
    pub maintains_use_defs: bool,
    pub does_not_require_alias_sets: bool,
    pub does_not_require_trees: bool,
    pub prefers_global_use_defs: bool,
    pub prefers_global_value_numbering: bool,
    pub loads_as_defs: bool,
    pub cannot_omit_trivial_defs: bool,
    pub supports_ilgen_opts: bool,
    pub do_not_set_frequencies: bool,
    pub can_add_symrefs: bool,
    pub accurate_node_count_required: bool,
    pub can_create_loops: bool,
}

impl OptCaps {
    pub const NONE: Self = Self {
        requires_structure: false,
        requires_local_use_defs: false,
        requires_global_use_defs: false,
        requires_local_value_numbering: false,
        requires_global_value_numbering: false,
        maintains_use_defs: false,
        does_not_require_alias_sets: false,
        does_not_require_trees: false,
        prefers_global_use_defs: false,
        prefers_global_value_numbering: false,
        loads_as_defs: false,
        cannot_omit_trivial_defs: false,
        supports_ilgen_opts: false,
        do_not_set_frequencies: false,
        can_add_symrefs: false,
        accurate_node_count_required: false,
        can_create_loops: false,
    };

    pub fn requires_use_defs(&self) -> bool {
        self.requires_local_use_defs || self.requires_global_use_defs
    }

    pub fn requires_value_numbering(&self) -> bool {
        self.requires_local_value_numbering || self.requires_global_value_numbering
    }
}

/// Run-time predicate attached to a strategy entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Guard {
    Always,
    IfLoops,
    IfNoLoops,
    IfMoreThanOneBlock,
    IfOneBlock,
    IfLoopsMarkLastRun,
    IfProfiling,
    IfNotProfiling,
    IfNotJitProfiling,
    IfNews,
    IfOptServer,
    IfMonitors,
    IfEnabledAndMonitors,
    IfEnabledAndOptServer,
    IfNotClassLoadPhase,
    IfNotClassLoadPhaseAndNotProfiling,
    IfEnabled,
    IfEnabledAndLoops,
    IfEnabledAndMoreThanOneBlock,
    IfEnabledAndMoreThanOneBlockMarkLastRun,
    IfEnabledAndNoLoops,
    IfEnabledAndProfiling,
    IfEnabledAndNotProfiling,
    IfEnabledAndNotJitProfiling,
    IfEnabledMarkLastRun,
    IfNoLoopsOrEnabledAndLoops,
    IfLoopsAndNotProfiling,
    MustBeDone,
    IfFullInliningUnderOsrDebug,
    IfNotFullInliningUnderOsrDebug,
    IfOsr,
    IfVoluntaryOsr,
    IfInvoluntaryOsr,
    IfAotAndEnabled,
    IfMethodHandleInvokes,
    IfNotQuickStart,
    IfEAOpportunities,
    IfEAOpportunitiesAndNotOptServer,
    IfEAOpportunitiesMarkLastRun,
    IfAggressiveLiveness,
    IfVectorApi,
    MarkLastRun,
}

impl Guard {
    /// Entries whose guard consults the requested state; these are the ones
    /// eligible for per-block dispatch.
    pub fn consults_enabledness(self) -> bool {
        matches!(
            self,
            Self::IfEnabled
                | Self::IfEnabledAndLoops
                | Self::IfEnabledAndMoreThanOneBlock
                | Self::IfEnabledAndMoreThanOneBlockMarkLastRun
                | Self::IfEnabledAndNoLoops
                | Self::IfEnabledAndProfiling
                | Self::IfEnabledAndNotProfiling
                | Self::IfEnabledAndNotJitProfiling
                | Self::IfEnabledMarkLastRun
                | Self::IfEnabledAndMonitors
                | Self::IfEnabledAndOptServer
                | Self::IfAotAndEnabled
                | Self::IfNoLoopsOrEnabledAndLoops
        )
    }

    /// Whether a successful run under this guard bars further runs.
    pub fn marks_last_run(self) -> bool {
        matches!(
            self,
            Self::IfLoopsMarkLastRun
                | Self::IfEnabledAndMoreThanOneBlockMarkLastRun
                | Self::IfEnabledMarkLastRun
                | Self::IfEAOpportunitiesMarkLastRun
                | Self::MarkLastRun
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Step {
    Opt(OptId),
    Group(OptGroup),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StrategyEntry {
    pub step: Step,
    pub guard: Guard,
    pub must_be_done: bool,
}

impl StrategyEntry {
    pub fn must_be_done(&self) -> bool {
        self.must_be_done || self.guard == Guard::MustBeDone
    }
}

const fn opt(id: OptId, guard: Guard) -> StrategyEntry {
    StrategyEntry { step: Step::Opt(id), guard, must_be_done: false }
}

const fn group(id: OptGroup, guard: Guard) -> StrategyEntry {
    StrategyEntry { step: Step::Group(id), guard, must_be_done: false }
}

// ---------------------------------------------------------------------------
// Built-in strategies.
// ---------------------------------------------------------------------------

/// Run right after IL generation; every member must tolerate
/// IL-generation-level trees.
pub static ILGEN_STRATEGY: &[StrategyEntry] = &[
    opt(OptId::TrivialDeadTreeRemoval, Guard::Always),
    opt(OptId::TreeSimplification, Guard::Always),
    opt(OptId::LocalValuePropagation, Guard::IfNotClassLoadPhase),
    opt(OptId::MethodHandleTransformer, Guard::IfMethodHandleInvokes),
    opt(OptId::VectorApiExpansion, Guard::IfVectorApi),
];

pub static NO_OPT_STRATEGY: &[StrategyEntry] = &[
    opt(OptId::TreeSimplification, Guard::Always),
    opt(OptId::RedundantGotoElimination, Guard::MustBeDone),
];

pub static COLD_STRATEGY: &[StrategyEntry] = &[
    opt(OptId::TrivialInlining, Guard::IfNotQuickStart),
    opt(OptId::TreeSimplification, Guard::Always),
    group(OptGroup::EachLocalAnalysis, Guard::Always),
    opt(OptId::DeadTreesElimination, Guard::Always),
    opt(OptId::CatchBlockRemoval, Guard::Always),
    opt(OptId::BasicBlockExtension, Guard::IfMoreThanOneBlock),
    opt(OptId::RedundantGotoElimination, Guard::MustBeDone),
];

pub static WARM_STRATEGY: &[StrategyEntry] = &[
    opt(OptId::Inlining, Guard::IfNotQuickStart),
    opt(OptId::OsrGuardInsertion, Guard::IfOsr),
    opt(OptId::TreeSimplification, Guard::Always),
    opt(OptId::MethodHandleTransformer, Guard::IfMethodHandleInvokes),
    opt(OptId::VectorApiExpansion, Guard::IfVectorApi),
    group(OptGroup::EachLocalAnalysis, Guard::Always),
    opt(OptId::SwitchAnalyzer, Guard::IfMoreThanOneBlock),
    group(OptGroup::EarlyGlobal, Guard::IfMoreThanOneBlock),
    group(OptGroup::LoopOpts, Guard::IfLoops),
    group(OptGroup::CheapObjectAllocation, Guard::IfEAOpportunitiesAndNotOptServer),
    opt(OptId::ColdBlockOutlining, Guard::IfNotProfiling),
    opt(OptId::ProfileGenerator, Guard::IfProfiling),
    opt(OptId::DeadTreesElimination, Guard::Always),
    opt(OptId::CatchBlockRemoval, Guard::Always),
    opt(OptId::BasicBlockExtension, Guard::IfMoreThanOneBlock),
    group(OptGroup::EachLocalAnalysis, Guard::Always),
    opt(OptId::TrivialBlockExtension, Guard::IfOneBlock),
    opt(OptId::CompactNullChecks, Guard::IfEnabledMarkLastRun),
    opt(OptId::RedundantGotoElimination, Guard::MustBeDone),
];

pub static HOT_STRATEGY: &[StrategyEntry] = &[
    opt(OptId::Inlining, Guard::IfNotQuickStart),
    opt(OptId::OsrGuardInsertion, Guard::IfOsr),
    opt(OptId::VirtualGuardTailSplitter, Guard::IfNotFullInliningUnderOsrDebug),
    opt(OptId::TreeSimplification, Guard::Always),
    opt(OptId::MethodHandleTransformer, Guard::IfMethodHandleInvokes),
    opt(OptId::VectorApiExpansion, Guard::IfVectorApi),
    group(OptGroup::EachLocalAnalysis, Guard::Always),
    group(OptGroup::EarlyGlobal, Guard::IfMoreThanOneBlock),
    group(OptGroup::LoopOpts, Guard::IfLoopsAndNotProfiling),
    opt(OptId::InductionVariableAnalysis, Guard::IfLoops),
    group(OptGroup::CheapObjectAllocation, Guard::IfEAOpportunities),
    opt(OptId::RedundantMonitorElimination, Guard::IfEnabledAndMonitors),
    opt(OptId::PartialRedundancyElimination, Guard::IfNotProfiling),
    opt(OptId::BasicBlockHoisting, Guard::IfMoreThanOneBlock),
    group(OptGroup::FinalGlobal, Guard::IfNoLoopsOrEnabledAndLoops),
    opt(OptId::ColdBlockOutlining, Guard::IfNotProfiling),
    opt(OptId::ProfileGenerator, Guard::IfProfiling),
    opt(OptId::DeadTreesElimination, Guard::Always),
    opt(OptId::CatchBlockRemoval, Guard::Always),
    opt(OptId::BasicBlockExtension, Guard::IfMoreThanOneBlock),
    group(OptGroup::EachLocalAnalysis, Guard::Always),
    opt(OptId::CompactNullChecks, Guard::IfEnabledMarkLastRun),
    opt(OptId::RedundantGotoElimination, Guard::MustBeDone),
];

static EACH_LOCAL_ANALYSIS_GROUP: &[StrategyEntry] = &[
    opt(OptId::LocalValuePropagation, Guard::IfEnabled),
    opt(OptId::LocalCommonSubexpressionElimination, Guard::IfEnabled),
    opt(OptId::LocalDeadStoreElimination, Guard::IfEnabled),
    opt(OptId::LocalReordering, Guard::IfEnabled),
    opt(OptId::LocalLiveRangeReduction, Guard::IfEnabledAndNotProfiling),
];

static LOOP_OPTS_GROUP: &[StrategyEntry] = &[
    opt(OptId::LoopCanonicalization, Guard::IfLoops),
    opt(OptId::InductionVariableAnalysis, Guard::IfLoops),
    opt(OptId::LoopVersioner, Guard::IfLoopsAndNotProfiling),
    opt(OptId::LoopUnroller, Guard::IfLoops),
    opt(OptId::LoopReduction, Guard::IfLoopsMarkLastRun),
    opt(OptId::AsyncCheckInsertion, Guard::IfLoops),
];

static EARLY_GLOBAL_GROUP: &[StrategyEntry] = &[
    opt(OptId::GlobalValuePropagation, Guard::IfMoreThanOneBlock),
    opt(OptId::GlobalCopyPropagation, Guard::IfEnabledAndMoreThanOneBlock),
    opt(OptId::DeadTreesElimination, Guard::Always),
];

static FINAL_GLOBAL_GROUP: &[StrategyEntry] = &[
    opt(OptId::GlobalDeadStoreElimination, Guard::IfEnabledAndMoreThanOneBlockMarkLastRun),
    opt(OptId::GlobalCopyPropagation, Guard::IfEnabledAndMoreThanOneBlock),
    opt(OptId::DeadTreesElimination, Guard::MarkLastRun),
];

static CHEAP_OBJECT_ALLOCATION_GROUP: &[StrategyEntry] = &[
    opt(OptId::EscapeAnalysis, Guard::IfEAOpportunitiesMarkLastRun),
    opt(OptId::RedundantMonitorElimination, Guard::IfEnabledAndMonitors),
];

// ---------------------------------------------------------------------------
// Packed custom strategies.
// ---------------------------------------------------------------------------

/// Terminates a packed custom strategy.
pub const END_CUSTOM_STRATEGY: u32 = u32::MAX;

/// High bit of a packed entry: run the optimization even outside the
/// first/last opt-index window.
pub const CUSTOM_MUST_BE_DONE: u32 = 0x8000_0000;

const CUSTOM_ID_MASK: u32 = 0xffff;

/// Decodes a packed custom strategy: the low 16 bits of each word name an
/// [`OptId`], bit 31 carries [`CUSTOM_MUST_BE_DONE`]. Decoding stops at the
/// first [`END_CUSTOM_STRATEGY`] word; an unknown id refuses the strategy.
pub fn decode_custom(words: &[u32]) -> Result<Vec<StrategyEntry>, CompilationFailure> {
    let mut entries = Vec::new();
    for &word in words {
        if word == END_CUSTOM_STRATEGY {
            break;
        }
        let id = OptId::from_u16((word & CUSTOM_ID_MASK) as u16)
            .ok_or(CompilationFailure::InvalidStrategy(word))?;
        entries.push(StrategyEntry {
            step: Step::Opt(id),
            guard: Guard::Always,
            must_be_done: word & CUSTOM_MUST_BE_DONE != 0,
        });
    }
    Ok(entries)
}
