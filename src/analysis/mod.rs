//! Analysis results and their lifetimes.
//!
//! The optimizer owns one [`AnalysisCache`] per compilation. Passes never
//! build analyses themselves; they declare requirements and the driver
//! materializes what is missing, then reconciles the cache against what the
//! pass did to the method. Invalidation is recovered locally: the entry is
//! dropped and the next consumer rebuilds.


use std::collections::{BTreeMap, BTreeSet};

use crate::il::{Method, SymKind, SymRef};

pub mod structure;
pub mod usedef;
pub mod valnum;

pub use usedef::{UseDefInfo, UseDefParams};
pub use valnum::{ValueNumberInfo, ValueNumberKind};

/// Visit counts past this point wrap around; the driver resets them.
pub const VISIT_COUNT_HIGH_WATER: u32 = 0x3fff_f000;

/// Symref-indexed may-alias sets. Temporaries and parameters alias only
/// themselves; statics and shadows conservatively alias each other.
pub struct AliasInfo {
    sets: BTreeMap<SymRef, BTreeSet<SymRef>>,
}

impl AliasInfo {
    fn build(method: &Method) -> Self {
        let memory: BTreeSet<SymRef> = method
            .symrefs()
            .filter(|&(_, kind)| matches!(kind, SymKind::Static | SymKind::Shadow))
            .map(|(symref, _)| symref)
            .collect();
        let sets = method
            .symrefs()
            .map(|(symref, kind)| {
                let set = match kind {
                    SymKind::Auto | SymKind::Parm => BTreeSet::from([symref]),
                    SymKind::Static | SymKind::Shadow => memory.clone(),
                };
                (symref, set)
            })
            .collect();
        Self { sets }
    }

    pub fn aliases(&self, symref: SymRef) -> Option<&BTreeSet<SymRef>> {
        self.sets.get(&symref)
    }
}

/// What a pass needs from use-def info; derived from its capability flags.
#[derive(Clone, Copy, Default, Debug)]
pub struct UseDefRequest {
    pub requires_globals: bool,
    pub prefers_globals: bool,
    pub loads_as_defs: bool,
    pub cannot_omit_trivial_defs: bool,
    pub conversion_regs_only: bool,
}

/// Method-shape watermarks captured before a pass runs, consumed by
/// [`AnalysisCache::reconcile_after_pass`].
#[derive(Clone, Copy, Debug)]
pub struct CacheMarks {
    pub nodes: u64,
    pub symrefs: u32,
    pub blocks: u32,
}

impl CacheMarks {
    pub fn capture(method: &Method) -> Self {
        Self {
            nodes: method.node_count(),
            symrefs: method.symref_count(),
            blocks: method.cfg().block_count(),
        }
    }
}

#[derive(Default)]
pub struct AnalysisCache {
    alias_info: Option<AliasInfo>,
    use_def: Option<UseDefInfo>,
    value_numbers: Option<ValueNumberInfo>,
    symref_snapshot: Option<Vec<u32>>,
    /// Loop and block counts cached on the first structure build only;
    /// complexity gates keep using them even after the structure itself is
    /// dropped.
    cached_loop_count: Option<u32>,
    cached_block_count: Option<u32>,
    disable_loop_creating_opts: bool,
    value_number_invalidations: u32,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alias_sets_valid(&self) -> bool {
        self.alias_info.is_some()
    }

    pub fn ensure_alias_sets(&mut self, method: &Method) -> &AliasInfo {
        if self.alias_info.is_none() {
            tracing::debug!(target: "jitframe::analysis", "building alias sets");
            self.alias_info = Some(AliasInfo::build(method));
        }
        self.alias_info.as_ref().expect("just built")
    }

    pub fn invalidate_alias_sets(&mut self) {
        self.alias_info = None;
    }

    pub fn use_defs(&self) -> Option<&UseDefInfo> {
        self.use_def.as_ref()
    }

    /// Materializes use-def info satisfying `request`, rebuilding when the
    /// cached flavor does not cover it. A rebuild drops value numbers.
    pub fn ensure_use_defs(&mut self, method: &Method, request: UseDefRequest) -> &UseDefInfo {
        let stale = match &self.use_def {
            None => true,
            Some(info) => {
                let wants_globals = request.requires_globals || request.prefers_globals;
                (wants_globals && !info.has_global_defs())
                    || info.has_loads_as_defs() != request.loads_as_defs
                    || info.params().cannot_omit_trivial_defs != request.cannot_omit_trivial_defs
                    || info.params().conversion_regs_only != request.conversion_regs_only
            }
        };
        if stale {
            let globals = request.requires_globals || request.prefers_globals;
            tracing::debug!(target: "jitframe::analysis", globals, "building use-def info");
            let params = UseDefParams {
                globals,
                loads_as_defs: request.loads_as_defs,
                cannot_omit_trivial_defs: request.cannot_omit_trivial_defs,
                conversion_regs_only: request.conversion_regs_only,
            };
            self.use_def = Some(usedef::build(method, params));
            self.invalidate_value_numbers();
        }
        self.use_def.as_ref().expect("just built")
    }

    pub fn invalidate_use_defs(&mut self) {
        self.use_def = None;
    }

    pub fn value_numbers(&self) -> Option<&ValueNumberInfo> {
        self.value_numbers.as_ref()
    }

    pub fn ensure_value_numbers(
        &mut self,
        method: &Method,
        kind: ValueNumberKind,
        request_globals: bool,
    ) -> &ValueNumberInfo {
        let stale = match &self.value_numbers {
            None => true,
            Some(info) => info.kind() != kind || (request_globals && !info.has_globals()),
        };
        if stale {
            tracing::debug!(target: "jitframe::analysis", ?kind, "building value numbers");
            self.value_numbers = Some(valnum::build(method, kind, request_globals));
        }
        self.value_numbers.as_ref().expect("just built")
    }

    pub fn invalidate_value_numbers(&mut self) {
        self.value_numbers = None;
        self.value_number_invalidations += 1;
    }

    /// How many times value numbers have been dropped this compilation.
    pub fn value_number_invalidations(&self) -> u32 {
        self.value_number_invalidations
    }

    /// Identity map from symref index to canonical representative,
    /// rebuilt whenever the symref count moves.
    pub fn symref_snapshot(&mut self, method: &Method) -> &[u32] {
        let count = method.symref_count();
        let stale = self.symref_snapshot.as_ref().map(|s| s.len() as u32) != Some(count);
        if stale {
            self.symref_snapshot = Some((0..count).collect());
        }
        self.symref_snapshot.as_deref().expect("just built")
    }

    pub fn invalidate_symref_snapshot(&mut self) {
        self.symref_snapshot = None;
    }

    /// Builds the region structure if the CFG has none, recording it there.
    /// The first build per compilation caches the loop and block counts and
    /// latches off loop-creating passes when the method is close to the
    /// loop limit.
    pub fn ensure_structure(&mut self, method: &mut Method, loop_limit: u32) {
        if method.cfg().structure().is_some() {
            return;
        }
        tracing::debug!(target: "jitframe::analysis", "building region structure");
        let structure = structure::discover(method.cfg()).map(Box::new);
        if self.cached_loop_count.is_none() {
            let loops = structure.as_ref().map_or(0, |s| s.loop_count());
            self.cached_loop_count = Some(loops);
            self.cached_block_count = Some(method.cfg().block_count());
            if loops + 25 >= loop_limit {
                self.disable_loop_creating_opts = true;
            }
        }
        method.cfg_mut().set_structure(structure);
    }

    pub fn invalidate_structure(&self, method: &mut Method) {
        method.cfg_mut().set_structure(None);
    }

    pub fn loop_count(&self) -> Option<u32> {
        self.cached_loop_count
    }

    pub fn block_count(&self) -> Option<u32> {
        self.cached_block_count
    }

    pub fn loop_creating_opts_disabled(&self) -> bool {
        self.disable_loop_creating_opts
    }

    /// Post-pass bookkeeping: drops whatever the pass invalidated.
    ///
    /// `maintains_use_defs` and `can_add_symrefs` come from the pass's
    /// capability flags.
    pub fn reconcile_after_pass(
        &mut self,
        method: &mut Method,
        marks: CacheMarks,
        maintains_use_defs: bool,
        can_add_symrefs: bool,
    ) {
        let nodes = method.node_count();
        if nodes != marks.nodes {
            self.invalidate_value_numbers();
        }
        if nodes > marks.nodes && !maintains_use_defs {
            self.invalidate_use_defs();
        }

        let symrefs = method.symref_count();
        if symrefs != marks.symrefs {
            self.invalidate_symref_snapshot();
        }
        if symrefs != marks.symrefs || can_add_symrefs {
            self.invalidate_alias_sets();
        }

        if method.cfg().block_count() != marks.blocks {
            self.invalidate_structure(method);
        }

        if method.visit_count() >= VISIT_COUNT_HIGH_WATER {
            method.reset_visit_counts();
        }
    }
}
