//! Use-def information.
//!
//! Reaching-definitions style: every load is a use, every store a def, and
//! the info records which defs can reach which uses. Two flavors exist. The
//! local flavor only connects uses to defs in the same block; the global
//! flavor runs the reaching-definitions dataflow over the CFG. Defs of
//! symrefs that are never used are trivial and omitted unless the requesting
//! pass cannot tolerate that.


use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use crate::il::{Method, NodeId, Opcode, SymKind, SymRef};

/// Build parameters; a cached info is reusable only for a compatible
/// request.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct UseDefParams {
    pub globals: bool,
    pub loads_as_defs: bool,
    pub cannot_omit_trivial_defs: bool,
    /// Track only method-local temporaries.
    pub conversion_regs_only: bool,
}

pub struct UseDefInfo {
    params: UseDefParams,
    defs_per_use: BTreeMap<NodeId, BTreeSet<NodeId>>,
    uses_per_def: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl UseDefInfo {
    pub fn has_global_defs(&self) -> bool {
        self.params.globals
    }

    pub fn has_loads_as_defs(&self) -> bool {
        self.params.loads_as_defs
    }

    pub fn params(&self) -> UseDefParams {
        self.params
    }

    pub fn defs_of(&self, use_node: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.defs_per_use.get(&use_node)
    }

    pub fn uses_of(&self, def_node: NodeId) -> Option<&BTreeSet<NodeId>> {
        self.uses_per_def.get(&def_node)
    }

    /// Order-stable digest over both relations; rebuilding with identical
    /// parameters must reproduce it.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (use_node, defs) in &self.defs_per_use {
            use_node.0.hash(&mut hasher);
            for def in defs {
                def.0.hash(&mut hasher);
            }
        }
        for (def_node, uses) in &self.uses_per_def {
            def_node.0.hash(&mut hasher);
            for use_node in uses {
                use_node.0.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}

struct Site {
    node: NodeId,
    symref: SymRef,
    is_def: bool,
    is_use: bool,
}

pub fn build(method: &Method, params: UseDefParams) -> UseDefInfo {
    let cfg = method.cfg();

    let tracked = |symref: SymRef| {
        !params.conversion_regs_only || method.symref_kind(symref) == SymKind::Auto
    };

    // Per block, sites in evaluation order.
    let mut sites: BTreeMap<u32, Vec<Site>> = BTreeMap::new();
    let mut used_symrefs: BTreeSet<SymRef> = BTreeSet::new();
    for block_id in cfg.block_ids() {
        let block = cfg.block(block_id);
        if !block.live {
            continue;
        }
        let list = sites.entry(block_id.0).or_default();
        for &root in &block.trees {
            collect_sites(method, root, params, &tracked, list);
        }
    }
    for list in sites.values() {
        for site in list {
            if site.is_use {
                used_symrefs.insert(site.symref);
            }
        }
    }

    let relevant_def = |site: &Site| {
        site.is_def && (params.cannot_omit_trivial_defs || used_symrefs.contains(&site.symref))
    };

    // Reaching sets at block entry, global flavor only.
    let mut reach_in: BTreeMap<u32, BTreeMap<SymRef, BTreeSet<NodeId>>> = BTreeMap::new();
    if params.globals {
        let mut reach_out: BTreeMap<u32, BTreeMap<SymRef, BTreeSet<NodeId>>> = BTreeMap::new();
        let mut changed = true;
        while changed {
            changed = false;
            for block_id in cfg.block_ids() {
                let block = cfg.block(block_id);
                if !block.live {
                    continue;
                }
                let mut in_sets: BTreeMap<SymRef, BTreeSet<NodeId>> = BTreeMap::new();
                for &pred in &block.preds {
                    if let Some(out) = reach_out.get(&pred.0) {
                        for (&symref, defs) in out {
                            in_sets.entry(symref).or_default().extend(defs);
                        }
                    }
                }
                let mut out_sets = in_sets.clone();
                if let Some(list) = sites.get(&block_id.0) {
                    for site in list {
                        if relevant_def(site) {
                            // A def kills everything previously reaching.
                            out_sets.insert(site.symref, BTreeSet::from([site.node]));
                        }
                    }
                }
                if reach_in.get(&block_id.0) != Some(&in_sets) {
                    reach_in.insert(block_id.0, in_sets);
                    changed = true;
                }
                if reach_out.get(&block_id.0) != Some(&out_sets) {
                    reach_out.insert(block_id.0, out_sets);
                    changed = true;
                }
            }
        }
    }

    let mut defs_per_use: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    let mut uses_per_def: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    for (block, list) in &sites {
        // Walk forward tracking the current in-block def per symref.
        let mut current: BTreeMap<SymRef, NodeId> = BTreeMap::new();
        for site in list {
            if site.is_use {
                let defs: BTreeSet<NodeId> = match current.get(&site.symref) {
                    Some(&def) => BTreeSet::from([def]),
                    None => reach_in
                        .get(block)
                        .and_then(|sets| sets.get(&site.symref))
                        .cloned()
                        .unwrap_or_default(),
                };
                for &def in &defs {
                    uses_per_def.entry(def).or_default().insert(site.node);
                }
                defs_per_use.insert(site.node, defs);
            }
            if relevant_def(site) {
                current.insert(site.symref, site.node);
                uses_per_def.entry(site.node).or_default();
            }
        }
    }

    UseDefInfo { params, defs_per_use, uses_per_def }
}

fn collect_sites(
    method: &Method,
    root: NodeId,
    params: UseDefParams,
    tracked: &impl Fn(SymRef) -> bool,
    out: &mut Vec<Site>,
) {
    // Children evaluate before the node itself.
    let node = method.node(root);
    for &child in &node.children {
        collect_sites(method, child, params, tracked, out);
    }
    match node.op {
        Opcode::Load(symref) if tracked(symref) => out.push(Site {
            node: root,
            symref,
            is_def: params.loads_as_defs,
            is_use: true,
        }),
        Opcode::Store(symref) if tracked(symref) => out.push(Site {
            node: root,
            symref,
            is_def: true,
            is_use: false,
        }),
        _ => {}
    }
}
