//! Minimal IL substrate.
//!
//! The optimizer core only ever observes a method through a narrow query
//! surface: block and node counts, loop presence, symbol references,
//! frequencies and visit counts. This module provides exactly that surface
//! plus enough expression structure for passes and analyses to chew on; it
//! is deliberately not a full IR.

use crate::analysis::structure::RegionStructure;


/// Index into the symbol reference table of a [`Method`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SymRef(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockId(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub u32);

/// What a symbol reference resolves to, as far as aliasing is concerned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SymKind {
    /// Method-local temporary. Aliases nothing.
    Auto,
    /// Incoming parameter. Aliases nothing.
    Parm,
    /// Static field. Statics alias each other.
    Static,
    /// Field shadow. Shadows alias each other and statics.
    Shadow,
}

#[derive(Clone, Debug)]
pub enum Opcode {
    IConst(i64),
    IAdd,
    ISub,
    IMul,
    Load(SymRef),
    Store(SymRef),
    /// Unconditional control transfer.
    Goto(BlockId),
    /// Two-way branch: taken target here, fall-through is the next block.
    IfCmpNonZero(BlockId),
    Call,
    Return,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub op: Opcode,
    pub children: Vec<NodeId>,
}

#[derive(Clone, Debug)]
pub struct Block {
    /// Tree roots in evaluation order.
    pub trees: Vec<NodeId>,
    pub preds: Vec<BlockId>,
    pub succs: Vec<BlockId>,
    pub frequency: Option<i32>,
    /// False once the block has been removed as unreachable.
    pub live: bool,
    /// True when this block is a fall-through continuation of the previous
    /// one rather than an extended-block header.
    pub extension: bool,
}

impl Block {
    fn new() -> Self {
        Self {
            trees: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            frequency: None,
            live: true,
            extension: false,
        }
    }

    pub fn is_extended_block_header(&self) -> bool {
        self.live && !self.extension
    }
}

#[derive(Default)]
pub struct Cfg {
    blocks: Vec<Block>,
    entry: Option<BlockId>,
    frequencies_set: bool,
    might_have_unreachable: bool,
    structure: Option<Box<RegionStructure>>,
}

impl Cfg {
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as _);
        self.blocks.push(Block::new());
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.0 as usize].succs.push(to);
        self.blocks[to.0 as usize].preds.push(from);
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    /// All blocks ever created, dead ones included; callers filter on
    /// [`Block::live`].
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.iter().filter(|b| b.live).count() as _
    }

    /// Conservative loop query: true iff a cycle is reachable from entry.
    pub fn may_have_loops(&self) -> bool {
        let Some(entry) = self.entry else {
            return false;
        };
        // Iterative DFS with an explicit on-path set.
        let n = self.blocks.len();
        let mut state = vec![0u8; n]; // 0 unvisited, 1 on path, 2 done
        let mut stack = vec![(entry, 0usize)];
        state[entry.0 as usize] = 1;
        while let Some(&mut (at, ref mut next)) = stack.last_mut() {
            let succs = &self.blocks[at.0 as usize].succs;
            if *next < succs.len() {
                let to = succs[*next];
                *next += 1;
                match state[to.0 as usize] {
                    0 if self.blocks[to.0 as usize].live => {
                        state[to.0 as usize] = 1;
                        stack.push((to, 0));
                    }
                    1 => return true,
                    _ => {}
                }
            } else {
                state[at.0 as usize] = 2;
                stack.pop();
            }
        }
        false
    }

    pub fn has_frequencies(&self) -> bool {
        self.frequencies_set
    }

    /// Static frequency estimate: entry hot, everything else warm. Passes
    /// that need better numbers bring their own profile.
    pub fn set_frequencies(&mut self) {
        let entry = self.entry;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if !block.live {
                continue;
            }
            let freq = if entry == Some(BlockId(i as _)) { 10_000 } else { 1_000 };
            block.frequency = Some(freq);
        }
        self.frequencies_set = true;
    }

    pub fn might_have_unreachable_blocks(&self) -> bool {
        self.might_have_unreachable
    }

    pub fn set_might_have_unreachable_blocks(&mut self) {
        self.might_have_unreachable = true;
    }

    /// Marks blocks unreachable from entry dead. Returns how many died.
    pub fn remove_unreachable_blocks(&mut self) -> u32 {
        self.might_have_unreachable = false;
        let Some(entry) = self.entry else {
            return 0;
        };
        let n = self.blocks.len();
        let mut reached = vec![false; n];
        let mut work = vec![entry];
        reached[entry.0 as usize] = true;
        while let Some(at) = work.pop() {
            for &to in &self.blocks[at.0 as usize].succs {
                if !reached[to.0 as usize] {
                    reached[to.0 as usize] = true;
                    work.push(to);
                }
            }
        }
        let mut removed = 0;
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.live && !reached[i] {
                block.live = false;
                removed += 1;
            }
        }
        removed
    }

    pub fn structure(&self) -> Option<&RegionStructure> {
        self.structure.as_deref()
    }

    pub fn set_structure(&mut self, structure: Option<Box<RegionStructure>>) {
        self.structure = structure;
    }
}

/// Shape flags the front end records while generating IL.
#[derive(Clone, Copy, Default, Debug)]
pub struct MethodShape {
    pub has_news: bool,
    pub may_contain_monitors: bool,
    pub has_method_handle_invokes: bool,
    pub has_vector_api: bool,
    pub has_escape_analysis_opportunities: bool,
    pub has_aggressive_liveness: bool,
}

pub struct Method {
    cfg: Cfg,
    nodes: Vec<Option<Node>>,
    live_nodes: u64,
    symrefs: Vec<SymKind>,
    visit_count: u32,
    pub shape: MethodShape,
}

impl Method {
    pub fn new() -> Self {
        Self {
            cfg: Cfg::default(),
            nodes: Vec::new(),
            live_nodes: 0,
            symrefs: Vec::new(),
            visit_count: 0,
            shape: MethodShape::default(),
        }
    }

    pub fn cfg(&self) -> &Cfg {
        &self.cfg
    }

    pub fn cfg_mut(&mut self) -> &mut Cfg {
        &mut self.cfg
    }

    pub fn create_node(&mut self, op: Opcode, children: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as _);
        self.nodes.push(Some(Node { op, children }));
        self.live_nodes += 1;
        id
    }

    /// Drops a node from the live count. The slot is not reused; dangling
    /// references are the caller's bug.
    pub fn release_node(&mut self, id: NodeId) {
        if self.nodes[id.0 as usize].take().is_some() {
            self.live_nodes -= 1;
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes[id.0 as usize].as_ref().expect("released node")
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.0 as usize].as_mut().expect("released node")
    }

    pub fn node_count(&self) -> u64 {
        self.live_nodes
    }

    pub fn add_symref(&mut self, kind: SymKind) -> SymRef {
        let id = SymRef(self.symrefs.len() as _);
        self.symrefs.push(kind);
        id
    }

    pub fn symref_count(&self) -> u32 {
        self.symrefs.len() as _
    }

    pub fn symref_kind(&self, symref: SymRef) -> SymKind {
        self.symrefs[symref.0 as usize]
    }

    pub fn symrefs(&self) -> impl Iterator<Item = (SymRef, SymKind)> + '_ {
        self.symrefs.iter().enumerate().map(|(i, &k)| (SymRef(i as _), k))
    }

    /// First tree root of the entry block, if any.
    pub fn first_tree_top(&self) -> Option<NodeId> {
        let entry = self.cfg.entry()?;
        self.cfg.block(entry).trees.first().copied()
    }

    /// True when any live block holds at least one tree.
    pub fn has_trees(&self) -> bool {
        self.cfg.blocks.iter().any(|block| block.live && !block.trees.is_empty())
    }

    /// Walks every live block's trees and resynchronizes the live-node
    /// count with what is actually reachable. Passes that rebuild trees
    /// wholesale can leave the running count stale; consumers needing an
    /// accurate count trigger this before reading it.
    pub fn recount_nodes(&mut self) -> u64 {
        let mut stack: Vec<NodeId> = Vec::new();
        for block in &self.cfg.blocks {
            if block.live {
                stack.extend(block.trees.iter().copied());
            }
        }
        let mut count = 0u64;
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(self.node(node).children.iter().copied());
        }
        self.live_nodes = count;
        count
    }

    pub fn visit_count(&self) -> u32 {
        self.visit_count
    }

    pub fn incr_visit_count(&mut self) -> u32 {
        self.visit_count += 1;
        self.visit_count
    }

    pub fn reset_visit_counts(&mut self) {
        self.visit_count = 0;
    }
}

impl Default for Method {
    fn default() -> Self {
        Self::new()
    }
}
