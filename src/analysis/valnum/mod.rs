//! Value numbering.
//!
//! Two flavors, selected by the compilation. The hash-based flavor numbers
//! nodes by structural key in one pass. The partition-based flavor starts
//! from opcode classes and refines until congruent nodes share a class;
//! both agree on DAGs, but the partition flavor is the one hosts pick when
//! they want the congruence classes themselves.


use std::collections::BTreeMap;

use crate::il::{BlockId, Method, NodeId, Opcode};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ValueNumberKind {
    HashBased,
    PartitionBased,
}

pub struct ValueNumberInfo {
    kind: ValueNumberKind,
    globals: bool,
    numbers: BTreeMap<NodeId, u32>,
}

impl ValueNumberInfo {
    pub fn kind(&self) -> ValueNumberKind {
        self.kind
    }

    pub fn has_globals(&self) -> bool {
        self.globals
    }

    pub fn value_number(&self, node: NodeId) -> Option<u32> {
        self.numbers.get(&node).copied()
    }
}

// Structural key for one node. The block component is Some for the local
// flavor, confining congruence to a single block.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Key {
    Const(i64, Option<u32>),
    Op(u32, Vec<u32>, Option<u32>),
    /// Loads, calls and stores are never congruent to anything; kills are
    /// not tracked at this level, so sharing numbers across memory would
    /// be unsound.
    Opaque(u32),
}

pub fn build(method: &Method, kind: ValueNumberKind, globals: bool) -> ValueNumberInfo {
    let numbers = match kind {
        ValueNumberKind::HashBased => hash_number(method, globals),
        ValueNumberKind::PartitionBased => partition_number(method, globals),
    };
    ValueNumberInfo { kind, globals, numbers }
}

fn each_node(method: &Method, mut f: impl FnMut(BlockId, NodeId)) {
    fn walk(method: &Method, block: BlockId, node: NodeId, f: &mut impl FnMut(BlockId, NodeId)) {
        for &child in &method.node(node).children {
            walk(method, block, child, f);
        }
        f(block, node);
    }
    let cfg = method.cfg();
    for block_id in cfg.block_ids() {
        let block = cfg.block(block_id);
        if !block.live {
            continue;
        }
        for &root in &block.trees {
            walk(method, block_id, root, &mut f);
        }
    }
}

fn node_key(
    method: &Method,
    block: BlockId,
    node: NodeId,
    child_number: &impl Fn(NodeId) -> u32,
    globals: bool,
) -> Key {
    let scope = (!globals).then_some(block.0);
    let n = method.node(node);
    match n.op {
        Opcode::IConst(value) => Key::Const(value, scope),
        Opcode::IAdd => Key::Op(0, n.children.iter().map(|&c| child_number(c)).collect(), scope),
        Opcode::ISub => Key::Op(1, n.children.iter().map(|&c| child_number(c)).collect(), scope),
        Opcode::IMul => Key::Op(2, n.children.iter().map(|&c| child_number(c)).collect(), scope),
        _ => Key::Opaque(node.0),
    }
}

fn hash_number(method: &Method, globals: bool) -> BTreeMap<NodeId, u32> {
    let mut numbers: BTreeMap<NodeId, u32> = BTreeMap::new();
    let mut by_key: BTreeMap<Key, u32> = BTreeMap::new();
    let mut next = 1u32;
    each_node(method, |block, node| {
        let lookup = |child: NodeId| numbers[&child];
        let key = node_key(method, block, node, &lookup, globals);
        let vn = *by_key.entry(key).or_insert_with(|| {
            let vn = next;
            next += 1;
            vn
        });
        numbers.insert(node, vn);
    });
    numbers
}

fn partition_number(method: &Method, globals: bool) -> BTreeMap<NodeId, u32> {
    let mut order: Vec<(BlockId, NodeId)> = Vec::new();
    each_node(method, |block, node| order.push((block, node)));

    // Start from one universal class and refine: split classes whose
    // members disagree on their own key or on child classes. The first
    // round partitions by shallow key, later rounds propagate child
    // distinctions upward until stable.
    let mut class: BTreeMap<NodeId, u32> = order.iter().map(|&(_, node)| (node, 0)).collect();
    loop {
        let mut refined: BTreeMap<NodeId, u32> = BTreeMap::new();
        let mut by_key: BTreeMap<Key, u32> = BTreeMap::new();
        let mut next = 1u32;
        for &(block, node) in &order {
            let lookup = |child: NodeId| class[&child];
            let key = node_key(method, block, node, &lookup, globals);
            let vn = *by_key.entry(key).or_insert_with(|| {
                let vn = next;
                next += 1;
                vn
            });
            refined.insert(node, vn);
        }
        if refined == class {
            return class;
        }
        class = refined;
    }
}
