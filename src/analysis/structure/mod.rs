//! Region structure: dominator-based natural-loop discovery.
//!
//! The structure tree is a hierarchical region decomposition recorded on the
//! CFG: one acyclic root region spanning the method, with one region per
//! natural loop nested by containment.


use std::collections::BTreeSet;

use crate::il::{BlockId, Cfg};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionKind {
    Acyclic,
    NaturalLoop,
}

#[derive(Clone, Debug)]
pub struct RegionStructure {
    pub kind: RegionKind,
    pub header: BlockId,
    /// Blocks belonging to this region, sub-region blocks included.
    pub blocks: Vec<BlockId>,
    pub children: Vec<RegionStructure>,
}

impl RegionStructure {
    /// Natural-loop regions in this subtree, the region itself included.
    pub fn loop_count(&self) -> u32 {
        let own = (self.kind == RegionKind::NaturalLoop) as u32;
        own + self.children.iter().map(RegionStructure::loop_count).sum::<u32>()
    }
}

/// Discovers the region structure of `cfg`. Empty CFGs yield `None`.
pub fn discover(cfg: &Cfg) -> Option<RegionStructure> {
    let entry = cfg.entry()?;

    // Reverse postorder over live reachable blocks.
    let rpo = reverse_postorder(cfg, entry);
    let n = rpo.len();
    let mut rpo_index = vec![usize::MAX; cfg.block_ids().count()];
    for (i, &b) in rpo.iter().enumerate() {
        rpo_index[b.0 as usize] = i;
    }

    // Iterative dominator computation (Cooper-Harvey-Kennedy).
    let mut idom = vec![usize::MAX; n];
    idom[0] = 0;
    let mut changed = true;
    while changed {
        changed = false;
        for i in 1..n {
            let block = rpo[i];
            let mut new_idom = usize::MAX;
            for &pred in &cfg.block(block).preds {
                let p = rpo_index[pred.0 as usize];
                if p == usize::MAX || (idom[p] == usize::MAX && p != 0) {
                    continue;
                }
                new_idom = if new_idom == usize::MAX {
                    p
                } else {
                    intersect(&idom, new_idom, p)
                };
            }
            if new_idom != usize::MAX && idom[i] != new_idom {
                idom[i] = new_idom;
                changed = true;
            }
        }
    }

    let dominates = |a: usize, b: usize| {
        let mut at = b;
        loop {
            if at == a {
                return true;
            }
            if at == 0 {
                return false;
            }
            at = idom[at];
        }
    };

    // Each back edge u -> v (v dominates u) contributes the natural loop of
    // v: all blocks that reach u without passing through v.
    let mut loops: Vec<(usize, BTreeSet<usize>)> = Vec::new();
    for (u, &block) in rpo.iter().enumerate() {
        for &succ in &cfg.block(block).succs {
            let v = rpo_index[succ.0 as usize];
            if v == usize::MAX || !dominates(v, u) {
                continue;
            }
            let mut body = BTreeSet::from([v, u]);
            let mut work = vec![u];
            while let Some(at) = work.pop() {
                if at == v {
                    continue;
                }
                for &pred in &cfg.block(rpo[at]).preds {
                    let p = rpo_index[pred.0 as usize];
                    if p != usize::MAX && body.insert(p) {
                        work.push(p);
                    }
                }
            }
            match loops.iter_mut().find(|(header, _)| *header == v) {
                Some((_, blocks)) => blocks.extend(body),
                None => loops.push((v, body)),
            }
        }
    }

    // Nest loops by containment: the parent of a loop is the smallest other
    // loop whose body strictly contains its header.
    loops.sort_by_key(|(_, body)| body.len());
    let mut regions: Vec<Option<RegionStructure>> = loops
        .iter()
        .map(|(header, body)| {
            Some(RegionStructure {
                kind: RegionKind::NaturalLoop,
                header: rpo[*header],
                blocks: body.iter().map(|&i| rpo[i]).collect(),
                children: Vec::new(),
            })
        })
        .collect();
    for i in 0..loops.len() {
        let parent = (i + 1..loops.len())
            .find(|&j| loops[j].1.contains(&loops[i].0) && loops[j].0 != loops[i].0);
        if let Some(j) = parent {
            let child = regions[i].take().expect("child already nested");
            regions[j].as_mut().expect("parent nested before child").children.push(child);
        }
    }

    Some(RegionStructure {
        kind: RegionKind::Acyclic,
        header: entry,
        blocks: rpo,
        children: regions.into_iter().flatten().collect(),
    })
}

fn reverse_postorder(cfg: &Cfg, entry: BlockId) -> Vec<BlockId> {
    let n = cfg.block_ids().count();
    let mut seen = vec![false; n];
    let mut post = Vec::new();
    let mut stack = vec![(entry, 0usize)];
    seen[entry.0 as usize] = true;
    while let Some(&mut (at, ref mut next)) = stack.last_mut() {
        let succs = &cfg.block(at).succs;
        if *next < succs.len() {
            let to = succs[*next];
            *next += 1;
            if !seen[to.0 as usize] && cfg.block(to).live {
                seen[to.0 as usize] = true;
                stack.push((to, 0));
            }
        } else {
            post.push(at);
            stack.pop();
        }
    }
    post.reverse();
    post
}

fn intersect(idom: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while a > b {
            a = idom[a];
        }
        while b > a {
            b = idom[b];
        }
    }
    a
}
