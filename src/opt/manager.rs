//! Per-compilation optimization state.
//!
//! One manager exists per optimization and per group, holding the mutable
//! request state the guards consult. Managers are owned by the optimizer
//! and survive across strategy entries; passes reach them through the
//! context to request later work.

use std::collections::BTreeSet;

use super::strategy::{OptGroup, OptId, Step};
use crate::il::BlockId;

/// Dense manager slot index: primitive optimizations first, then groups.
pub(crate) fn slot(step: Step) -> usize {
    match step {
        Step::Opt(id) => id as usize,
        Step::Group(g) => OptId::COUNT + g as usize,
    }
}

pub(crate) const SLOT_COUNT: usize = OptId::COUNT + OptGroup::COUNT;

#[derive(Default)]
pub struct OptManager {
    requested: bool,
    last_run: bool,
    requested_blocks: BTreeSet<BlockId>,
    trace: bool,
}

impl OptManager {
    /// Whole-method request; the next enabled-guarded entry fires.
    pub fn request(&mut self) {
        self.requested = true;
    }

    /// Per-block request; the next enabled-guarded entry fires in
    /// per-block mode on the accumulated set.
    pub fn request_on_block(&mut self, block: BlockId) {
        self.requested = true;
        self.requested_blocks.insert(block);
    }

    pub fn requested(&self) -> bool {
        self.requested
    }

    pub fn requested_blocks(&self) -> &BTreeSet<BlockId> {
        &self.requested_blocks
    }

    pub fn has_requested_blocks(&self) -> bool {
        !self.requested_blocks.is_empty()
    }

    pub(crate) fn take_requested_blocks(&mut self) -> BTreeSet<BlockId> {
        std::mem::take(&mut self.requested_blocks)
    }

    pub(crate) fn clear_request(&mut self) {
        self.requested = false;
    }

    pub fn last_run_performed(&self) -> bool {
        self.last_run
    }

    pub(crate) fn set_last_run_performed(&mut self) {
        self.last_run = true;
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn trace(&self) -> bool {
        self.trace
    }
}
