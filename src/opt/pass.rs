//! The pass contract.
//!
//! Optimizations are opaque to the driver: a factory produces a fresh
//! instance per dispatch, the instance votes with `should_perform`, then one
//! of the two dispatch shapes runs. Whole-method passes get
//! `pre_perform`/`perform`/`post_perform`; per-block dispatch (for entries
//! whose enabled-guard fired off a block-request set) gets the `_on_blocks`
//! shape with one `perform_on_block` call per live extended-block header.

use super::manager::{slot, OptManager};
use super::strategy::{OptGroup, OptId, Step};
use crate::analysis::AnalysisCache;
use crate::compile::Compilation;
use crate::il::{BlockId, Method};

/// What the driver hands a pass while it runs.
pub struct OptContext<'a> {
    pub comp: &'a mut Compilation,
    pub cache: &'a mut AnalysisCache,
    pub(crate) managers: &'a mut [OptManager],
    pub(crate) current: Step,
}

impl OptContext<'_> {
    pub fn method(&self) -> &Method {
        self.comp.method()
    }

    pub fn method_mut(&mut self) -> &mut Method {
        self.comp.method_mut()
    }

    /// The entry being dispatched.
    pub fn current_step(&self) -> Step {
        self.current
    }

    pub fn manager(&self, id: OptId) -> &OptManager {
        &self.managers[slot(Step::Opt(id))]
    }

    /// Requests a later whole-method run of `id`.
    pub fn request_opt(&mut self, id: OptId) {
        self.managers[slot(Step::Opt(id))].request();
    }

    /// Requests a later per-block run of `id` on `block`.
    pub fn request_opt_on_block(&mut self, id: OptId, block: BlockId) {
        self.managers[slot(Step::Opt(id))].request_on_block(block);
    }

    pub fn request_group(&mut self, group: OptGroup) {
        self.managers[slot(Step::Group(group))].request();
    }
}

/// One optimization instance, produced per dispatch by its factory.
///
/// `perform` and `perform_on_block` return a cost estimate in arbitrary
/// units; the driver forwards the sum as a rough budget signal.
pub trait OptimizationPass {
    fn should_perform(&self, _ctx: &OptContext<'_>) -> bool {
        true
    }

    fn pre_perform(&mut self, _ctx: &mut OptContext<'_>) {}

    fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32;

    fn post_perform(&mut self, _ctx: &mut OptContext<'_>) {}

    fn pre_perform_on_blocks(&mut self, _ctx: &mut OptContext<'_>) {}

    fn perform_on_block(&mut self, _block: BlockId, _ctx: &mut OptContext<'_>) -> i32 {
        0
    }

    fn post_perform_on_blocks(&mut self, _ctx: &mut OptContext<'_>) {}
}

pub type PassFactory = Box<dyn Fn() -> Box<dyn OptimizationPass>>;
