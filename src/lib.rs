//! Optimizer pipeline driver and POSIX signal protection core for JIT
//! runtimes.
//!
//! Two self-contained components:
//!
//! - [`opt`] drives an ordered, guarded strategy of optimization passes
//!   over one method's IL, materializing analyses ([`analysis`]) on demand
//!   and invalidating them as passes mutate the method.
//! - [`signal`] multiplexes synchronous fault signals across scoped
//!   protection frames with non-local return, and funnels asynchronous
//!   signals through a single reporter thread to registered listeners.
//!
//! ## Example
//!
//! Drive a one-entry strategy over a freshly built method:
//!
//! ```rust
//! use jitframe::compile::{Compilation, Hotness, Options};
//! use jitframe::il::{Method, Opcode};
//! use jitframe::opt::{
//!     Guard, OptContext, OptId, OptimizationPass, Optimizer, Step, StrategyEntry, StrategySource,
//! };
//!
//! struct CountBlocks;
//!
//! impl OptimizationPass for CountBlocks {
//!     fn perform(&mut self, ctx: &mut OptContext<'_>) -> i32 {
//!         ctx.method().cfg().block_count() as i32
//!     }
//! }
//!
//! let mut method = Method::new();
//! let block = method.cfg_mut().add_block();
//! let ret = method.create_node(Opcode::Return, vec![]);
//! method.cfg_mut().block_mut(block).trees.push(ret);
//! let mut comp = Compilation::new(method, Options::default());
//! comp.hotness = Hotness::Cold;
//!
//! let strategy = [StrategyEntry {
//!     step: Step::Opt(OptId::TreeSimplification),
//!     guard: Guard::Always,
//!     must_be_done: false,
//! }];
//! let mut optimizer = Optimizer::new(&comp, StrategySource::Explicit(&strategy)).unwrap();
//! optimizer.register_pass(OptId::TreeSimplification, Box::new(|| Box::new(CountBlocks)));
//! let cost = optimizer.optimize(&mut comp).unwrap();
//! assert!(cost >= 1);
//! ```
//!
//! Protection frames and asynchronous dispatch live in [`signal`]; see the
//! module docs for the signal-side example.

pub mod analysis;
pub mod compile;
mod ffi;
pub mod il;
pub mod opt;
pub mod signal;
