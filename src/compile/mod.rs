//! Per-compilation context.
//!
//! A [`Compilation`] bundles the method being compiled with everything the
//! optimizer consults while driving it: option switches, the hotness tier,
//! profiling and server state, the cancellation flag and the typed failure
//! channel. One compilation is driven by one thread; distinct compilations
//! may run concurrently.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::il::Method;

/// Compilation aggressiveness tier. Strategy selection and complexity
/// limits key off this.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Hotness {
    NoOpt,
    Cold,
    Warm,
    Hot,
    VeryHot,
    Scorching,
}

/// How (and whether) this compilation supports on-stack replacement.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum OsrMode {
    #[default]
    None,
    Voluntary,
    Involuntary,
}

/// Option switches the optimizer consults.
///
/// All default to off; hosts flip what they need.
#[derive(Clone, Debug)]
pub struct Options {
    /// Run passes on methods past the block/loop complexity limits instead
    /// of failing with [`CompilationFailure::ExcessiveComplexity`].
    pub process_huge_methods: bool,

    /// Select the partition-based value-numbering flavor instead of the
    /// hash-based one.
    pub prepartitioned_value_numbering: bool,

    /// Restrict use-def info to conversion registers.
    pub conversion_regs_only: bool,

    /// Only run optimizations whose name contains one of these needles.
    /// Empty means no restriction.
    pub enabled_opts: Vec<String>,

    /// Never run optimizations whose name contains one of these needles.
    pub disabled_opts: Vec<String>,

    /// Log a debugger attach point before running a matching optimization.
    pub break_on_opt: Vec<String>,

    /// Global optimization index window; passes outside it are skipped
    /// unless marked must-be-done.
    pub first_opt_index: u32,
    pub last_opt_index: u32,

    /// Startup-sensitive mode; some expensive passes are gated off.
    pub quick_start: bool,

    /// Ahead-of-time compilation.
    pub aot: bool,

    /// Full inlining requested while debugging under OSR.
    pub full_inlining_under_osr_debug: bool,

    /// Trace guard decisions and pass dispatch.
    pub trace_opt_details: bool,

    /// Measure and log per-pass wall time.
    pub time_opts: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            process_huge_methods: false,
            prepartitioned_value_numbering: false,
            conversion_regs_only: false,
            enabled_opts: Vec::new(),
            disabled_opts: Vec::new(),
            break_on_opt: Vec::new(),
            first_opt_index: 0,
            last_opt_index: u32::MAX,
            quick_start: false,
            aot: false,
            full_inlining_under_osr_debug: false,
            trace_opt_details: false,
            time_opts: false,
        }
    }
}

/// Typed compilation failures. The optimizer never swallows these; they
/// bubble to the compilation driver unchanged.
#[derive(Error, Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompilationFailure {
    #[error("invalid custom strategy word {0:#010x}")]
    InvalidStrategy(u32),

    #[error("method too complex: {blocks} blocks, {loops} loops")]
    ExcessiveComplexity { blocks: u32, loops: u32 },

    #[error("compilation must be retried at {required:?} or above")]
    InsufficientlyAggressiveCompilation { required: Hotness },

    #[error("compilation interrupted")]
    CompilationInterrupted,
}

pub struct Compilation {
    method: Method,
    pub options: Options,
    pub hotness: Hotness,
    pub profiling: bool,
    pub jit_profiling: bool,
    pub opt_server: bool,
    pub class_load_phase: bool,
    pub osr: OsrMode,
    pub outermost: bool,
    interrupt_requested: AtomicBool,
    demanded_hotness: Option<Hotness>,
    // Identifier of the optimizer currently driving this compilation;
    // optimizers nest and restore the previous value on return.
    current_optimizer: Option<u64>,
}

impl Compilation {
    pub fn new(method: Method, options: Options) -> Self {
        Self {
            method,
            options,
            hotness: Hotness::Warm,
            profiling: false,
            jit_profiling: false,
            opt_server: false,
            class_load_phase: false,
            osr: OsrMode::None,
            outermost: true,
            interrupt_requested: AtomicBool::new(false),
            demanded_hotness: None,
            current_optimizer: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    pub fn is_outermost_method(&self) -> bool {
        self.outermost
    }

    pub fn is_profiling_compilation(&self) -> bool {
        self.profiling
    }

    pub fn is_opt_server(&self) -> bool {
        self.opt_server
    }

    pub fn method_hotness(&self) -> Hotness {
        self.hotness
    }

    /// Demands recompilation at a higher tier; observed by the next
    /// `optimize()` as [`CompilationFailure::InsufficientlyAggressiveCompilation`].
    pub fn demand_hotness(&mut self, required: Hotness) {
        self.demanded_hotness = Some(required);
    }

    pub fn demanded_hotness(&self) -> Option<Hotness> {
        self.demanded_hotness
    }

    /// Cancellation request; may be called from any thread holding a
    /// shared reference.
    pub fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::Release);
    }

    pub fn compilation_should_be_interrupted(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    pub fn report_optimization_phase(&self, name: &str, begin: bool) {
        if begin {
            tracing::debug!(target: "jitframe::opt", opt = name, "performing");
        } else {
            tracing::trace!(target: "jitframe::opt", opt = name, "done");
        }
    }

    pub fn report_analysis_phase(&self, name: &str) {
        tracing::debug!(target: "jitframe::analysis", analysis = name, "building");
    }

    pub(crate) fn current_optimizer(&self) -> Option<u64> {
        self.current_optimizer
    }

    pub(crate) fn set_current_optimizer(&mut self, id: Option<u64>) {
        self.current_optimizer = id;
    }
}
