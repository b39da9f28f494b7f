//! Process-wide signal dispatch and protection.
//!
//! Two delivery paths share one lazy installation layer:
//!
//! - *Synchronous* fault signals (SIGSEGV, SIGBUS, SIGILL, SIGTRAP, SIGFPE)
//!   dispatch on the faulting thread through a per-thread stack of
//!   protection frames pushed by [`protect`]; a frame's callback can resume
//!   the faulting instruction or unwind the protected call with a non-local
//!   return.
//! - *Asynchronous* signals (SIGQUIT, SIGINT, SIGTERM, SIGHUP, SIGALRM,
//!   SIGXFSZ) are only counted in the OS handler; a dedicated reporter
//!   thread drains the counts and fans each delivery out to the registered
//!   listeners. User callbacks never execute in signal context.
//!
//! The dispatcher is a process-wide singleton with attach counting: the
//! first [`startup`] creates it, the last [`shutdown`] restores every OS
//! disposition it overrode and tears it down.
//!
//! ## Example
//!
//! ```no_run
//! use jitframe::signal::{self, flags, Protected, SyncAction};
//!
//! signal::startup().unwrap();
//!
//! let outcome = signal::protect(
//!     || unsafe { libc::raise(libc::SIGSEGV) as usize },
//!     |info, _arg| {
//!         assert_eq!(info.os_signal, libc::SIGSEGV);
//!         SyncAction::ReturnException
//!     },
//!     std::ptr::null_mut(),
//!     flags::SIGSEGV | flags::MAY_RETURN,
//! )
//! .unwrap();
//! assert!(matches!(outcome, Protected::Exception(_)));
//!
//! signal::shutdown().unwrap();
//! ```

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use arrayvec::ArrayVec;
use libc::c_int;
use thiserror::Error;

mod install;
mod reporter;
mod sync;

#[cfg(test)]
mod test;

pub use reporter::AsyncHandlerFn;
pub use sync::{current_signal, protect, Protected, SignalInfo, SyncAction, SyncHandlerFn};

/// Signal category and control bits.
///
/// A category always carries its kind indicator ([`IS_SYNC`] or
/// [`IS_ASYNC`]); the SIGFPE sub-codes also carry the [`SIGFPE`] bit so a
/// frame protecting against SIGFPE matches every FP variant.
pub mod flags {
    /// The protected call may be unwound by a non-local return.
    pub const MAY_RETURN: u32 = 1 << 0;
    /// The handler may ask to resume the faulting instruction.
    pub const MAY_CONTINUE_EXECUTION: u32 = 1 << 1;
    pub const IS_SYNC: u32 = 1 << 2;
    pub const IS_ASYNC: u32 = 1 << 3;

    pub const SIGSEGV: u32 = IS_SYNC | 1 << 4;
    pub const SIGBUS: u32 = IS_SYNC | 1 << 5;
    pub const SIGILL: u32 = IS_SYNC | 1 << 6;
    pub const SIGTRAP: u32 = IS_SYNC | 1 << 7;
    pub const SIGFPE: u32 = IS_SYNC | 1 << 8;
    pub const SIGFPE_DIV_BY_ZERO: u32 = SIGFPE | 1 << 9;
    pub const SIGFPE_INT_DIV_BY_ZERO: u32 = SIGFPE | 1 << 10;
    pub const SIGFPE_INT_OVERFLOW: u32 = SIGFPE | 1 << 11;

    pub const SIGQUIT: u32 = IS_ASYNC | 1 << 12;
    pub const SIGINT: u32 = IS_ASYNC | 1 << 13;
    pub const SIGTERM: u32 = IS_ASYNC | 1 << 14;
    pub const SIGHUP: u32 = IS_ASYNC | 1 << 15;
    pub const SIGALRM: u32 = IS_ASYNC | 1 << 16;
    pub const SIGXFSZ: u32 = IS_ASYNC | 1 << 17;

    pub const SIGALLSYNC: u32 = SIGSEGV
        | SIGBUS
        | SIGILL
        | SIGTRAP
        | SIGFPE
        | SIGFPE_DIV_BY_ZERO
        | SIGFPE_INT_DIV_BY_ZERO
        | SIGFPE_INT_OVERFLOW;
    pub const SIGALLASYNC: u32 = SIGQUIT | SIGINT | SIGTERM | SIGHUP | SIGALRM | SIGXFSZ;

    pub(super) const CONTROL: u32 = MAY_RETURN | MAY_CONTINUE_EXECUTION;
}

/// Dispatcher option bits, OR-merged by [`set_options`].
pub mod options {
    /// `protect` runs its function without installing OS handlers;
    /// protected faults are not recoverable.
    pub const REDUCED_SIGNALS_SYNCHRONOUS: u32 = 1 << 0;
    /// Async registration is refused, except SIGXFSZ when granted.
    pub const REDUCED_SIGNALS_ASYNCHRONOUS: u32 = 1 << 1;
    /// Grants SIGXFSZ registration under reduced-async mode.
    pub const SIGXFSZ: u32 = 1 << 2;
    /// Never forward unhandled signals to foreign handlers.
    pub const NO_CHAIN: u32 = 1 << 3;
    /// Accepted for option-mask round-trips; the cooperative-abend path is
    /// not portable and no handler verdict maps to it.
    pub const COOPERATIVE_SHUTDOWN: u32 = 1 << 4;

    pub(super) const ALL: u32 = REDUCED_SIGNALS_SYNCHRONOUS
        | REDUCED_SIGNALS_ASYNCHRONOUS
        | SIGXFSZ
        | NO_CHAIN
        | COOPERATIVE_SHUTDOWN;
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("flags {0:#x} select both or neither of sync and async")]
    AmbiguousFlags(u32),

    #[error("unsupported signal flags {0:#x}")]
    Unsupported(u32),

    #[error("the signal dispatcher is not attached")]
    NotAttached,

    #[error("cannot switch into reduced-signal mode with handlers installed")]
    HandlersInstalled,

    #[error(transparent)]
    Os(#[from] io::Error),
}

/// Non-zero flags must select exactly one of the kind indicators.
fn ambiguous(flags: u32) -> bool {
    let is_sync = flags & flags::IS_SYNC != 0;
    let is_async = flags & flags::IS_ASYNC != 0;
    flags != 0 && is_sync == is_async
}

static OPTIONS: AtomicU32 = AtomicU32::new(0);

fn option_set(bit: u32) -> bool {
    OPTIONS.load(Ordering::Acquire) & bit != 0
}

/// OR-merges `mask` into the dispatcher options. Switching into a reduced
/// mode fails once any OS handler is installed.
pub fn set_options(mask: u32) -> Result<(), SignalError> {
    if mask & !options::ALL != 0 {
        return Err(SignalError::Unsupported(mask));
    }
    let reducing = mask
        & (options::REDUCED_SIGNALS_SYNCHRONOUS | options::REDUCED_SIGNALS_ASYNCHRONOUS)
        != 0;
    if reducing && install::any_installed() {
        return Err(SignalError::HandlersInstalled);
    }
    OPTIONS.fetch_or(mask, Ordering::AcqRel);
    Ok(())
}

pub fn get_options() -> u32 {
    OPTIONS.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Category <-> OS signal mapping.
// ---------------------------------------------------------------------------

// libc's Linux bindings omit the FPE si_code constants; these match the
// fixed glibc/kernel siginfo.h ABI values.
const FPE_INTDIV: i32 = 1;
const FPE_INTOVF: i32 = 2;
const FPE_FLTDIV: i32 = 3;

const ASYNC_OS_SIGNALS: [c_int; 6] = [
    libc::SIGQUIT,
    libc::SIGINT,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGALRM,
    libc::SIGXFSZ,
];

fn category_for(sig: c_int, si_code: i32) -> u32 {
    match sig {
        libc::SIGSEGV => flags::SIGSEGV,
        libc::SIGBUS => flags::SIGBUS,
        libc::SIGILL => flags::SIGILL,
        libc::SIGTRAP => flags::SIGTRAP,
        libc::SIGFPE => match si_code {
            FPE_FLTDIV => flags::SIGFPE_DIV_BY_ZERO,
            FPE_INTDIV => flags::SIGFPE_INT_DIV_BY_ZERO,
            FPE_INTOVF => flags::SIGFPE_INT_OVERFLOW,
            _ => flags::SIGFPE,
        },
        libc::SIGQUIT => flags::SIGQUIT,
        libc::SIGINT => flags::SIGINT,
        libc::SIGTERM => flags::SIGTERM,
        libc::SIGHUP => flags::SIGHUP,
        libc::SIGALRM => flags::SIGALRM,
        libc::SIGXFSZ => flags::SIGXFSZ,
        _ => 0,
    }
}

/// OS signals covered by the synchronous categories in `mask`, each once;
/// all FP variants fold onto SIGFPE.
fn sync_os_signals(mask: u32) -> ArrayVec<c_int, 5> {
    let mut sigs = ArrayVec::new();
    let mut push = |bit: u32, sig: c_int| {
        if mask & bit & !flags::IS_SYNC != 0 && !sigs.contains(&sig) {
            sigs.push(sig);
        }
    };
    push(flags::SIGSEGV, libc::SIGSEGV);
    push(flags::SIGBUS, libc::SIGBUS);
    push(flags::SIGILL, libc::SIGILL);
    push(flags::SIGTRAP, libc::SIGTRAP);
    // Sub-codes carry the SIGFPE bit, so one probe covers all FP variants.
    push(flags::SIGFPE, libc::SIGFPE);
    sigs
}

/// OS signals covered by the asynchronous categories in `mask`.
fn async_os_signals(mask: u32) -> ArrayVec<c_int, 6> {
    let mut sigs = ArrayVec::new();
    let mut push = |bit: u32, sig: c_int| {
        if mask & bit & !flags::IS_ASYNC != 0 {
            sigs.push(sig);
        }
    };
    push(flags::SIGQUIT, libc::SIGQUIT);
    push(flags::SIGINT, libc::SIGINT);
    push(flags::SIGTERM, libc::SIGTERM);
    push(flags::SIGHUP, libc::SIGHUP);
    push(flags::SIGALRM, libc::SIGALRM);
    push(flags::SIGXFSZ, libc::SIGXFSZ);
    sigs
}

// ---------------------------------------------------------------------------
// Lifecycle.
// ---------------------------------------------------------------------------

struct Context {
    attach_count: u32,
    reporter: Option<JoinHandle<()>>,
}

static CONTEXT: Mutex<Context> = Mutex::new(Context { attach_count: 0, reporter: None });

fn attached() -> bool {
    CONTEXT.lock().unwrap_or_else(|p| p.into_inner()).attach_count > 0
}

/// Attaches to the dispatcher. The first attach creates the wakeup
/// semaphore and the reporter thread; no OS handler is installed yet
/// (installation is lazy).
pub fn startup() -> Result<(), SignalError> {
    let mut ctx = CONTEXT.lock().unwrap_or_else(|p| p.into_inner());
    if ctx.attach_count == 0 {
        reporter::init_wakeup()?;
        let thread = std::thread::Builder::new()
            .name("signal reporter".into())
            .spawn(reporter::reporter_loop);
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                reporter::teardown();
                return Err(SignalError::Os(err));
            }
        };
        ctx.reporter = Some(thread);
        tracing::debug!(target: "jitframe::signal", "dispatcher attached");
    }
    ctx.attach_count += 1;
    Ok(())
}

/// Detaches from the dispatcher. The last detach stops the reporter,
/// restores every OS disposition captured at installation time and resets
/// all module state, so a later [`startup`] begins fresh.
pub fn shutdown() -> Result<(), SignalError> {
    let mut ctx = CONTEXT.lock().unwrap_or_else(|p| p.into_inner());
    if ctx.attach_count == 0 {
        return Err(SignalError::NotAttached);
    }
    ctx.attach_count -= 1;
    if ctx.attach_count > 0 {
        return Ok(());
    }

    reporter::request_shutdown();
    if let Some(thread) = ctx.reporter.take() {
        // The reporter observes the flag on its next wakeup and signals
        // exit by terminating; joining is the shutdown condition.
        let _ = thread.join();
    }
    install::restore_all();
    reporter::teardown();
    OPTIONS.store(0, Ordering::Release);
    tracing::debug!(target: "jitframe::signal", "dispatcher detached");
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries and direct OS-handler management.
// ---------------------------------------------------------------------------

/// Whether [`protect`] can honor the requested capability set under the
/// current options.
pub fn can_protect(mask: u32) -> bool {
    if mask == 0 {
        return true;
    }
    if ambiguous(mask) || mask & flags::IS_ASYNC != 0 {
        return false;
    }
    if mask & !(flags::SIGALLSYNC | flags::CONTROL | flags::IS_SYNC) != 0 {
        return false;
    }
    !option_set(options::REDUCED_SIGNALS_SYNCHRONOUS)
}

/// True iff `handler` is one of the dispatcher's OS-level entry points.
pub fn is_main_signal_handler(handler: usize) -> bool {
    handler == sync::main_sync_handler as usize || handler == reporter::main_async_handler as usize
}

/// Queries the OS disposition of the single signal in `single_flag` and
/// reports whether it is "ignore".
pub fn is_signal_ignored(single_flag: u32) -> Result<bool, SignalError> {
    let sig = single_os_signal(single_flag)?;
    install::is_ignored(sig).map_err(SignalError::Os)
}

/// Installs a caller-supplied OS-level handler for exactly one signal,
/// bypassing the main handler. Returns the replaced disposition.
pub fn register_os_handler(
    single_flag: u32,
    handler: libc::sighandler_t,
) -> Result<libc::sigaction, SignalError> {
    let sig = single_os_signal(single_flag)?;
    install::install_custom(sig, handler).map_err(SignalError::Os)
}

/// Registers, updates or removes an asynchronous callback.
///
/// Main async handlers are installed lazily for every signal in `mask`
/// that lacks one, then the call quiesces until no dispatch is in flight.
/// `mask == 0` removes the record matching `(handler, handler_arg)`;
/// otherwise `mask` is OR-merged into the matching record, or a fresh
/// record is appended.
pub fn set_async_signal_handler(
    handler: AsyncHandlerFn,
    handler_arg: *mut libc::c_void,
    mask: u32,
) -> Result<(), SignalError> {
    reporter::set_async_signal_handler(handler, handler_arg, mask)
}

/// As [`set_async_signal_handler`], but `single_flag` names at most one
/// signal and becomes exclusively associated with this callback: the bit is
/// cleared from every other record. Returns the disposition replaced by a
/// fresh main-handler install, if one happened.
pub fn set_single_async_signal_handler(
    handler: AsyncHandlerFn,
    handler_arg: *mut libc::c_void,
    single_flag: u32,
) -> Result<Option<libc::sigaction>, SignalError> {
    reporter::set_single_async_signal_handler(handler, handler_arg, single_flag)
}

fn single_os_signal(single_flag: u32) -> Result<c_int, SignalError> {
    if ambiguous(single_flag) {
        return Err(SignalError::AmbiguousFlags(single_flag));
    }
    let sync = sync_os_signals(single_flag);
    let asynchronous = async_os_signals(single_flag);
    match (sync.as_slice(), asynchronous.as_slice()) {
        ([sig], []) | ([], [sig]) => Ok(*sig),
        _ => Err(SignalError::Unsupported(single_flag)),
    }
}
