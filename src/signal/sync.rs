//! Synchronous fault protection.
//!
//! [`protect`] runs a function under a stack-allocated protection frame
//! linked into a per-thread chain. The main synchronous handler walks that
//! chain on the faulting thread, unlinking a matched frame before its
//! callback runs; a `ReturnException` verdict unwinds the protected call
//! with `siglongjmp` back into the trampoline established by `protect`.
//!
//! Everything the handler touches before user callbacks is async-signal
//! safe: the thread-locals are const-initialized `Cell`s over raw pointers
//! and plain scalars.

use std::cell::Cell;
use std::mem;
use std::ptr;

use libc::{c_int, c_void};

use super::{ambiguous, attached, category_for, flags, install, option_set, options, SignalError};
use crate::ffi;

/// Scalars describing the signal being dispatched, copied out of the
/// platform `siginfo` for the user callback.
#[derive(Clone, Copy, Debug)]
pub struct SignalInfo {
    pub category: u32,
    pub os_signal: i32,
    pub si_code: i32,
    pub fault_address: usize,
}

/// Verdict of a synchronous handler callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyncAction {
    /// Relink the frame and offer the signal to the next one down.
    ContinueSearch,
    /// Return from the OS handler; the OS resumes the faulting instruction.
    ContinueExecution,
    /// Unwind to the protection frame; the protected call reports
    /// [`Protected::Exception`].
    ReturnException,
}

/// How a protected call ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protected {
    /// The function ran to completion; its return value.
    Done(usize),
    /// A fault was dispatched to the frame's callback, which unwound the
    /// call; the dispatched category.
    Exception(u32),
}

pub type SyncHandlerFn = fn(info: &SignalInfo, arg: *mut c_void) -> SyncAction;

#[derive(Clone, Copy)]
struct CurrentSignal {
    category: u32,
    os_signal: i32,
    si_code: i32,
}

impl CurrentSignal {
    const NONE: Self = Self { category: 0, os_signal: 0, si_code: 0 };
}

struct ProtectFrame {
    prev: *mut ProtectFrame,
    flags: u32,
    handler: SyncHandlerFn,
    handler_arg: *mut c_void,
    /// Jump target inside the C trampoline; null unless MAY_RETURN.
    jmp: *mut ffi::SigJmpBuf,
    /// Category written by the handler just before it unwinds here.
    dispatched: u32,
}

thread_local! {
    // Const-initialized so first access from signal context performs no
    // lazy initialization.
    static FRAME_TOP: Cell<*mut ProtectFrame> = const { Cell::new(ptr::null_mut()) };
    static CURRENT: Cell<CurrentSignal> = const { Cell::new(CurrentSignal::NONE) };
}

/// The logical category being dispatched on this thread, or zero. Nested
/// dispatches save and restore the previous value.
pub fn current_signal() -> u32 {
    CURRENT.get().category
}

#[cfg(test)]
pub(super) fn frame_stack_empty() -> bool {
    FRAME_TOP.get().is_null()
}

struct Invocation<F> {
    f: Option<F>,
    result: usize,
    frame: ProtectFrame,
}

/// Runs `f` within a new protection frame.
///
/// With `mask == 0` or under `REDUCED_SIGNALS_SYNCHRONOUS` no OS handler is
/// installed and `f` simply runs. Otherwise main synchronous handlers are
/// installed lazily for the requested categories, the frame is pushed, and
/// `f` runs under it; with [`flags::MAY_RETURN`] a non-local-return target
/// is established first.
///
/// A `ReturnException` unwind skips the destructors of everything between
/// the fault and the protection frame; protected functions must not rely on
/// drops for correctness. A panic out of `f` aborts the process.
pub fn protect<F>(
    f: F,
    handler: SyncHandlerFn,
    handler_arg: *mut c_void,
    mask: u32,
) -> Result<Protected, SignalError>
where
    F: FnOnce() -> usize,
{
    if mask != 0 {
        if ambiguous(mask) {
            return Err(SignalError::AmbiguousFlags(mask));
        }
        if mask & !(flags::SIGALLSYNC | flags::CONTROL | flags::IS_SYNC) != 0 {
            return Err(SignalError::Unsupported(mask));
        }
    }

    if mask == 0 || option_set(options::REDUCED_SIGNALS_SYNCHRONOUS) {
        return Ok(Protected::Done(f()));
    }

    if !attached() {
        return Err(SignalError::NotAttached);
    }
    install::install_main_sync(mask)?;

    let mut inv = Invocation {
        f: Some(f),
        result: 0,
        frame: ProtectFrame {
            prev: ptr::null_mut(),
            flags: mask,
            handler,
            handler_arg,
            jmp: ptr::null_mut(),
            dispatched: 0,
        },
    };

    if mask & flags::MAY_RETURN != 0 {
        let inv_ptr = &mut inv as *mut Invocation<F> as *mut c_void;
        let slot: *mut *mut ffi::SigJmpBuf = &mut inv.frame.jmp;
        // SAFETY: the trampoline publishes the sigsetjmp buffer through
        // `slot` before running the body, so the frame's jump target is
        // valid for exactly the extent of the protected call.
        let jumped = unsafe { ffi::jitframe_sigprotect(run_protected::<F>, inv_ptr, slot) };
        if jumped != 0 {
            // The handler unlinked the frame before unwinding (I-S3).
            return Ok(Protected::Exception(inv.frame.dispatched));
        }
        Ok(Protected::Done(inv.result))
    } else {
        run_protected::<F>(&mut inv as *mut Invocation<F> as *mut c_void);
        Ok(Protected::Done(inv.result))
    }
}

struct PopGuard {
    prev: *mut ProtectFrame,
}

impl Drop for PopGuard {
    fn drop(&mut self) {
        FRAME_TOP.set(self.prev);
    }
}

extern "C" fn run_protected<F: FnOnce() -> usize>(arg: *mut c_void) {
    // SAFETY: `arg` is the Invocation<F> living in `protect`'s frame on
    // this thread.
    let inv = unsafe { &mut *(arg as *mut Invocation<F>) };
    inv.frame.prev = FRAME_TOP.get();
    FRAME_TOP.set(&mut inv.frame);
    // Popped on normal exit. A non-local return skips this drop; the
    // handler has already reset the stack below this frame by then.
    let _guard = PopGuard { prev: inv.frame.prev };
    let f = inv.f.take().expect("protected function already consumed");
    inv.result = f();
}

pub(super) extern "C" fn main_sync_handler(
    sig: c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut c_void,
) {
    let si_code = if info.is_null() { 0 } else { unsafe { (*info).si_code } };
    let category = category_for(sig, si_code);
    if category == 0 {
        return;
    }
    let fault_address = if info.is_null() {
        0
    } else {
        // SAFETY: si_addr is valid for the fault signals this handler is
        // ever installed for.
        unsafe { (*info).si_addr() as usize }
    };

    let saved = CURRENT.get();
    CURRENT.set(CurrentSignal { category, os_signal: sig, si_code });
    let signal_info = SignalInfo { category, os_signal: sig, si_code, fault_address };

    let mut record = FRAME_TOP.get();
    while !record.is_null() {
        // SAFETY: frames live on the stacks of protect calls whose dynamic
        // extent encloses this dispatch.
        let frame = unsafe { &mut *record };

        // FP sub-codes carry the SIGFPE bit, so a frame registered for
        // SIGFPE matches every variant.
        if frame.flags & category & !flags::IS_SYNC == 0 {
            record = frame.prev;
            continue;
        }

        // Unlink before the callback so a crash inside it cannot re-enter
        // this frame.
        FRAME_TOP.set(frame.prev);
        match (frame.handler)(&signal_info, frame.handler_arg) {
            SyncAction::ContinueSearch => {
                FRAME_TOP.set(record);
                record = frame.prev;
            }
            SyncAction::ContinueExecution => {
                // The frame stays armed: execution resumes inside its
                // protected extent.
                FRAME_TOP.set(record);
                CURRENT.set(saved);
                return;
            }
            SyncAction::ReturnException => {
                CURRENT.set(saved);
                frame.dispatched = category;
                if frame.jmp.is_null() {
                    // The frame never established a jump target
                    // (MAY_RETURN unset); there is nowhere to unwind to.
                    unsafe { libc::abort() }
                }
                // SAFETY: the target trampoline frame is live; savemask
                // restores the OS-imposed signal mask at the jump target.
                unsafe { ffi::siglongjmp(frame.jmp, 1) }
            }
        }
    }

    CURRENT.set(saved);
    unhandled(sig, info, ctx, si_code);
}

fn unhandled(sig: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void, si_code: i32) {
    if option_set(options::NO_CHAIN) {
        unsafe { libc::abort() }
    }
    match install::saved_original(sig) {
        Some(original) if original.sa_sigaction == libc::SIG_IGN => {}
        Some(original) if original.sa_sigaction != libc::SIG_DFL => {
            // SAFETY: the disposition was captured from a live sigaction;
            // forwarding matches the contract it was installed under.
            unsafe { call_foreign(&original, sig, info, ctx) };
        }
        _ => {
            // Default action required. Positive si_code means the signal
            // came from hardware, so resuming cannot make progress.
            if si_code > 0 {
                unsafe { libc::abort() }
            }
        }
    }
}

/// Invokes a foreign disposition captured before a main handler replaced
/// it.
pub(super) unsafe fn call_foreign(
    original: &libc::sigaction,
    sig: c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut c_void,
) {
    if original.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void) =
            mem::transmute(original.sa_sigaction);
        handler(sig, info, ctx);
    } else {
        let handler: extern "C" fn(c_int) = mem::transmute(original.sa_sigaction);
        handler(sig);
    }
}
