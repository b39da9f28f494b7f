//! OS-handler installation.
//!
//! One main handler exists per signal kind; installation is lazy and
//! serialized by the register lock. The first installation per OS signal
//! captures the previous disposition so full teardown can restore it
//! bit-exactly; later re-installations throw the replaced disposition away.
//! The originals live in a lock-free table because the chaining path reads
//! them from signal context.

use std::cell::UnsafeCell;
use std::io::Result;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Mutex;

use libc::c_int;

use super::{async_os_signals, reporter, sync};
use crate::ffi;

/// One past the largest signal number we ever touch.
pub(super) const NSIG: usize = 65;

// Serializes sigaction calls and bitmask/original-table updates.
static REGISTER: Mutex<()> = Mutex::new(());

// Bit `sig` set when this module owns the disposition of signal `sig`.
static INSTALLED: AtomicU64 = AtomicU64::new(0);
// Subset of INSTALLED where the disposition is one of the main handlers.
static MAIN_INSTALLED: AtomicU64 = AtomicU64::new(0);
// Bit `sig` set once ORIGINALS[sig] holds the captured disposition.
static ORIGINAL_SAVED: AtomicU64 = AtomicU64::new(0);

struct OriginalTable {
    slots: [UnsafeCell<MaybeUninit<libc::sigaction>>; NSIG],
}

// Writes happen under REGISTER with the bit in ORIGINAL_SAVED published
// afterwards (Release); readers check the bit first (Acquire). A slot is
// written at most once.
unsafe impl Sync for OriginalTable {}

static ORIGINALS: OriginalTable = OriginalTable {
    slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; NSIG],
};

fn bit(sig: c_int) -> u64 {
    1u64 << sig as u64
}

pub(super) fn any_installed() -> bool {
    INSTALLED.load(Ordering::Acquire) != 0
}

pub(super) fn main_installed_for(sig: c_int) -> bool {
    MAIN_INSTALLED.load(Ordering::Acquire) & bit(sig) != 0
}

/// The disposition captured at first installation, readable from signal
/// context.
pub(super) fn saved_original(sig: c_int) -> Option<libc::sigaction> {
    if ORIGINAL_SAVED.load(Ordering::Acquire) & bit(sig) == 0 {
        return None;
    }
    // The slot was fully written before the bit was published and is never
    // written again.
    Some(unsafe { (*ORIGINALS.slots[sig as usize].get()).assume_init() })
}

fn action_for(handler: libc::sighandler_t, mask: libc::sigset_t) -> libc::sigaction {
    // Zero-initialized to stay independent of per-libc extra fields.
    let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
    action.sa_sigaction = handler;
    action.sa_mask = mask;
    // Restart interrupted syscalls, deliver siginfo, and do not mask the
    // signal during its own handler (the protection-frame walk must observe
    // nested faults).
    action.sa_flags = libc::SA_RESTART | libc::SA_SIGINFO | libc::SA_NODEFER;
    action
}

/// Installs `handler` for `sig`, capturing the original disposition on
/// first touch. Returns the replaced disposition. Caller holds REGISTER.
fn install_locked(
    sig: c_int,
    handler: libc::sighandler_t,
    mask: libc::sigset_t,
    is_main: bool,
) -> Result<libc::sigaction> {
    let action = action_for(handler, mask);
    let mut replaced = MaybeUninit::<libc::sigaction>::zeroed();
    ffi::sigaction(sig, Some(&action), Some(unsafe { &mut *replaced.as_mut_ptr() }))?;
    let replaced = unsafe { replaced.assume_init() };

    if ORIGINAL_SAVED.load(Ordering::Acquire) & bit(sig) == 0 {
        // First install: this is the disposition shutdown restores. Later
        // re-installs drop the replaced disposition on the floor.
        unsafe { (*ORIGINALS.slots[sig as usize].get()).write(replaced) };
        ORIGINAL_SAVED.fetch_or(bit(sig), Ordering::Release);
    }

    // The new disposition must be visible to every thread before a fault
    // can reach it.
    fence(Ordering::SeqCst);
    INSTALLED.fetch_or(bit(sig), Ordering::Release);
    if is_main {
        MAIN_INSTALLED.fetch_or(bit(sig), Ordering::Release);
    } else {
        MAIN_INSTALLED.fetch_and(!bit(sig), Ordering::Release);
    }

    // A blocked signal inherited across fork/exec must not mask what we
    // just installed.
    ffi::unblock([sig])?;

    tracing::debug!(target: "jitframe::signal", sig, is_main, "handler installed");
    Ok(replaced)
}

/// Lazily installs the main synchronous handler for every sync category in
/// `mask` that lacks one.
pub(super) fn install_main_sync(mask: u32) -> Result<()> {
    let _guard = REGISTER.lock().unwrap_or_else(|p| p.into_inner());
    for sig in super::sync_os_signals(mask) {
        if !main_installed_for(sig) {
            install_locked(
                sig,
                sync::main_sync_handler as libc::sighandler_t,
                ffi::empty_sigset(),
                true,
            )?;
        }
    }
    Ok(())
}

/// Lazily installs the main asynchronous handler for every async category
/// in `mask` that lacks one. Returns the last freshly replaced disposition.
///
/// All other async signals are masked while the handler runs, so async
/// dispatch never nests on the counting path.
pub(super) fn install_main_async(mask: u32) -> Result<Option<libc::sigaction>> {
    let _guard = REGISTER.lock().unwrap_or_else(|p| p.into_inner());
    let handler_mask = ffi::sigset_of(super::ASYNC_OS_SIGNALS);
    let mut replaced = None;
    for sig in async_os_signals(mask) {
        if !main_installed_for(sig) {
            replaced = Some(install_locked(
                sig,
                reporter::main_async_handler as libc::sighandler_t,
                handler_mask,
                true,
            )?);
        }
    }
    Ok(replaced)
}

/// Installs a caller-supplied OS-level handler, bypassing the main handler.
pub(super) fn install_custom(sig: c_int, handler: libc::sighandler_t) -> Result<libc::sigaction> {
    let _guard = REGISTER.lock().unwrap_or_else(|p| p.into_inner());
    install_locked(sig, handler, ffi::empty_sigset(), false)
}

/// Queries whether the OS disposition of `sig` is "ignore".
pub(super) fn is_ignored(sig: c_int) -> Result<bool> {
    let mut current = MaybeUninit::<libc::sigaction>::zeroed();
    ffi::sigaction(sig, None, Some(unsafe { &mut *current.as_mut_ptr() }))?;
    let current = unsafe { current.assume_init() };
    Ok(current.sa_sigaction == libc::SIG_IGN)
}

/// Restores every overridden disposition to the one captured at first
/// installation and resets the installation state.
pub(super) fn restore_all() {
    let _guard = REGISTER.lock().unwrap_or_else(|p| p.into_inner());
    let installed = INSTALLED.load(Ordering::Acquire);
    for sig in 1..64 as c_int {
        if installed & bit(sig) == 0 {
            continue;
        }
        if let Some(original) = saved_original(sig) {
            if let Err(err) = ffi::sigaction(sig, Some(&original), None) {
                tracing::warn!(target: "jitframe::signal", sig, %err, "failed to restore disposition");
            }
        }
    }
    INSTALLED.store(0, Ordering::Release);
    MAIN_INSTALLED.store(0, Ordering::Release);
    ORIGINAL_SAVED.store(0, Ordering::Release);
}
