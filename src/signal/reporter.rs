//! Asynchronous signal delivery.
//!
//! The main asynchronous handler is signal-context code and does exactly
//! two things: one atomic increment and one semaphore post. Everything else
//! happens on the dedicated reporter thread, which drains the counts and
//! fans each delivery out to the registered records. The wakeup semaphore
//! is counted, so the reporter handles one pending signal per wakeup and
//! the next post brings it back for the rest.
//!
//! Registration quiesces: the record list never changes while callbacks
//! are in flight.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use libc::{c_int, c_void};

use super::install::NSIG;
use super::{
    ambiguous, attached, category_for, flags, install, option_set, options, sync, SignalError,
    ASYNC_OS_SIGNALS,
};
use crate::ffi;

/// Asynchronous callback: runs on the reporter thread, never in signal
/// context. Deliveries are at-least-once; callbacks must be idempotent
/// with respect to delivery count.
pub type AsyncHandlerFn = fn(category: u32, arg: *mut c_void);

struct AsyncRecord {
    handler: AsyncHandlerFn,
    arg: usize,
    mask: u32,
}

struct AsyncState {
    records: Vec<AsyncRecord>,
    in_flight: u32,
}

static ASYNC: Mutex<AsyncState> = Mutex::new(AsyncState { records: Vec::new(), in_flight: 0 });
static QUIESCED: Condvar = Condvar::new();

// Monotonic per-signal reservoirs: the main handler increments, the
// reporter decrements.
static SIGNAL_COUNTS: [AtomicU32; NSIG] = [const { AtomicU32::new(0) }; NSIG];
static SHUT_DOWN: AtomicBool = AtomicBool::new(false);

struct Wakeup {
    sem: UnsafeCell<MaybeUninit<libc::sem_t>>,
}

// Initialized by the first startup before the reporter exists; sem_post
// and sem_wait are thread-safe on an initialized semaphore.
unsafe impl Sync for Wakeup {}

static WAKEUP: Wakeup = Wakeup { sem: UnsafeCell::new(MaybeUninit::uninit()) };

fn wakeup_sem() -> *mut libc::sem_t {
    WAKEUP.sem.get() as *mut libc::sem_t
}

pub(super) fn init_wakeup() -> Result<(), SignalError> {
    SHUT_DOWN.store(false, Ordering::Release);
    for count in &SIGNAL_COUNTS {
        count.store(0, Ordering::Release);
    }
    ffi::sem_init(wakeup_sem(), 0).map_err(SignalError::Os)
}

pub(super) fn request_shutdown() {
    SHUT_DOWN.store(true, Ordering::Release);
    let _ = ffi::sem_post(wakeup_sem());
}

pub(super) fn teardown() {
    let _ = ffi::sem_destroy(wakeup_sem());
    let mut state = lock_async();
    state.records.clear();
    state.in_flight = 0;
    for count in &SIGNAL_COUNTS {
        count.store(0, Ordering::Release);
    }
}

fn lock_async() -> MutexGuard<'static, AsyncState> {
    ASYNC.lock().unwrap_or_else(|p| p.into_inner())
}

/// Signal-context entry point: count and post, nothing else.
pub(super) extern "C" fn main_async_handler(
    sig: c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut c_void,
) {
    if (sig as usize) < NSIG {
        SIGNAL_COUNTS[sig as usize].fetch_add(1, Ordering::AcqRel);
        let _ = ffi::sem_post(wakeup_sem());
    }
}

pub(super) fn reporter_loop() {
    tracing::debug!(target: "jitframe::signal", "reporter running");
    loop {
        if ffi::sem_wait(wakeup_sem()).is_err() {
            break;
        }
        if SHUT_DOWN.load(Ordering::Acquire) {
            break;
        }
        for &sig in &ASYNC_OS_SIGNALS {
            if SIGNAL_COUNTS[sig as usize].load(Ordering::Acquire) > 0 {
                let category = category_for(sig, 0);
                run_async_handlers(category, sig);
                SIGNAL_COUNTS[sig as usize].fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
    }
    tracing::debug!(target: "jitframe::signal", "reporter exiting");
}

fn run_async_handlers(category: u32, sig: c_int) {
    // Snapshot under the monitor with the in-flight counter raised; the
    // callbacks themselves run without any lock held.
    let snapshot: Vec<(AsyncHandlerFn, usize)> = {
        let mut state = lock_async();
        state.in_flight += 1;
        state
            .records
            .iter()
            .filter(|record| record.mask & category & !flags::IS_ASYNC != 0)
            .map(|record| (record.handler, record.arg))
            .collect()
    };

    for (handler, arg) in snapshot {
        handler(category, arg as *mut c_void);
    }

    {
        let mut state = lock_async();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            QUIESCED.notify_all();
        }
    }

    if !option_set(options::NO_CHAIN) {
        if let Some(original) = install::saved_original(sig) {
            if original.sa_sigaction != libc::SIG_DFL && original.sa_sigaction != libc::SIG_IGN {
                // SAFETY: forwarding a captured foreign disposition; async
                // chaining passes no siginfo.
                unsafe {
                    sync::call_foreign(&original, sig, std::ptr::null_mut(), std::ptr::null_mut())
                };
            }
        }
    }
}

fn validate_async_mask(mask: u32) -> Result<(), SignalError> {
    if mask == 0 {
        // Removal request.
        return Ok(());
    }
    if ambiguous(mask) {
        return Err(SignalError::AmbiguousFlags(mask));
    }
    if mask & !(flags::SIGALLASYNC | flags::IS_ASYNC) != 0 {
        return Err(SignalError::Unsupported(mask));
    }
    if option_set(options::REDUCED_SIGNALS_ASYNCHRONOUS) {
        let xfsz_granted = option_set(options::SIGXFSZ) && mask & !flags::SIGXFSZ == 0;
        if !xfsz_granted {
            return Err(SignalError::Unsupported(mask));
        }
    }
    Ok(())
}

fn quiesce() -> MutexGuard<'static, AsyncState> {
    let mut state = lock_async();
    while state.in_flight > 0 {
        state = QUIESCED.wait(state).unwrap_or_else(|p| p.into_inner());
    }
    state
}

fn upsert(state: &mut AsyncState, handler: AsyncHandlerFn, arg: usize, mask: u32) {
    let position = state
        .records
        .iter()
        .position(|record| record.handler as usize == handler as usize && record.arg == arg);
    match position {
        Some(index) if mask == 0 => {
            state.records.remove(index);
        }
        Some(index) => state.records[index].mask |= mask,
        None if mask != 0 => state.records.push(AsyncRecord { handler, arg, mask }),
        None => {}
    }
}

pub(super) fn set_async_signal_handler(
    handler: AsyncHandlerFn,
    arg: *mut c_void,
    mask: u32,
) -> Result<(), SignalError> {
    validate_async_mask(mask)?;
    if !attached() {
        return Err(SignalError::NotAttached);
    }
    if mask != 0 {
        install::install_main_async(mask).map_err(SignalError::Os)?;
    }
    let mut state = quiesce();
    upsert(&mut state, handler, arg as usize, mask);
    Ok(())
}

pub(super) fn set_single_async_signal_handler(
    handler: AsyncHandlerFn,
    arg: *mut c_void,
    single_flag: u32,
) -> Result<Option<libc::sigaction>, SignalError> {
    validate_async_mask(single_flag)?;
    if (single_flag & !flags::IS_ASYNC).count_ones() > 1 {
        return Err(SignalError::Unsupported(single_flag));
    }
    if !attached() {
        return Err(SignalError::NotAttached);
    }
    let replaced = if single_flag != 0 {
        install::install_main_async(single_flag).map_err(SignalError::Os)?
    } else {
        None
    };

    let mut state = quiesce();
    // One signal, one callback: strip the bit from every other record and
    // drop records left without a signal.
    let single_bit = single_flag & !flags::IS_ASYNC;
    for record in &mut state.records {
        if record.handler as usize != handler as usize || record.arg != arg as usize {
            record.mask &= !single_bit;
        }
    }
    state.records.retain(|record| record.mask & !flags::IS_ASYNC != 0);
    upsert(&mut state, handler, arg as usize, single_flag);
    Ok(replaced)
}

// Test observability.

#[cfg(test)]
pub(super) fn in_flight() -> u32 {
    lock_async().in_flight
}

#[cfg(test)]
pub(super) fn pending_count(sig: c_int) -> u32 {
    SIGNAL_COUNTS[sig as usize].load(Ordering::Acquire)
}

#[cfg(test)]
pub(super) fn snapshot_records() -> Vec<(usize, usize, u32)> {
    lock_async()
        .records
        .iter()
        .map(|record| (record.handler as usize, record.arg, record.mask))
        .collect()
}
