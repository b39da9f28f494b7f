use std::ptr::null_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use libc::{c_int, c_void};

use super::*;

// OS dispositions are process state; every test in this module serializes
// on this lock and detaches the dispatcher before releasing it.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn disposition(sig: libc::c_int) -> libc::sigaction {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(sig, std::ptr::null(), &mut action) };
    assert_eq!(rc, 0);
    action
}

fn wait_for(condition: impl Fn() -> bool) -> bool {
    for _ in 0..5_000 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

static SYNC_CALLS: AtomicU32 = AtomicU32::new(0);
static SYNC_SEEN_CATEGORY: AtomicU32 = AtomicU32::new(0);
static SYNC_CURRENT_DURING: AtomicU32 = AtomicU32::new(0);

fn unwind_handler(info: &SignalInfo, _arg: *mut c_void) -> SyncAction {
    SYNC_CALLS.fetch_add(1, Ordering::SeqCst);
    SYNC_SEEN_CATEGORY.store(info.category, Ordering::SeqCst);
    SYNC_CURRENT_DURING.store(current_signal(), Ordering::SeqCst);
    SyncAction::ReturnException
}

#[test]
fn protected_fault_unwinds_to_the_frame() {
    let _lock = lock();
    SYNC_CALLS.store(0, Ordering::SeqCst);
    SYNC_SEEN_CATEGORY.store(0, Ordering::SeqCst);
    SYNC_CURRENT_DURING.store(0, Ordering::SeqCst);
    startup().unwrap();

    let outcome = protect(
        || {
            unsafe { libc::raise(libc::SIGSEGV) };
            99
        },
        unwind_handler,
        null_mut(),
        flags::SIGSEGV | flags::MAY_RETURN,
    )
    .unwrap();

    assert_eq!(outcome, Protected::Exception(flags::SIGSEGV));
    assert_eq!(SYNC_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(SYNC_SEEN_CATEGORY.load(Ordering::SeqCst), flags::SIGSEGV);
    // The signal was current while the callback ran and cleared after.
    assert_eq!(SYNC_CURRENT_DURING.load(Ordering::SeqCst), flags::SIGSEGV);
    assert_eq!(current_signal(), 0);
    assert!(sync::frame_stack_empty());

    shutdown().unwrap();
}

static CONTINUE_CALLS: AtomicU32 = AtomicU32::new(0);

fn continue_handler(_info: &SignalInfo, _arg: *mut c_void) -> SyncAction {
    CONTINUE_CALLS.fetch_add(1, Ordering::SeqCst);
    SyncAction::ContinueExecution
}

#[test]
fn continue_execution_resumes_the_protected_function() {
    let _lock = lock();
    CONTINUE_CALLS.store(0, Ordering::SeqCst);
    startup().unwrap();

    let outcome = protect(
        || {
            unsafe { libc::raise(libc::SIGSEGV) };
            5
        },
        continue_handler,
        null_mut(),
        flags::SIGSEGV | flags::MAY_CONTINUE_EXECUTION,
    )
    .unwrap();

    assert_eq!(outcome, Protected::Done(5));
    assert_eq!(CONTINUE_CALLS.load(Ordering::SeqCst), 1);
    assert!(sync::frame_stack_empty());

    shutdown().unwrap();
}

static INNER_CALLS: AtomicU32 = AtomicU32::new(0);
static OUTER_CALLS: AtomicU32 = AtomicU32::new(0);
static INNER_OUTCOME: AtomicU32 = AtomicU32::new(0);

fn inner_handler(_info: &SignalInfo, _arg: *mut c_void) -> SyncAction {
    INNER_CALLS.fetch_add(1, Ordering::SeqCst);
    SyncAction::ReturnException
}

fn outer_handler(_info: &SignalInfo, _arg: *mut c_void) -> SyncAction {
    OUTER_CALLS.fetch_add(1, Ordering::SeqCst);
    SyncAction::ReturnException
}

#[test]
fn nested_frames_unwind_only_the_matched_one() {
    let _lock = lock();
    INNER_CALLS.store(0, Ordering::SeqCst);
    OUTER_CALLS.store(0, Ordering::SeqCst);
    INNER_OUTCOME.store(0, Ordering::SeqCst);
    startup().unwrap();

    let outer = protect(
        || {
            let inner = protect(
                || {
                    unsafe { libc::raise(libc::SIGSEGV) };
                    0
                },
                inner_handler,
                null_mut(),
                flags::SIGSEGV | flags::MAY_RETURN,
            );
            if matches!(inner, Ok(Protected::Exception(category)) if category == flags::SIGSEGV) {
                INNER_OUTCOME.store(1, Ordering::SeqCst);
            }
            7
        },
        outer_handler,
        null_mut(),
        flags::SIGSEGV | flags::MAY_RETURN,
    )
    .unwrap();

    assert_eq!(outer, Protected::Done(7));
    assert_eq!(INNER_OUTCOME.load(Ordering::SeqCst), 1);
    assert_eq!(INNER_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(OUTER_CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(current_signal(), 0);
    assert!(sync::frame_stack_empty());

    shutdown().unwrap();
}

static A_CALLS: AtomicU32 = AtomicU32::new(0);
static B_CALLS: AtomicU32 = AtomicU32::new(0);
static C_CALLS: AtomicU32 = AtomicU32::new(0);
static OFF_REPORTER: AtomicU32 = AtomicU32::new(0);

fn on_reporter_thread() -> bool {
    std::thread::current().name() == Some("signal reporter")
}

fn async_a(_category: u32, _arg: *mut c_void) {
    A_CALLS.fetch_add(1, Ordering::SeqCst);
    if !on_reporter_thread() {
        OFF_REPORTER.fetch_add(1, Ordering::SeqCst);
    }
}

fn async_b(_category: u32, _arg: *mut c_void) {
    B_CALLS.fetch_add(1, Ordering::SeqCst);
    if !on_reporter_thread() {
        OFF_REPORTER.fetch_add(1, Ordering::SeqCst);
    }
}

fn async_c(_category: u32, _arg: *mut c_void) {
    C_CALLS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn async_delivery_fans_out_on_the_reporter_thread() {
    let _lock = lock();
    A_CALLS.store(0, Ordering::SeqCst);
    B_CALLS.store(0, Ordering::SeqCst);
    C_CALLS.store(0, Ordering::SeqCst);
    OFF_REPORTER.store(0, Ordering::SeqCst);
    startup().unwrap();

    set_async_signal_handler(async_a, null_mut(), flags::SIGTERM).unwrap();
    set_async_signal_handler(async_b, null_mut(), flags::SIGTERM | flags::SIGHUP).unwrap();
    set_async_signal_handler(async_c, null_mut(), flags::SIGHUP).unwrap();

    unsafe { libc::raise(libc::SIGTERM) };

    assert!(wait_for(|| {
        A_CALLS.load(Ordering::SeqCst) == 1 && B_CALLS.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(A_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(B_CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(C_CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(OFF_REPORTER.load(Ordering::SeqCst), 0);
    assert!(wait_for(|| reporter::pending_count(libc::SIGTERM) == 0));
    assert_eq!(reporter::in_flight(), 0);

    set_async_signal_handler(async_a, null_mut(), 0).unwrap();
    set_async_signal_handler(async_b, null_mut(), 0).unwrap();
    set_async_signal_handler(async_c, null_mut(), 0).unwrap();
    shutdown().unwrap();
}

#[test]
fn shutdown_restores_first_startup_dispositions() {
    let _lock = lock();
    let segv_before = disposition(libc::SIGSEGV);
    let term_before = disposition(libc::SIGTERM);
    startup().unwrap();

    protect(|| 0, unwind_handler, null_mut(), flags::SIGSEGV | flags::MAY_RETURN).unwrap();
    set_async_signal_handler(async_a, null_mut(), flags::SIGTERM).unwrap();
    assert!(is_main_signal_handler(disposition(libc::SIGSEGV).sa_sigaction));
    assert!(is_main_signal_handler(disposition(libc::SIGTERM).sa_sigaction));

    set_async_signal_handler(async_a, null_mut(), 0).unwrap();
    shutdown().unwrap();

    let segv_after = disposition(libc::SIGSEGV);
    let term_after = disposition(libc::SIGTERM);
    assert_eq!(segv_after.sa_sigaction, segv_before.sa_sigaction);
    assert_eq!(segv_after.sa_flags, segv_before.sa_flags);
    assert_eq!(term_after.sa_sigaction, term_before.sa_sigaction);
    assert_eq!(term_after.sa_flags, term_before.sa_flags);
}

#[test]
fn async_register_then_unregister_round_trips_the_list() {
    let _lock = lock();
    startup().unwrap();
    let baseline = reporter::snapshot_records();

    set_async_signal_handler(async_a, null_mut(), flags::SIGTERM).unwrap();
    assert_eq!(reporter::snapshot_records().len(), baseline.len() + 1);

    set_async_signal_handler(async_a, null_mut(), 0).unwrap();
    assert_eq!(reporter::snapshot_records(), baseline);
    // The main-handler install persists past the removal.
    assert!(is_main_signal_handler(disposition(libc::SIGTERM).sa_sigaction));

    shutdown().unwrap();
}

#[test]
fn single_async_handler_owns_its_signal_exclusively() {
    let _lock = lock();
    startup().unwrap();

    set_async_signal_handler(async_a, null_mut(), flags::SIGTERM | flags::SIGHUP).unwrap();
    set_single_async_signal_handler(async_b, null_mut(), flags::SIGTERM).unwrap();

    let term_bit = flags::SIGTERM & !flags::IS_ASYNC;
    let hup_bit = flags::SIGHUP & !flags::IS_ASYNC;
    let records = reporter::snapshot_records();
    let owners: Vec<_> = records.iter().filter(|(_, _, mask)| mask & term_bit != 0).collect();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].0, async_b as usize);
    let a_record = records.iter().find(|(h, _, _)| *h == async_a as usize).unwrap();
    assert_eq!(a_record.2 & term_bit, 0);
    assert_ne!(a_record.2 & hup_bit, 0);

    set_async_signal_handler(async_a, null_mut(), 0).unwrap();
    set_async_signal_handler(async_b, null_mut(), 0).unwrap();
    shutdown().unwrap();
}

#[test]
fn ambiguous_flags_error_without_side_effects() {
    let _lock = lock();
    let both = flags::SIGSEGV | flags::SIGTERM;
    let neither = flags::MAY_RETURN;
    let records_before = reporter::snapshot_records();
    let term_before = disposition(libc::SIGTERM);

    assert!(matches!(
        protect(|| 0, unwind_handler, null_mut(), both),
        Err(SignalError::AmbiguousFlags(_))
    ));
    assert!(matches!(
        protect(|| 0, unwind_handler, null_mut(), neither),
        Err(SignalError::AmbiguousFlags(_))
    ));
    assert!(matches!(
        set_async_signal_handler(async_a, null_mut(), both),
        Err(SignalError::AmbiguousFlags(_))
    ));
    assert!(matches!(
        set_single_async_signal_handler(async_a, null_mut(), both),
        Err(SignalError::AmbiguousFlags(_))
    ));
    assert!(!can_protect(both));
    assert!(!can_protect(neither));

    assert_eq!(reporter::snapshot_records(), records_before);
    assert_eq!(disposition(libc::SIGTERM).sa_sigaction, term_before.sa_sigaction);
}

#[test]
fn bare_protect_installs_nothing() {
    let _lock = lock();
    let before = disposition(libc::SIGSEGV);
    startup().unwrap();

    let outcome = protect(|| 3, unwind_handler, null_mut(), 0).unwrap();

    assert_eq!(outcome, Protected::Done(3));
    assert_eq!(disposition(libc::SIGSEGV).sa_sigaction, before.sa_sigaction);
    shutdown().unwrap();
}

#[test]
fn reduced_sync_mode_runs_without_installation() {
    let _lock = lock();
    let before = disposition(libc::SIGSEGV);
    startup().unwrap();
    set_options(options::REDUCED_SIGNALS_SYNCHRONOUS).unwrap();
    assert!(!can_protect(flags::SIGSEGV | flags::MAY_RETURN));

    let outcome = protect(
        || 7,
        unwind_handler,
        null_mut(),
        flags::SIGSEGV | flags::MAY_RETURN,
    )
    .unwrap();

    assert_eq!(outcome, Protected::Done(7));
    assert_eq!(disposition(libc::SIGSEGV).sa_sigaction, before.sa_sigaction);

    // The last detach resets the option mask.
    shutdown().unwrap();
    assert_eq!(get_options(), 0);
}

#[test]
fn reduced_mode_switch_is_refused_once_handlers_exist() {
    let _lock = lock();
    startup().unwrap();
    protect(|| 0, unwind_handler, null_mut(), flags::SIGSEGV | flags::MAY_RETURN).unwrap();

    assert!(matches!(
        set_options(options::REDUCED_SIGNALS_ASYNCHRONOUS),
        Err(SignalError::HandlersInstalled)
    ));

    shutdown().unwrap();
}

#[test]
fn protect_requires_an_attached_dispatcher() {
    let _lock = lock();
    assert!(matches!(
        protect(|| 0, unwind_handler, null_mut(), flags::SIGSEGV | flags::MAY_RETURN),
        Err(SignalError::NotAttached)
    ));
}

#[test]
fn fpe_sub_codes_collapse_onto_the_fpe_bit() {
    let div = category_for(libc::SIGFPE, FPE_INTDIV);
    assert_eq!(div, flags::SIGFPE_INT_DIV_BY_ZERO);
    // A frame registered for plain SIGFPE matches the sub-code category.
    assert_ne!(flags::SIGFPE & div & !flags::IS_SYNC, 0);
    assert_eq!(category_for(libc::SIGFPE, FPE_FLTDIV), flags::SIGFPE_DIV_BY_ZERO);
    assert_eq!(category_for(libc::SIGFPE, FPE_INTOVF), flags::SIGFPE_INT_OVERFLOW);
    assert_eq!(category_for(libc::SIGFPE, 0), flags::SIGFPE);
}

#[test]
fn signal_ignored_query_reads_the_os_disposition() {
    let _lock = lock();
    let previous = disposition(libc::SIGHUP);
    unsafe { libc::signal(libc::SIGHUP, libc::SIG_IGN) };

    assert!(is_signal_ignored(flags::SIGHUP).unwrap());
    assert!(!is_signal_ignored(flags::SIGTERM).unwrap());

    let rc = unsafe { libc::sigaction(libc::SIGHUP, &previous, std::ptr::null_mut()) };
    assert_eq!(rc, 0);
}

extern "C" fn custom_os_handler(_sig: c_int) {}

#[test]
fn registered_os_handler_bypasses_the_main_handler() {
    let _lock = lock();
    startup().unwrap();

    register_os_handler(flags::SIGQUIT, custom_os_handler as libc::sighandler_t).unwrap();

    let installed = disposition(libc::SIGQUIT).sa_sigaction;
    assert_eq!(installed, custom_os_handler as libc::sighandler_t);
    assert!(!is_main_signal_handler(installed));

    shutdown().unwrap();
    assert_ne!(
        disposition(libc::SIGQUIT).sa_sigaction,
        custom_os_handler as libc::sighandler_t
    );
}

#[test]
fn attach_counting_tears_down_on_the_last_detach() {
    let _lock = lock();
    startup().unwrap();
    startup().unwrap();

    shutdown().unwrap();
    // Still attached: registration works.
    set_async_signal_handler(async_a, null_mut(), flags::SIGTERM).unwrap();
    set_async_signal_handler(async_a, null_mut(), 0).unwrap();

    shutdown().unwrap();
    assert!(matches!(
        set_async_signal_handler(async_a, null_mut(), flags::SIGTERM),
        Err(SignalError::NotAttached)
    ));
}

#[test]
fn can_protect_reflects_flag_validity() {
    let _lock = lock();
    assert!(can_protect(0));
    assert!(can_protect(flags::SIGSEGV | flags::MAY_RETURN));
    assert!(can_protect(flags::SIGALLSYNC | flags::MAY_RETURN | flags::MAY_CONTINUE_EXECUTION));
    assert!(!can_protect(flags::SIGTERM));
}
