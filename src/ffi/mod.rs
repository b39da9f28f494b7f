use std::io::{Error, Result};
use std::mem::MaybeUninit;

use libc::{c_int, c_void};

/// Opaque `sigjmp_buf` owned by a `jitframe_sigprotect` frame in C.
///
/// Only ever handled behind a raw pointer; the buffer is dead once the
/// trampoline frame returns.
pub enum SigJmpBuf {}

pub type ProtectBody = extern "C" fn(arg: *mut c_void);

extern "C" {
    // csrc/sigprotect.c
    pub fn jitframe_sigprotect(
        body: ProtectBody,
        arg: *mut c_void,
        slot: *mut *mut SigJmpBuf,
    ) -> c_int;

    // Real exported symbol on glibc and musl; noreturn, so calling it from
    // Rust is an ordinary FFI call (only the setjmp side needs C).
    pub fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

pub fn sigaction(
    sig: c_int,
    new: Option<&libc::sigaction>,
    old: Option<&mut libc::sigaction>,
) -> Result<()> {
    let new = new.map_or(std::ptr::null(), |a| a as *const _);
    let old = old.map_or(std::ptr::null_mut(), |a| a as *mut _);
    let result = unsafe { libc::sigaction(sig, new, old) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn empty_sigset() -> libc::sigset_t {
    let mut set = MaybeUninit::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

pub fn sigset_of(sigs: impl IntoIterator<Item = c_int>) -> libc::sigset_t {
    let mut set = empty_sigset();
    for sig in sigs {
        unsafe { libc::sigaddset(&mut set, sig) };
    }
    set
}

pub fn unblock(sigs: impl IntoIterator<Item = c_int>) -> Result<()> {
    let set = sigset_of(sigs);
    let result = unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) };
    if result == 0 {
        Ok(())
    } else {
        Err(Error::from_raw_os_error(result))
    }
}

pub fn sem_init(sem: *mut libc::sem_t, value: u32) -> Result<()> {
    let result = unsafe { libc::sem_init(sem, 0, value as _) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Async-signal-safe (POSIX.2017 §2.4.3); the only primitive the main
/// asynchronous handler posts besides one atomic increment.
pub fn sem_post(sem: *mut libc::sem_t) -> Result<()> {
    let result = unsafe { libc::sem_post(sem) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn sem_wait(sem: *mut libc::sem_t) -> Result<()> {
    loop {
        let result = unsafe { libc::sem_wait(sem) };
        if result != -1 {
            return Ok(());
        }
        let err = Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

pub fn sem_destroy(sem: *mut libc::sem_t) -> Result<()> {
    let result = unsafe { libc::sem_destroy(sem) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}
