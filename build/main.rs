const SHIM: &str = "csrc/sigprotect.c";

fn main() {
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unimplemented!("the signal dispatcher requires a POSIX sigaction/semaphore target");

    println!("cargo:rerun-if-changed={}", SHIM);

    cc::Build::new().file(SHIM).compile("sigprotect");
}
