//! Ctrl-C / SIGTERM handling for the three binaries.
//!
//! Mirrors the original's `signal.signal(SIGINT, handler)`: a dedicated
//! thread blocks on the signal and flips a shared stop flag, which every
//! long-running task (the endpoint listener, the per-GBN pump and timer,
//! the loss-rate printer) already polls each iteration. No dedicated signal
//! crate is introduced; this is a small, self-contained use of `libc`, kept
//! in line with the rest of the system's thread-per-task model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
unsafe fn sigint_term_set() -> libc::sigset_t {
    let mut set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigaddset(&mut set, libc::SIGINT);
    libc::sigaddset(&mut set, libc::SIGTERM);
    set
}

/// Block SIGINT/SIGTERM on the calling thread. Must run on the main thread
/// before any other thread is spawned, so every spawned thread inherits the
/// blocked mask -- otherwise the signal could be delivered to, and kill, a
/// thread that never calls `sigwait`.
#[cfg(unix)]
pub fn block_default_disposition() {
    unsafe {
        let set = sigint_term_set();
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
pub fn block_default_disposition() {}

/// Spawn the thread that waits for SIGINT/SIGTERM (already blocked by
/// `block_default_disposition`) and sets `stop` when either arrives. Returns
/// immediately; the handler thread runs for the life of the process.
#[cfg(unix)]
pub fn spawn_wait(stop: Arc<AtomicBool>) {
    std::thread::Builder::new()
        .name("signal-wait".into())
        .spawn(move || unsafe {
            let set = sigint_term_set();
            let mut signum: libc::c_int = 0;
            let rc = libc::sigwait(&set, &mut signum);
            if rc == 0 {
                tracing::info!(signal = signum, "received shutdown signal");
            }
            stop.store(true, Ordering::SeqCst);
        })
        .expect("spawn signal-wait thread");
}

/// Non-Unix fallback: nothing to install. Ctrl-C still terminates the
/// process via the platform default; graceful task shutdown is unix-only,
/// matching this system's localhost-only, non-goal-excluded-platform scope.
#[cfg(not(unix))]
pub fn spawn_wait(_stop: Arc<AtomicBool>) {}
