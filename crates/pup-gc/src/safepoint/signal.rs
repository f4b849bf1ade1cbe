//! Signal delivery of stop requests.
//!
//! The handler touches nothing but atomics reached through a const-initialized
//! thread-local, which keeps it async-signal-safe.

use std::io;
use std::mem;
use std::ptr;

use libc::c_int;
use parking_lot::Mutex;

use crate::error::GcError;
use crate::thread;

/// Signals whose handler is already installed. Heaps share the handler.
static INSTALLED: Mutex<Vec<c_int>> = Mutex::new(Vec::new());

extern "C" fn handle_stop_request(_signal: c_int) {
    thread::on_stop_signal();
}

/// Installs the stop-request handler for `signal`, once per process.
pub(crate) fn install(signal: c_int) -> Result<(), GcError> {
    let mut installed = INSTALLED.lock();
    if installed.contains(&signal) {
        return Ok(());
    }

    // SAFETY: a zeroed sigaction is a valid starting point; every field we
    // rely on is set below.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handle_stop_request as extern "C" fn(c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    // SAFETY: `action` is a valid, exclusively borrowed sigaction.
    let rc = unsafe {
        libc::sigemptyset(&raw mut action.sa_mask);
        libc::sigaction(signal, &raw const action, ptr::null_mut())
    };
    if rc != 0 {
        return Err(GcError::SignalInstall {
            signal,
            source: io::Error::last_os_error(),
        });
    }

    installed.push(signal);
    tracing::debug!(signal, "safepoint signal handler installed");
    Ok(())
}

/// Sends `signal` to one thread.
pub(crate) fn send(target: libc::pthread_t, signal: c_int) -> io::Result<()> {
    // SAFETY: `target` is a live attached thread; threads detach before
    // they exit.
    let rc = unsafe { libc::pthread_kill(target, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}
