//! Abort requests from SIGINT/SIGTERM.
//!
//! Provisioning never stops in the middle of a step. The handler records the
//! request, the step in flight (a table write, a format, a mount) runs to its
//! end, and the next [`checkpoint`] turns the request into
//! [`ProvisionError::Interrupted`]. The provisioner then rolls back whatever
//! it has recorded.
//!
//! A second signal gives up on the rollback: the default disposition is
//! restored and the signal delivered again.

use crate::utils::error::{ProvisionError, Result};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Signal behind the pending abort request, 0 while none is pending
static ABORT_SIGNAL: AtomicI32 = AtomicI32::new(0);

static SIGNALS_SEEN: AtomicUsize = AtomicUsize::new(0);

const HANDLED: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

// Only atomics and raw write(2) in here
extern "C" fn request_abort(sig: libc::c_int) {
    if SIGNALS_SEEN.fetch_add(1, Ordering::SeqCst) == 0 {
        ABORT_SIGNAL.store(sig, Ordering::SeqCst);
        let msg = b"\nAbort requested: finishing the current step, then rolling back\n";
        unsafe {
            libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        }
    } else {
        let msg = b"\nRollback skipped. Mounts and mappings may remain: run diskprep cleanup\n";
        unsafe {
            libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
}

/// Route SIGINT and SIGTERM to the abort flag. Calling it again is harmless.
pub fn install_signal_handlers() {
    for sig in HANDLED {
        unsafe {
            libc::signal(sig, request_abort as *const () as libc::sighandler_t);
        }
    }
}

/// Signal number of the pending abort request
pub fn abort_signal() -> Option<libc::c_int> {
    match ABORT_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}

pub fn is_interrupted() -> bool {
    abort_signal().is_some()
}

/// Pause point between steps: fails with [`ProvisionError::Interrupted`]
/// naming `next_step` once an abort has been requested.
pub fn checkpoint(next_step: &str) -> Result<()> {
    pause_point(abort_signal(), next_step)
}

fn pause_point(pending: Option<libc::c_int>, next_step: &str) -> Result<()> {
    match pending {
        Some(_) => Err(ProvisionError::Interrupted(next_step.to_string())),
        None => Ok(()),
    }
}

/// After rollback, deliver the abort signal again with its default action so
/// the parent shell sees the process die by that signal. No-op without a
/// pending request.
pub fn reraise() {
    if let Some(sig) = abort_signal() {
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
    }
}
