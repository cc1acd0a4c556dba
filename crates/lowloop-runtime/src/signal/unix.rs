//! Unix signal handlers writing the signal number into the wake pipe.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use lowloop_core::{LoopError, LoopResult};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use super::HANDLED_SIGNALS;

static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signum: libc::c_int) {
    let fd = WAKE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn set_handler(signum: i32, handler: SigHandler) -> LoopResult<()> {
    let sig = Signal::try_from(signum).map_err(|e| LoopError::os(e as i32, "sigaction"))?;
    let action = SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());
    unsafe { signal::sigaction(sig, &action) }
        .map(|_| ())
        .map_err(|e| LoopError::os(e as i32, "sigaction"))
}

/// Route the handled signals into `wake_fd`. Idempotent; a second call
/// only retargets the pipe.
pub fn install(wake_fd: i32) -> LoopResult<()> {
    WAKE_WRITE_FD.store(wake_fd, Ordering::SeqCst);
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    for signum in HANDLED_SIGNALS {
        set_handler(signum, SigHandler::Handler(on_signal))?;
    }
    Ok(())
}

/// Stop forwarding and restore the default dispositions.
pub fn uninstall() {
    WAKE_WRITE_FD.store(-1, Ordering::SeqCst);
    if !HANDLER_INSTALLED.swap(false, Ordering::SeqCst) {
        return;
    }
    for signum in HANDLED_SIGNALS {
        let _ = set_handler(signum, SigHandler::SigDfl);
    }
}

/// Restore `SIG_DFL` for `signum` and raise it on ourselves.
pub fn restore_default_and_raise(signum: i32) -> LoopResult<()> {
    set_handler(signum, SigHandler::SigDfl)?;
    let ret = unsafe { libc::raise(signum) };
    if ret != 0 {
        return Err(LoopError::last_os("raise"));
    }
    Ok(())
}

#[inline]
pub fn is_installed() -> bool {
    HANDLER_INSTALLED.load(Ordering::Relaxed)
}
