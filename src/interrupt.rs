use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Routes SIGINT to a flag polled by the scan loop. The handler is installed
/// without `SA_RESTART`, so a blocked `poll` wakes up with `EINTR`.
pub fn install() -> io::Result<()> {
    // SAFETY: the handler only touches an atomic, which is async-signal-safe.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
        action.sa_flags = 0;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGINT, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    log::debug!("Installed SIGINT handler");

    Ok(())
}

#[inline]
pub fn requested() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
