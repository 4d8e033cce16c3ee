//! The supervisor's self-pipe and signal handlers.
//!
//! The handler may only perform async-signal-safe work: it writes the
//! signal number to the pipe and, for SIGTERM, flips an atomic flag. The
//! write end is published through an atomic so the handler never touches
//! the `OwnedFd`s that own the pipe.

use nix::errno::Errno;
use nix::sys::signal::{self, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

static SELF_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);
static GOT_SIGTERM: AtomicBool = AtomicBool::new(false);

extern "C" fn deliver(signo: libc::c_int) {
    if signo == libc::SIGTERM {
        GOT_SIGTERM.store(true, Ordering::Relaxed);
    }
    let fd = SELF_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// The installed self-pipe. Both ends are non-blocking.
pub struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl SignalPipe {
    /// The read end, for the select set.
    pub fn read_fd(&self) -> &OwnedFd {
        &self.read
    }

    /// Raw descriptors, so a fork child can close them before exec.
    pub fn raw_fds(&self) -> (RawFd, RawFd) {
        (self.read.as_raw_fd(), self.write.as_raw_fd())
    }

    /// Discard everything queued on the read end.
    pub fn drain(&self) {
        let mut buf = [0u8; 128];
        while matches!(unistd::read(self.read.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
    }
}

/// Create the self-pipe and route SIGCHLD and SIGTERM through it.
pub fn install() -> Result<SignalPipe, Errno> {
    let (read, write) = unistd::pipe()?;
    set_nonblocking(read.as_raw_fd())?;
    set_nonblocking(write.as_raw_fd())?;
    SELF_PIPE_WRITE.store(write.as_raw_fd(), Ordering::Relaxed);

    let action = SigAction::new(SigHandler::Handler(deliver), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGCHLD, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(SignalPipe { read, write })
}

/// Whether SIGTERM has been received since [`install`].
pub fn got_sigterm() -> bool {
    GOT_SIGTERM.load(Ordering::Relaxed)
}

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<(), Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Errno::last());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Restore every catchable signal to its default disposition.
///
/// The supervisor's launcher (often PHP) may have ignored SIGPIPE or
/// others; student code must not inherit that.
pub fn reset_all_dispositions() {
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        unsafe {
            let _ = signal::signal(sig, SigHandler::SigDfl);
        }
    }
}
