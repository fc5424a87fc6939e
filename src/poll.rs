//! Level-triggered readiness polling over the engine's two pipe endpoints.
//!
//! The non-blocking scheduler needs exactly one multiplexing primitive: "is
//! stdout readable, is stdin writable, did either end hang up — and wait at
//! most this long". `poll(2)` covers that on every Unix; no event loop or
//! registration state is required for two descriptors, so nothing heavier
//! is used.
//!
//! Also hosts the fd mode helpers (`O_NONBLOCK`, and the Linux-only stdin
//! pipe resize via `F_SETPIPE_SZ`).
//!
//! Unix-only; on other platforms the crate offers only the blocking
//! scheduler.

#![cfg(unix)]

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Readiness observed by one poll call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    /// stdout has bytes available (or EOF is observable via a zero read).
    pub(crate) readable: bool,
    /// stdin can accept at least one byte.
    pub(crate) writable: bool,
    /// Either endpoint reported `POLLHUP`/`POLLERR`; a following read or
    /// write will surface the failure.
    pub(crate) hangup: bool,
}

impl Readiness {
    pub(crate) fn any(&self) -> bool {
        self.readable || self.writable || self.hangup
    }
}

/// Polls `read_fd` for readability and (optionally) `write_fd` for
/// writability, waiting at most `timeout`.
///
/// The timeout is rounded up to the next millisecond so a sub-millisecond
/// remaining budget still sleeps instead of degenerating into a busy spin;
/// the overshoot is bounded by one millisecond, inside the scheduler's
/// tolerance of one poll slice plus one syscall.
pub(crate) fn poll_duplex(
    read_fd: RawFd,
    write_fd: Option<RawFd>,
    timeout: Duration,
) -> io::Result<Readiness> {
    let mut fds = [
        libc::pollfd {
            fd: read_fd,
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: -1,
            events: libc::POLLOUT,
            revents: 0,
        },
    ];
    let nfds = match write_fd {
        Some(fd) => {
            fds[1].fd = fd;
            2
        }
        None => 1,
    };

    let timeout_ms = timeout
        .as_millis()
        .saturating_add(if timeout.subsec_nanos() % 1_000_000 != 0 { 1 } else { 0 })
        .min(i32::MAX as u128) as i32;

    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            let mut ready = Readiness::default();
            for fd in &fds[..nfds] {
                if fd.revents & libc::POLLIN != 0 {
                    ready.readable = true;
                }
                if fd.revents & libc::POLLOUT != 0 {
                    ready.writable = true;
                }
                if fd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                    ready.hangup = true;
                    // A hung-up read end is still drainable until EOF.
                    if fd.events == libc::POLLIN {
                        ready.readable = true;
                    }
                }
            }
            return Ok(ready);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        // EINTR: retry with the same timeout; the caller's deadline check
        // bounds total waiting.
    }
}

/// Sets `O_NONBLOCK` on a descriptor.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resizes a pipe's kernel buffer (Linux only; elsewhere a no-op).
///
/// Growing the stdin pipe lets the scheduler park more formatted lines in
/// the kernel between polls; the kernel may round the size up.
#[cfg(target_os = "linux")]
pub(crate) fn set_pipe_buffer(fd: RawFd, bytes: usize) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETPIPE_SZ, bytes as libc::c_int) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn set_pipe_buffer(_fd: RawFd, _bytes: usize) -> io::Result<()> {
    Ok(())
}
