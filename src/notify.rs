/*
 * notify.rs
 *
 * Cross-thread wake-up channel.
 *
 * Any thread can jolt the owner out of its kernel wait by making an
 * internal fd readable: eventfd on Linux (one fd, kernel-coalesced
 * counter), a non-blocking pipe everywhere else. The reactor registers the
 * read side as an internal persistent read event and tracks a pending flag
 * so back-to-back notifies cost one write, not many.
 */

use std::os::fd::RawFd;

use crate::error::{ReactorError, Result, last_errno};

#[derive(Debug)]
pub(crate) struct NotifyChannel {
    read_fd: RawFd,
    write_fd: RawFd,
    /* eventfd uses one fd for both directions */
    is_eventfd: bool,
}

#[cfg(target_os = "linux")]
fn make_channel() -> Result<NotifyChannel> {
    // SAFETY: eventfd takes an initial count and flags.
    let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if efd >= 0 {
        return Ok(NotifyChannel {
            read_fd: efd,
            write_fd: efd,
            is_eventfd: true,
        });
    }
    /* ancient kernel: fall through to a pipe */
    log::debug!("eventfd unavailable (errno {}), using pipe", last_errno());
    make_pipe_channel()
}

#[cfg(not(target_os = "linux"))]
fn make_channel() -> Result<NotifyChannel> {
    make_pipe_channel()
}

fn make_pipe_channel() -> Result<NotifyChannel> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element array, pipe() writes exactly 2 fds.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(ReactorError::Plumbing("pipe", last_errno()));
    }
    for fd in fds {
        // SAFETY: fd is a valid fd just returned by pipe(); fcntl ops share
        // the fd-validity invariant.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        let ok = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            flags >= 0
                && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0
                && libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) >= 0
        };
        if !ok {
            let errno = last_errno();
            // SAFETY: both fds came from pipe() above.
            #[allow(clippy::multiple_unsafe_ops_per_block)]
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(ReactorError::Plumbing("fcntl", errno));
        }
    }
    Ok(NotifyChannel {
        read_fd: fds[0],
        write_fd: fds[1],
        is_eventfd: false,
    })
}

impl NotifyChannel {
    pub(crate) fn new() -> Result<Self> {
        make_channel()
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Make the read side readable. Callable from any thread.
    pub(crate) fn notify(&self) {
        if self.is_eventfd {
            let one: u64 = 1;
            // SAFETY: write_fd is a live eventfd; an 8-byte write of a
            // nonzero counter is the eventfd contract.
            unsafe {
                libc::write(self.write_fd, (&raw const one).cast(), 8);
            }
        } else {
            let byte: u8 = 0;
            // SAFETY: write_fd is the live, non-blocking write end of our
            // pipe; a full pipe just means a wake-up is already queued.
            unsafe {
                libc::write(self.write_fd, (&raw const byte).cast(), 1);
            }
        }
    }

    /// Consume all queued wake-ups.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is a valid buffer; read_fd is non-blocking.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            /* eventfd returns the whole counter in one 8-byte read */
            if n <= 0 || self.is_eventfd {
                break;
            }
        }
    }
}

impl Drop for NotifyChannel {
    fn drop(&mut self) {
        // SAFETY: read_fd is live and owned by self.
        unsafe {
            libc::close(self.read_fd);
        }
        if !self.is_eventfd {
            // SAFETY: write_fd is live, distinct from read_fd for pipes.
            unsafe {
                libc::close(self.write_fd);
            }
        }
    }
}
