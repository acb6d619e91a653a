/*
 * signal.rs
 *
 * Signal trampoline: turn async-signal delivery into a readable pipe.
 *
 * Problem: the owner thread is blocked in the kernel wait. A signal
 * handler runs in async-signal context and can do almost nothing safely.
 *
 * Fix: create a pipe, handler writes the signal number as one byte, the
 * pipe's read end is an internal persistent read event on the reactor.
 * Signal arrives, pipe becomes readable, the wait returns, the drain
 * callback re-activates every user event registered for that signal.
 *
 * THE HANDLER CONTRACT: the OS-level handler below performs exactly one
 * write() to the pipe and restores errno. No allocation, no locks, no
 * formatting, nothing else. Anything more is undefined behavior waiting
 * for a stack to happen on.
 *
 * Signals are process-global, so only one reactor at a time owns the
 * trampoline. The last reactor to install a watch wins; ownership moves
 * with it (the loser's signal events go quiet, as documented).
 */

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::error::{ReactorError, Result, last_errno};

/* Write end of the owning reactor's signal pipe, -1 if none. The handler
 * reads this; stores must happen before sigaction installs the handler. */
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/* Which reactor owns the trampoline (an opaque token; 0 = nobody). */
static TRAMPOLINE_OWNER: AtomicUsize = AtomicUsize::new(0);

/* errno is thread-local behind a platform-specific accessor */
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe extern "C" {
    #[link_name = "__errno_location"]
    fn errno_ptr() -> *mut i32;
}
#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "dragonfly"))]
unsafe extern "C" {
    #[link_name = "__error"]
    fn errno_ptr() -> *mut i32;
}
#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe extern "C" {
    #[link_name = "__errno"]
    fn errno_ptr() -> *mut i32;
}

/* The OS-level handler. write() + errno restore, nothing else - this runs
 * in async-signal context. */
extern "C" fn trampoline(sig: i32) {
    // SAFETY: errno_ptr always returns a valid thread-local pointer.
    let errno_slot = unsafe { errno_ptr() };
    // SAFETY: errno_slot is valid per above.
    let saved = unsafe { *errno_slot };

    let fd = SIGNAL_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let byte: u8 = sig as u8;
        // SAFETY: fd was validated >= 0 and set by SignalTrampoline::install.
        // write() with a 1-byte buffer is async-signal-safe per POSIX. The
        // pipe is non-blocking; a full pipe drops the byte, which only
        // coalesces the signal harder.
        unsafe {
            let _ = libc::write(fd, (&raw const byte).cast(), 1);
        }
    }

    // SAFETY: errno_slot is valid per above; restoring what we saved.
    unsafe {
        *errno_slot = saved;
    }
}

/* non-blocking + cloexec on both ends; handler must never block */
fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element array, pipe() writes exactly 2 fds.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(ReactorError::Plumbing("pipe", last_errno()));
    }
    for fd in fds {
        // SAFETY: fd is a valid fd just returned by pipe(); fcntl with
        // F_GETFL/F_SETFL/F_SETFD is safe on valid fds. The ops share the
        // fd-validity invariant.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        let ok = unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            flags >= 0
                && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0
                && libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) >= 0
        };
        if !ok {
            let errno = last_errno();
            // SAFETY: both fds came from pipe() above and are unused elsewhere.
            #[allow(clippy::multiple_unsafe_ops_per_block)]
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(ReactorError::Plumbing("fcntl", errno));
        }
    }
    Ok((fds[0], fds[1]))
}

pub(crate) struct SignalTrampoline {
    read_fd: RawFd,
    write_fd: RawFd,
    /* previous dispositions, restored on unwatch/teardown */
    saved: HashMap<i32, libc::sigaction>,
    token: usize,
}

impl SignalTrampoline {
    /// Build the pipe and claim process-wide ownership for `token`.
    pub(crate) fn install(token: usize) -> Result<Self> {
        debug_assert!(token != 0);
        let (read_fd, write_fd) = make_pipe()?;
        /* last attach wins: publish the write fd before any handler can
         * be installed through watch() */
        SIGNAL_WRITE_FD.store(write_fd, Ordering::SeqCst);
        TRAMPOLINE_OWNER.store(token, Ordering::SeqCst);
        Ok(Self {
            read_fd,
            write_fd,
            saved: HashMap::new(),
            token,
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Route `signo` through the trampoline, saving the old disposition.
    pub(crate) fn watch(&mut self, signo: i32) -> Result<()> {
        /* re-claim on every watch: if another reactor took the trampoline,
         * the latest watcher takes it back */
        SIGNAL_WRITE_FD.store(self.write_fd, Ordering::SeqCst);
        TRAMPOLINE_OWNER.store(self.token, Ordering::SeqCst);

        // SAFETY: sa is zeroed then fully initialized; trampoline is an
        // extern "C" fn with the correct signature; sigaction with a valid
        // signo and valid in/out pointers is a standard POSIX call. The ops
        // share the handler-installation invariant.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        let (ret, old) = unsafe {
            let mut sa: libc::sigaction = core::mem::zeroed();
            sa.sa_sigaction = trampoline as *const () as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&raw mut sa.sa_mask);
            let mut old: libc::sigaction = core::mem::zeroed();
            let ret = libc::sigaction(signo, &raw const sa, &raw mut old);
            (ret, old)
        };
        if ret != 0 {
            return Err(ReactorError::Signal(last_errno()));
        }
        /* keep the FIRST saved disposition across repeated watches */
        self.saved.entry(signo).or_insert(old);
        Ok(())
    }

    /// Restore the disposition `signo` had before we watched it.
    pub(crate) fn unwatch(&mut self, signo: i32) {
        if let Some(old) = self.saved.remove(&signo) {
            // SAFETY: old was filled in by sigaction at watch time and is a
            // valid disposition to restore.
            unsafe {
                libc::sigaction(signo, &raw const old, core::ptr::null_mut());
            }
        }
    }

    /// Read everything the handler wrote since the last drain, coalesced
    /// per signal number.
    pub(crate) fn drain(&self) -> Vec<(i32, u16)> {
        let mut counts: HashMap<i32, u16> = HashMap::new();
        let mut buf = [0u8; 128];
        loop {
            // SAFETY: buf is a valid buffer; read_fd is our non-blocking
            // pipe read end.
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            #[allow(clippy::cast_sign_loss)]
            for &b in &buf[..n as usize] {
                let c = counts.entry(i32::from(b)).or_insert(0);
                *c = c.saturating_add(1);
            }
        }
        counts.into_iter().collect()
    }

    /// True if this reactor still owns the process trampoline.
    pub(crate) fn owns(&self) -> bool {
        TRAMPOLINE_OWNER.load(Ordering::SeqCst) == self.token
    }

    /// Post-fork: the old pipe is shared with the parent; build a fresh
    /// one and re-publish if we own the trampoline.
    pub(crate) fn rebuild_pipe(&mut self) -> Result<()> {
        // SAFETY: both fds are live and owned by self.
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
        let (read_fd, write_fd) = make_pipe()?;
        self.read_fd = read_fd;
        self.write_fd = write_fd;
        if self.owns() {
            SIGNAL_WRITE_FD.store(write_fd, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for SignalTrampoline {
    fn drop(&mut self) {
        /* restore handlers FIRST so nothing writes into fds we are about
         * to close (a reused fd number would be worse than EBADF) */
        let signos: Vec<i32> = self.saved.keys().copied().collect();
        for signo in signos {
            self.unwatch(signo);
        }
        if self.owns() {
            SIGNAL_WRITE_FD.store(-1, Ordering::SeqCst);
            TRAMPOLINE_OWNER.store(0, Ordering::SeqCst);
        }
        // SAFETY: both fds are live and owned by self; nothing writes to
        // them anymore (handlers restored, ownership cleared).
        #[allow(clippy::multiple_unsafe_ops_per_block)]
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /* signal-delivery tests live in tests/integration.rs where they own
     * the process; here we only exercise the plumbing.
     * the trampoline globals are process-wide, so these tests serialize. */
    static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn test_install_and_drop_clears_globals() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        {
            let tramp = SignalTrampoline::install(0xdead).unwrap();
            assert!(tramp.owns());
            assert!(SIGNAL_WRITE_FD.load(Ordering::SeqCst) >= 0);
        }
        assert_eq!(SIGNAL_WRITE_FD.load(Ordering::SeqCst), -1);
        assert_eq!(TRAMPOLINE_OWNER.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drain_counts_bytes() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tramp = SignalTrampoline::install(0xbeef).unwrap();
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let byte = libc::SIGUSR2 as u8;
        for _ in 0..3 {
            // SAFETY: write_fd is the live write end of the pipe.
            unsafe {
                libc::write(tramp.write_fd, (&raw const byte).cast(), 1);
            }
        }
        let drained = tramp.drain();
        assert_eq!(drained, vec![(libc::SIGUSR2, 3)]);
        /* second drain finds nothing */
        assert!(tramp.drain().is_empty());
    }

    #[test]
    fn test_last_attach_wins() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let t1 = SignalTrampoline::install(1).unwrap();
        let mut t2 = SignalTrampoline::install(2).unwrap();
        assert!(!t1.owns());
        assert!(t2.owns());
        /* watch() re-claims for its own pipe */
        t2.watch(libc::SIGUSR2).unwrap();
        assert_eq!(SIGNAL_WRITE_FD.load(Ordering::SeqCst), t2.write_fd);
        t2.unwatch(libc::SIGUSR2);
    }
}
