/*
 * kqueue.rs
 *
 * BSD/macOS kqueue backend. Direct libc because the nix kqueue API keeps
 * changing.
 *
 * kqueue splits interest per filter: one EVFILT_READ registration and one
 * EVFILT_WRITE registration per fd, added and deleted independently as the
 * aggregate mask changes. EV_CLEAR gives edge-triggered delivery. kevent()
 * calls from different threads are kernel-serialized, so non-owner add/del
 * may race the owner's wait. The kqueue fd is not inherited across fork,
 * hence need_reinit.
 */

#![cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]

use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::backend::{Backend, Ready, features};
use crate::error::{ReactorError, Result, last_errno};
use crate::event::EventMask;

const INITIAL_NEVENT: usize = 32;
const MAX_NEVENT: usize = 4096;

/* kevent filter/flags field types differ across the BSDs */
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn kev(ident: RawFd, filter: i32, flags: u16) -> libc::kevent {
    // SAFETY: kevent is a plain C struct; zeroing produces a valid value.
    let mut ev: libc::kevent = unsafe { core::mem::zeroed() };
    ev.ident = ident as libc::uintptr_t;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev
}

pub(crate) struct KqueueBackend {
    kq: RawFd,
    buf: Mutex<Vec<libc::kevent>>,
}

impl KqueueBackend {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: kqueue() has no preconditions.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(ReactorError::Backend("kqueue", last_errno()));
        }
        // SAFETY: kq is a valid fd just returned by kqueue().
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Self {
            kq,
            buf: Mutex::new(Vec::with_capacity(INITIAL_NEVENT)),
        })
    }

    /* apply a change list without draining the event queue */
    fn apply(&self, changes: &[libc::kevent]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let zero = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: kq is live; changes points at `len` valid kevent structs;
        // no output buffer is passed.
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                core::ptr::null_mut(),
                0,
                &raw const zero,
            )
        };
        if ret < 0 {
            let errno = last_errno();
            /* deleting a filter the kernel already dropped (fd closed) */
            if errno == libc::ENOENT || errno == libc::EBADF {
                log::debug!("kevent change: errno {errno} (ignored)");
                return Ok(());
            }
            return Err(ReactorError::Backend("kevent", errno));
        }
        Ok(())
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn features(&self) -> u32 {
        features::ET | features::O1 | features::FDS
    }

    fn need_reinit(&self) -> bool {
        true
    }

    fn add(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()> {
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        let et = if new.contains(EventMask::ET) {
            libc::EV_CLEAR
        } else {
            0
        };
        if new.contains(EventMask::READ) && !old.contains(EventMask::READ) {
            changes.push(kev(fd, libc::EVFILT_READ as i32, libc::EV_ADD | et));
        }
        if new.contains(EventMask::WRITE) && !old.contains(EventMask::WRITE) {
            changes.push(kev(fd, libc::EVFILT_WRITE as i32, libc::EV_ADD | et));
        }
        self.apply(&changes)
    }

    fn del(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()> {
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        if old.contains(EventMask::READ) && !new.contains(EventMask::READ) {
            changes.push(kev(fd, libc::EVFILT_READ as i32, libc::EV_DELETE));
        }
        if old.contains(EventMask::WRITE) && !new.contains(EventMask::WRITE) {
            changes.push(kev(fd, libc::EVFILT_WRITE as i32, libc::EV_DELETE));
        }
        self.apply(&changes)
    }

    fn dispatch(&self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> Result<()> {
        let mut buf = self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cap = buf.capacity().clamp(INITIAL_NEVENT, MAX_NEVENT);
        buf.clear();
        buf.reserve(cap);

        #[allow(clippy::cast_lossless)]
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: libc::time_t::try_from(d.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(core::ptr::null(), |t| t as *const libc::timespec);

        // SAFETY: kq is live; the spare capacity of buf holds at least `cap`
        // kevent entries and the kernel writes no more than that; ts_ptr is
        // null or points at a timespec that outlives the call.
        let n = unsafe {
            libc::kevent(
                self.kq,
                core::ptr::null(),
                0,
                buf.spare_capacity_mut().as_mut_ptr().cast(),
                cap as libc::c_int,
                ts_ptr,
            )
        };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(());
            }
            return Err(ReactorError::Backend("kevent", errno));
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        // SAFETY: the kernel initialized the first n entries.
        unsafe { buf.set_len(n) };

        for ev in buf.iter() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let fd = ev.ident as RawFd;
            if ev.flags & libc::EV_ERROR != 0 {
                #[allow(clippy::cast_possible_truncation)]
                let errno = ev.data as i32;
                match errno {
                    /* the fd went away between change and wait */
                    libc::EBADF | libc::ENOENT | libc::EINVAL => {
                        log::debug!("kevent reported errno {errno} for fd {fd} (ignored)");
                        continue;
                    }
                    /* broken pipe surfaces as error, report it as readiness
                     * so the user callback observes the EOF */
                    libc::EPERM | libc::EPIPE => {
                        ready.push(Ready {
                            fd,
                            mask: EventMask::READ | EventMask::WRITE,
                        });
                        continue;
                    }
                    errno => return Err(ReactorError::Backend("kevent", errno)),
                }
            }
            let mut mask = match i32::from(ev.filter) {
                x if x == libc::EVFILT_READ as i32 => EventMask::READ,
                x if x == libc::EVFILT_WRITE as i32 => EventMask::WRITE,
                _ => EventMask::NONE,
            };
            if ev.flags & libc::EV_EOF != 0 {
                mask |= EventMask::CLOSED;
            }
            if !mask.is_empty() {
                ready.push(Ready { fd, mask });
            }
        }
        if n == cap && cap < MAX_NEVENT {
            buf.reserve(cap * 2);
        }
        Ok(())
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        // SAFETY: kq was returned by kqueue() and closed nowhere else.
        unsafe {
            libc::close(self.kq);
        }
    }
}
