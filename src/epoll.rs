/*
 * epoll.rs
 *
 * Linux epoll backend. One epoll instance per reactor, one registration
 * per descriptor carrying the aggregate interest.
 *
 * epoll_ctl may race with an epoll_wait on another thread - the kernel
 * serializes that, which is exactly what lets non-owner threads register
 * events while the owner sleeps. The epoll fd itself does not survive
 * fork usefully (it stays shared with the parent), hence need_reinit.
 */

#![cfg(target_os = "linux")]

use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::backend::{Backend, Ready, features, timeout_to_ms};
use crate::error::{ReactorError, Result, last_errno};
use crate::event::EventMask;

/* readiness batch size per epoll_wait; grows when the batch comes back full */
const INITIAL_NEVENT: usize = 32;
const MAX_NEVENT: usize = 4096;

pub(crate) struct EpollBackend {
    epfd: RawFd,
    /* reusable epoll_wait buffer; only the owner thread dispatches */
    buf: Mutex<Vec<libc::epoll_event>>,
}

fn mask_to_epoll(mask: EventMask) -> u32 {
    let mut ep = 0u32;
    if mask.contains(EventMask::READ) {
        ep |= libc::EPOLLIN as u32;
    }
    if mask.contains(EventMask::WRITE) {
        ep |= libc::EPOLLOUT as u32;
    }
    if mask.contains(EventMask::CLOSED) {
        ep |= libc::EPOLLRDHUP as u32;
    }
    if mask.contains(EventMask::ET) {
        ep |= libc::EPOLLET as u32;
    }
    ep
}

fn epoll_to_mask(ep: u32) -> EventMask {
    let mut mask = EventMask::NONE;
    if ep & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
        /* error/hangup wakes both directions so the owner sees it whichever
         * way it is waiting */
        mask |= EventMask::READ | EventMask::WRITE;
    }
    if ep & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
        mask |= EventMask::READ;
    }
    if ep & libc::EPOLLOUT as u32 != 0 {
        mask |= EventMask::WRITE;
    }
    if ep & libc::EPOLLRDHUP as u32 != 0 {
        mask |= EventMask::CLOSED;
    }
    mask
}

impl EpollBackend {
    pub(crate) fn new() -> Result<Self> {
        // SAFETY: epoll_create1 takes only a flags argument.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(ReactorError::Backend("epoll_create1", last_errno()));
        }
        Ok(Self {
            epfd,
            buf: Mutex::new(Vec::with_capacity(INITIAL_NEVENT)),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: EventMask) -> i32 {
        let mut ev = libc::epoll_event {
            events: mask_to_epoll(mask),
            u64: fd as u64,
        };
        // SAFETY: epfd is a live epoll fd owned by self; ev is a valid
        // epoll_event for ADD/MOD and ignored for DEL.
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &raw mut ev) };
        if ret == 0 { 0 } else { last_errno() }
    }
}

impl Backend for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn features(&self) -> u32 {
        features::ET | features::O1 | features::EARLY_CLOSE
    }

    fn need_reinit(&self) -> bool {
        true
    }

    fn add(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()> {
        let op = if old.io_bits().is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        match self.ctl(op, fd, new) {
            0 => Ok(()),
            /* lost a race with a closed-and-reopened fd: retry the other op */
            libc::EEXIST if op == libc::EPOLL_CTL_ADD => {
                match self.ctl(libc::EPOLL_CTL_MOD, fd, new) {
                    0 => Ok(()),
                    errno => Err(ReactorError::Backend("epoll_ctl", errno)),
                }
            }
            libc::ENOENT if op == libc::EPOLL_CTL_MOD => {
                match self.ctl(libc::EPOLL_CTL_ADD, fd, new) {
                    0 => Ok(()),
                    errno => Err(ReactorError::Backend("epoll_ctl", errno)),
                }
            }
            errno => Err(ReactorError::Backend("epoll_ctl", errno)),
        }
    }

    fn del(&self, fd: RawFd, _old: EventMask, new: EventMask) -> Result<()> {
        let errno = if new.io_bits().is_empty() {
            self.ctl(libc::EPOLL_CTL_DEL, fd, EventMask::NONE)
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, new)
        };
        match errno {
            0 => Ok(()),
            /* the user closed the fd before deleting the event; the kernel
             * already dropped the registration */
            libc::ENOENT | libc::EBADF | libc::EPERM => {
                log::debug!("epoll del on fd {fd}: errno {errno} (ignored)");
                Ok(())
            }
            errno => Err(ReactorError::Backend("epoll_ctl", errno)),
        }
    }

    fn dispatch(&self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> Result<()> {
        let mut buf = self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let cap = buf.capacity().clamp(INITIAL_NEVENT, MAX_NEVENT);
        buf.clear();
        buf.reserve(cap);

        let ms = timeout_to_ms(timeout);
        // SAFETY: epfd is live; the spare capacity of buf holds at least
        // `cap` epoll_event entries and the kernel writes no more than that.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.spare_capacity_mut().as_mut_ptr().cast(),
                cap as libc::c_int,
                ms,
            )
        };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(());
            }
            return Err(ReactorError::Backend("epoll_wait", errno));
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        // SAFETY: the kernel initialized the first n entries.
        unsafe { buf.set_len(n) };

        for ev in buf.iter() {
            let mask = epoll_to_mask(ev.events);
            if !mask.is_empty() {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                ready.push(Ready {
                    fd: ev.u64 as RawFd,
                    mask,
                });
            }
        }
        /* a full batch means there may be more: widen the next read */
        if n == cap && cap < MAX_NEVENT {
            buf.reserve(cap * 2);
        }
        Ok(())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // SAFETY: epfd was returned by epoll_create1 and closed nowhere else.
        unsafe {
            libc::close(self.epfd);
        }
    }
}
