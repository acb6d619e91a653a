/*
 * poll.rs
 *
 * Portable poll(2) backend, the fallback on every Unix.
 *
 * poll has no kernel-side registration object: the interest set is handed
 * over on every call. We keep the set in a mutex-guarded map and snapshot
 * it into a pollfd array at each dispatch. A non-owner thread that changes
 * the set while the owner is blocked relies on the reactor's wake-up
 * channel (its read end is part of the set) to get the snapshot rebuilt.
 *
 * No kernel object also means nothing to rebuild after fork.
 */

use core::time::Duration;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::backend::{Backend, Ready, features, timeout_to_ms};
use crate::error::{ReactorError, Result, last_errno};
use crate::event::EventMask;

pub(crate) struct PollBackend {
    interest: Mutex<HashMap<RawFd, EventMask>>,
}

fn mask_to_poll(mask: EventMask) -> libc::c_short {
    let mut ev: libc::c_short = 0;
    if mask.contains(EventMask::READ) {
        ev |= libc::POLLIN | libc::POLLPRI;
    }
    if mask.contains(EventMask::WRITE) {
        ev |= libc::POLLOUT;
    }
    ev
}

fn poll_to_mask(revents: libc::c_short) -> EventMask {
    let mut mask = EventMask::NONE;
    if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
        mask |= EventMask::READ | EventMask::WRITE;
    }
    if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
        mask |= EventMask::READ;
    }
    if revents & libc::POLLOUT != 0 {
        mask |= EventMask::WRITE;
    }
    mask
}

impl PollBackend {
    pub(crate) fn new() -> Self {
        Self {
            interest: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RawFd, EventMask>> {
        self.interest
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Backend for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn features(&self) -> u32 {
        features::FDS
    }

    fn need_reinit(&self) -> bool {
        false
    }

    fn add(&self, fd: RawFd, _old: EventMask, new: EventMask) -> Result<()> {
        self.lock().insert(fd, new);
        Ok(())
    }

    fn del(&self, fd: RawFd, _old: EventMask, new: EventMask) -> Result<()> {
        let mut interest = self.lock();
        if new.io_bits().is_empty() {
            interest.remove(&fd);
        } else {
            interest.insert(fd, new);
        }
        Ok(())
    }

    fn dispatch(&self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> Result<()> {
        /* snapshot under the lock, poll without it */
        let mut fds: Vec<libc::pollfd> = self
            .lock()
            .iter()
            .map(|(fd, mask)| libc::pollfd {
                fd: *fd,
                events: mask_to_poll(*mask),
                revents: 0,
            })
            .collect();

        let ms = timeout_to_ms(timeout);
        // SAFETY: fds points at fds.len() valid pollfd structs.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::EINTR {
                return Ok(());
            }
            return Err(ReactorError::Backend("poll", errno));
        }

        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                /* fd closed out from under us; the owner will del it */
                log::debug!("poll: fd {} is invalid (POLLNVAL)", pfd.fd);
                continue;
            }
            let mask = poll_to_mask(pfd.revents);
            if !mask.is_empty() {
                ready.push(Ready { fd: pfd.fd, mask });
            }
        }
        Ok(())
    }
}
