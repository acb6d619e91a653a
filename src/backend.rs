/*
 * backend.rs
 *
 * The contract every kernel readiness primitive is wrapped behind, and the
 * selection logic that picks one at reactor construction.
 *
 * Preference order is most-scalable-first: epoll, kqueue, poll. A config
 * can blacklist backends by name or demand a feature set; the environment
 * can disable backends with EVENT_NO<NAME> (ignored for set-id processes).
 *
 * add/del are called only when the aggregate interest on a descriptor
 * changes - evmap has already OR'd the per-event masks. dispatch is called
 * by the owner thread with the reactor lock RELEASED; add/del may race
 * with it from other threads, which every backend here tolerates (epoll
 * and kqueue at the kernel, poll with an internal snapshot).
 */

use core::time::Duration;
use std::os::fd::RawFd;

use crate::config::ReactorConfig;
use crate::error::{ReactorError, Result};
use crate::event::EventMask;

/// Backend capability bits, as reported by each backend's `features()` and
/// demanded via [`ReactorConfig::require_features`](crate::ReactorConfig::require_features).
pub mod features {
    /// Edge-triggered delivery is available (`EventMask::ET`).
    pub const ET: u32 = 0x01;
    /// add/del/dispatch cost does not grow with the number of watched fds.
    pub const O1: u32 = 0x02;
    /// Arbitrary fd kinds work, not just sockets.
    pub const FDS: u32 = 0x04;
    /// Peer-shutdown can be reported without a read (`EventMask::CLOSED`).
    pub const EARLY_CLOSE: u32 = 0x08;
}

/* one kernel-reported readiness fact */
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub fd: RawFd,
    pub mask: EventMask,
}

pub(crate) trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn features(&self) -> u32;

    /// True if the kernel object does not survive fork and must be torn
    /// down and rebuilt in the child.
    fn need_reinit(&self) -> bool;

    /// Aggregate interest on `fd` grew from `old` to `new`.
    fn add(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()>;

    /// Aggregate interest on `fd` shrank from `old` to `new`.
    fn del(&self, fd: RawFd, old: EventMask, new: EventMask) -> Result<()>;

    /// Block up to `timeout` (None = forever) and report readiness into
    /// `ready`. A wake with nothing ready (EINTR, notify) is not an error.
    fn dispatch(&self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> Result<()>;
}

/* constructors in preference order, most scalable first */
struct Candidate {
    name: &'static str,
    build: fn() -> Result<Box<dyn Backend>>,
}

#[cfg(target_os = "linux")]
fn build_epoll() -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::epoll::EpollBackend::new()?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn build_kqueue() -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::kqueue::KqueueBackend::new()?))
}

fn build_poll() -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::poll::PollBackend::new()))
}

fn candidates() -> Vec<Candidate> {
    let mut list = Vec::with_capacity(3);
    #[cfg(target_os = "linux")]
    list.push(Candidate {
        name: "epoll",
        build: build_epoll,
    });
    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    list.push(Candidate {
        name: "kqueue",
        build: build_kqueue,
    });
    list.push(Candidate {
        name: "poll",
        build: build_poll,
    });
    list
}

/// Names of the backends compiled into this build, preference order.
#[must_use]
pub fn supported_methods() -> Vec<&'static str> {
    candidates().iter().map(|c| c.name).collect()
}

/* feature masks are static per backend; consult them without constructing */
fn static_features(name: &str) -> u32 {
    match name {
        "epoll" => features::ET | features::O1 | features::EARLY_CLOSE,
        "kqueue" => features::ET | features::O1 | features::FDS,
        "poll" => features::FDS,
        _ => 0,
    }
}

pub(crate) fn select_backend(cfg: &ReactorConfig) -> Result<Box<dyn Backend>> {
    for cand in candidates() {
        if cfg.is_avoided(cand.name) {
            log::debug!("backend {}: avoided by config", cand.name);
            continue;
        }
        if cfg.env_disabled(cand.name) {
            log::debug!("backend {}: disabled by environment", cand.name);
            continue;
        }
        let required = cfg.required_features();
        if static_features(cand.name) & required != required {
            log::debug!("backend {}: missing required features", cand.name);
            continue;
        }
        match (cand.build)() {
            Ok(backend) => {
                if cfg.show_method() {
                    log::info!("using event-notification method: {}", backend.name());
                }
                return Ok(backend);
            }
            Err(e) => {
                /* constructor failure is not fatal while others remain */
                log::warn!("backend {} failed to initialize: {e}", cand.name);
            }
        }
    }
    Err(ReactorError::NoBackend)
}

/* shared by poll and epoll: Duration -> milliseconds, rounded UP so a
 * 1.4ms timeout never wakes at 1ms and spins */
pub(crate) fn timeout_to_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d
                .as_millis()
                .saturating_add(u128::from(d.subsec_nanos() % 1_000_000 != 0));
            i32::try_from(ms).unwrap_or(i32::MAX)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_methods_nonempty_and_ends_with_poll() {
        let methods = supported_methods();
        assert!(!methods.is_empty());
        assert_eq!(*methods.last().unwrap(), "poll");
    }

    #[test]
    fn test_default_selection_picks_first_candidate() {
        let cfg = ReactorConfig::new();
        let backend = select_backend(&cfg).expect("some backend must build");
        assert_eq!(backend.name(), supported_methods()[0]);
    }

    #[test]
    fn test_avoid_method_falls_back() {
        let mut cfg = ReactorConfig::new();
        for name in supported_methods() {
            if name != "poll" {
                cfg.avoid_method(name);
            }
        }
        let backend = select_backend(&cfg).expect("poll always builds");
        assert_eq!(backend.name(), "poll");
    }

    #[test]
    fn test_avoiding_everything_fails() {
        let mut cfg = ReactorConfig::new();
        for name in supported_methods() {
            cfg.avoid_method(name);
        }
        assert!(matches!(select_backend(&cfg), Err(ReactorError::NoBackend)));
    }

    #[test]
    fn test_require_features_filters() {
        let mut cfg = ReactorConfig::new();
        cfg.require_features(features::O1);
        match select_backend(&cfg) {
            Ok(b) => assert!(b.features() & features::O1 != 0),
            /* a poll-only platform has no O(1) backend */
            Err(ReactorError::NoBackend) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_timeout_to_ms_rounds_up() {
        assert_eq!(timeout_to_ms(None), -1);
        assert_eq!(timeout_to_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_to_ms(Some(Duration::from_millis(10))), 10);
        assert_eq!(timeout_to_ms(Some(Duration::from_micros(10_400))), 11);
        assert_eq!(timeout_to_ms(Some(Duration::from_secs(1 << 40))), i32::MAX);
    }
}
