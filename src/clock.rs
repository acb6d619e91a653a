/*
 * clock.rs
 *
 * Monotonic time for deadlines, wall time for reporting.
 *
 * Deadlines are Durations measured on CLOCK_MONOTONIC. Wall clocks jump
 * (NTP, manual adjustment); a timer armed for "2 seconds from now" must not
 * care. Users still want to see wall-clock deadlines, so we keep a
 * monotonic-to-wall offset and resync it at most every 5 seconds.
 *
 * On Linux the coarse clock is a vDSO read with ~1ms resolution, good
 * enough for timeout work and much cheaper under heavy dispatch. The
 * precise_timer config flag switches to the full-resolution clock.
 */

use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

/* resync the wall offset at most this often */
const WALL_SYNC_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct Clock {
    clockid: libc::clockid_t,
    /* monotonic reads are clamped so time never goes backwards */
    last: Duration,
    /* wall = monotonic + offset; resynced lazily */
    wall_offset: Duration,
    last_sync: Option<Duration>,
}

/* raw clock_gettime for the chosen clock */
fn read_clock(clockid: libc::clockid_t) -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid timespec; clock_gettime with a monotonic clock
    // id cannot fail on any supported target.
    unsafe {
        libc::clock_gettime(clockid, &raw mut ts);
    }
    #[allow(clippy::cast_sign_loss)]
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

#[cfg(target_os = "linux")]
fn pick_clockid(precise: bool) -> libc::clockid_t {
    if precise {
        libc::CLOCK_MONOTONIC
    } else {
        libc::CLOCK_MONOTONIC_COARSE
    }
}

#[cfg(not(target_os = "linux"))]
fn pick_clockid(_precise: bool) -> libc::clockid_t {
    /* macOS and the BSDs: CLOCK_MONOTONIC is already cheap */
    libc::CLOCK_MONOTONIC
}

impl Clock {
    pub(crate) fn new(precise: bool) -> Self {
        Self {
            clockid: pick_clockid(precise),
            last: Duration::ZERO,
            wall_offset: Duration::ZERO,
            last_sync: None,
        }
    }

    /// Non-decreasing monotonic time since an arbitrary epoch.
    pub(crate) fn now(&mut self) -> Duration {
        let raw = read_clock(self.clockid);
        /* never hand out a time earlier than one we already handed out */
        if raw > self.last {
            self.last = raw;
        }
        self.last
    }

    /// Convert a monotonic instant to wall-clock time for user reporting.
    pub(crate) fn wall_from_monotonic(&mut self, mono: Duration) -> SystemTime {
        let now = self.now();
        let due = match self.last_sync {
            Some(at) => now.saturating_sub(at) >= WALL_SYNC_INTERVAL,
            None => true,
        };
        if due {
            let wall = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            self.wall_offset = wall.saturating_sub(now);
            self.last_sync = Some(now);
        }
        UNIX_EPOCH + self.wall_offset + mono
    }
}
