/*
 * event.rs
 *
 * The event handle and its vocabulary types.
 *
 * An Event describes interest in some combination of fd readiness, one
 * signal, and a timeout, plus the callback to run when any of them fires.
 * The handle owns an arena slot inside its reactor; dropping the handle
 * deletes the event and releases the slot. Methods take &self and are safe
 * to call from any thread - cross-thread callers that need to keep the
 * handle around share it behind an Arc.
 *
 * Mask bit values match the wire-honored classics (READ=0x02 etc.) so that
 * code ported from C event loops reads the same.
 */

use core::fmt;
use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::Result;
use crate::reactor::{Core, SlotId};

/// Interest/result mask. Combine with `|`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u16);

impl EventMask {
    pub const NONE: Self = Self(0x00);
    /// Timer fired (result) or "also arm the timeout" (interest is implied
    /// by passing a timeout to `add`).
    pub const TIMEOUT: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE: Self = Self(0x04);
    /// Signal delivery. Must not be combined with READ/WRITE/CLOSED.
    pub const SIGNAL: Self = Self(0x08);
    /// Re-arm automatically after each firing.
    pub const PERSIST: Self = Self(0x10);
    /// Edge-triggered, where the backend supports it.
    pub const ET: Self = Self(0x20);
    /// Peer closed its half of the connection (backend-permitting).
    pub const CLOSED: Self = Self(0x80);

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The I/O readiness bits only.
    #[inline]
    #[must_use]
    pub const fn io_bits(self) -> Self {
        Self(self.0 & (Self::READ.0 | Self::WRITE.0 | Self::CLOSED.0))
    }

}

impl core::ops::BitOr for EventMask {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for EventMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for EventMask {
    type Output = Self;
    #[inline]
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventMask, &str); 7] = [
            (EventMask::TIMEOUT, "TIMEOUT"),
            (EventMask::READ, "READ"),
            (EventMask::WRITE, "WRITE"),
            (EventMask::SIGNAL, "SIGNAL"),
            (EventMask::PERSIST, "PERSIST"),
            (EventMask::ET, "ET"),
            (EventMask::CLOSED, "CLOSED"),
        ];
        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/* per-event lifecycle flags, crate-internal */
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct EvFlags(u8);

impl EvFlags {
    pub(crate) const TIMEOUT: Self = Self(0x01);
    pub(crate) const INSERTED: Self = Self(0x02);
    pub(crate) const ACTIVE: Self = Self(0x08);
    pub(crate) const INTERNAL: Self = Self(0x10);
    pub(crate) const ACTIVE_LATER: Self = Self(0x20);
    pub(crate) const FINALIZING: Self = Self(0x40);

    #[inline]
    pub(crate) const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub(crate) const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub(crate) fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub(crate) fn clear(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for EvFlags {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for EvFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EvFlags({:#04x})", self.0)
    }
}

/// What an event watches: a descriptor, a signal, or nothing (pure timer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Fd(RawFd),
    Signal(i32),
    None,
}

impl Target {
    #[inline]
    #[must_use]
    pub const fn fd(self) -> Option<RawFd> {
        match self {
            Self::Fd(fd) => Some(fd),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn signal(self) -> Option<i32> {
        match self {
            Self::Signal(sig) => Some(sig),
            _ => None,
        }
    }
}

/// A timeout for `Event::add`: either a standalone duration (one heap entry
/// per event) or a common-timeout token from
/// [`Reactor::init_common_timeout`](crate::Reactor::init_common_timeout)
/// (one shared FIFO with a single heap sentinel).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    After(Duration),
    Common(CommonTimeout),
}

impl Timeout {
    /// The relative duration this timeout represents.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        match self {
            Self::After(d) => *d,
            Self::Common(c) => c.duration,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::After(d)
    }
}

/// Opaque handle to one reactor's common-timeout queue. Only valid on the
/// reactor that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommonTimeout {
    pub(crate) index: u8,
    pub(crate) duration: Duration,
}

/* callback invoked on fire: (fd-or-signo, result mask) */
pub type Callback = Box<dyn FnMut(RawFd, EventMask) + Send + 'static>;
/* deferred teardown callback */
pub type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// A registered interest in fd readiness, signal delivery, and/or time.
///
/// Created against a [`Reactor`](crate::Reactor); does nothing until
/// [`add`](Event::add) is called. Dropping the handle deletes the event.
pub struct Event {
    pub(crate) core: Arc<Core>,
    pub(crate) id: SlotId,
}

impl Event {
    /// Describe interest in `target` with `mask`, to fire `cb`.
    ///
    /// SIGNAL may not be combined with READ/WRITE/CLOSED: signals are not
    /// descriptors. Pure timers pass `Target::None` and an empty mask.
    pub fn new(
        reactor: &crate::Reactor,
        target: Target,
        mask: EventMask,
        cb: impl FnMut(RawFd, EventMask) + Send + 'static,
    ) -> Result<Self> {
        reactor.assign(target, mask, Box::new(cb))
    }

    /// A timer event. `persist` re-arms the same duration after each fire.
    pub fn new_timer(
        reactor: &crate::Reactor,
        persist: bool,
        cb: impl FnMut(RawFd, EventMask) + Send + 'static,
    ) -> Result<Self> {
        let mask = if persist {
            EventMask::PERSIST
        } else {
            EventMask::NONE
        };
        reactor.assign(Target::None, mask, Box::new(cb))
    }

    /// A persistent signal event for `signo`.
    pub fn new_signal(
        reactor: &crate::Reactor,
        signo: i32,
        cb: impl FnMut(RawFd, EventMask) + Send + 'static,
    ) -> Result<Self> {
        reactor.assign(
            Target::Signal(signo),
            EventMask::SIGNAL | EventMask::PERSIST,
            Box::new(cb),
        )
    }

    /// Register the event, with an optional timeout.
    ///
    /// Re-adding a pending event is allowed: the timeout (if given) is
    /// re-scheduled from now, and the I/O/signal registration is untouched.
    pub fn add(&self, timeout: Option<Timeout>) -> Result<()> {
        self.core.ev_add(self.id, timeout)
    }

    /// Remove the event from the backend, timers, and active queues.
    ///
    /// Idempotent; callable from within the event's own callback. From a
    /// non-owner thread this blocks until a concurrently running callback
    /// of this event completes (see [`del_noblock`](Event::del_noblock)).
    pub fn del(&self) -> Result<()> {
        self.core.ev_del(self.id, crate::reactor::DelMode::AutoBlock)
    }

    /// Like [`del`](Event::del), but always waits out a concurrently
    /// running callback. Waiting for yourself never ends: only call this
    /// from threads other than the one running the loop.
    pub fn del_block(&self) -> Result<()> {
        self.core.ev_del(self.id, crate::reactor::DelMode::Block)
    }

    /// Like [`del`](Event::del), but never waits: a callback already in
    /// flight on another thread may still be executing when this returns.
    pub fn del_noblock(&self) -> Result<()> {
        self.core.ev_del(self.id, crate::reactor::DelMode::NoBlock)
    }

    /// Make the event active now with result `mask`, as if the backend had
    /// reported it. `ncalls` is the invocation count (signals coalesce).
    pub fn activate(&self, mask: EventMask, ncalls: u16) {
        self.core.ev_activate(self.id, mask, ncalls);
    }

    /// Queue the event for the *next* loop tick instead of the current one.
    /// Useful inside a callback to break an activation chain that would
    /// otherwise starve the kernel wait.
    pub fn activate_later(&self, mask: EventMask) {
        self.core.ev_activate_later(self.id, mask);
    }

    /// True if any of `mask`'s interests are pending (registered or
    /// queued for dispatch). `EventMask::TIMEOUT` asks about the timer.
    #[must_use]
    pub fn pending(&self, mask: EventMask) -> bool {
        self.core.ev_pending(self.id, mask)
    }

    /// Wall-clock deadline of the armed timeout, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<SystemTime> {
        self.core.ev_deadline(self.id)
    }

    /// Set dispatch priority; 0 is highest. Fails on an active event or a
    /// priority outside the reactor's configured range.
    pub fn set_priority(&self, priority: u8) -> Result<()> {
        self.core.ev_set_priority(self.id, priority)
    }

    /// Two-phase teardown: removes the event now, runs `f` from the loop
    /// once no callback of this event can still be in flight, then frees
    /// the slot. The handle is consumed.
    pub fn finalize(self, f: impl FnOnce() + Send + 'static) -> Result<()> {
        self.core.ev_finalize(self.id, Box::new(f))
        /* Drop still runs, but the slot is already finalizing; ev_drop
         * treats that as a no-op. */
    }

    /// What this event watches.
    #[must_use]
    pub fn target(&self) -> Target {
        self.core.ev_target(self.id)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.core.ev_drop(self.id);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("target", &self.target())
            .field("id", &self.id)
            .finish()
    }
}
