/*
 * reactor.rs
 *
 * The event base: owns the backend, the registration maps, the timer
 * structures, the per-priority active queues, and the loop that ties them
 * together.
 *
 * Locking model: one mutex guards all reactor state. The owner thread
 * releases it in exactly two places - around the kernel wait and around
 * user callback bodies. Everything else is a short critical section.
 * Foreign threads mutate under the same lock and, when the change affects
 * what the owner should be waiting for, write to the wake-up channel.
 *
 * Events are slots in an arena, referenced by (index, generation). Queues
 * hold indices; each slot records its own heap position and common-queue
 * membership so deletion never searches the heap.
 *
 * Cached time: the per-tick timestamp is valid only on the owner thread
 * while the lock is held, and never between the pre-wait clear and the
 * post-wait refresh. Foreign threads that read time while the owner sleeps
 * get a fresh clock read instead of a stale cache.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::ThreadId;
use std::time::SystemTime;

use crate::backend::{Backend, features, select_backend};
use crate::clock::Clock;
use crate::config::ReactorConfig;
use crate::debug;
use crate::error::{ReactorError, Result};
use crate::event::{Callback, CommonTimeout, EvFlags, Event, EventMask, Finalizer, Target, Timeout};
use crate::evmap::EvMap;
use crate::minheap::{TimerEntry, TimerHeap};
use crate::notify::NotifyChannel;
use crate::signal::SignalTrampoline;

/* hard caps: a u8 indexes common-timeout queues, priorities stay sane */
const MAX_COMMON_TIMEOUTS: usize = 256;
const MAX_PRIORITIES: usize = 255;

/* debug-table keys are unique across all reactors in the process */
static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Flags for [`Reactor::dispatch`]. Combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchFlags(u8);

impl DispatchFlags {
    pub const NONE: Self = Self(0);
    /// Return after one productive round of callbacks.
    pub const ONCE: Self = Self(0x01);
    /// Never block in the kernel; process what is ready and return.
    pub const NONBLOCK: Self = Self(0x02);
    /// Keep looping even when no events are registered.
    pub const NO_EXIT_ON_EMPTY: Self = Self(0x04);

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for DispatchFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Why [`Reactor::dispatch`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Ran to completion (ONCE satisfied, NONBLOCK pass done, or drained).
    Completed,
    /// Nothing registered and NO_EXIT_ON_EMPTY not set.
    NoPendingEvents,
    /// loopbreak or loopexit ended the loop.
    Broken,
}

/* how del treats a callback in flight on another thread */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DelMode {
    /// Wait unless called from the owner thread (where waiting would
    /// deadlock against ourselves).
    AutoBlock,
    /// Always wait. Caller guarantees it is not the owner thread.
    Block,
    /// Never wait.
    NoBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SlotId {
    idx: usize,
    r#gen: u32,
}

/* what the dispatcher does when the slot comes off an active queue */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    User,
    /* wake-up channel read end */
    Notify,
    /* signal pipe read end */
    SignalPipe,
    /* sentinel for one common-timeout queue */
    CommonSentinel(u8),
    /* internal one-shot armed by loopexit */
    LoopExit,
}

struct EventSlot {
    r#gen: u32,
    uid: u64,
    kind: Kind,
    target: Target,
    mask: EventMask,
    flags: EvFlags,
    priority: usize,
    cb: Option<Callback>,
    finalizer: Option<Finalizer>,
    /* accumulated result while active */
    res: EventMask,
    ncalls: u16,
    /* last scheduled absolute deadline; meaningful while TIMEOUT set, and
     * kept afterwards so persistent re-arm can anchor to it */
    deadline: Option<Duration>,
    /* timeout to re-arm for persistent events */
    period: Option<Timeout>,
    heap_pos: Option<usize>,
    common_queue: Option<u8>,
    /* handle gone (or never existed): free the slot after dispatch */
    dropped: bool,
}

impl EventSlot {
    fn internal(&self) -> bool {
        self.flags.contains(EvFlags::INTERNAL)
    }

    /* counts toward event_count per the documented invariant */
    fn relevant(&self) -> bool {
        !self.internal()
            && self.flags.intersects(
                EvFlags::INSERTED | EvFlags::ACTIVE | EvFlags::ACTIVE_LATER | EvFlags::TIMEOUT,
            )
    }
}

struct CommonQueue {
    duration: Duration,
    /* ascending-deadline FIFO of slot indices */
    queue: VecDeque<usize>,
    sentinel: usize,
}

struct Inner {
    slots: Vec<Option<EventSlot>>,
    free_list: Vec<usize>,
    next_gen: u32,
    evmap: EvMap,
    heap: TimerHeap,
    common: Vec<CommonQueue>,
    active: Vec<VecDeque<usize>>,
    active_later: VecDeque<usize>,
    clock: Clock,
    cached_now: Option<Duration>,
    cache_time: bool,
    /* loop state */
    running: bool,
    owner: Option<ThreadId>,
    loop_break: bool,
    loop_exit: bool,
    loop_continue: bool,
    running_priority: usize,
    current: Option<SlotId>,
    current_waiters: usize,
    /* plumbing */
    trampoline: Option<SignalTrampoline>,
    notify: Option<NotifyChannel>,
    notify_pending: bool,
    /* pacing */
    max_dispatch_time: Option<Duration>,
    max_dispatch_callbacks: Option<usize>,
    limit_after_prio: usize,
    torn_down: bool,
}

impl Inner {
    fn now(&mut self) -> Duration {
        match self.cached_now {
            Some(t) => t,
            None => self.clock.now(),
        }
    }

    fn n_active(&self) -> usize {
        self.active.iter().map(VecDeque::len).sum::<usize>() + self.active_later.len()
    }

    fn haveevents(&self) -> bool {
        self.slots.iter().flatten().any(EventSlot::relevant)
    }

    fn slot(&self, idx: usize) -> Option<&EventSlot> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, idx: usize) -> Option<&mut EventSlot> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn alloc_slot(&mut self, slot: EventSlot) -> usize {
        match self.free_list.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn free_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots[idx].take() {
            debug::note_teardown(slot.uid);
            self.free_list.push(idx);
        }
    }
}

pub(crate) struct Core {
    inner: Mutex<Inner>,
    /* signaled whenever a callback body finishes */
    cb_done: Condvar,
    /* read-locked around add/del/dispatch, write-locked only by reinit */
    backend: RwLock<Box<dyn Backend>>,
    cfg: ReactorConfig,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(inner: &Inner, id: SlotId) -> Result<usize> {
        match inner.slot(id.idx) {
            Some(slot) if slot.r#gen == id.r#gen => Ok(id.idx),
            _ => Err(ReactorError::Stale),
        }
    }

    /* true when a foreign mutation must jolt the owner out of its wait */
    fn need_notify(inner: &Inner) -> bool {
        inner.running
            && inner.notify.is_some()
            && inner.owner != Some(std::thread::current().id())
    }

    fn notify_nolock(inner: &mut Inner) {
        if inner.notify_pending {
            return;
        }
        if let Some(ch) = &inner.notify {
            inner.notify_pending = true;
            ch.notify();
        }
    }

    /* ------------------------------------------------------------------ */
    /* slot allocation / handle operations                                 */
    /* ------------------------------------------------------------------ */

    fn new_slot(inner: &mut Inner, kind: Kind, target: Target, mask: EventMask) -> usize {
        let r#gen = inner.next_gen;
        inner.next_gen = inner.next_gen.wrapping_add(1);
        let uid = NEXT_UID.fetch_add(1, Ordering::Relaxed);
        let mut flags = EvFlags::default();
        if kind != Kind::User && kind != Kind::LoopExit {
            flags.set(EvFlags::INTERNAL);
        }
        let priority = inner.active.len() / 2;
        let idx = inner.alloc_slot(EventSlot {
            r#gen,
            uid,
            kind,
            target,
            mask,
            flags,
            priority,
            cb: None,
            finalizer: None,
            res: EventMask::NONE,
            ncalls: 0,
            deadline: None,
            period: None,
            heap_pos: None,
            common_queue: None,
            dropped: false,
        });
        debug::note_assign(uid);
        idx
    }

    pub(crate) fn assign(
        self: &Arc<Self>,
        target: Target,
        mask: EventMask,
        cb: Callback,
    ) -> Result<Event> {
        if mask.contains(EventMask::SIGNAL)
            && mask.intersects(EventMask::READ | EventMask::WRITE | EventMask::CLOSED | EventMask::ET)
        {
            return Err(ReactorError::InvalidArgument("SIGNAL mixed with I/O bits"));
        }
        match target {
            Target::Signal(_) if !mask.contains(EventMask::SIGNAL) => {
                return Err(ReactorError::InvalidArgument("signal target without SIGNAL"));
            }
            Target::Fd(_) | Target::None if mask.contains(EventMask::SIGNAL) => {
                return Err(ReactorError::InvalidArgument("SIGNAL without signal target"));
            }
            Target::Signal(signo) if signo <= 0 => {
                return Err(ReactorError::InvalidArgument("bad signal number"));
            }
            _ => {}
        }
        if mask.contains(EventMask::CLOSED) {
            let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
            if be.features() & features::EARLY_CLOSE == 0 {
                return Err(ReactorError::InvalidArgument(
                    "CLOSED unsupported by this backend",
                ));
            }
        }
        if mask.contains(EventMask::ET) {
            let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
            if be.features() & features::ET == 0 {
                return Err(ReactorError::InvalidArgument(
                    "edge-triggered unsupported by this backend",
                ));
            }
        }
        let mut inner = self.lock();
        if inner.torn_down {
            return Err(ReactorError::Stale);
        }
        let idx = Self::new_slot(&mut inner, Kind::User, target, mask);
        let slot = inner.slot_mut(idx).expect("just allocated");
        slot.cb = Some(cb);
        let r#gen = slot.r#gen;
        Ok(Event {
            core: Arc::clone(self),
            id: SlotId { idx, r#gen },
        })
    }

    /* register io/signal interest with evmap + backend; sets INSERTED */
    fn insert_registration(&self, inner: &mut Inner, idx: usize) -> Result<()> {
        let (target, mask, flags) = {
            let slot = inner.slot(idx).expect("caller resolved");
            (slot.target, slot.mask, slot.flags)
        };
        if flags.contains(EvFlags::INSERTED) {
            return Ok(());
        }
        match target {
            Target::Fd(fd) if !mask.io_bits().is_empty() => {
                let reg_mask = mask.io_bits()
                    | if mask.contains(EventMask::ET) {
                        EventMask::ET
                    } else {
                        EventMask::NONE
                    };
                let change = inner.evmap.add_io(fd, idx, reg_mask);
                if change.changed() {
                    let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                    if let Err(e) = be.add(fd, change.old, change.new) {
                        inner.evmap.del_io(fd, idx, reg_mask);
                        return Err(e);
                    }
                }
            }
            Target::Signal(signo) => {
                self.ensure_trampoline(inner)?;
                let first = inner.evmap.add_signal(signo, idx);
                if first {
                    let tramp = inner.trampoline.as_mut().expect("just ensured");
                    if let Err(e) = tramp.watch(signo) {
                        inner.evmap.del_signal(signo, idx);
                        return Err(e);
                    }
                }
            }
            _ => return Ok(()),
        }
        if let Some(slot) = inner.slot_mut(idx) {
            slot.flags.set(EvFlags::INSERTED);
        }
        Ok(())
    }

    /* build the signal pipe and its internal read event on first use */
    fn ensure_trampoline(&self, inner: &mut Inner) -> Result<()> {
        if inner.trampoline.is_some() {
            return Ok(());
        }
        let token = self as *const Core as usize;
        let tramp = SignalTrampoline::install(token)?;
        let fd = tramp.read_fd();
        inner.trampoline = Some(tramp);
        let idx = Self::new_slot(
            inner,
            Kind::SignalPipe,
            Target::Fd(fd),
            EventMask::READ | EventMask::PERSIST,
        );
        if let Err(e) = self.insert_registration(inner, idx) {
            inner.free_slot(idx);
            inner.trampoline = None;
            return Err(e);
        }
        Ok(())
    }

    /* place a timer at an absolute deadline, replacing any armed one */
    fn arm_timeout_absolute(
        inner: &mut Inner,
        idx: usize,
        run_at: Duration,
        spec: Timeout,
    ) -> Result<()> {
        Self::disarm_timeout(inner, idx);
        /* the deadline must be visible before queue insertion: the common
         * path orders by it and the sentinel schedule reads the head's */
        if let Some(slot) = inner.slot_mut(idx) {
            slot.deadline = Some(run_at);
        }
        match spec {
            Timeout::After(_) => {
                let Inner { heap, slots, .. } = &mut *inner;
                heap.push(
                    TimerEntry {
                        deadline: run_at,
                        slot: idx,
                    },
                    |s, p| {
                        if let Some(slot) = slots[s].as_mut() {
                            slot.heap_pos = p;
                        }
                    },
                );
            }
            Timeout::Common(ct) => {
                let qi = usize::from(ct.index);
                let valid = inner
                    .common
                    .get(qi)
                    .is_some_and(|q| q.duration == ct.duration);
                if !valid {
                    return Err(ReactorError::InvalidArgument(
                        "common timeout from another reactor",
                    ));
                }
                /* FIFO is in ascending deadline order; a re-armed event
                 * whose anchor slipped into the past inserts from the tail */
                let at = {
                    let q = &inner.common[qi];
                    let mut at = q.queue.len();
                    while at > 0 {
                        let prev = q.queue[at - 1];
                        let prev_deadline = inner
                            .slot(prev)
                            .and_then(|s| s.deadline)
                            .unwrap_or(Duration::ZERO);
                        if prev_deadline <= run_at {
                            break;
                        }
                        at -= 1;
                    }
                    at
                };
                inner.common[qi].queue.insert(at, idx);
                if let Some(slot) = inner.slot_mut(idx) {
                    slot.common_queue = Some(ct.index);
                }
                if at == 0 {
                    Self::schedule_common_sentinel(inner, qi);
                }
            }
        }
        if let Some(slot) = inner.slot_mut(idx) {
            slot.flags.set(EvFlags::TIMEOUT);
        }
        Ok(())
    }

    /* re-point the sentinel's heap entry at the queue head's deadline */
    fn schedule_common_sentinel(inner: &mut Inner, qi: usize) {
        let (sentinel, head_deadline) = {
            let q = &inner.common[qi];
            let head = q.queue.front().copied();
            let deadline = head
                .and_then(|h| inner.slot(h).and_then(|s| s.deadline));
            (q.sentinel, deadline)
        };
        let Some(deadline) = head_deadline else {
            return;
        };
        Self::disarm_timeout(inner, sentinel);
        let Inner { heap, slots, .. } = &mut *inner;
        heap.push(
            TimerEntry {
                deadline,
                slot: sentinel,
            },
            |s, p| {
                if let Some(slot) = slots[s].as_mut() {
                    slot.heap_pos = p;
                }
            },
        );
        if let Some(slot) = inner.slot_mut(sentinel) {
            slot.deadline = Some(deadline);
            slot.flags.set(EvFlags::TIMEOUT);
        }
    }

    /* remove from heap or common queue; keeps slot.deadline for re-arm */
    fn disarm_timeout(inner: &mut Inner, idx: usize) {
        let (had, heap_pos, common_queue) = match inner.slot(idx) {
            Some(slot) => (
                slot.flags.contains(EvFlags::TIMEOUT),
                slot.heap_pos,
                slot.common_queue,
            ),
            None => return,
        };
        if !had {
            return;
        }
        if let Some(pos) = heap_pos {
            let Inner { heap, slots, .. } = &mut *inner;
            heap.remove_at(pos, |s, p| {
                if let Some(slot) = slots[s].as_mut() {
                    slot.heap_pos = p;
                }
            });
        } else if let Some(qi) = common_queue {
            let q = &mut inner.common[usize::from(qi)];
            if let Some(pos) = q.queue.iter().position(|&s| s == idx) {
                let _ = q.queue.remove(pos);
            }
        }
        if let Some(slot) = inner.slot_mut(idx) {
            slot.flags.clear(EvFlags::TIMEOUT);
            slot.heap_pos = None;
            slot.common_queue = None;
        }
    }

    pub(crate) fn ev_add(&self, id: SlotId, timeout: Option<Timeout>) -> Result<()> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, id)?;
        self.add_nolock(&mut inner, idx, timeout, false)
    }

    fn add_nolock(
        &self,
        inner: &mut Inner,
        idx: usize,
        timeout: Option<Timeout>,
        internal_caller: bool,
    ) -> Result<()> {
        {
            let slot = inner.slot(idx).expect("caller resolved");
            if slot.flags.contains(EvFlags::FINALIZING) && !internal_caller {
                return Err(ReactorError::InvalidArgument("add on finalizing event"));
            }
        }
        let was_inserted = inner
            .slot(idx)
            .expect("resolved")
            .flags
            .contains(EvFlags::INSERTED);
        self.insert_registration(inner, idx)?;
        let newly_inserted = !was_inserted
            && inner
                .slot(idx)
                .is_some_and(|s| s.flags.contains(EvFlags::INSERTED));

        let mut new_min_deadline = false;
        if let Some(spec) = timeout {
            let now = inner.now();
            let run_at = now + spec.duration();
            if inner
                .slot(idx)
                .is_some_and(|s| s.mask.contains(EventMask::PERSIST))
            {
                if let Some(slot) = inner.slot_mut(idx) {
                    slot.period = Some(spec);
                }
            }
            Self::arm_timeout_absolute(inner, idx, run_at, spec)?;
            new_min_deadline = inner.heap.peek().is_some_and(|top| top.slot == idx)
                || (matches!(spec, Timeout::Common(_))
                    && inner.heap.peek().is_some_and(|top| {
                        inner
                            .slot(top.slot)
                            .is_some_and(|s| matches!(s.kind, Kind::CommonSentinel(_)))
                            && top.deadline == run_at
                    }));
        }
        debug::note_add(inner.slot(idx).expect("resolved").uid);

        if (newly_inserted || new_min_deadline) && Self::need_notify(inner) {
            Self::notify_nolock(inner);
        }
        Ok(())
    }

    pub(crate) fn ev_del(&self, id: SlotId, mode: DelMode) -> Result<()> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, id)?;

        /* block until a callback in flight on another thread finishes */
        let blocking = match mode {
            DelMode::NoBlock => false,
            DelMode::Block => true,
            DelMode::AutoBlock => inner.owner != Some(std::thread::current().id()),
        };
        if blocking {
            while inner.current == Some(id) && inner.owner != Some(std::thread::current().id()) {
                inner.current_waiters += 1;
                inner = self
                    .cb_done
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
                inner.current_waiters -= 1;
            }
            /* the slot may be gone by the time we wake */
            if Self::resolve(&inner, id).is_err() {
                return Ok(());
            }
        }

        self.del_nolock(&mut inner, idx, false);
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
        Ok(())
    }

    /* the workhorse: undo add and activation. preserve_ncalls keeps the
     * coalesced signal count alive for the dispatcher's pre-dispatch del */
    fn del_nolock(&self, inner: &mut Inner, idx: usize, preserve_ncalls: bool) {
        let Some(slot) = inner.slot(idx) else { return };
        let uid = slot.uid;
        let target = slot.target;
        let mask = slot.mask;
        let flags = slot.flags;
        let priority = slot.priority;

        Self::disarm_timeout(inner, idx);

        if flags.contains(EvFlags::ACTIVE) {
            let q = &mut inner.active[priority];
            if let Some(pos) = q.iter().position(|&s| s == idx) {
                let _ = q.remove(pos);
            }
        }
        if flags.contains(EvFlags::ACTIVE_LATER) {
            if let Some(pos) = inner.active_later.iter().position(|&s| s == idx) {
                let _ = inner.active_later.remove(pos);
            }
        }

        if flags.contains(EvFlags::INSERTED) {
            match target {
                Target::Fd(fd) => {
                    let reg_mask = mask.io_bits()
                        | if mask.contains(EventMask::ET) {
                            EventMask::ET
                        } else {
                            EventMask::NONE
                        };
                    let change = inner.evmap.del_io(fd, idx, reg_mask);
                    if change.changed() {
                        let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                        if let Err(e) = be.del(fd, change.old, change.new) {
                            /* the event is gone from our maps regardless */
                            log::warn!("backend del for fd {fd} failed: {e}");
                        }
                    }
                }
                Target::Signal(signo) => {
                    if inner.evmap.del_signal(signo, idx) {
                        if let Some(tramp) = inner.trampoline.as_mut() {
                            tramp.unwatch(signo);
                        }
                    }
                }
                Target::None => {}
            }
        }

        if let Some(slot) = inner.slot_mut(idx) {
            slot.flags.clear(
                EvFlags::INSERTED | EvFlags::ACTIVE | EvFlags::ACTIVE_LATER | EvFlags::TIMEOUT,
            );
            slot.res = EventMask::NONE;
            if !preserve_ncalls {
                slot.ncalls = 0;
            }
        }
        debug::note_del(uid);
    }

    fn activate_nolock(inner: &mut Inner, idx: usize, res: EventMask, ncalls: u16) {
        let Some(slot) = inner.slot_mut(idx) else { return };
        if slot.flags.contains(EvFlags::FINALIZING) {
            return;
        }
        if slot
            .flags
            .intersects(EvFlags::ACTIVE | EvFlags::ACTIVE_LATER)
        {
            /* already queued: coalesce */
            slot.res |= res;
            if slot.mask.contains(EventMask::SIGNAL) {
                slot.ncalls = slot.ncalls.saturating_add(ncalls);
            }
            return;
        }
        slot.res = res;
        slot.ncalls = ncalls;
        slot.flags.set(EvFlags::ACTIVE);
        let priority = slot.priority;
        inner.active[priority].push_back(idx);
        /* a callback activating something more urgent restarts the scan */
        if inner.running && priority < inner.running_priority {
            inner.loop_continue = true;
        }
    }

    fn activate_later_nolock(inner: &mut Inner, idx: usize, res: EventMask, ncalls: u16) {
        let Some(slot) = inner.slot_mut(idx) else { return };
        if slot.flags.contains(EvFlags::FINALIZING) {
            return;
        }
        if slot
            .flags
            .intersects(EvFlags::ACTIVE | EvFlags::ACTIVE_LATER)
        {
            slot.res |= res;
            if slot.mask.contains(EventMask::SIGNAL) {
                slot.ncalls = slot.ncalls.saturating_add(ncalls);
            }
            return;
        }
        slot.res = res;
        slot.ncalls = ncalls;
        slot.flags.set(EvFlags::ACTIVE_LATER);
        inner.active_later.push_back(idx);
    }

    pub(crate) fn ev_activate(&self, id: SlotId, res: EventMask, ncalls: u16) {
        let mut inner = self.lock();
        let Ok(idx) = Self::resolve(&inner, id) else {
            return;
        };
        Self::activate_nolock(&mut inner, idx, res, ncalls.max(1));
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
    }

    pub(crate) fn ev_activate_later(&self, id: SlotId, res: EventMask) {
        let mut inner = self.lock();
        let Ok(idx) = Self::resolve(&inner, id) else {
            return;
        };
        Self::activate_later_nolock(&mut inner, idx, res, 1);
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
    }

    pub(crate) fn ev_pending(&self, id: SlotId, mask: EventMask) -> bool {
        let inner = self.lock();
        let Ok(idx) = Self::resolve(&inner, id) else {
            return false;
        };
        let slot = inner.slot(idx).expect("resolved");
        let mut pend = EventMask::NONE;
        if slot.flags.contains(EvFlags::INSERTED) {
            pend |= slot.mask
                & (EventMask::READ | EventMask::WRITE | EventMask::CLOSED | EventMask::SIGNAL);
        }
        if slot
            .flags
            .intersects(EvFlags::ACTIVE | EvFlags::ACTIVE_LATER)
        {
            pend |= slot.res;
        }
        if slot.flags.contains(EvFlags::TIMEOUT) {
            pend |= EventMask::TIMEOUT;
        }
        pend.intersects(mask)
    }

    pub(crate) fn ev_deadline(&self, id: SlotId) -> Option<SystemTime> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, id).ok()?;
        let slot = inner.slot(idx)?;
        if !slot.flags.contains(EvFlags::TIMEOUT) {
            return None;
        }
        let mono = slot.deadline?;
        Some(inner.clock.wall_from_monotonic(mono))
    }

    pub(crate) fn ev_set_priority(&self, id: SlotId, priority: u8) -> Result<()> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, id)?;
        let nqueues = inner.active.len();
        let slot = inner.slot_mut(idx).expect("resolved");
        if slot
            .flags
            .intersects(EvFlags::ACTIVE | EvFlags::ACTIVE_LATER)
        {
            return Err(ReactorError::InvalidArgument("priority_set on active event"));
        }
        if usize::from(priority) >= nqueues {
            return Err(ReactorError::InvalidArgument("priority out of range"));
        }
        slot.priority = usize::from(priority);
        Ok(())
    }

    pub(crate) fn ev_finalize(&self, id: SlotId, f: Finalizer) -> Result<()> {
        let mut inner = self.lock();
        let idx = Self::resolve(&inner, id)?;
        {
            let slot = inner.slot_mut(idx).expect("resolved");
            if slot.flags.contains(EvFlags::FINALIZING) {
                return Err(ReactorError::InvalidArgument("finalize twice"));
            }
            slot.finalizer = Some(f);
        }
        self.del_nolock(&mut inner, idx, false);
        let slot = inner.slot_mut(idx).expect("resolved");
        slot.flags.set(EvFlags::FINALIZING);
        slot.res = EventMask::NONE;
        slot.flags.set(EvFlags::ACTIVE);
        let priority = slot.priority;
        inner.active[priority].push_back(idx);
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
        Ok(())
    }

    pub(crate) fn ev_target(&self, id: SlotId) -> Target {
        let inner = self.lock();
        match Self::resolve(&inner, id) {
            Ok(idx) => inner.slot(idx).map_or(Target::None, |s| s.target),
            Err(_) => Target::None,
        }
    }

    /* handle dropped: delete and free, deferring if a callback is running */
    pub(crate) fn ev_drop(&self, id: SlotId) {
        let mut inner = self.lock();
        let Ok(idx) = Self::resolve(&inner, id) else {
            return;
        };
        if inner
            .slot(idx)
            .is_some_and(|s| s.flags.contains(EvFlags::FINALIZING))
        {
            /* finalize() owns the teardown now */
            return;
        }
        self.del_nolock(&mut inner, idx, false);
        if inner.current == Some(id) {
            /* dispatcher frees it when the callback returns */
            if let Some(slot) = inner.slot_mut(idx) {
                slot.dropped = true;
            }
        } else {
            inner.free_slot(idx);
        }
    }

    /* ------------------------------------------------------------------ */
    /* timer engine                                                        */
    /* ------------------------------------------------------------------ */

    /* activate everything whose deadline has passed */
    fn timeout_process(&self, inner: &mut Inner) {
        if inner.heap.is_empty() {
            return;
        }
        let now = inner.now();
        loop {
            let Some(top) = inner.heap.peek() else { break };
            if top.deadline > now {
                break;
            }
            let idx = top.slot;
            /* non-persistent semantics: fully un-add, then activate; the
             * persistent closure re-adds from the retained deadline */
            self.del_nolock(inner, idx, true);
            Self::activate_nolock(inner, idx, EventMask::TIMEOUT, 1);
        }
    }

    /* drain one common-timeout queue after its sentinel fired */
    fn process_common(&self, inner: &mut Inner, qi: usize) {
        let now = inner.now();
        loop {
            let Some(&head) = inner.common[qi].queue.front() else {
                break;
            };
            let due = inner
                .slot(head)
                .and_then(|s| s.deadline)
                .is_some_and(|d| d <= now);
            if !due {
                break;
            }
            self.del_nolock(inner, head, true);
            Self::activate_nolock(inner, head, EventMask::TIMEOUT, 1);
        }
        Self::schedule_common_sentinel(inner, qi);
    }

    /* next kernel wait: zero if work is queued, heap-driven otherwise */
    fn timeout_next(inner: &mut Inner) -> Option<Duration> {
        let deadline = inner.heap.peek().map(|top| top.deadline)?;
        let now = inner.now();
        Some(deadline.saturating_sub(now))
    }

    fn make_later_active(inner: &mut Inner) {
        while let Some(idx) = inner.active_later.pop_front() {
            let Some(slot) = inner.slot_mut(idx) else { continue };
            slot.flags.clear(EvFlags::ACTIVE_LATER);
            slot.flags.set(EvFlags::ACTIVE);
            let priority = slot.priority;
            inner.active[priority].push_back(idx);
        }
    }

    /* persistent events: compute the next deadline BEFORE the callback
     * runs, anchored to the previous deadline for timer-fired events so
     * periods do not drift with callback latency */
    fn persist_rearm(&self, inner: &mut Inner, idx: usize, fired: EventMask) -> Result<()> {
        let (period, prev_deadline) = match inner.slot(idx) {
            Some(slot) => (slot.period, slot.deadline),
            None => return Ok(()),
        };
        self.insert_registration(inner, idx)?;
        if let Some(spec) = period {
            let now = inner.now();
            let delay = spec.duration();
            let anchor = if fired.contains(EventMask::TIMEOUT) {
                prev_deadline.unwrap_or(now)
            } else {
                now
            };
            let mut run_at = anchor + delay;
            if run_at < now {
                /* clock jump or a slow callback: re-anchor to now. A
                 * deadline landing exactly on now is on time, not late -
                 * the coarse clock makes that collision routine */
                run_at = now + delay;
            }
            Self::arm_timeout_absolute(inner, idx, run_at, spec)?;
        }
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* the loop                                                            */
    /* ------------------------------------------------------------------ */

    pub(crate) fn dispatch(self: &Arc<Self>, flags: DispatchFlags) -> Result<DispatchOutcome> {
        let mut inner = self.lock();
        if inner.running {
            return Err(ReactorError::LoopRunning);
        }
        if inner.torn_down {
            return Err(ReactorError::Stale);
        }
        inner.running = true;
        inner.owner = Some(std::thread::current().id());
        inner.loop_break = false;
        inner.loop_exit = false;
        inner.cached_now = None;

        let mut outcome = DispatchOutcome::Completed;
        let mut result: Result<()> = Ok(());
        let mut done = false;

        while !done {
            inner.loop_continue = false;
            if inner.loop_break || inner.loop_exit {
                outcome = DispatchOutcome::Broken;
                break;
            }

            let have_active = inner.n_active() > 0;
            let wait = if have_active || flags.contains(DispatchFlags::NONBLOCK) {
                Some(Duration::ZERO)
            } else {
                Self::timeout_next(&mut inner)
            };

            if !inner.haveevents()
                && !have_active
                && !flags.contains(DispatchFlags::NO_EXIT_ON_EMPTY)
            {
                outcome = DispatchOutcome::NoPendingEvents;
                break;
            }

            Self::make_later_active(&mut inner);

            /* the cache must not be trusted across the kernel wait */
            inner.cached_now = None;
            drop(inner);

            let mut ready = Vec::with_capacity(32);
            let wait_result = {
                let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                be.dispatch(wait, &mut ready)
            };

            inner = self.lock();
            if let Err(e) = wait_result {
                result = Err(e);
                break;
            }
            if inner.cache_time {
                inner.cached_now = Some(inner.clock.now());
            }

            for rd in ready {
                for (idx, bits) in inner.evmap.io_ready(rd.fd, rd.mask) {
                    Self::activate_nolock(&mut inner, idx, bits, 1);
                }
            }

            self.timeout_process(&mut inner);

            if inner.n_active() > 0 {
                let (returned, ncalled) = self.process_active(inner);
                inner = returned;
                if flags.contains(DispatchFlags::ONCE) && ncalled > 0 && inner.n_active() == 0 {
                    done = true;
                }
            } else if flags.contains(DispatchFlags::NONBLOCK) {
                done = true;
            }

            if inner.loop_break || inner.loop_exit {
                outcome = DispatchOutcome::Broken;
                done = true;
            }
        }

        inner.cached_now = None;
        inner.running = false;
        inner.owner = None;
        inner.running_priority = usize::MAX;
        drop(inner);

        result.map(|()| outcome)
    }

    /* run the highest non-empty priority queue; returns user callbacks run */
    fn process_active<'a>(
        self: &'a Arc<Self>,
        mut guard: MutexGuard<'a, Inner>,
    ) -> (MutexGuard<'a, Inner>, usize) {
        let nqueues = guard.active.len();
        let mut total = 0usize;
        for pri in 0..nqueues {
            if guard.active[pri].is_empty() {
                continue;
            }
            guard.running_priority = pri;
            let limited = pri >= guard.limit_after_prio;
            let max_cb = if limited {
                guard.max_dispatch_callbacks.unwrap_or(usize::MAX)
            } else {
                usize::MAX
            };
            let endtime = if limited {
                match guard.max_dispatch_time {
                    Some(d) => Some(guard.clock.now() + d),
                    None => None,
                }
            } else {
                None
            };
            let (returned, count) = self.process_queue(guard, pri, max_cb, endtime);
            guard = returned;
            total += count;
            if count > 0 || guard.loop_break || guard.loop_continue {
                /* processed real work, or a callback asked us to stop or
                 * restart: never fall through to lower priorities */
                break;
            }
        }
        guard.running_priority = usize::MAX;
        (guard, total)
    }

    #[allow(clippy::too_many_lines)]
    fn process_queue<'a>(
        self: &'a Arc<Self>,
        mut guard: MutexGuard<'a, Inner>,
        pri: usize,
        max_cb: usize,
        endtime: Option<Duration>,
    ) -> (MutexGuard<'a, Inner>, usize) {
        let mut count = 0usize;
        while let Some(idx) = guard.active[pri].pop_front() {
            let Some(slot) = guard.slot_mut(idx) else {
                continue;
            };
            slot.flags.clear(EvFlags::ACTIVE);
            let res = slot.res;
            slot.res = EventMask::NONE;
            let kind = slot.kind;
            let r#gen = slot.r#gen;
            let target = slot.target;
            let mask = slot.mask;
            let finalizing = slot.flags.contains(EvFlags::FINALIZING);
            let dropped_already = slot.dropped;

            match kind {
                Kind::Notify => {
                    if let Some(ch) = &guard.notify {
                        ch.drain();
                    }
                    guard.notify_pending = false;
                    continue;
                }
                Kind::SignalPipe => {
                    let fired = guard.trampoline.as_ref().map(SignalTrampoline::drain);
                    if let Some(pairs) = fired {
                        for (signo, n) in pairs {
                            for sidx in guard.evmap.signal_ready(signo) {
                                Self::activate_nolock(&mut guard, sidx, EventMask::SIGNAL, n);
                            }
                        }
                    }
                    continue;
                }
                Kind::CommonSentinel(qi) => {
                    self.process_common(&mut guard, usize::from(qi));
                    continue;
                }
                Kind::LoopExit => {
                    guard.loop_exit = true;
                    guard.free_slot(idx);
                    count += 1;
                    break;
                }
                Kind::User => {}
            }

            let id = SlotId { idx, r#gen };

            if finalizing {
                let finalizer = guard.slot_mut(idx).and_then(|s| s.finalizer.take());
                guard.free_slot(idx);
                if let Some(f) = finalizer {
                    drop(guard);
                    f();
                    guard = self.lock();
                }
                count += 1;
                continue;
            }

            let fd_arg: RawFd = match target {
                Target::Fd(fd) => fd,
                Target::Signal(signo) => signo,
                Target::None => -1,
            };

            if mask.contains(EventMask::SIGNAL) {
                /* coalesced delivery: the callback runs ncalls times; a
                 * concurrent del zeroes the count and stops the loop */
                if !mask.contains(EventMask::PERSIST) {
                    self.del_nolock(&mut guard, idx, true);
                }
                loop {
                    let remaining = match guard.slot(idx) {
                        Some(slot) if slot.r#gen == r#gen => slot.ncalls,
                        _ => break,
                    };
                    if remaining == 0 {
                        break;
                    }
                    if let Some(slot) = guard.slot_mut(idx) {
                        slot.ncalls = remaining - 1;
                    }
                    let Some(mut cb) = guard.slot_mut(idx).and_then(|s| s.cb.take()) else {
                        break;
                    };
                    guard.current = Some(id);
                    drop(guard);
                    cb(fd_arg, res);
                    guard = self.lock();
                    guard.current = None;
                    if guard.current_waiters > 0 {
                        self.cb_done.notify_all();
                    }
                    if let Some(slot) = guard.slot_mut(idx) {
                        if slot.r#gen == r#gen && slot.cb.is_none() {
                            slot.cb = Some(cb);
                        }
                    }
                    if guard.loop_break {
                        break;
                    }
                }
            } else {
                if mask.contains(EventMask::PERSIST) {
                    if let Err(e) = self.persist_rearm(&mut guard, idx, res) {
                        log::warn!("persistent re-arm failed: {e}");
                    }
                } else {
                    self.del_nolock(&mut guard, idx, true);
                }
                let cb = guard.slot_mut(idx).and_then(|s| s.cb.take());
                if let Some(mut cb) = cb {
                    guard.current = Some(id);
                    drop(guard);
                    cb(fd_arg, res);
                    guard = self.lock();
                    guard.current = None;
                    if guard.current_waiters > 0 {
                        self.cb_done.notify_all();
                    }
                    if let Some(slot) = guard.slot_mut(idx) {
                        if slot.r#gen == r#gen && slot.cb.is_none() {
                            slot.cb = Some(cb);
                        }
                    }
                }
            }

            /* a once event or a handle dropped mid-callback frees here */
            let free_now = dropped_already
                || guard
                    .slot(idx)
                    .is_some_and(|s| s.r#gen == r#gen && s.dropped);
            if free_now
                && guard
                    .slot(idx)
                    .is_some_and(|s| s.r#gen == r#gen)
            {
                self.del_nolock(&mut guard, idx, false);
                guard.free_slot(idx);
            }

            count += 1;
            if guard.loop_break || guard.loop_continue {
                break;
            }
            if count >= max_cb {
                break;
            }
            if count % 4 == 0 {
                if let Some(end) = endtime {
                    if guard.clock.now() >= end {
                        break;
                    }
                }
            }
        }
        (guard, count)
    }

    /* ------------------------------------------------------------------ */
    /* loop control / misc                                                 */
    /* ------------------------------------------------------------------ */

    pub(crate) fn loopbreak(&self) {
        let mut inner = self.lock();
        inner.loop_break = true;
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
    }

    pub(crate) fn loopcontinue(&self) {
        let mut inner = self.lock();
        inner.loop_continue = true;
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
    }

    pub(crate) fn loopexit(&self, after: Option<Duration>) -> Result<()> {
        let mut inner = self.lock();
        if inner.torn_down {
            return Err(ReactorError::Stale);
        }
        let idx = Self::new_slot(&mut inner, Kind::LoopExit, Target::None, EventMask::NONE);
        match after {
            Some(d) if !d.is_zero() => {
                self.add_nolock(&mut inner, idx, Some(Timeout::After(d)), true)?;
            }
            _ => {
                Self::activate_nolock(&mut inner, idx, EventMask::TIMEOUT, 1);
            }
        }
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
        Ok(())
    }

    pub(crate) fn once(
        self: &Arc<Self>,
        target: Target,
        mask: EventMask,
        timeout: Option<Timeout>,
        cb: impl FnOnce(RawFd, EventMask) + Send + 'static,
    ) -> Result<()> {
        if mask.intersects(EventMask::PERSIST | EventMask::SIGNAL) {
            return Err(ReactorError::InvalidArgument(
                "once cannot be persistent or signal",
            ));
        }
        let mut cb = Some(cb);
        let wrapped: Callback = Box::new(move |fd, res| {
            if let Some(f) = cb.take() {
                f(fd, res);
            }
        });
        let mut inner = self.lock();
        if inner.torn_down {
            return Err(ReactorError::Stale);
        }
        let idx = Self::new_slot(&mut inner, Kind::User, target, mask);
        {
            let slot = inner.slot_mut(idx).expect("just allocated");
            slot.cb = Some(wrapped);
            /* no handle exists: the dispatcher frees it after the fire */
            slot.dropped = true;
        }
        let immediate = mask.io_bits().is_empty()
            && timeout.is_none_or(|t| t.duration().is_zero());
        if immediate {
            /* zero or absent timeout: activate now, keeping FIFO order with
             * anything else queued this tick */
            Self::activate_nolock(&mut inner, idx, EventMask::TIMEOUT, 1);
        } else if let Err(e) = self.add_nolock(&mut inner, idx, timeout, true) {
            inner.free_slot(idx);
            return Err(e);
        }
        if Self::need_notify(&inner) {
            Self::notify_nolock(&mut inner);
        }
        Ok(())
    }

    pub(crate) fn init_common_timeout(&self, duration: Duration) -> Result<Timeout> {
        let mut inner = self.lock();
        if inner.torn_down {
            return Err(ReactorError::Stale);
        }
        for (i, q) in inner.common.iter().enumerate() {
            if q.duration == duration {
                #[allow(clippy::cast_possible_truncation)]
                return Ok(Timeout::Common(CommonTimeout {
                    index: i as u8,
                    duration,
                }));
            }
        }
        if inner.common.len() >= MAX_COMMON_TIMEOUTS {
            return Err(ReactorError::TooManyCommonTimeouts);
        }
        let qi = inner.common.len();
        let sentinel = Self::new_slot(&mut inner, Kind::CommonSentinel(qi as u8), Target::None, EventMask::NONE);
        inner.common.push(CommonQueue {
            duration,
            queue: VecDeque::new(),
            sentinel,
        });
        #[allow(clippy::cast_possible_truncation)]
        Ok(Timeout::Common(CommonTimeout {
            index: qi as u8,
            duration,
        }))
    }

    pub(crate) fn priority_init(&self, n: usize) -> Result<()> {
        let mut inner = self.lock();
        if inner.running || inner.n_active() > 0 {
            return Err(ReactorError::PriorityTooLate);
        }
        if n == 0 || n > MAX_PRIORITIES {
            return Err(ReactorError::PriorityTooLate);
        }
        inner.active = (0..n).map(|_| VecDeque::new()).collect();
        /* clamp anything assigned before the resize */
        for slot in inner.slots.iter_mut().flatten() {
            if slot.priority >= n {
                slot.priority = n - 1;
            }
        }
        Ok(())
    }

    fn build_notify(&self, inner: &mut Inner) -> Result<()> {
        let ch = NotifyChannel::new()?;
        let fd = ch.read_fd();
        inner.notify = Some(ch);
        let idx = Self::new_slot(
            inner,
            Kind::Notify,
            Target::Fd(fd),
            EventMask::READ | EventMask::PERSIST,
        );
        if let Err(e) = self.insert_registration(inner, idx) {
            inner.free_slot(idx);
            inner.notify = None;
            return Err(e);
        }
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* fork recovery                                                       */
    /* ------------------------------------------------------------------ */

    pub(crate) fn reinit(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.running {
            return Err(ReactorError::LoopRunning);
        }
        let need_reinit = {
            let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
            be.need_reinit()
        };

        /* find the internal plumbing slots so their fds can be remapped */
        let mut notify_slot = None;
        let mut sigpipe_slot = None;
        for (i, slot) in inner.slots.iter().enumerate() {
            match slot.as_ref().map(|s| s.kind) {
                Some(Kind::Notify) => notify_slot = Some(i),
                Some(Kind::SignalPipe) => sigpipe_slot = Some(i),
                _ => {}
            }
        }

        /* detach the old pipes. For a backend that survives fork (poll),
         * the stale fds must also leave the backend's interest set; for
         * one that does not, its kernel object is dead anyway. */
        if let Some(idx) = notify_slot {
            let old_fd = inner.slot(idx).and_then(|s| s.target.fd());
            if let Some(fd) = old_fd {
                inner.evmap.del_io(fd, idx, EventMask::READ);
                if !need_reinit {
                    let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                    let _ = be.del(fd, EventMask::READ, EventMask::NONE);
                }
            }
            inner.notify = None; /* closes the shared-with-parent fds */
            inner.notify_pending = false;
            let ch = NotifyChannel::new()?;
            let new_fd = ch.read_fd();
            inner.notify = Some(ch);
            if let Some(slot) = inner.slot_mut(idx) {
                slot.target = Target::Fd(new_fd);
            }
            inner.evmap.add_io(new_fd, idx, EventMask::READ);
            if !need_reinit {
                let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                be.add(new_fd, EventMask::NONE, EventMask::READ)?;
            }
        }

        if let Some(idx) = sigpipe_slot {
            let old_fd = inner.slot(idx).and_then(|s| s.target.fd());
            if let Some(fd) = old_fd {
                inner.evmap.del_io(fd, idx, EventMask::READ);
                if !need_reinit {
                    let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                    let _ = be.del(fd, EventMask::READ, EventMask::NONE);
                }
            }
            let new_fd = {
                let tramp = inner.trampoline.as_mut().expect("sigpipe slot implies trampoline");
                tramp.rebuild_pipe()?;
                tramp.read_fd()
            };
            if let Some(slot) = inner.slot_mut(idx) {
                slot.target = Target::Fd(new_fd);
            }
            inner.evmap.add_io(new_fd, idx, EventMask::READ);
            if !need_reinit {
                let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
                be.add(new_fd, EventMask::NONE, EventMask::READ)?;
            }
            /* re-route every watched signal through the fresh pipe */
            let signos = inner.evmap.registered_signals();
            let tramp = inner.trampoline.as_mut().expect("checked above");
            for signo in signos {
                tramp.watch(signo)?;
            }
        }

        if need_reinit {
            let fresh = select_backend(&self.cfg)?;
            let regs = inner.evmap.io_registrations();
            {
                let mut be = self.backend.write().unwrap_or_else(PoisonError::into_inner);
                *be = fresh;
            }
            let be = self.backend.read().unwrap_or_else(PoisonError::into_inner);
            for (fd, mask) in regs {
                be.add(fd, EventMask::NONE, mask)?;
            }
        }
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* teardown                                                            */
    /* ------------------------------------------------------------------ */

    fn teardown(&self, run_finalizers: bool) {
        let mut inner = self.lock();
        if inner.torn_down {
            return;
        }
        inner.torn_down = true;

        let mut finalizers = Vec::new();
        for idx in 0..inner.slots.len() {
            let Some(slot) = inner.slot_mut(idx) else { continue };
            if run_finalizers && slot.flags.contains(EvFlags::FINALIZING) {
                if let Some(f) = slot.finalizer.take() {
                    finalizers.push(f);
                }
            }
            inner.free_slot(idx);
        }
        inner.active.iter_mut().for_each(VecDeque::clear);
        inner.active_later.clear();
        inner.common.clear();
        while inner.heap.pop_min(|_, _| {}).is_some() {}
        inner.evmap = EvMap::new();
        inner.trampoline = None; /* restores handlers, closes the pipe */
        inner.notify = None;
        drop(inner);

        for f in finalizers {
            f();
        }
    }

    /* introspection used by Reactor */

    fn event_count(&self) -> usize {
        let inner = self.lock();
        inner.slots.iter().flatten().filter(|s| s.relevant()).count()
    }

    fn active_count(&self) -> usize {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .flatten()
            .filter(|s| {
                !s.internal()
                    && s.flags
                        .intersects(EvFlags::ACTIVE | EvFlags::ACTIVE_LATER)
            })
            .count()
    }
}

/// The event base: registrations, timers, active queues, and the loop.
pub struct Reactor {
    core: Arc<Core>,
}

impl Reactor {
    /// A reactor with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(&ReactorConfig::new())
    }

    /// A reactor configured by `cfg`. The config is consumed by value
    /// semantics: later mutations of the caller's copy have no effect.
    pub fn with_config(cfg: &ReactorConfig) -> Result<Self> {
        let backend = select_backend(cfg)?;
        let core = Arc::new(Core {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_list: Vec::new(),
                next_gen: 1,
                evmap: EvMap::new(),
                heap: TimerHeap::new(),
                common: Vec::new(),
                active: vec![VecDeque::new()],
                active_later: VecDeque::new(),
                clock: Clock::new(cfg.precise_timer()),
                cached_now: None,
                cache_time: !cfg.no_cache_time(),
                running: false,
                owner: None,
                loop_break: false,
                loop_exit: false,
                loop_continue: false,
                running_priority: usize::MAX,
                current: None,
                current_waiters: 0,
                trampoline: None,
                notify: None,
                notify_pending: false,
                max_dispatch_time: cfg.max_dispatch_time,
                max_dispatch_callbacks: cfg.max_dispatch_callbacks,
                limit_after_prio: cfg.limit_after_prio,
                torn_down: false,
            }),
            cb_done: Condvar::new(),
            backend: RwLock::new(backend),
            cfg: cfg.clone(),
        });
        if !cfg.threadless() {
            let mut inner = core.lock();
            core.build_notify(&mut inner)?;
        }
        Ok(Self { core })
    }

    pub(crate) fn assign(&self, target: Target, mask: EventMask, cb: Callback) -> Result<Event> {
        self.core.assign(target, mask, cb)
    }

    /// Run the loop. See [`DispatchFlags`] for the stopping conditions.
    pub fn dispatch(&self, flags: DispatchFlags) -> Result<DispatchOutcome> {
        self.core.dispatch(flags)
    }

    /// Stop the loop after the callback currently running, from any thread.
    pub fn loopbreak(&self) {
        self.core.loopbreak();
    }

    /// Stop the loop once `after` elapses (immediately for zero/None).
    pub fn loopexit(&self, after: Option<Duration>) -> Result<()> {
        self.core.loopexit(after)
    }

    /// Abandon the current priority queue and rescan from priority 0.
    /// Meaningful from within a callback.
    pub fn loopcontinue(&self) {
        self.core.loopcontinue();
    }

    /// True if the last `dispatch` ended via [`loopbreak`](Reactor::loopbreak).
    #[must_use]
    pub fn got_break(&self) -> bool {
        self.core.lock().loop_break
    }

    /// True if the last `dispatch` ended via [`loopexit`](Reactor::loopexit).
    #[must_use]
    pub fn got_exit(&self) -> bool {
        self.core.lock().loop_exit
    }

    /// Rebuild kernel state in a forked child: fresh backend (where the old
    /// one does not survive fork), fresh wake-up and signal pipes, every
    /// registration re-applied.
    pub fn reinit(&self) -> Result<()> {
        self.core.reinit()
    }

    /// Use `n` priority queues (0 = highest). Must run before any event is
    /// activated; 1..=255.
    pub fn priority_init(&self, n: usize) -> Result<()> {
        self.core.priority_init(n)
    }

    /// Number of configured priority queues.
    #[must_use]
    pub fn npriorities(&self) -> usize {
        self.core.lock().active.len()
    }

    /// Register a shared duration; events added with the returned timeout
    /// share one heap sentinel instead of one heap entry each. At most 256
    /// distinct durations per reactor.
    pub fn init_common_timeout(&self, duration: Duration) -> Result<Timeout> {
        self.core.init_common_timeout(duration)
    }

    /// Register-and-forget: run `cb` once when `target` is ready or
    /// `timeout` expires, then release the event. Timeout-only with a zero
    /// or absent timeout fires on the next tick, in order with anything
    /// else queued this tick. PERSIST and SIGNAL are rejected.
    pub fn once(
        &self,
        target: Target,
        mask: EventMask,
        timeout: Option<Timeout>,
        cb: impl FnOnce(RawFd, EventMask) + Send + 'static,
    ) -> Result<()> {
        self.core.once(target, mask, timeout, cb)
    }

    /// Non-internal events that are registered, queued, or armed.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.core.event_count()
    }

    /// Non-internal events currently queued for dispatch.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.core.active_count()
    }

    /// Name of the backend in use ("epoll", "kqueue", "poll").
    #[must_use]
    pub fn method(&self) -> &'static str {
        self.core
            .backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name()
    }

    /// Wall-clock time derived from the loop's cached tick, falling back
    /// to a fresh read outside the loop.
    #[must_use]
    pub fn cached_time_of_day(&self) -> SystemTime {
        let mut inner = self.core.lock();
        match inner.cached_now {
            Some(t) => inner.clock.wall_from_monotonic(t),
            None => SystemTime::now(),
        }
    }

    /// Refresh the cached tick mid-callback (after a slow callback, timers
    /// armed later in the same tick would otherwise anchor to a stale now).
    pub fn update_cache_time(&self) {
        let mut inner = self.core.lock();
        if inner.running && inner.cache_time {
            inner.cached_now = Some(inner.clock.now());
        }
    }

    /// Tear down without running pending finalizers.
    pub fn free_without_finalizers(self) {
        self.core.teardown(false);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.core.teardown(true);
    }
}

impl core::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Reactor")
            .field("method", &self.method())
            .field("events", &self.event_count())
            .finish()
    }
}
