/*
 * evmap.rs
 *
 * Registration maps: fd -> interested events, signal -> interested events.
 *
 * The backend is only told about a descriptor when the AGGREGATE interest
 * on it changes. Three events reading the same fd are one kernel
 * registration; deleting two of them changes nothing at the kernel. add/del
 * therefore return the (old, new) aggregate masks and the reactor calls the
 * backend only when they differ.
 *
 * Events are arena slot ids here, never pointers. A slot appears in at
 * most one list per interest bit (the INSERTED flag guards re-adds above
 * this layer).
 */

use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::event::EventMask;

#[derive(Debug, Default)]
struct FdEntry {
    read: Vec<usize>,
    write: Vec<usize>,
    close: Vec<usize>,
    /* events on this fd that requested edge-triggered delivery */
    n_et: usize,
}

impl FdEntry {
    fn aggregate(&self) -> EventMask {
        let mut mask = EventMask::NONE;
        if !self.read.is_empty() {
            mask |= EventMask::READ;
        }
        if !self.write.is_empty() {
            mask |= EventMask::WRITE;
        }
        if !self.close.is_empty() {
            mask |= EventMask::CLOSED;
        }
        if self.n_et > 0 {
            mask |= EventMask::ET;
        }
        mask
    }

    fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty() && self.close.is_empty()
    }
}

/// Aggregate interest on one fd, before and after a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MaskChange {
    pub old: EventMask,
    pub new: EventMask,
}

impl MaskChange {
    #[inline]
    pub(crate) fn changed(&self) -> bool {
        self.old != self.new
    }
}

#[derive(Debug, Default)]
pub(crate) struct EvMap {
    io: HashMap<RawFd, FdEntry>,
    signals: HashMap<i32, Vec<usize>>,
}

fn remove_slot(list: &mut Vec<usize>, slot: usize) {
    if let Some(pos) = list.iter().position(|&s| s == slot) {
        list.swap_remove(pos);
    }
}

impl EvMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record `slot`'s interest `mask` on `fd`.
    pub(crate) fn add_io(&mut self, fd: RawFd, slot: usize, mask: EventMask) -> MaskChange {
        let entry = self.io.entry(fd).or_default();
        let old = entry.aggregate();
        if mask.contains(EventMask::READ) {
            entry.read.push(slot);
        }
        if mask.contains(EventMask::WRITE) {
            entry.write.push(slot);
        }
        if mask.contains(EventMask::CLOSED) {
            entry.close.push(slot);
        }
        if mask.contains(EventMask::ET) {
            entry.n_et += 1;
        }
        MaskChange {
            old,
            new: entry.aggregate(),
        }
    }

    /// Remove `slot`'s interest `mask` from `fd`.
    pub(crate) fn del_io(&mut self, fd: RawFd, slot: usize, mask: EventMask) -> MaskChange {
        let Some(entry) = self.io.get_mut(&fd) else {
            return MaskChange {
                old: EventMask::NONE,
                new: EventMask::NONE,
            };
        };
        let old = entry.aggregate();
        if mask.contains(EventMask::READ) {
            remove_slot(&mut entry.read, slot);
        }
        if mask.contains(EventMask::WRITE) {
            remove_slot(&mut entry.write, slot);
        }
        if mask.contains(EventMask::CLOSED) {
            remove_slot(&mut entry.close, slot);
        }
        if mask.contains(EventMask::ET) {
            entry.n_et = entry.n_et.saturating_sub(1);
        }
        let new = entry.aggregate();
        if entry.is_empty() {
            self.io.remove(&fd);
        }
        MaskChange { old, new }
    }

    /// Events to activate for kernel-reported readiness on `fd`.
    /// Each interested slot appears once, with the union of its matched bits.
    pub(crate) fn io_ready(&self, fd: RawFd, ready: EventMask) -> Vec<(usize, EventMask)> {
        let mut out: Vec<(usize, EventMask)> = Vec::new();
        let Some(entry) = self.io.get(&fd) else {
            return out;
        };
        let mut push = |slot: usize, bit: EventMask| {
            if let Some((_, mask)) = out.iter_mut().find(|(s, _)| *s == slot) {
                *mask |= bit;
            } else {
                out.push((slot, bit));
            }
        };
        if ready.contains(EventMask::READ) {
            for &slot in &entry.read {
                push(slot, EventMask::READ);
            }
        }
        if ready.contains(EventMask::WRITE) {
            for &slot in &entry.write {
                push(slot, EventMask::WRITE);
            }
        }
        if ready.contains(EventMask::CLOSED) {
            for &slot in &entry.close {
                push(slot, EventMask::CLOSED);
            }
        }
        out
    }

    /// Record `slot`'s interest in `signo`. True if this is the first
    /// event for that signal (caller installs the OS handler).
    pub(crate) fn add_signal(&mut self, signo: i32, slot: usize) -> bool {
        let list = self.signals.entry(signo).or_default();
        list.push(slot);
        list.len() == 1
    }

    /// Remove `slot` from `signo`. True if no events remain for that
    /// signal (caller restores the OS handler).
    pub(crate) fn del_signal(&mut self, signo: i32, slot: usize) -> bool {
        let Some(list) = self.signals.get_mut(&signo) else {
            return false;
        };
        remove_slot(list, slot);
        if list.is_empty() {
            self.signals.remove(&signo);
            true
        } else {
            false
        }
    }

    /// Slots interested in `signo`.
    pub(crate) fn signal_ready(&self, signo: i32) -> Vec<usize> {
        self.signals.get(&signo).cloned().unwrap_or_default()
    }

    /// (fd, aggregate mask) pairs, for re-registering after fork.
    pub(crate) fn io_registrations(&self) -> Vec<(RawFd, EventMask)> {
        self.io.iter().map(|(fd, e)| (*fd, e.aggregate())).collect()
    }

    /// Signals with at least one interested event, for trampoline re-install.
    pub(crate) fn registered_signals(&self) -> Vec<i32> {
        self.signals.keys().copied().collect()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.io.is_empty() && self.signals.is_empty()
    }
}
